//! A logging implementation
//!
//! The kernel core only talks to the [`log`] facade. Whoever boots the kernel picks where the
//! lines end up by handing a [`Console`] to [`init_logger`].

use core::fmt;

use crate::sync::KSpinLock;

static LOGGER: Logger = Logger;

/// The sink log lines are written to.
static CONSOLE: KSpinLock<Option<&'static dyn Console>> = KSpinLock::new(None);

/// Something that can print text, such as a UART or the SBI console.
pub trait Console: Sync {
    /// Write the string out in full.
    fn write_str(&self, s: &str);
}

/// Initialize the logger.
///
/// This function should only be called once. Later calls log an error and leave the first
/// console in place.
pub fn init_logger(console: &'static dyn Console, level: log::LevelFilter) {
    match log::set_logger(&LOGGER) {
        Ok(()) => (),
        Err(e) => {
            log::error!("Error initializing logger: {e}");
            return;
        }
    }
    *CONSOLE.lock() = Some(console);
    log::set_max_level(level);
}

/// The logger to use.
struct Logger;

impl log::Log for Logger {
    fn log(&self, record: &log::Record) {
        use core::fmt::Write as _;

        let Some(console) = *CONSOLE.lock() else {
            return;
        };
        _ = writeln!(
            ConsoleWriter(console),
            "{level:>8 } - {source} - {args}",
            level = record.level(),
            source = SourceLogWriter {
                file: record.file(),
                line: record.line()
            },
            args = record.args(),
        );
    }

    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn flush(&self) {
        // We write everything out immediately.
    }
}

/// Adapts a [`Console`] to [`fmt::Write`].
struct ConsoleWriter(&'static dyn Console);
impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

struct SourceLogWriter<'a> {
    file: Option<&'a str>,
    line: Option<u32>,
}
impl fmt::Display for SourceLogWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self {
                file,
                line: Some(line),
            } => write!(f, "{}:{line}", file.unwrap_or("<unknown>")),
            Self {
                file: Some(file),
                line: None,
            } => f.write_str(file),
            Self {
                file: None,
                line: None,
            } => f.write_str("<unknown loc>"),
        }
    }
}
