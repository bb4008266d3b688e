// common.rs: console output shared by every crate
//
// All crates log through the `log` facade. This module provides the sink:
// a console logger that prints to stdout/stderr and can be redirected into a
// capture buffer (used by tools and tests to inspect what was printed).

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

pub const MAXPRINTMSG: usize = 4096;

// ============================================================
// Redirect buffer
// ============================================================

static RD_BUFFER: Mutex<Option<String>> = Mutex::new(None);

/// Set when debug-level messages should be printed.
static DEVELOPER: AtomicBool = AtomicBool::new(false);

/// Begin redirecting console output into a buffer.
pub fn begin_redirect() {
    *RD_BUFFER.lock() = Some(String::new());
}

/// End redirect and return the captured output.
pub fn end_redirect() -> Option<String> {
    RD_BUFFER.lock().take()
}

/// Toggle developer output (debug-level log records).
pub fn set_developer(enabled: bool) {
    DEVELOPER.store(enabled, Ordering::Relaxed);
    log::set_max_level(max_level());
}

pub fn is_developer() -> bool {
    DEVELOPER.load(Ordering::Relaxed)
}

fn max_level() -> LevelFilter {
    if is_developer() {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

// ============================================================
// Console logger
// ============================================================

/// The console sink behind the `log` macros.
pub struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl ConsoleLogger {
    fn format(record: &Record) -> String {
        let mut msg = match record.level() {
            Level::Error => format!("ERROR: {}", record.args()),
            Level::Warn => format!("WARNING: {}", record.args()),
            Level::Info => format!("{}", record.args()),
            Level::Debug | Level::Trace => format!("[{}] {}", record.target(), record.args()),
        };
        if msg.len() > MAXPRINTMSG {
            let mut cut = MAXPRINTMSG;
            while !msg.is_char_boundary(cut) {
                cut -= 1;
            }
            msg.truncate(cut);
        }
        msg.push('\n');
        msg
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let msg = Self::format(record);

        {
            let mut buf = RD_BUFFER.lock();
            if let Some(ref mut s) = *buf {
                s.push_str(&msg);
                return;
            }
        }

        if record.level() <= Level::Warn {
            let _ = std::io::stderr().write_all(msg.as_bytes());
        } else {
            print!("{}", msg);
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

/// Install the console logger. Safe to call more than once; later calls only
/// update the developer switch.
pub fn init_logging(developer: bool) {
    DEVELOPER.store(developer, Ordering::Relaxed);
    // set_logger fails if another logger is already installed (tests, hosts).
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(max_level());
}

#[cfg(test)]
mod tests {
    use super::*;

    // The redirect buffer is process-global; keep everything touching it in
    // a single test so parallel test threads do not interleave.
    #[test]
    fn test_redirect_captures_and_levels() {
        init_logging(false);

        begin_redirect();
        log::info!("starfield ready");
        log::error!("out of space");
        log::debug!("hidden");
        let out = end_redirect().unwrap();

        assert!(out.contains("starfield ready\n"));
        assert!(out.contains("ERROR: out of space\n"));
        assert!(!out.contains("hidden"));

        set_developer(true);
        begin_redirect();
        log::debug!("now visible");
        let out = end_redirect().unwrap();
        set_developer(false);
        assert!(out.contains("now visible"));

        assert!(end_redirect().is_none());
    }

    #[test]
    fn test_format_truncates_long_messages() {
        let long = "x".repeat(MAXPRINTMSG * 2);
        let msg = ConsoleLogger::format(
            &Record::builder()
                .args(format_args!("{}", long))
                .level(Level::Info)
                .build(),
        );
        assert_eq!(msg.len(), MAXPRINTMSG + 1);
        assert!(msg.ends_with('\n'));
    }
}
