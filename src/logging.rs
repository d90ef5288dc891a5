//! Logging setup.
//!
//! Events go to stderr through the usual fmt layer and, unless disabled, to
//! the system log. The syslog layer formats each event without timestamps
//! or colors and hands it to `syslog(3)` at a priority derived from the
//! event's level.

use crate::config::Config;
use std::ffi::CString;
use std::io;
use std::sync::Once;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Identity prefixed to every syslog line.
const SYSLOG_IDENT: &[u8] = b"aesdsocket\0";

static OPENLOG: Once = Once::new();

/// Initialize the global subscriber.
pub fn init(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr);

    let syslog = config.syslog.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .with_level(false)
            .with_writer(Syslog::open())
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(syslog)
        .init();
}

/// `MakeWriter` that sends each formatted event to syslog.
#[derive(Debug, Clone, Copy)]
pub struct Syslog;

impl Syslog {
    /// Open the connection to the system logger with the `LOG_USER` facility.
    pub fn open() -> Self {
        OPENLOG.call_once(|| {
            // SAFETY: the identity is a static NUL-terminated string.
            unsafe {
                libc::openlog(
                    SYSLOG_IDENT.as_ptr().cast(),
                    libc::LOG_PID,
                    libc::LOG_USER,
                );
            }
        });
        Syslog
    }
}

impl<'a> MakeWriter<'a> for Syslog {
    type Writer = SyslogLine;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogLine::new(libc::LOG_INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogLine::new(priority(meta.level()))
    }
}

/// Map a tracing level to a syslog priority.
pub fn priority(level: &Level) -> libc::c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
    }
}

/// One formatted event, sent to syslog when dropped.
pub struct SyslogLine {
    priority: libc::c_int,
    buf: Vec<u8>,
}

impl SyslogLine {
    fn new(priority: libc::c_int) -> Self {
        Self {
            priority,
            buf: Vec::with_capacity(128),
        }
    }

    fn message(&self) -> Option<CString> {
        let end = self
            .buf
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        if end == 0 {
            return None;
        }
        let bytes: Vec<u8> = self.buf[..end]
            .iter()
            .map(|&b| if b == 0 { b' ' } else { b })
            .collect();
        CString::new(bytes).ok()
    }
}

impl io::Write for SyslogLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogLine {
    fn drop(&mut self) {
        if let Some(message) = self.message() {
            // SAFETY: both strings are NUL-terminated and the format takes
            // exactly one string argument.
            unsafe {
                libc::syslog(self.priority, b"%s\0".as_ptr().cast(), message.as_ptr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_priority_mapping() {
        assert_eq!(priority(&Level::ERROR), libc::LOG_ERR);
        assert_eq!(priority(&Level::WARN), libc::LOG_WARNING);
        assert_eq!(priority(&Level::INFO), libc::LOG_INFO);
        assert_eq!(priority(&Level::DEBUG), libc::LOG_DEBUG);
        assert_eq!(priority(&Level::TRACE), libc::LOG_DEBUG);
    }

    #[test]
    fn test_line_message() {
        let mut line = SyslogLine::new(libc::LOG_INFO);
        writeln!(line, "Accepted connection from 127.0.0.1").unwrap();
        assert_eq!(
            line.message().unwrap().as_bytes(),
            b"Accepted connection from 127.0.0.1"
        );
        // Nothing is logged for the test's line.
        line.buf.clear();
    }

    #[test]
    fn test_line_message_strips_nul() {
        let mut line = SyslogLine::new(libc::LOG_INFO);
        line.write_all(b"a\0b").unwrap();
        assert_eq!(line.message().unwrap().as_bytes(), b"a b");
        line.buf.clear();
    }

    #[test]
    fn test_empty_line_has_no_message() {
        let line = SyslogLine::new(libc::LOG_INFO);
        assert!(line.message().is_none());
    }
}
