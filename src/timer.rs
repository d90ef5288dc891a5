//! Background timestamp writer.
//!
//! Appends a `timestamp:<RFC 2822 time>` record to the shared log once per
//! interval until shutdown is requested.

use crate::shutdown::Shutdown;
use crate::storage::SharedLog;
use chrono::{DateTime, Local, TimeZone};
use std::fmt::Display;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

const TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// Format a single timestamp record, including the trailing newline.
pub fn format_record<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!("timestamp:{}\n", now.format(TIMESTAMP_FORMAT))
}

/// Start the timer thread.
pub fn spawn(
    log: Arc<SharedLog>,
    shutdown: Shutdown,
    interval: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("timer".to_string())
        .spawn(move || run(&log, &shutdown, interval))
}

fn run(log: &SharedLog, shutdown: &Shutdown, interval: Duration) {
    info!(interval_secs = interval.as_secs_f64(), "Timer started");

    while !shutdown.sleep(interval) {
        let record = format_record(&Local::now());
        let mut guard = log.lock();
        match guard.append(record.as_bytes()) {
            Ok(()) => debug!(record = record.trim_end(), "Appended timestamp"),
            Err(e) => error!(
                error = %e,
                path = %guard.path().display(),
                "Failed to append timestamp"
            ),
        }
    }

    info!("Timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use std::time::Instant;

    #[test]
    fn test_record_format() {
        let tz = FixedOffset::west_opt(7 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 3, 5, 9, 4, 7).unwrap();
        assert_eq!(
            format_record(&now),
            "timestamp:Tue, 05 Mar 2024 09:04:07 -0700\n"
        );

        let tz = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();
        let now = tz.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(
            format_record(&now),
            "timestamp:Sun, 31 Dec 2023 23:59:59 +0530\n"
        );
    }

    #[test]
    fn test_local_record_is_rfc2822() {
        let record = format_record(&Local::now());
        let body = record
            .strip_prefix("timestamp:")
            .and_then(|r| r.strip_suffix('\n'))
            .unwrap();
        assert!(DateTime::parse_from_rfc2822(body).is_ok(), "{body}");
    }

    #[test]
    fn test_appends_one_record_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(SharedLog::new(dir.path().join("data")));
        let shutdown = Shutdown::new();

        let handle = spawn(Arc::clone(&log), shutdown.clone(), Duration::from_millis(100)).unwrap();
        thread::sleep(Duration::from_millis(350));
        shutdown.trigger();
        handle.join().unwrap();

        let contents = String::from_utf8(log.lock().read_all().unwrap()).unwrap();
        let records: Vec<&str> = contents.lines().collect();
        assert!((2..=4).contains(&records.len()), "{records:?}");
        for record in records {
            let body = record.strip_prefix("timestamp:").unwrap();
            assert!(DateTime::parse_from_rfc2822(body).is_ok(), "{body}");
        }
    }

    #[test]
    fn test_stops_without_final_append() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(SharedLog::new(dir.path().join("data")));
        let shutdown = Shutdown::new();

        let start = Instant::now();
        let handle = spawn(Arc::clone(&log), shutdown.clone(), Duration::from_secs(10)).unwrap();
        thread::sleep(Duration::from_millis(50));
        shutdown.trigger();
        handle.join().unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!log.path().exists());
    }
}
