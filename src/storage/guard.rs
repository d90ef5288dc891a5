//! Exclusive access to the log file.

use super::LogFile;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Held while a caller owns the log.
pub type LogGuard<'a> = MutexGuard<'a, LogFile>;

/// The log file behind a single coarse lock.
///
/// Every append and every replay goes through [`SharedLog::lock`], so the
/// connection workers and the timer see a total order of operations.
#[derive(Debug)]
pub struct SharedLog {
    path: PathBuf,
    file: Mutex<LogFile>,
}

impl SharedLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            file: Mutex::new(LogFile::new(path.clone())),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until no other worker holds the log.
    ///
    /// A holder that panicked leaves the lock poisoned. The file on disk is
    /// the only state, so the lock is recovered rather than propagated.
    pub fn lock(&self) -> LogGuard<'_> {
        self.file.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!(path = %self.path.display(), "Recovering poisoned data file lock");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_concurrent_appends_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(SharedLog::new(dir.path().join("data")));

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for i in 0..50 {
                        // Long packets make torn writes visible if the lock leaks.
                        let mut packet = format!("writer-{w}-packet-{i}-").into_bytes();
                        packet.extend(std::iter::repeat(b'a' + w as u8).take(2048));
                        packet.push(b'\n');

                        let mut guard = log.lock();
                        guard.append(&packet).unwrap();
                        let snapshot = guard.read_all().unwrap();
                        assert!(snapshot.ends_with(&packet));
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }

        let contents = log.lock().read_all().unwrap();
        let lines: Vec<&[u8]> = contents
            .split(|&b| b == b'\n')
            .filter(|l| !l.is_empty())
            .collect();
        assert_eq!(lines.len(), 8 * 50);
        for line in lines {
            let text = std::str::from_utf8(line).unwrap();
            let w: u8 = text.split('-').nth(1).unwrap().parse().unwrap();
            let fill = &line[line.len() - 2048..];
            assert!(fill.iter().all(|&b| b == b'a' + w));
        }
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(SharedLog::new(dir.path().join("data")));

        let poisoner = Arc::clone(&log);
        let _ = thread::spawn(move || {
            let mut guard = poisoner.lock();
            guard.append(b"before panic\n").unwrap();
            panic!("worker died holding the lock");
        })
        .join();

        let mut guard = log.lock();
        guard.append(b"after\n").unwrap();
        assert_eq!(guard.read_all().unwrap(), b"before panic\nafter\n");
    }
}
