//! The on-disk log file shared by every connection and the timer.
//!
//! `LogFile` opens the file fresh for every operation, so the path is the
//! only state it carries. Methods that touch the file take `&mut self`;
//! the only way to get a `&mut LogFile` at runtime is through
//! [`SharedLog::lock`](super::SharedLog::lock).

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Chunk size used when streaming the log back to a client.
const REPLAY_CHUNK_SIZE: usize = 1024;

/// Permissions for a newly created log file.
const FILE_MODE: u32 = 0o644;

/// Append-only log stored at a fixed path.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
}

/// Failure while streaming the log to a peer.
#[derive(Debug)]
pub enum ReplayError {
    /// Opening or reading the log failed.
    Log(io::Error),
    /// Writing to the peer failed.
    Peer(io::Error),
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::Log(e) => write!(f, "failed to read data file: {e}"),
            ReplayError::Peer(e) => write!(f, "failed to send response data: {e}"),
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReplayError::Log(e) | ReplayError::Peer(e) => Some(e),
        }
    }
}

impl LogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `bytes` to the end of the log, creating the file if needed.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(FILE_MODE)
            .open(&self.path)?;
        file.write_all(bytes)
    }

    /// Read the whole log. A log that does not exist yet reads as empty.
    ///
    /// Replies to clients go through [`LogFile::replay`], which streams
    /// instead of buffering the whole file.
    #[allow(dead_code)]
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        Ok(contents)
    }

    /// Stream the whole log into `out`, returning the number of bytes sent.
    pub fn replay<W: Write + ?Sized>(&mut self, out: &mut W) -> Result<u64, ReplayError> {
        let mut file = File::open(&self.path).map_err(ReplayError::Log)?;
        let mut chunk = [0u8; REPLAY_CHUNK_SIZE];
        let mut sent = 0u64;

        loop {
            let n = match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReplayError::Log(e)),
            };
            out.write_all(&chunk[..n]).map_err(ReplayError::Peer)?;
            sent += n as u64;
        }

        Ok(sent)
    }

    /// Remove the log. Returns `false` if there was nothing to remove.
    pub fn delete(&mut self) -> io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn temp_log() -> (tempfile::TempDir, LogFile) {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::new(dir.path().join("aesdsocketdata"));
        (dir, log)
    }

    #[test]
    fn test_append_creates_file() {
        let (_dir, mut log) = temp_log();
        assert!(!log.path().exists());

        log.append(b"hello\n").unwrap();
        assert!(log.path().exists());
        assert_eq!(log.read_all().unwrap(), b"hello\n");

        let mode = fs::metadata(log.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o600, 0o600);
    }

    #[test]
    fn test_appends_accumulate_in_order() {
        let (_dir, mut log) = temp_log();
        log.append(b"foo\n").unwrap();
        log.append(b"bar\n").unwrap();
        log.append(b"\x00\xffbinary\n").unwrap();
        assert_eq!(log.read_all().unwrap(), b"foo\nbar\n\x00\xffbinary\n");
    }

    #[test]
    fn test_read_missing_is_empty() {
        let (_dir, mut log) = temp_log();
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_replay_streams_large_log() {
        let (_dir, mut log) = temp_log();
        let line = vec![b'x'; REPLAY_CHUNK_SIZE * 3 + 17];
        log.append(&line).unwrap();
        log.append(b"\n").unwrap();

        let mut out = Vec::new();
        let sent = log.replay(&mut out).unwrap();
        assert_eq!(sent as usize, line.len() + 1);
        assert_eq!(&out[..line.len()], &line[..]);
        assert_eq!(out.last(), Some(&b'\n'));
        assert_eq!(out, log.read_all().unwrap());
    }

    #[test]
    fn test_replay_missing_is_log_error() {
        let (_dir, mut log) = temp_log();
        let mut out = Vec::new();
        assert!(matches!(log.replay(&mut out), Err(ReplayError::Log(_))));
    }

    #[test]
    fn test_replay_peer_error() {
        struct Closed;
        impl Write for Closed {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let (_dir, mut log) = temp_log();
        log.append(b"data\n").unwrap();
        assert!(matches!(log.replay(&mut Closed), Err(ReplayError::Peer(_))));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, mut log) = temp_log();
        assert!(!log.delete().unwrap());

        log.append(b"x\n").unwrap();
        assert!(log.delete().unwrap());
        assert!(!log.path().exists());
        assert!(!log.delete().unwrap());
    }
}
