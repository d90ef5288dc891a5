//! Detaching from the controlling terminal.

use daemonize::Daemonize;
use std::fmt;
use tracing::info;

#[derive(Debug)]
pub struct DaemonError(daemonize::Error);

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to enter daemon mode: {}", self.0)
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Fork into the background.
///
/// The parent exits with status 0; only the child returns. The child runs in
/// a new session with `/` as its working directory, a zero umask and the
/// standard streams redirected to `/dev/null`. Must be called before any
/// thread other than the main one is spawned.
pub fn detach() -> Result<(), DaemonError> {
    Daemonize::new()
        .working_directory("/")
        .umask(0)
        .start()
        .map_err(DaemonError)?;

    info!(pid = std::process::id(), "Running as daemon");
    Ok(())
}
