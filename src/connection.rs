//! Per-connection worker.
//!
//! Each accepted stream is served on its own thread. Incoming bytes are
//! framed into newline-terminated packets; every packet is appended to the
//! shared log and the whole log is sent back while the lock is still held,
//! so the reply is exactly the log as of that append.

use crate::shutdown::Shutdown;
use crate::storage::{ReplayError, SharedLog};
use std::collections::TryReserveError;
use std::io::{self, Read, Write};
use tracing::{debug, error, trace, warn};

/// Accumulates received bytes and splits them into packets.
///
/// A packet is every byte up to and including a `\n`. Bytes after the last
/// newline stay buffered until more data arrives. There is no size limit,
/// so a client that never sends a newline grows the buffer without bound.
#[derive(Debug, Default)]
pub struct PacketFramer {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to contain no newline.
    scanned: usize,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a received chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), TryReserveError> {
        self.buffer.try_reserve(chunk.len())?;
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Take the next complete packet, if one is buffered.
    pub fn next_packet(&mut self) -> Option<Vec<u8>> {
        match self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let end = self.scanned + pos + 1;
                let rest = self.buffer.split_off(end);
                self.scanned = 0;
                Some(std::mem::replace(&mut self.buffer, rest))
            }
            None => {
                self.scanned = self.buffer.len();
                None
            }
        }
    }

    /// Bytes waiting for a newline.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

/// Append one packet and send the resulting log to `peer`.
///
/// Log failures are reported and skip this reply only; a peer failure is
/// returned because the connection is no longer usable.
pub fn process_packet<W: Write + ?Sized>(
    log: &SharedLog,
    packet: &[u8],
    peer: &mut W,
) -> io::Result<()> {
    let mut guard = log.lock();

    if let Err(e) = guard.append(packet) {
        error!(error = %e, path = %guard.path().display(), "Failed to append packet");
        return Ok(());
    }

    match guard.replay(peer) {
        Ok(sent) => {
            trace!(packet_len = packet.len(), sent, "Replayed data file");
            Ok(())
        }
        Err(ReplayError::Log(e)) => {
            error!(error = %e, path = %guard.path().display(), "Failed to read data file");
            Ok(())
        }
        Err(ReplayError::Peer(e)) => Err(e),
    }
}

/// Serve one client until it disconnects or an I/O error occurs.
///
/// The stream is dropped, and therefore closed, when this returns.
pub fn serve<S: Read + Write>(
    mut stream: S,
    log: &SharedLog,
    shutdown: &Shutdown,
    recv_buffer_size: usize,
) -> io::Result<()> {
    let mut chunk = vec![0u8; recv_buffer_size];
    let mut framer = PacketFramer::new();

    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => {
                if !framer.pending().is_empty() {
                    debug!(
                        discarded = framer.pending().len(),
                        "Client closed with a partial packet"
                    );
                }
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if shutdown.is_triggered() {
                    return Ok(());
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = framer.push(&chunk[..n]) {
            warn!(
                buffered = framer.pending().len(),
                error = %e,
                "Failed to grow packet buffer"
            );
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, e));
        }

        while let Some(packet) = framer.next_packet() {
            process_packet(log, &packet, &mut stream)?;
        }
    }
}
