//! Registry of live connection workers.
//!
//! Owned by the accept loop. Finished workers are reaped after every accept
//! so the registry only grows with the number of connected clients; on
//! shutdown every remaining worker is joined.

use slab::Slab;
use std::net::SocketAddr;
use std::thread::JoinHandle;
use tracing::{debug, error};

/// A spawned connection worker.
#[derive(Debug)]
pub struct ConnectionRecord {
    /// Monotonic connection identifier, used in logs.
    pub id: u64,
    pub peer: SocketAddr,
    pub handle: JoinHandle<()>,
}

impl ConnectionRecord {
    pub fn new(id: u64, peer: SocketAddr, handle: JoinHandle<()>) -> Self {
        Self { id, peer, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn join(self) {
        if self.handle.join().is_err() {
            error!(conn_id = self.id, peer = %self.peer, "Connection worker panicked");
        } else {
            debug!(conn_id = self.id, peer = %self.peer, "Connection worker joined");
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    records: Slab<ConnectionRecord>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly spawned worker. Returns its slot.
    pub fn register(&mut self, record: ConnectionRecord) -> usize {
        self.records.insert(record)
    }

    /// Join and drop every worker that has already finished.
    ///
    /// Never waits on a worker that is still running.
    pub fn reap_completed(&mut self) -> usize {
        let finished: Vec<usize> = self
            .records
            .iter()
            .filter(|(_, record)| record.is_finished())
            .map(|(key, _)| key)
            .collect();

        for &key in &finished {
            self.records.remove(key).join();
        }
        finished.len()
    }

    /// Join every remaining worker, blocking until each one exits.
    pub fn join_all(&mut self) -> usize {
        let records: Vec<ConnectionRecord> = self.records.drain().collect();
        let count = records.len();
        for record in records {
            record.join();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn wait_finished(registry: &ConnectionRegistry, key: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !registry.records[key].is_finished() {
            assert!(Instant::now() < deadline, "worker did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_reap_only_finished() {
        let mut registry = ConnectionRegistry::new();
        let (release, blocked) = mpsc::channel::<()>();

        let done = registry.register(ConnectionRecord::new(1, peer(), thread::spawn(|| {})));
        registry.register(ConnectionRecord::new(
            2,
            peer(),
            thread::spawn(move || {
                let _ = blocked.recv();
            }),
        ));
        assert_eq!(registry.len(), 2);

        wait_finished(&registry, done);
        assert_eq!(registry.reap_completed(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.reap_completed(), 0);

        release.send(()).unwrap();
        assert_eq!(registry.join_all(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_join_all_waits_for_running_workers() {
        let mut registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel();

        for id in 0..4 {
            let tx = tx.clone();
            registry.register(ConnectionRecord::new(
                id,
                peer(),
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20 * id));
                    tx.send(id).unwrap();
                }),
            ));
        }
        drop(tx);

        assert_eq!(registry.join_all(), 4);
        assert!(registry.is_empty());
        let mut finished: Vec<u64> = rx.iter().collect();
        finished.sort_unstable();
        assert_eq!(finished, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_panicked_worker_is_reaped() {
        let mut registry = ConnectionRegistry::new();
        let key = registry.register(ConnectionRecord::new(
            9,
            peer(),
            thread::spawn(|| panic!("connection worker failure")),
        ));

        wait_finished(&registry, key);
        assert_eq!(registry.reap_completed(), 1);
        assert!(registry.is_empty());
    }
}
