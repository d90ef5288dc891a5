//! Listener and lifecycle controller.
//!
//! Binds the listening socket, runs the accept loop on the calling thread
//! and tears everything down once shutdown is requested:
//!
//! ```text
//! Initializing -> Listening -> ShuttingDown -> Terminated
//! ```
//!
//! The listener is non-blocking and registered with a `mio::Poll` next to
//! a `Waker` owned by the shutdown context, so a signal interrupts a
//! pending accept immediately. In-flight connections are never cut off;
//! shutdown waits for each client to disconnect.

use crate::config::Config;
use crate::connection;
use crate::registry::{ConnectionRecord, ConnectionRegistry};
use crate::shutdown::Shutdown;
use crate::storage::SharedLog;
use crate::timer;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Pause before retrying an accept that failed for lack of resources.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Lifecycle of the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    Listening,
    ShuttingDown,
    Terminated,
}

/// Fatal errors raised before the server starts serving.
#[derive(Debug)]
pub enum StartupError {
    Socket(io::Error),
    ReuseAddress(io::Error),
    Bind(SocketAddr, io::Error),
    Listen(io::Error),
    NonBlocking(io::Error),
    Poll(io::Error),
    Timer(io::Error),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::Socket(e) => write!(f, "socket() failed: {e}"),
            StartupError::ReuseAddress(e) => write!(f, "setsockopt(SO_REUSEADDR) failed: {e}"),
            StartupError::Bind(addr, e) => write!(f, "bind() failed on {addr}: {e}"),
            StartupError::Listen(e) => write!(f, "listen() failed: {e}"),
            StartupError::NonBlocking(e) => write!(f, "failed to make listener non-blocking: {e}"),
            StartupError::Poll(e) => write!(f, "failed to set up accept polling: {e}"),
            StartupError::Timer(e) => write!(f, "failed to start timer: {e}"),
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StartupError::Socket(e)
            | StartupError::ReuseAddress(e)
            | StartupError::Bind(_, e)
            | StartupError::Listen(e)
            | StartupError::NonBlocking(e)
            | StartupError::Poll(e)
            | StartupError::Timer(e) => Some(e),
        }
    }
}

/// A bound, listening, non-blocking socket.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Create the listening socket with `SO_REUSEADDR` set.
    pub fn bind(addr: SocketAddr, backlog: i32) -> Result<Self, StartupError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(StartupError::Socket)?;
        socket
            .set_reuse_address(true)
            .map_err(StartupError::ReuseAddress)?;
        socket
            .bind(&addr.into())
            .map_err(|e| StartupError::Bind(addr, e))?;
        socket.listen(backlog).map_err(StartupError::Listen)?;
        socket
            .set_nonblocking(true)
            .map_err(StartupError::NonBlocking)?;

        Ok(Self {
            inner: socket.into(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Server instance
pub struct Server {
    /// Dropped when shutdown starts so new connections are refused.
    listener: Option<Listener>,
    log: Arc<SharedLog>,
    shutdown: Shutdown,
    registry: ConnectionRegistry,
    config: Config,
    state: LifecycleState,
    next_conn_id: u64,
}

impl Server {
    pub fn new(listener: Listener, config: Config, shutdown: Shutdown) -> Self {
        Server {
            listener: Some(listener),
            log: Arc::new(SharedLog::new(config.data_file.clone())),
            shutdown,
            registry: ConnectionRegistry::new(),
            config,
            state: LifecycleState::Initializing,
            next_conn_id: 0,
        }
    }

    /// Serve until shutdown is requested, then tear down.
    pub fn run(mut self) -> Result<(), StartupError> {
        self.clear_stale_log();

        let mut poll = Poll::new().map_err(StartupError::Poll)?;
        let fd = match self.listener.as_ref() {
            Some(listener) => listener.inner.as_raw_fd(),
            None => return Ok(()),
        };
        poll.registry()
            .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)
            .map_err(StartupError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(StartupError::Poll)?;
        self.shutdown.attach_waker(Arc::new(waker));

        let timer = timer::spawn(
            Arc::clone(&self.log),
            self.shutdown.clone(),
            self.config.timestamp_interval,
        )
        .map_err(StartupError::Timer)?;

        self.transition(LifecycleState::Listening);
        if let Some(Ok(addr)) = self.listener.as_ref().map(Listener::local_addr) {
            info!(addr = %addr, "Listening for connections");
        }
        if let Err(e) = self.accept_loop(&mut poll) {
            error!(error = %e, "Accept loop failed");
            self.shutdown.trigger();
        }

        self.transition(LifecycleState::ShuttingDown);
        drop(poll);
        self.listener = None;
        self.teardown(timer);
        self.transition(LifecycleState::Terminated);
        Ok(())
    }

    fn accept_loop(&mut self, poll: &mut Poll) -> io::Result<()> {
        let mut events = Events::with_capacity(16);

        while !self.shutdown.is_triggered() {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_pending();
                }
            }
        }
        Ok(())
    }

    /// Accept until the backlog is drained.
    fn accept_pending(&mut self) {
        loop {
            if self.shutdown.is_triggered() {
                return;
            }

            let accepted = match self.listener.as_ref() {
                Some(listener) => listener.inner.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, peer)) => {
                    self.spawn_worker(stream, peer);
                    let reaped = self.registry.reap_completed();
                    if reaped > 0 {
                        debug!(reaped, live = self.registry.len(), "Reaped connection workers");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    // Edge-triggered: queued clients raise no new event,
                    // so the backlog must be drained from here.
                    error!(error = %e, "accept() failed, retrying");
                    self.registry.reap_completed();
                    if self.shutdown.sleep(ACCEPT_RETRY_DELAY) {
                        return;
                    }
                }
            }
        }
    }

    fn spawn_worker(&mut self, stream: TcpStream, peer: SocketAddr) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        // Accepted sockets do not inherit O_NONBLOCK on Linux, but the
        // worker relies on blocking reads everywhere.
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(conn_id, peer = %peer, error = %e, "Failed to make connection blocking");
            return;
        }

        let log = Arc::clone(&self.log);
        let shutdown = self.shutdown.clone();
        let recv_buffer_size = self.config.recv_buffer_size;

        let spawned = thread::Builder::new()
            .name(format!("conn-{conn_id}"))
            .spawn(move || {
                info!(conn_id, "Accepted connection from {}", peer.ip());
                if let Err(e) = connection::serve(stream, &log, &shutdown, recv_buffer_size) {
                    warn!(conn_id, peer = %peer, error = %e, "Connection abandoned");
                }
                info!(conn_id, "Closed connection from {}", peer.ip());
            });

        match spawned {
            Ok(handle) => {
                self.registry
                    .register(ConnectionRecord::new(conn_id, peer, handle));
                debug!(conn_id, live = self.registry.len(), "Registered connection worker");
            }
            Err(e) => error!(
                conn_id,
                peer = %peer,
                error = %e,
                "Failed to spawn connection worker"
            ),
        }
    }

    fn teardown(&mut self, timer: thread::JoinHandle<()>) {
        if timer.join().is_err() {
            error!("Timer thread panicked");
        }

        if !self.registry.is_empty() {
            info!(
                outstanding = self.registry.len(),
                "Waiting for open connections to close"
            );
        }
        let joined = self.registry.join_all();
        debug!(joined, "Joined connection workers");

        match self.log.lock().delete() {
            Ok(true) => info!(path = %self.log.path().display(), "Removed data file"),
            Ok(false) => {}
            Err(e) => error!(
                path = %self.log.path().display(),
                error = %e,
                "Failed to remove data file"
            ),
        }
    }

    fn clear_stale_log(&self) {
        match self.log.lock().delete() {
            Ok(true) => warn!(path = %self.log.path().display(), "Removed stale data file"),
            Ok(false) => {}
            Err(e) => error!(
                path = %self.log.path().display(),
                error = %e,
                "Failed to remove stale data file"
            ),
        }
    }

    fn transition(&mut self, next: LifecycleState) {
        debug!(from = ?self.state, to = ?next, "Lifecycle transition");
        self.state = next;
    }
}
