// TCP listener, accept loop, and shutdown for the lottery server.
//
// Architecture: thread-per-connection, no central event loop.
//
// - **Accept thread** (`run_accept_loop`): owns the listening socket. The
//   socket is non-blocking so the loop can poll the `ShutdownToken` between
//   accepts; when nothing is pending it sleeps for `ACCEPT_POLL_INTERVAL`.
//   Every accepted connection gets its own named session thread, whose
//   `JoinHandle` is kept until the thread is joined.
// - **Session threads**: one `AgencySession` each, blocking on socket reads
//   and, at the end, on `DrawCoordinator::rendezvous`.
//
// Shutdown (token cancelled by a signal or `ServerHandle::stop`): the accept
// loop stops, aborts the coordinator so that sessions parked in `rendezvous`
// return, closes the listener, and joins every session thread. Connections
// that are still open are not closed by force; a session blocked in a read
// only returns once its agency disconnects.
//
// A peer that aborts or resets before its connection is accepted is logged
// and skipped. Any other listener failure (besides `WouldBlock` and
// `Interrupted`) ends the accept loop with that error, which the binary
// treats as fatal.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, info_span, warn};

use crate::draw::{DrawCoordinator, WinPredicate};
use crate::session::{AgencySession, DrawContext, SessionError};
use crate::store::BetStore;

/// How long the accept loop sleeps when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Agencies taking part in the draw when none is configured.
const DEFAULT_AGENCIES: NonZeroUsize = NonZeroUsize::MIN.saturating_add(4);

/// Cancellation flag shared by the accept loop, signal handlers, and
/// `ServerHandle`.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for registration with OS signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Configuration for starting the server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub listen_backlog: i32,
    pub number_of_agencies: NonZeroUsize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 12345,
            listen_backlog: 5,
            number_of_agencies: DEFAULT_AGENCIES,
        }
    }
}

/// Handle returned by `start_server` to control the running server.
pub struct ServerHandle {
    shutdown: ShutdownToken,
    coordinator: Arc<DrawCoordinator>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl ServerHandle {
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub fn coordinator(&self) -> &Arc<DrawCoordinator> {
        &self.coordinator
    }

    /// Signal the server to stop and wait until every session thread has
    /// been joined.
    pub fn stop(self) -> io::Result<()> {
        self.shutdown.cancel();
        self.wait()
    }

    /// Wait for the accept loop to end, either through the shutdown token or
    /// a listener failure.
    pub fn wait(mut self) -> io::Result<()> {
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("accept loop panicked"))),
            None => Ok(()),
        }
    }
}

/// Bind the listener and start the accept loop on a background thread.
/// Returns a handle for stopping it and the actual bound address (useful
/// when port 0 is used to let the OS pick a free port).
pub fn start_server(
    config: &ServerConfig,
    store: Arc<dyn BetStore>,
    predicate: Arc<dyn WinPredicate>,
) -> io::Result<(ServerHandle, SocketAddr)> {
    let listener = bind_listener(&config.host, config.port, config.listen_backlog)?;
    let addr = listener.local_addr()?;
    let shutdown = ShutdownToken::new();
    let coordinator = Arc::new(DrawCoordinator::new(config.number_of_agencies));
    let context = DrawContext {
        store,
        coordinator: Arc::clone(&coordinator),
        predicate,
    };

    info!(
        action = "start_server",
        result = "success",
        %addr,
        agencies = config.number_of_agencies.get()
    );

    let loop_shutdown = shutdown.clone();
    let thread = thread::Builder::new()
        .name("accept".into())
        .spawn(move || run_accept_loop(listener, context, loop_shutdown))?;

    Ok((
        ServerHandle {
            shutdown,
            coordinator,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Create a non-blocking listening socket with an explicit backlog.
fn bind_listener(host: &str, port: u16, backlog: i32) -> io::Result<TcpListener> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn run_accept_loop(
    listener: TcpListener,
    context: DrawContext,
    shutdown: ShutdownToken,
) -> io::Result<()> {
    let mut sessions: Vec<JoinHandle<()>> = Vec::new();

    let result = loop {
        if shutdown.is_cancelled() {
            info!(action = "shutdown", result = "in_progress");
            break Ok(());
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(action = "accept_connections", result = "success", ip = %peer.ip());
                match spawn_session(stream, peer, context.clone()) {
                    Ok(handle) => sessions.push(handle),
                    Err(e) => {
                        error!(action = "spawn_session", result = "fail", %peer, error = %e);
                    }
                }
                reap_finished(&mut sessions);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if !is_listener_failure(&e) => {
                warn!(action = "accept_connections", result = "fail", error = %e);
            }
            Err(e) => {
                error!(action = "accept_connections", result = "fail", error = %e);
                break Err(e);
            }
        }
    };

    context.coordinator.abort();
    drop(listener);
    debug!(action = "join_sessions", pending = sessions.len());
    for handle in sessions {
        if handle.join().is_err() {
            error!(action = "join_sessions", result = "fail", "session thread panicked");
        }
    }
    info!(action = "shutdown", result = "success");
    result
}

/// Whether an `accept` error means the listening socket itself is unusable.
/// A peer that aborts or resets while still queued only loses its own
/// connection.
fn is_listener_failure(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    context: DrawContext,
) -> io::Result<JoinHandle<()>> {
    // Sessions block on reads; the listener's non-blocking mode must not leak
    // into accepted sockets.
    stream.set_nonblocking(false)?;
    thread::Builder::new()
        .name(format!("agency-{peer}"))
        .spawn(move || serve_agency(stream, peer, context))
}

/// Body of a session thread: run the session and log how it ended.
fn serve_agency(stream: TcpStream, peer: SocketAddr, context: DrawContext) {
    let span = info_span!("agency_session", %peer);
    let _enter = span.enter();

    match AgencySession::new(stream, context).run() {
        Ok(()) => info!(action = "close_connection", result = "success"),
        Err(SessionError::Connection(e)) => {
            warn!(action = "receive_message", result = "fail", error = %e);
        }
        Err(SessionError::Aborted(e)) => {
            info!(action = "ask_for_winners", result = "fail", error = %e);
        }
        Err(e) => error!(action = "handle_message", result = "fail", error = %e),
    }
}

/// Join session threads that have already returned.
fn reap_finished(sessions: &mut Vec<JoinHandle<()>>) {
    let (finished, running): (Vec<_>, Vec<_>) =
        sessions.drain(..).partition(|handle| handle.is_finished());
    *sessions = running;
    for handle in finished {
        if handle.join().is_err() {
            error!(action = "join_sessions", result = "fail", "session thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use lottery_protocol::{read_message, write_message};

    use super::*;
    use crate::draw::WinningNumber;
    use crate::store::MemoryBetStore;

    fn local_config(agencies: usize) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            number_of_agencies: NonZeroUsize::new(agencies).unwrap(),
            ..ServerConfig::default()
        }
    }

    fn start(agencies: usize) -> (ServerHandle, SocketAddr) {
        start_server(
            &local_config(agencies),
            Arc::new(MemoryBetStore::new()),
            Arc::new(WinningNumber::default()),
        )
        .unwrap()
    }

    #[test]
    fn shutdown_token_is_shared_between_clones() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        assert!(token.flag().load(Ordering::SeqCst));
    }

    #[test]
    fn stop_without_connections_returns_promptly() {
        let (handle, _addr) = start(2);
        let started = Instant::now();
        handle.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn stop_aborts_pending_rendezvous() {
        let (handle, addr) = start(2);
        let coordinator = Arc::clone(handle.coordinator());

        let mut client = TcpStream::connect(addr).unwrap();
        write_message(&mut client, r#"ASK["agency":"1"]"#).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while coordinator.arrived() < 1 {
            assert!(Instant::now() < deadline, "ASK never reached the coordinator");
            thread::sleep(Duration::from_millis(5));
        }

        handle.stop().unwrap();
        assert!(coordinator.is_aborted());
        // The aborted session closes the connection without a WIN message.
        let err = read_message(&mut client).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn cancelled_token_stops_accept_loop() {
        let (handle, _addr) = start(1);
        handle.shutdown_token().cancel();
        handle.wait().unwrap();
    }

    #[test]
    fn aborted_peers_do_not_stop_the_listener() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
        ] {
            assert!(!is_listener_failure(&io::Error::from(kind)));
        }
        for kind in [
            io::ErrorKind::InvalidInput,
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::Other,
        ] {
            assert!(is_listener_failure(&io::Error::from(kind)));
        }
    }

    #[test]
    fn bind_rejects_invalid_host() {
        let err = bind_listener("not a host", 0, 5).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
