//! Connection handler
//!
//! Background task that binds the server socket, accepts the single slave
//! connection and starts a session over it. The task ends once the slave is
//! connected; the connection itself lives on in the handler until the master
//! closes it.
//!
//! ```text
//! Idle --backoff--> Accepting --accept--> Connected (task done)
//!   ^                   |
//!   |              accept error
//!   +-------------------+
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::wire_codec;
use crate::config::ListenerConfig;
use crate::constants::ACCEPT_BACKOFF;
use crate::error::{ExceptionHandler, ListenerError, Result, TransportError};
use crate::session::{MessageControl, SessionSettings};
use crate::transport::{self, EventPoll, Transport};

/// Published server socket; `closed` aborts a pending accept
struct ServerSocket {
    listener: Arc<TcpListener>,
    closed: CancellationToken,
}

/// State shared between the master and its connection handler task
pub(crate) struct ListenerShared {
    pub(crate) config: ListenerConfig,
    pub(crate) event_poll: Option<EventPoll>,
    pub(crate) exception_handler: Arc<dyn ExceptionHandler>,
    connected: AtomicBool,
    initialized: AtomicBool,
    restarts: AtomicU64,
    server_socket: Mutex<Option<ServerSocket>>,
}

impl ListenerShared {
    pub(crate) fn new(
        config: ListenerConfig,
        event_poll: Option<EventPoll>,
        exception_handler: Arc<dyn ExceptionHandler>,
    ) -> Self {
        Self {
            config,
            event_poll,
            exception_handler,
            connected: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
            server_socket: Mutex::new(None),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::Release);
    }

    pub(crate) fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Returns the new restart count
    pub(crate) fn record_restart(&self) -> u64 {
        self.restarts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Publish `listener` unless `cancel` already fired; a cancelled handler's
    /// socket is dropped here so it can never outlive `stop()`
    fn install_server_socket(
        &self,
        listener: TcpListener,
        cancel: &CancellationToken,
    ) -> Option<(Arc<TcpListener>, CancellationToken)> {
        let mut slot = self.server_socket.lock();
        if cancel.is_cancelled() {
            return None;
        }

        let socket = ServerSocket {
            listener: Arc::new(listener),
            closed: CancellationToken::new(),
        };
        let installed = (Arc::clone(&socket.listener), socket.closed.clone());

        if let Some(previous) = slot.replace(socket) {
            previous.closed.cancel();
        }
        Some(installed)
    }

    /// Close the published server socket, if any
    pub(crate) fn close_server_socket(&self) {
        if let Some(socket) = self.server_socket.lock().take() {
            socket.closed.cancel();
            if let Ok(addr) = socket.listener.local_addr() {
                debug!("Closed server socket on {}", addr);
            }
        }
    }

    pub(crate) fn server_socket_addr(&self) -> Option<SocketAddr> {
        self.server_socket
            .lock()
            .as_ref()
            .and_then(|socket| socket.listener.local_addr().ok())
    }

    pub(crate) fn report(&self, error: &ListenerError) {
        self.exception_handler.received_exception(error);
    }
}

#[derive(Default)]
struct Connection {
    session: Option<Arc<MessageControl>>,
    transport: Option<Arc<dyn Transport>>,
    peer: Option<SocketAddr>,
}

/// Accept loop and owner of the live slave connection
pub struct ConnectionHandler {
    shared: Arc<ListenerShared>,
    cancel: CancellationToken,
    connection: Mutex<Connection>,
}

impl ConnectionHandler {
    pub(crate) fn new(shared: Arc<ListenerShared>, cancel: CancellationToken) -> Self {
        Self {
            shared,
            cancel,
            connection: Mutex::new(Connection::default()),
        }
    }

    /// Handler task body; returns once a slave is connected, when cancelled,
    /// when its server socket is closed under it, or with `Init` when the port
    /// cannot be bound
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self
            .shared
            .config
            .bind_addr()
            .map_err(|e| ListenerError::init(e.to_string()))?;
        debug!(
            "Connection handler started ({} framing, {})",
            self.shared.config.framing,
            if self.shared.event_poll.is_some() { "event poll" } else { "blocking reader" }
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Connection handler cancelled");
                    return Ok(());
                }
                _ = sleep(ACCEPT_BACKOFF) => {}
            }

            if self.shared.is_connected() {
                return Ok(());
            }

            self.shared.close_server_socket();
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    self.close_connection();
                    return Err(bind_failure(addr, &e));
                },
            };

            let Some((listener, closed)) =
                self.shared.install_server_socket(listener, &self.cancel)
            else {
                debug!("Connection handler cancelled while binding");
                return Ok(());
            };
            info!("Waiting for slave on {}", addr);

            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Connection handler cancelled while accepting");
                    return Ok(());
                }
                _ = closed.cancelled() => {
                    debug!("Server socket closed while accepting");
                    return Ok(());
                }
                result = listener.accept() => result,
            };

            match accepted {
                Ok((stream, peer)) => match self.establish(stream, peer) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        error!("Failed to set up connection from {}: {}", peer, e);
                        self.close_connection();
                        self.shared.report(&e);
                    },
                },
                Err(e) => {
                    let err = TransportError::from(e);
                    if err.is_timeout() {
                        continue;
                    }
                    if err.is_socket_closed() {
                        return Ok(());
                    }
                    self.close_connection();
                    self.shared.report(&ListenerError::Connection(err));
                },
            }
        }
    }

    fn establish(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let transport = transport::open(stream, self.shared.event_poll.as_ref())?;
        let (parser, keys) = wire_codec(self.shared.config.framing);
        let session = MessageControl::start(
            Arc::clone(&transport),
            parser,
            keys,
            SessionSettings::from_config(&self.shared.config),
            Arc::clone(&self.shared.exception_handler),
        )?;

        let mut connection = self.connection.lock();
        if self.cancel.is_cancelled() {
            drop(connection);
            session.stop()?;
            return Ok(());
        }

        connection.session = Some(session);
        connection.transport = Some(transport);
        connection.peer = Some(peer);
        self.shared.connected.store(true, Ordering::Release);
        drop(connection);

        info!("Slave connected from {}", peer);
        Ok(())
    }

    /// Stop the session, close the socket and mark the listener disconnected.
    /// Idempotent.
    pub fn close_connection(&self) {
        let mut connection = self.connection.lock();
        let session = connection.session.take();
        let transport = connection.transport.take();
        let peer = connection.peer.take();
        self.shared.connected.store(false, Ordering::Release);
        drop(connection);

        if let Some(session) = session {
            if let Err(e) = session.stop() {
                self.shared.report(&ListenerError::Connection(e));
            }
        }
        if let Some(transport) = transport {
            if let Err(e) = transport.close() {
                self.shared.report(&ListenerError::Connection(e));
            }
        }
        if let Some(peer) = peer {
            info!("Closed connection to slave {}", peer);
        }
    }

    /// Cancel the task and drop any live connection; no connection can be
    /// established afterwards
    pub fn stop(&self) {
        self.cancel.cancel();
        self.close_connection();
    }

    pub fn session(&self) -> Option<Arc<MessageControl>> {
        self.connection.lock().session.clone()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.lock().peer
    }
}

/// Every bind failure is fatal to the handler, whatever its io kind
fn bind_failure(addr: SocketAddr, err: &std::io::Error) -> ListenerError {
    ListenerError::init(format!("Failed to bind {}: {}", addr, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Framing;
    use crate::error::LoggingExceptionHandler;
    use std::time::Duration;

    fn shared(port: u16) -> Arc<ListenerShared> {
        let config = ListenerConfig::new(port, Framing::Tagged).with_host("127.0.0.1");
        Arc::new(ListenerShared::new(config, None, Arc::new(LoggingExceptionHandler)))
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_accepts_and_closes_connection() {
        let port = free_port();
        let shared = shared(port);
        let handler = Arc::new(ConnectionHandler::new(Arc::clone(&shared), CancellationToken::new()));
        let task = tokio::spawn(Arc::clone(&handler).run());

        wait_for(|| shared.server_socket_addr().is_some()).await;
        let _slave = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        wait_for(|| shared.is_connected()).await;
        assert!(handler.session().is_some());
        assert!(handler.peer_addr().is_some());

        // The accept loop is done once the slave is in
        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap();
        assert!(result.unwrap().is_ok());
        assert!(shared.is_connected());

        handler.close_connection();
        handler.close_connection();
        assert!(!shared.is_connected());
        assert!(handler.session().is_none());
        handler.stop();
    }

    #[tokio::test]
    async fn test_cancelled_handler_never_publishes_socket() {
        let shared = shared(free_port());
        let cancel = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        cancel.cancel();
        assert!(shared.install_server_socket(listener, &cancel).is_none());
        assert!(shared.server_socket_addr().is_none());

        // The refused listener was dropped, so the port is free again
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn test_any_bind_failure_is_init_error() {
        let addr = SocketAddr::from(([0, 0, 0, 0], 502));
        for kind in [
            std::io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::AddrInUse,
            std::io::ErrorKind::InvalidInput,
        ] {
            let err = bind_failure(addr, &std::io::Error::from(kind));
            assert!(matches!(err, ListenerError::Init(_)), "{:?} -> {:?}", kind, err);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_closing_server_socket_ends_accept() {
        let port = free_port();
        let shared = shared(port);
        let handler = Arc::new(ConnectionHandler::new(Arc::clone(&shared), CancellationToken::new()));
        let task = tokio::spawn(Arc::clone(&handler).run());

        wait_for(|| shared.server_socket_addr().is_some()).await;
        shared.close_server_socket();
        assert!(shared.server_socket_addr().is_none());

        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap();
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind_conflict_is_init_error() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let shared = shared(occupied.local_addr().unwrap().port());
        let handler = Arc::new(ConnectionHandler::new(shared, CancellationToken::new()));

        let result = tokio::time::timeout(Duration::from_secs(2), Arc::clone(&handler).run())
            .await
            .unwrap();
        assert!(matches!(result, Err(ListenerError::Init(_))));
    }
}
