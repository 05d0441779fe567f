//! Listener-mode Modbus master
//!
//! Owns the worker pool, the server-socket slot and the current connection
//! handler. `init`, `destroy` and `send` serialize on one async mutex; the
//! connected/initialized flags are shared with the handler task as atomics.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{Framing, OutgoingEnvelope};
use crate::config::ListenerConfig;
use crate::constants::{DRAIN_TIMEOUT, RETRY_LIMIT};
use crate::error::{ExceptionHandler, ListenerError, LoggingExceptionHandler, Result, TransportError};
use crate::handler::{ConnectionHandler, ListenerShared};
use crate::pool::WorkerPool;
use crate::protocol::{ModbusRequest, ModbusResponse};
use crate::transport::EventPoll;

/// Point-in-time view of the listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerStatus {
    pub initialized: bool,
    pub connected: bool,
    /// Server socket bound and waiting for the slave
    pub accepting: bool,
    pub retries: u8,
    /// Completed full recoveries
    pub restarts: u64,
    pub next_transaction_id: u16,
}

#[derive(Default)]
struct MasterState {
    next_transaction_id: u16,
    retries: u8,
    pool: Option<WorkerPool>,
    handler: Option<Arc<ConnectionHandler>>,
}

impl MasterState {
    /// Post-increment, wrapping at 2^16
    fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = id.wrapping_add(1);
        id
    }
}

/// Builder for [`TcpListenerMaster`]
pub struct TcpListenerMasterBuilder {
    config: ListenerConfig,
    exception_handler: Arc<dyn ExceptionHandler>,
    event_poll: Option<EventPoll>,
}

impl TcpListenerMasterBuilder {
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            exception_handler: Arc::new(LoggingExceptionHandler),
            event_poll: None,
        }
    }

    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }

    /// Drive accepted sockets from this event poll instead of a reader thread
    pub fn event_poll(mut self, event_poll: EventPoll) -> Self {
        self.event_poll = Some(event_poll);
        self
    }

    pub fn build(self) -> TcpListenerMaster {
        TcpListenerMaster {
            shared: Arc::new(ListenerShared::new(
                self.config,
                self.event_poll,
                self.exception_handler,
            )),
            state: Mutex::new(MasterState::default()),
        }
    }
}

/// Modbus master that waits for the slave to connect to it
pub struct TcpListenerMaster {
    shared: Arc<ListenerShared>,
    state: Mutex<MasterState>,
}

impl TcpListenerMaster {
    pub fn new(config: ListenerConfig) -> Self {
        TcpListenerMasterBuilder::new(config).build()
    }

    pub fn builder(config: ListenerConfig) -> TcpListenerMasterBuilder {
        TcpListenerMasterBuilder::new(config)
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.shared.config
    }

    /// Start the worker pool and the connection handler
    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.shared.is_initialized() {
            debug!("Listener already initialized");
            return Ok(());
        }

        self.shared
            .config
            .validate()
            .map_err(|e| ListenerError::init(e.to_string()))?;

        let pool = WorkerPool::new(Arc::clone(&self.shared.exception_handler))?;
        let handler = self.start_listener(&pool)?;
        state.pool = Some(pool);
        state.handler = Some(handler);
        self.shared.set_initialized(true);

        info!(
            "Modbus listener initialized on {}:{} ({} framing)",
            self.shared.config.host, self.shared.config.port, self.shared.config.framing
        );
        Ok(())
    }

    /// Close the server socket and connection, then drain the worker pool.
    /// Failures go to the exception handler. Safe without a prior `init`.
    pub async fn destroy(&self) {
        let mut state = self.state.lock().await;
        self.shared.close_server_socket();
        self.terminate_listener(&mut state).await;
        self.shared.set_initialized(false);
        info!("Modbus listener destroyed");
    }

    /// Send one request to the connected slave
    ///
    /// `Ok(None)` when the listener is not initialized or the request is a
    /// broadcast.
    pub async fn send(&self, request: ModbusRequest) -> Result<Option<ModbusResponse>> {
        let mut state = self.state.lock().await;

        if !self.shared.is_connected() {
            return Err(ListenerError::NotConnected);
        }
        if !self.shared.is_initialized() {
            return Ok(None);
        }

        let slave_id = request.slave_id();
        let envelope = match self.shared.config.framing {
            Framing::Encapsulated => OutgoingEnvelope::encapsulated(request),
            Framing::Tagged => OutgoingEnvelope::tagged(request, state.next_transaction_id()),
        };
        let expects_response = envelope.expects_response();

        let session = state
            .handler
            .as_ref()
            .and_then(|handler| handler.session())
            .ok_or(ListenerError::NotConnected)?;

        let result = match session.send(envelope).await {
            Ok(Some(envelope)) => return Ok(Some(envelope.into_response())),
            Ok(None) if !expects_response => return Ok(None),
            Ok(None) => TransportError::NoResponse,
            Err(e) => e,
        };

        if result.needs_restart() || state.retries >= RETRY_LIMIT {
            warn!(
                "Send to slave {} failed ({}), restarting listener after {} retries",
                slave_id, result, state.retries
            );
            if let Err(restart) = self.recover(&mut state).await {
                return Err(ListenerError::transport(slave_id, restart));
            }
        } else {
            state.retries += 1;
            debug!(
                "Send to slave {} failed ({}), retry {}/{}",
                slave_id, result, state.retries, RETRY_LIMIT
            );
        }

        Err(ListenerError::transport(slave_id, result))
    }

    pub async fn status(&self) -> ListenerStatus {
        let state = self.state.lock().await;
        let connected = self.shared.is_connected();
        ListenerStatus {
            initialized: self.shared.is_initialized(),
            connected,
            accepting: !connected && self.shared.server_socket_addr().is_some(),
            retries: state.retries,
            restarts: self.shared.restarts(),
            next_transaction_id: state.next_transaction_id,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_initialized()
    }

    /// Address of the bound server socket, if any
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.server_socket_addr()
    }

    fn start_listener(&self, pool: &WorkerPool) -> Result<Arc<ConnectionHandler>> {
        let handler = Arc::new(ConnectionHandler::new(
            Arc::clone(&self.shared),
            pool.shutdown_token(),
        ));
        pool.execute(Arc::clone(&handler).run())?;
        Ok(handler)
    }

    /// Stop the handler and drain its pool
    async fn terminate_listener(&self, state: &mut MasterState) {
        if let Some(handler) = state.handler.take() {
            handler.stop();
        }
        // A handler that bound before the cancel may have published a socket
        self.shared.close_server_socket();
        if let Some(pool) = state.pool.take() {
            if let Err(e) = pool.shutdown(DRAIN_TIMEOUT).await {
                self.shared.report(&e);
            }
        }
    }

    /// Tear the listener stack down and rebuild it on the same port
    async fn recover(&self, state: &mut MasterState) -> std::result::Result<(), TransportError> {
        self.shared.close_server_socket();
        self.terminate_listener(state).await;

        if !self.shared.is_initialized() {
            debug!("Listener destroyed, not restarting");
            return Ok(());
        }

        let pool = WorkerPool::new(Arc::clone(&self.shared.exception_handler))
            .map_err(|e| TransportError::Restart(e.to_string()))?;
        let handler = self
            .start_listener(&pool)
            .map_err(|e| TransportError::Restart(e.to_string()))?;
        state.pool = Some(pool);
        state.handler = Some(handler);
        state.retries = 0;

        let restarts = self.shared.record_restart();
        info!("Modbus listener restarted ({} so far)", restarts);
        Ok(())
    }
}
