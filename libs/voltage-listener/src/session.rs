//! Session controller
//!
//! Runs one request/response exchange at a time over a [`Transport`]. A reader
//! pump decodes inbound bytes and hands each response to the waiter registered
//! under its correlation key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use crate::codec::{IncomingEnvelope, MessageParser, OutgoingEnvelope, WaitingRoomKey, WaitingRoomKeyFactory};
use crate::config::ListenerConfig;
use crate::error::{ExceptionHandler, ListenerError, TransportError};
use crate::transport::{Inbound, Transport};

/// Per-request timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Response wait per attempt
    pub timeout: Duration,
    /// Resends after a timed-out attempt
    pub retries: u32,
}

impl SessionSettings {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            timeout: config.timeout(),
            retries: config.retries,
        }
    }
}

#[derive(Default)]
struct RoomState {
    pending: HashMap<WaitingRoomKey, oneshot::Sender<IncomingEnvelope>>,
    closed: Option<TransportError>,
}

/// Requests waiting for their response, by correlation key
#[derive(Default)]
struct WaitingRoom {
    state: Mutex<RoomState>,
}

impl WaitingRoom {
    fn enter(&self, key: WaitingRoomKey) -> Result<oneshot::Receiver<IncomingEnvelope>, TransportError> {
        let mut state = self.state.lock();
        if let Some(err) = &state.closed {
            return Err(err.clone());
        }
        if state.pending.contains_key(&key) {
            return Err(TransportError::protocol(format!("Request already waiting: {}", key)));
        }

        let (tx, rx) = oneshot::channel();
        state.pending.insert(key, tx);
        Ok(rx)
    }

    /// Returns false when nobody waits under `key`
    fn deliver(&self, key: WaitingRoomKey, envelope: IncomingEnvelope) -> bool {
        let waiter = self.state.lock().pending.remove(&key);
        match waiter {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    fn leave(&self, key: &WaitingRoomKey) {
        self.state.lock().pending.remove(key);
    }

    /// Fail current and future waiters with `err`; first close wins
    fn close(&self, err: TransportError) {
        let mut state = self.state.lock();
        if state.closed.is_none() {
            state.closed = Some(err);
        }
        state.pending.clear();
    }

    fn closed_error(&self) -> TransportError {
        self.state
            .lock()
            .closed
            .clone()
            .unwrap_or_else(|| TransportError::socket_closed("Session closed"))
    }
}

/// Session controller over one accepted connection
pub struct MessageControl {
    transport: Arc<dyn Transport>,
    keys: Arc<dyn WaitingRoomKeyFactory>,
    settings: SessionSettings,
    room: Arc<WaitingRoom>,
    pump: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl MessageControl {
    /// Start the reader pump and return the running session
    pub fn start(
        transport: Arc<dyn Transport>,
        parser: MessageParser,
        keys: Arc<dyn WaitingRoomKeyFactory>,
        settings: SessionSettings,
        exception_handler: Arc<dyn ExceptionHandler>,
    ) -> Result<Arc<Self>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.start(tx)?;

        let room = Arc::new(WaitingRoom::default());
        let pump = tokio::spawn(pump(
            rx,
            parser,
            Arc::clone(&keys),
            Arc::clone(&room),
            exception_handler,
        ));

        Ok(Arc::new(Self {
            transport,
            keys,
            settings,
            room,
            pump: Mutex::new(Some(pump)),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Send one request and wait for its response
    ///
    /// `Ok(None)` when the request is a broadcast or every attempt timed out.
    pub async fn send(&self, envelope: OutgoingEnvelope) -> Result<Option<IncomingEnvelope>, TransportError> {
        let frame = envelope.to_bytes();

        if !envelope.expects_response() {
            self.transport.write(&frame).await?;
            return Ok(None);
        }

        let key = self.keys.request_key(&envelope);
        for attempt in 0..=self.settings.retries {
            let rx = self.room.enter(key)?;

            if let Err(e) = self.transport.write(&frame).await {
                self.room.leave(&key);
                return Err(e);
            }

            match timeout(self.settings.timeout, rx).await {
                Ok(Ok(response)) => return Ok(Some(response)),
                // Waiter dropped: the room was closed under us
                Ok(Err(_)) => return Err(self.room.closed_error()),
                Err(_) => {
                    self.room.leave(&key);
                    debug!(
                        "No response for {} within {:?} (attempt {}/{})",
                        key,
                        self.settings.timeout,
                        attempt + 1,
                        self.settings.retries + 1
                    );
                },
            }
        }

        Ok(None)
    }

    /// Stop the pump and close the transport; idempotent
    pub fn stop(&self) -> Result<(), TransportError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.room.close(TransportError::socket_closed("Session stopped"));
        let result = self.transport.close();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        result
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for MessageControl {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn pump(
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    mut parser: MessageParser,
    keys: Arc<dyn WaitingRoomKeyFactory>,
    room: Arc<WaitingRoom>,
    exception_handler: Arc<dyn ExceptionHandler>,
) {
    let mut buffer = BytesMut::new();

    while let Some(event) = inbound.recv().await {
        match event {
            Inbound::Data(bytes) => {
                buffer.extend_from_slice(&bytes);
                loop {
                    match parser.decode(&mut buffer) {
                        Ok(Some(envelope)) => {
                            let key = keys.response_key(&envelope);
                            if !room.deliver(key, envelope) {
                                warn!("Dropping unsolicited response: {}", key);
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            exception_handler.received_exception(&ListenerError::Connection(e));
                            buffer.clear();
                            break;
                        },
                    }
                }
            },
            Inbound::Closed(err) => {
                debug!("Transport closed: {}", err);
                room.close(err);
                return;
            },
        }
    }

    trace!("Inbound channel closed");
    room.close(TransportError::socket_closed("Transport reader stopped"));
}
