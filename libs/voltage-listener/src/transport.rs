//! Byte-stream transports over an accepted slave socket
//!
//! Two flavours, selected by whether an [`EventPoll`] was supplied:
//! - [`StreamTransport`]: blocking socket, reads on a dedicated OS thread
//! - [`PolledTransport`]: non-blocking socket registered with the event-poll
//!   runtime, reads on a task spawned there

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ListenerError, TransportError};

const READ_BUFFER_SIZE: usize = 1024;

/// Events delivered from a transport to its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Bytes as read, not yet framed
    Data(Bytes),
    /// No more data will follow
    Closed(TransportError),
}

/// Duplex byte stream
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin delivering inbound bytes; may be called once
    fn start(&self, inbound: mpsc::UnboundedSender<Inbound>) -> Result<(), TransportError>;

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Shut the socket down in both directions; idempotent
    fn close(&self) -> Result<(), TransportError>;
}

/// Event-poll facility: the runtime that drives socket readiness for
/// [`PolledTransport`]
#[derive(Debug, Clone)]
pub struct EventPoll {
    handle: Handle,
}

impl EventPoll {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on
    pub fn current() -> Result<Self, ListenerError> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ListenerError::init(format!("No async runtime for event poll: {}", e)))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

/// Wrap an accepted socket in the transport the capability flag selects
pub fn open(stream: TcpStream, event_poll: Option<&EventPoll>) -> Result<Arc<dyn Transport>, TransportError> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("TCP_NODELAY: {}", e);
    }

    match event_poll {
        Some(poll) => Ok(Arc::new(PolledTransport::new(stream, poll.clone())?)),
        None => Ok(Arc::new(StreamTransport::new(stream)?)),
    }
}

/// Classify a read failure; anything after a local close is a closed socket
fn read_failure(err: std::io::Error, closed: bool) -> TransportError {
    if closed {
        TransportError::socket_closed("Transport closed")
    } else {
        TransportError::from(err)
    }
}

fn shutdown(control: &StdTcpStream) -> Result<(), TransportError> {
    match control.shutdown(Shutdown::Both) {
        Ok(()) => Ok(()),
        // Peer already gone
        Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Blocking transport
// ============================================================================

/// Blocking socket with a reader thread per connection
pub struct StreamTransport {
    control: StdTcpStream,
    writer: Arc<Mutex<StdTcpStream>>,
    reader: Mutex<Option<StdTcpStream>>,
    closed: Arc<AtomicBool>,
}

impl StreamTransport {
    pub fn new(stream: TcpStream) -> Result<Self, TransportError> {
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;

        Ok(Self {
            control: stream.try_clone()?,
            reader: Mutex::new(Some(stream.try_clone()?)),
            writer: Arc::new(Mutex::new(stream)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn start(&self, inbound: mpsc::UnboundedSender<Inbound>) -> Result<(), TransportError> {
        let mut reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| TransportError::Io("Transport already started".to_string()))?;
        let closed = Arc::clone(&self.closed);

        thread::Builder::new()
            .name("modbus-listener-rx".to_string())
            .spawn(move || {
                let mut buf = [0u8; READ_BUFFER_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            let event = if closed.load(Ordering::Acquire) {
                                TransportError::socket_closed("Transport closed")
                            } else {
                                TransportError::connection_broken("Peer closed connection")
                            };
                            let _ = inbound.send(Inbound::Closed(event));
                            break;
                        },
                        Ok(n) => {
                            if inbound.send(Inbound::Data(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                                break;
                            }
                        },
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            let event = read_failure(e, closed.load(Ordering::Acquire));
                            let _ = inbound.send(Inbound::Closed(event));
                            break;
                        },
                    }
                }
                debug!("Reader thread exited");
            })?;

        Ok(())
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::socket_closed("Transport closed"));
        }

        let writer = Arc::clone(&self.writer);
        let data = frame.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut stream = writer.lock();
            stream.write_all(&data)?;
            stream.flush()
        })
        .await
        .map_err(|e| TransportError::Io(format!("Writer task failed: {}", e)))??;
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        shutdown(&self.control)
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Transport close on drop: {}", e);
        }
    }
}

// ============================================================================
// Event-driven transport
// ============================================================================

/// Non-blocking socket driven by the event-poll runtime
pub struct PolledTransport {
    control: StdTcpStream,
    poll: EventPoll,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    reader: Mutex<Option<OwnedReadHalf>>,
    closed: CancellationToken,
}

impl PolledTransport {
    pub fn new(stream: TcpStream, poll: EventPoll) -> Result<Self, TransportError> {
        let stream = stream.into_std()?;
        let control = stream.try_clone()?;

        // Register with the event-poll reactor rather than the caller's
        let stream = {
            let _guard = poll.handle().enter();
            TcpStream::from_std(stream)?
        };
        let (reader, writer) = stream.into_split();

        Ok(Self {
            control,
            poll,
            writer: tokio::sync::Mutex::new(writer),
            reader: Mutex::new(Some(reader)),
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Transport for PolledTransport {
    fn start(&self, inbound: mpsc::UnboundedSender<Inbound>) -> Result<(), TransportError> {
        let mut reader = self
            .reader
            .lock()
            .take()
            .ok_or_else(|| TransportError::Io("Transport already started".to_string()))?;
        let closed = self.closed.clone();

        self.poll.handle().spawn(async move {
            let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
            loop {
                buf.reserve(READ_BUFFER_SIZE);
                let result = tokio::select! {
                    _ = closed.cancelled() => {
                        let _ = inbound.send(Inbound::Closed(TransportError::socket_closed("Transport closed")));
                        break;
                    }
                    result = reader.read_buf(&mut buf) => result,
                };

                match result {
                    Ok(0) => {
                        let _ = inbound.send(Inbound::Closed(TransportError::connection_broken(
                            "Peer closed connection",
                        )));
                        break;
                    },
                    Ok(_) => {
                        if inbound.send(Inbound::Data(buf.split().freeze())).is_err() {
                            break;
                        }
                    },
                    Err(e) => {
                        let _ = inbound.send(Inbound::Closed(read_failure(e, closed.is_cancelled())));
                        break;
                    },
                }
            }
            debug!("Reader task exited");
        });

        Ok(())
    }

    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::socket_closed("Transport closed"));
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        shutdown(&self.control)
    }
}

impl Drop for PolledTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Transport close on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }

    async fn exercise(transport: Arc<dyn Transport>, mut peer: TcpStream) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start(tx).unwrap();

        transport.write(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3]);

        peer.write_all(&[9, 8]).await.unwrap();
        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event, Inbound::Data(Bytes::from_static(&[9, 8])));

        // Peer hang-up surfaces as a broken connection
        drop(peer);
        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, Inbound::Closed(TransportError::ConnectionBroken(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stream_transport_exchange() {
        let (accepted, peer) = socket_pair().await;
        let transport = open(accepted, None).unwrap();
        exercise(transport, peer).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_polled_transport_exchange() {
        let (accepted, peer) = socket_pair().await;
        let poll = EventPoll::current().unwrap();
        let transport = open(accepted, Some(&poll)).unwrap();
        exercise(transport, peer).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_is_idempotent_and_blocks_writes() {
        let (accepted, mut peer) = socket_pair().await;
        let transport = open(accepted, None).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start(tx).unwrap();

        transport.close().unwrap();
        transport.close().unwrap();

        let err = transport.write(&[1]).await.unwrap_err();
        assert!(err.is_socket_closed());

        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, Inbound::Closed(TransportError::SocketClosed(_))));

        // The peer sees the shutdown as EOF
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_twice_fails() {
        let (accepted, _peer) = socket_pair().await;
        let transport = open(accepted, None).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.start(tx.clone()).unwrap();
        assert!(transport.start(tx).is_err());
    }
}
