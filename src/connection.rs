//! Connection manager owning the shared duplex channel to the server.
//!
//! One [`ConnectionManager`] holds at most one live link. Outbound messages
//! are queued on a bounded channel drained by a writer task; inbound frames
//! are decoded on a reader task and fanned out through the shared
//! [`DispatchRegistry`]. Both tasks share a [`CancellationToken`] so either
//! side failing tears the link down promptly. [`ConnectionManager::send`]
//! never blocks: it fails immediately when the link is down or the outbound
//! queue is full.
//!
//! Framing is length-delimited; message bodies are encoded through the
//! configured [`Serializer`].

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, error, info, warn};

use crate::{
    dispatch::DispatchRegistry,
    protocol::ProtocolMessage,
    serializer::{BincodeSerializer, Serializer},
};

/// Messages queued for the writer task before backpressure applies.
const OUTBOUND_CAPACITY: usize = 32;

/// Errors surfaced by [`ConnectionManager`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// No live link to the server; the message was not sent.
    #[error("connection is not open")]
    NotConnected,
    /// The outbound queue is full; the message was not sent.
    #[error("outbound queue is full")]
    QueueFull,
    /// `connect` was called on a manager constructed without an address.
    #[error("no server address configured")]
    AddressRequired,
    /// Establishing the TCP connection failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// The channel ends and shutdown token of one live link.
struct Link {
    outbound: mpsc::Sender<ProtocolMessage>,
    shutdown: CancellationToken,
}

impl Link {
    fn is_open(&self) -> bool { !self.shutdown.is_cancelled() }
}

/// Trait alias for transports the manager can drive.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owns the shared connection and fans every inbound message out to the
/// registry.
///
/// Constructed explicitly by the application's composition root and shared as
/// an [`Arc`]; there is no implicit global instance.
pub struct ConnectionManager<S = BincodeSerializer> {
    registry: Arc<DispatchRegistry>,
    serializer: S,
    addr: Option<SocketAddr>,
    link: std::sync::Mutex<Option<Link>>,
}

impl ConnectionManager<BincodeSerializer> {
    /// Create a manager that connects to `addr` with the default serializer.
    #[must_use]
    pub fn new(addr: SocketAddr, registry: Arc<DispatchRegistry>) -> Self {
        Self::with_serializer(Some(addr), registry, BincodeSerializer)
    }

    /// Create a manager with no address, for transports installed via
    /// [`attach`](Self::attach) (in-process pipes, tests).
    #[must_use]
    pub fn detached(registry: Arc<DispatchRegistry>) -> Self {
        Self::with_serializer(None, registry, BincodeSerializer)
    }
}

impl<S> ConnectionManager<S>
where
    S: Serializer + Clone + Send + Sync + 'static,
{
    /// Create a manager using a custom serializer.
    #[must_use]
    pub fn with_serializer(
        addr: Option<SocketAddr>,
        registry: Arc<DispatchRegistry>,
        serializer: S,
    ) -> Self {
        Self {
            registry,
            serializer,
            addr,
            link: std::sync::Mutex::new(None),
        }
    }

    /// Registry this manager dispatches inbound messages through.
    #[must_use]
    pub fn registry(&self) -> &Arc<DispatchRegistry> { &self.registry }

    /// Whether a live link currently exists.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock_link().as_ref().is_some_and(Link::is_open)
    }

    /// Establish the TCP link if one is not already open.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::AddressRequired`] for a detached manager and
    /// [`ConnectionError::Io`] when the TCP connection fails.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        let addr = self.addr.ok_or(ConnectionError::AddressRequired)?;
        let stream = TcpStream::connect(addr).await?;
        info!(%addr, "connected to server");
        self.attach(stream);
        Ok(())
    }

    /// Install `stream` as the live link, replacing and cancelling any
    /// previous one.
    ///
    /// Spawns the reader and writer tasks for the new link.
    pub fn attach<T: Transport>(&self, stream: T) {
        let shutdown = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (sink, source) = framed.split();

        tokio::spawn(write_loop(
            self.serializer.clone(),
            sink,
            outbound_rx,
            shutdown.clone(),
        ));
        tokio::spawn(read_loop(
            self.serializer.clone(),
            source,
            Arc::clone(&self.registry),
            shutdown.clone(),
        ));

        let previous = self.lock_link().replace(Link {
            outbound: outbound_tx,
            shutdown,
        });
        if let Some(old) = previous {
            old.shutdown.cancel();
        }
    }

    /// Queue `message` for transmission.
    ///
    /// Returns immediately; actual transmission happens on the writer task.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] when no live link exists and
    /// [`ConnectionError::QueueFull`] under backpressure. In both cases the
    /// message was not sent.
    pub fn send(&self, message: ProtocolMessage) -> Result<(), ConnectionError> {
        let guard = self.lock_link();
        let link = guard.as_ref().ok_or(ConnectionError::NotConnected)?;
        if !link.is_open() {
            return Err(ConnectionError::NotConnected);
        }
        link.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::NotConnected,
        })
    }

    /// Tear down the live link, if any.
    pub fn close(&self) {
        if let Some(link) = self.lock_link().take() {
            link.shutdown.cancel();
            info!("connection closed");
        }
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, Option<Link>> {
        self.link
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Drain the outbound queue into the framed sink until cancelled.
async fn write_loop<S, W>(
    serializer: S,
    mut sink: W,
    mut outbound: mpsc::Receiver<ProtocolMessage>,
    shutdown: CancellationToken,
) where
    S: Serializer,
    W: futures::Sink<Bytes, Error = std::io::Error> + Unpin,
{
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let bytes = match serializer.serialize(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                // An unencodable message poisons nothing else; drop it.
                warn!(opcode = %message.opcode(), error = %e, "failed to encode outbound message");
                continue;
            }
        };
        if let Err(e) = sink.send(Bytes::from(bytes)).await {
            error!(error = %e, "write failed; closing connection");
            shutdown.cancel();
            break;
        }
        debug!(opcode = %message.opcode(), "message sent");
    }
}

/// Decode inbound frames and hand each message to the registry.
async fn read_loop<S, R>(
    serializer: S,
    mut source: R,
    registry: Arc<DispatchRegistry>,
    shutdown: CancellationToken,
) where
    S: Serializer,
    R: futures::Stream<Item = Result<bytes::BytesMut, std::io::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = source.next() => frame,
        };
        match frame {
            Some(Ok(bytes)) => match serializer.deserialize::<ProtocolMessage>(&bytes) {
                Ok((message, _)) => registry.dispatch(message),
                Err(e) => {
                    // A malformed body is recoverable; the framing layer
                    // still knows where the next message starts.
                    warn!(error = %e, "failed to decode inbound frame; skipping");
                }
            },
            Some(Err(e)) => {
                error!(error = %e, "read failed; closing connection");
                shutdown.cancel();
                break;
            }
            None => {
                info!("server closed the connection");
                shutdown.cancel();
                break;
            }
        }
    }
}
