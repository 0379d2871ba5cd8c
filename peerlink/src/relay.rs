//! WebSocket link to the relay.
//!
//! [`connect`] opens the socket; [`RelayLink::new`] splits it into a cheap
//! sending handle and an I/O future that forwards decoded envelopes to the
//! client as [`RelayEvent`]s. Every event carries the generation number of
//! the connection attempt that produced it, so the client can ignore
//! leftovers from a connection it has already given up on.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peerlink_proto::codec::{self, CodecError};
use peerlink_proto::envelope::Envelope;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Socket type produced by [`connect`].
pub type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors from the relay link.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The connection attempt did not finish in time.
    #[error("timed out connecting to relay")]
    Timeout,

    /// Nothing is listening at the relay address.
    #[error("relay unreachable: {0}")]
    Unreachable(std::io::Error),

    /// The WebSocket handshake or transport failed.
    #[error("relay connection failed: {0}")]
    Connect(String),

    /// The link's I/O task has stopped.
    #[error("relay connection closed")]
    Closed,

    /// The envelope could not be encoded.
    #[error(transparent)]
    Encode(#[from] CodecError),
}

/// Something that happened on a relay connection.
#[derive(Debug)]
pub enum RelayEvent {
    /// The socket is open; `link` sends on it.
    Connected {
        /// Attempt number.
        generation: u64,
        /// Sending handle.
        link: RelayLink,
    },
    /// The attempt failed.
    ConnectFailed {
        /// Attempt number.
        generation: u64,
        /// Why.
        error: RelayError,
    },
    /// An envelope arrived.
    Envelope {
        /// Attempt number.
        generation: u64,
        /// Decoded envelope.
        envelope: Envelope,
    },
    /// The connection ended.
    Closed {
        /// Attempt number.
        generation: u64,
    },
}

/// Opens a WebSocket to `url`, giving up after `timeout`.
///
/// # Errors
///
/// - [`RelayError::Timeout`] if the handshake does not finish in time.
/// - [`RelayError::Unreachable`] if the connection is refused.
/// - [`RelayError::Connect`] for any other handshake failure.
pub async fn connect(url: &str, timeout: Duration) -> Result<RelaySocket, RelayError> {
    let (socket, _response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| {
            tracing::warn!(url, "relay WebSocket connect timed out");
            RelayError::Timeout
        })?
        .map_err(|e| {
            tracing::warn!(url, err = %e, "relay WebSocket connect failed");
            map_ws_connect_error(e)
        })?;
    tracing::info!(url, "connected to relay");
    Ok(socket)
}

/// Sending half of a relay connection.
///
/// Dropping the link closes the connection.
#[derive(Debug)]
pub struct RelayLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
}

impl RelayLink {
    /// Splits `socket` into a link and the I/O future that services it.
    ///
    /// The future must be polled (spawned) for anything to move. It runs
    /// until the socket ends or the link is dropped, then posts
    /// [`RelayEvent::Closed`].
    pub fn new(
        socket: RelaySocket,
        generation: u64,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> (Self, impl Future<Output = ()> + Send + 'static) {
        let (outbound, queue) = mpsc::unbounded_channel();
        let io = run_io(socket, generation, queue, events);
        (
            Self {
                generation,
                outbound,
            },
            io,
        )
    }

    /// Attempt number this link belongs to.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Encodes and queues `envelope` for sending.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Encode`] if serialization fails, or
    /// [`RelayError::Closed`] if the connection has ended.
    pub fn send(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let text = codec::encode(envelope)?;
        self.outbound.send(text).map_err(|_| RelayError::Closed)
    }
}

/// Pumps queued frames out and decoded envelopes in.
///
/// Malformed frames are logged and skipped; they do not end the link.
async fn run_io(
    socket: RelaySocket,
    generation: u64,
    mut queue: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    let (mut writer, mut reader) = socket.split();
    loop {
        tokio::select! {
            outgoing = queue.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = writer.send(Message::text(text)).await {
                        tracing::warn!(err = %e, "relay WebSocket write error");
                        break;
                    }
                }
                None => {
                    // Link dropped: close politely.
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => forward(codec::decode_str(text.as_str()), generation, &events),
                Some(Ok(Message::Binary(data))) => forward(codec::decode(&data), generation, &events),
                Some(Ok(Message::Close(_))) => {
                    tracing::info!("relay WebSocket closed by server");
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    tracing::warn!(err = %e, "relay WebSocket read error");
                    break;
                }
                None => break,
            },
        }
    }
    tracing::debug!(generation, "relay I/O task exiting");
    let _ = events.send(RelayEvent::Closed { generation });
}

fn forward(
    decoded: Result<Envelope, CodecError>,
    generation: u64,
    events: &mpsc::UnboundedSender<RelayEvent>,
) {
    match decoded {
        Ok(envelope) => {
            let _ = events.send(RelayEvent::Envelope {
                generation,
                envelope,
            });
        }
        Err(e) => tracing::warn!(err = %e, "malformed relay frame, skipping"),
    }
}

/// Map a tungstenite connect error into a [`RelayError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> RelayError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) =>
        {
            RelayError::Unreachable(io_err)
        }
        WsError::Http(response) => {
            RelayError::Connect(format!("relay HTTP error: status {}", response.status()))
        }
        other => RelayError::Connect(other.to_string()),
    }
}
