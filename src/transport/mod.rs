//! Transport abstraction layer.
//!
//! A [`Transport`] moves raw text frames over one duplex connection.
//! [`Connection`] wraps a transport with the session-facing contract:
//! connect-and-authenticate reported as a boolean, fire-and-forget sends,
//! an ordered receive loop and an idempotent stop.

pub mod channel;
pub mod websocket;

pub use channel::{ChannelPeer, ChannelTransport};
pub use websocket::WebSocketTransport;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Async duplex text-frame transport.
///
/// Uses `&self` with interior mutability so the receive loop and the
/// continuous-phase task can share one instance.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Opens the underlying connection.
    async fn open(&self) -> Result<()>;

    /// Writes one text frame.
    async fn send(&self, text: &str) -> Result<()>;

    /// Reads the next text frame.
    ///
    /// Returns `Ok(None)` when the peer closes the connection.
    async fn receive(&self) -> Result<Option<String>>;

    /// Closes the connection. Closing twice is not an error.
    async fn close(&self) -> Result<()>;

    /// Returns the type of this transport for logging.
    fn transport_type(&self) -> TransportType;
}

/// Transport type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// WebSocket client connection.
    WebSocket,
    /// In-process channel pair.
    Channel,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::Channel => write!(f, "channel"),
        }
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Handshake performed right after the connection opens.
///
/// Implementations send whatever login frame the server expects through
/// `transport` and report whether the handshake succeeded.
#[async_trait::async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Runs the handshake.
    async fn authenticate(&self, transport: &dyn Transport, credentials: &Value) -> bool;
}

/// Sends the credentials object verbatim as the login frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoginPayloadAuth;

#[async_trait::async_trait]
impl AuthStrategy for LoginPayloadAuth {
    async fn authenticate(&self, transport: &dyn Transport, credentials: &Value) -> bool {
        let payload = match serde_json::to_string(credentials) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "could not serialize login payload");
                return false;
            }
        };
        debug!(payload = %payload, "--> login");
        match transport.send(&payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "login send failed");
                false
            }
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// How a receive loop ended.
#[derive(Debug)]
pub enum ListenOutcome {
    /// The peer closed the connection.
    Closed,
    /// [`Connection::stop`] was called.
    Cancelled,
    /// A transport error ended the loop.
    Failed(TransportError),
}

/// Session-facing wrapper around a [`Transport`].
pub struct Connection {
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthStrategy>,
    credentials: Value,
    connected: AtomicBool,
    cancel: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport.transport_type())
            .field("connected", &self.is_connected())
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a connection that authenticates with `auth` and `credentials`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthStrategy>,
        credentials: Value,
    ) -> Self {
        Self {
            transport,
            auth,
            credentials,
            connected: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Returns `true` between a successful [`connect`](Self::connect) and the
    /// end of the connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Opens the transport and runs the authentication handshake.
    ///
    /// Returns `false`, leaving the connection unset, if opening fails, the
    /// handshake is rejected, or [`stop`](Self::stop) is called meanwhile.
    pub async fn connect(&self) -> bool {
        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!("connect cancelled");
                return false;
            }
            r = self.transport.open() => r,
        };
        if let Err(e) = opened {
            warn!(error = %e, transport = %self.transport.transport_type(), "connection failed");
            return false;
        }

        let authenticated = tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            ok = self.auth.authenticate(self.transport.as_ref(), &self.credentials) => ok,
        };
        if !authenticated || self.cancel.is_cancelled() {
            warn!("authentication failed");
            self.close_transport().await;
            return false;
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(transport = %self.transport.transport_type(), "connected");
        true
    }

    /// Writes one frame. Failures are logged and swallowed.
    pub async fn send(&self, text: &str) {
        if !self.is_connected() {
            warn!("send on closed connection dropped");
            return;
        }
        debug!(frame = %text, "--> sending");
        if let Err(e) = self.transport.send(text).await {
            warn!(error = %e, "send failed");
        }
    }

    /// Reads frames in order and awaits `on_frame` for each one.
    ///
    /// Returns when the peer closes, the transport fails, or
    /// [`stop`](Self::stop) is called. A frame already being handled is
    /// allowed to finish before the stop takes effect.
    pub async fn start_listening<F, Fut>(&self, mut on_frame: F) -> ListenOutcome
    where
        F: FnMut(String) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let outcome = loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break ListenOutcome::Cancelled,
                r = self.transport.receive() => r,
            };
            match next {
                Ok(Some(frame)) => {
                    debug!(frame = %frame, "<-- received");
                    on_frame(frame).await;
                }
                Ok(None) => {
                    info!("connection closed by peer");
                    break ListenOutcome::Closed;
                }
                Err(e) => {
                    error!(error = %e, "receive loop failed");
                    break ListenOutcome::Failed(e);
                }
            }
        };
        self.connected.store(false, Ordering::SeqCst);
        outcome
    }

    /// Cancels the receive loop and closes the transport.
    ///
    /// Safe to call repeatedly and concurrently with `connect`.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
        self.close_transport().await;
    }

    async fn close_transport(&self) {
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "error while closing transport");
        }
    }
}
