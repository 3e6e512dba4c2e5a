//! In-process transport backed by unbounded channels.
//!
//! [`ChannelTransport::pair`] returns the transport plus a [`ChannelPeer`]
//! that plays the server: it pushes inbound frames and reads what the
//! session sent. Dropping the peer closes the connection.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

use super::{Result, Transport, TransportType};

/// Transport half of an in-process connection.
#[derive(Debug)]
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
    open: AtomicBool,
    refuse_open: bool,
    closed: CancellationToken,
}

/// Server half of an in-process connection.
#[derive(Debug)]
pub struct ChannelPeer {
    sent: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    /// Creates a connected transport/peer pair.
    #[must_use]
    pub fn pair() -> (Self, ChannelPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let transport = Self {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            open: AtomicBool::new(false),
            refuse_open: false,
            closed: CancellationToken::new(),
        };
        let peer = ChannelPeer {
            sent: out_rx,
            inbound: in_tx,
        };
        (transport, peer)
    }

    /// Makes every `open()` fail, for exercising connect failures.
    #[must_use]
    pub fn refuse_open(mut self) -> Self {
        self.refuse_open = true;
        self
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn open(&self) -> Result<()> {
        if self.refuse_open || self.closed.is_cancelled() {
            return Err(TransportError::ConnectionFailed(
                "channel refused connection".to_string(),
            ));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(text.to_owned())
            .map_err(|_| TransportError::ConnectionClosed("peer dropped".to_string()))
    }

    async fn receive(&self) -> Result<Option<String>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Ok(None),
            frame = inbound.recv() => Ok(frame),
        }
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Channel
    }
}

impl ChannelPeer {
    /// Queues a raw inbound frame. Returns `false` if the transport is gone.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        self.inbound.send(frame.into()).is_ok()
    }

    /// Queues an `{"type":"event"}` frame.
    pub fn push_event(&self, event_type: &str, data: Value) -> bool {
        self.push(json!({"type": "event", "eventType": event_type, "data": data}).to_string())
    }

    /// Waits for the next frame the session sent.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    /// Returns every frame sent so far without waiting.
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }
}
