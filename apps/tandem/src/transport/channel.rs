use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("data channel closed")]
    Closed,
    #[error("data channel send failed: {0}")]
    Send(String),
}

/// A message-oriented channel to the peer, as exposed by an open WebRTC data
/// channel. Text frames only; binary payloads are base64 inside envelopes.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), ChannelError>;

    /// Bytes queued locally and not yet handed to the network.
    async fn buffered_amount(&self) -> usize;
}

/// Waits until `channel` has at most `threshold` bytes buffered, checking
/// every `poll`. There is no upper bound on the wait.
pub async fn wait_until_drained(channel: &dyn DataChannel, threshold: usize, poll: Duration) {
    while channel.buffered_amount().await > threshold {
        tokio::time::sleep(poll).await;
    }
}

/// In-process channel end: frames sent here come out of the paired receiver.
/// The buffered amount is whatever the owner last set, which lets callers
/// simulate a congested link.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<String>,
    buffered: Arc<AtomicUsize>,
}

impl MemoryChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                buffered: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    pub fn set_buffered_amount(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        self.tx.send(text).map_err(|_| ChannelError::Closed)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}
