use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{LocalMedia, MediaKind};
use crate::transport::DataChannel;

/// Which side of the offer/answer exchange a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("invalid session description: {0}")]
    Description(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

/// Asynchronous happenings on a peer connection.
pub enum LinkEvent {
    /// The data channel is open and ready for envelopes.
    ChannelOpen(Arc<dyn DataChannel>),
    /// One text frame from the peer's data channel.
    Message(String),
    /// A locally gathered ICE candidate, for trickle signaling.
    LocalCandidate(Value),
    RemoteTrack(MediaKind),
    Connected,
    Closed,
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkEvent::ChannelOpen(_) => f.write_str("ChannelOpen"),
            LinkEvent::Message(text) => f.debug_tuple("Message").field(&text.len()).finish(),
            LinkEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            LinkEvent::RemoteTrack(kind) => f.debug_tuple("RemoteTrack").field(kind).finish(),
            LinkEvent::Connected => f.write_str("Connected"),
            LinkEvent::Closed => f.write_str("Closed"),
        }
    }
}

/// One live peer connection. Session descriptions and candidates are opaque
/// JSON values relayed verbatim through signaling.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<Value, LinkError>;

    /// Applies the remote offer and returns the local answer.
    async fn accept_offer(&self, offer: Value) -> Result<Value, LinkError>;

    async fn apply_answer(&self, answer: Value) -> Result<(), LinkError>;

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), LinkError>;

    /// Swaps outgoing tracks in place, without renegotiation.
    async fn replace_tracks(&self, media: &LocalMedia) -> Result<(), LinkError>;

    async fn close(&self);
}

pub struct PeerHandle {
    pub link: Box<dyn PeerLink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Builds peer connections with local media attached.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        role: NegotiationRole,
        media: &LocalMedia,
    ) -> Result<PeerHandle, LinkError>;
}
