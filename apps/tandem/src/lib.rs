//! Tandem client core.
//!
//! A session joins a room on the `tandem-road` relay, negotiates one WebRTC
//! peer connection with whoever else is in the room, and then carries chat and
//! chunked file transfers over that connection's data channel.

pub mod cli;
pub mod config;
pub mod media;
pub mod orchestrator;
pub mod signaling;
pub mod transport;

pub use config::ClientConfig;
pub use orchestrator::{Orchestrator, SessionCommand, SessionEvent, SessionSettings};
pub use signaling::{SignalingClient, SignalingError};
