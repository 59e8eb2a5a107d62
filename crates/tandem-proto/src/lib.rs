//! Wire types shared by `tandem-road` and the Tandem client.
//!
//! Two independent formats live here: the signaling events exchanged with the
//! relay server over a websocket, and the envelopes the two peers exchange
//! over their data channel once connected.

pub mod envelope;
pub mod signaling;

pub use envelope::{ChunkAck, Envelope, EnvelopeError, FileChunk, Inbound};
pub use signaling::{ClientEvent, ServerEvent, SIGNALING_PATH};
