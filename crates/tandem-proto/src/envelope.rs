use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const TYPE_CHAT: &str = "chat";
const TYPE_FILE_CHUNK: &str = "file-chunk";
const TYPE_CHUNK_ACK: &str = "chunk-ack";

/// One fragment of a file in flight. `chunk` is the base64 text of the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    #[serde(rename = "fileId")]
    pub file_id: String,
    pub index: u32,
    pub total: u32,
    #[serde(rename = "fileName")]
    pub file_name: String,
    pub chunk: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkAck {
    #[serde(rename = "fileId")]
    pub file_id: String,
    pub index: u32,
}

/// Data-channel messages the transport itself understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "chat")]
    Chat { content: String },
    #[serde(rename = "file-chunk")]
    FileChunk(FileChunk),
    #[serde(rename = "chunk-ack")]
    ChunkAck(ChunkAck),
}

impl Envelope {
    pub fn to_text(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),
    #[error("envelope has no string `type` field")]
    MissingType,
    #[error("malformed `{kind}` envelope: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A decoded data-channel message: either a transport envelope or a control
/// message (display name, screen-share flag, ...) passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Envelope(Envelope),
    Control(Value),
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text).map_err(EnvelopeError::NotJson)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingType)?
            .to_owned();
        match kind.as_str() {
            TYPE_CHAT | TYPE_FILE_CHUNK | TYPE_CHUNK_ACK => serde_json::from_value(value)
                .map(Inbound::Envelope)
                .map_err(|source| EnvelopeError::Malformed { kind, source }),
            _ => Ok(Inbound::Control(value)),
        }
    }
}
