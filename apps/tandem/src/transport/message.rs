use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;

use super::blob::BlobRef;

const DATA_URL_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    Me,
    Peer,
}

/// Where a file's bytes can be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// `data:<mime>;base64,<payload>`
    Inline(String),
    Blob(BlobRef),
}

impl Content {
    pub fn inline(bytes: &[u8]) -> Self {
        Content::Inline(format!("data:{DATA_URL_MIME};base64,{}", STANDARD.encode(bytes)))
    }

    /// Decoded payload; `None` for a released blob or an unreadable data URL.
    pub fn bytes(&self) -> Option<Bytes> {
        match self {
            Content::Inline(url) => {
                let (_, encoded) = url.split_once(";base64,")?;
                STANDARD.decode(encoded).ok().map(Bytes::from)
            }
            Content::Blob(blob) => blob.bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text {
        sender: Sender,
        content: String,
    },
    File {
        sender: Sender,
        file_name: String,
        size: u64,
        content: Content,
    },
}

impl Message {
    pub fn sender(&self) -> Sender {
        match self {
            Message::Text { sender, .. } | Message::File { sender, .. } => *sender,
        }
    }
}
