//! Reliable chat and file transfer over an open data channel.
//!
//! Files are split into base64 chunks sent with a bounded window. Each chunk
//! waits for a `chunk-ack` from the receiver and is resent with linear backoff
//! when the ack does not arrive in time. Every outgoing envelope first waits
//! for the channel's send buffer to drain below a threshold.

pub mod blob;
pub mod channel;
pub mod chunk;
pub mod message;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tandem_proto::{ChunkAck, Envelope, EnvelopeError, FileChunk, Inbound};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

pub use blob::{BlobRef, BlobStore};
pub use channel::{wait_until_drained, ChannelError, DataChannel, MemoryChannel};
pub use chunk::{DeviceClass, TransferConfig};
pub use message::{Content, Message, Sender};
pub use retry::{AttemptError, RetryError, RetryPolicy};

use chunk::{chunk_slice, chunk_total, encode_chunk, new_file_id, Reassembler, Receipt};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no open data channel")]
    NotConnected,
    #[error("file size {size} exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
    #[error("chunk {index} not acknowledged after {attempts} attempts ({reason})")]
    RetriesExhausted {
        index: u32,
        attempts: u32,
        reason: ChunkFailure,
    },
    #[error("transfer cancelled by teardown")]
    Cancelled,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Why a single chunk attempt did not get its ack.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkFailure {
    #[error("no ack within {0:?}")]
    TimedOut(Duration),
    #[error("send failed: {0}")]
    Send(String),
    #[error("cancelled")]
    Cancelled,
}

/// Something the peer sent that the session should surface.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(Message),
    /// Envelope with a type the transport does not handle (display name,
    /// screen-share flag, ...), passed through untouched.
    Control(Value),
}

type AckKey = (String, u32);

struct Inner {
    channel: Arc<dyn DataChannel>,
    config: TransferConfig,
    pending: Mutex<HashMap<AckKey, oneshot::Sender<()>>>,
    reassembler: Mutex<Reassembler>,
    blobs: BlobStore,
    closed: watch::Sender<bool>,
}

/// Cheap to clone; clones share the channel, pending acks and partial
/// transfers.
#[derive(Clone)]
pub struct ReliableTransport {
    inner: Arc<Inner>,
}

/// Removes a pending ack registration when the attempt that made it ends,
/// whichever way it ends.
struct PendingAck<'a> {
    pending: &'a Mutex<HashMap<AckKey, oneshot::Sender<()>>>,
    key: AckKey,
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}

impl ReliableTransport {
    pub fn new(channel: Arc<dyn DataChannel>, config: TransferConfig) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                channel,
                reassembler: Mutex::new(Reassembler::new(&config)),
                config,
                pending: Mutex::new(HashMap::new()),
                blobs: BlobStore::new(),
                closed,
            }),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn partial_transfers(&self) -> usize {
        self.inner.reassembler.lock().in_progress()
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    pub async fn send_chat(&self, content: String) -> Result<Message, TransferError> {
        if self.is_closed() {
            return Err(TransferError::NotConnected);
        }
        let text = Envelope::Chat {
            content: content.clone(),
        }
        .to_text()?;
        self.send_raw(text).await?;
        Ok(Message::Text {
            sender: Sender::Me,
            content,
        })
    }

    /// Sends an arbitrary control envelope. It must carry a `type` field.
    pub async fn send_control(&self, value: Value) -> Result<(), TransferError> {
        if self.is_closed() {
            return Err(TransferError::NotConnected);
        }
        let text = serde_json::to_string(&value).map_err(EnvelopeError::Encode)?;
        self.send_raw(text).await?;
        Ok(())
    }

    /// Sends `bytes` as a chunked file, reporting progress as a rounded
    /// percentage after each acknowledged chunk. Resolves with the local echo
    /// of the message once every chunk has been acknowledged.
    pub async fn send_file<P>(
        &self,
        file_name: &str,
        bytes: Bytes,
        mut progress: P,
    ) -> Result<Message, TransferError>
    where
        P: FnMut(u8) + Send,
    {
        if self.is_closed() {
            return Err(TransferError::NotConnected);
        }
        let config = self.inner.config;
        let size = bytes.len() as u64;
        if size > config.max_file_bytes {
            return Err(TransferError::TooLarge {
                size,
                limit: config.max_file_bytes,
            });
        }

        let file_id = new_file_id();
        let total = chunk_total(bytes.len(), config.chunk_bytes);
        let started = Instant::now();
        info!(file_id = %file_id, file_name, size, total, window = config.window, "sending file");

        let mut in_flight = FuturesUnordered::new();
        let mut next = 0u32;
        let mut acked = 0u32;
        while next < total || !in_flight.is_empty() {
            while next < total && in_flight.len() < config.window.max(1) {
                let chunk = encode_chunk(
                    &file_id,
                    file_name,
                    next,
                    total,
                    &chunk_slice(&bytes, next, config.chunk_bytes),
                );
                in_flight.push(self.send_chunk(chunk));
                next += 1;
            }
            if let Some(result) = in_flight.next().await {
                if let Err(err) = result {
                    warn!(file_id = %file_id, file_name, error = %err, "file transfer failed");
                    return Err(err);
                }
                acked += 1;
                progress(percent(acked, total));
            }
        }

        debug!(file_id = %file_id, elapsed = ?started.elapsed(), "file transfer complete");
        Ok(Message::File {
            sender: Sender::Me,
            file_name: file_name.to_owned(),
            size,
            content: self.materialize(bytes),
        })
    }

    async fn send_chunk(&self, chunk: FileChunk) -> Result<(), TransferError> {
        let key = (chunk.file_id.clone(), chunk.index);
        let index = chunk.index;
        let text = Envelope::FileChunk(chunk).to_text()?;
        let policy = self.inner.config.retry_policy();

        let outcome = policy
            .run(|attempt| {
                let text = text.clone();
                let key = key.clone();
                async move {
                    if attempt > 0 {
                        debug!(file_id = %key.0, index = key.1, attempt, "resending chunk");
                    }
                    let (tx, rx) = oneshot::channel();
                    let _registration = self.register_ack(key, tx)?;
                    match self.send_raw(text).await {
                        Ok(()) => {}
                        Err(TransferError::Cancelled) | Err(TransferError::Channel(ChannelError::Closed)) => {
                            return Err(AttemptError::Fatal(ChunkFailure::Cancelled))
                        }
                        Err(err) => return Err(AttemptError::Retryable(ChunkFailure::Send(err.to_string()))),
                    }
                    match policy.bounded(rx).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(_)) => Err(AttemptError::Fatal(ChunkFailure::Cancelled)),
                        Err(_) => Err(AttemptError::Retryable(ChunkFailure::TimedOut(
                            policy.attempt_timeout,
                        ))),
                    }
                }
            })
            .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(RetryError::Fatal(_)) => Err(TransferError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => Err(TransferError::RetriesExhausted {
                index,
                attempts,
                reason: last,
            }),
        }
    }

    fn register_ack(
        &self,
        key: AckKey,
        tx: oneshot::Sender<()>,
    ) -> Result<PendingAck<'_>, AttemptError<ChunkFailure>> {
        let mut pending = self.inner.pending.lock();
        // Checked under the lock so teardown cannot miss this registration.
        if self.is_closed() {
            return Err(AttemptError::Fatal(ChunkFailure::Cancelled));
        }
        pending.insert(key.clone(), tx);
        Ok(PendingAck {
            pending: &self.inner.pending,
            key,
        })
    }

    async fn send_raw(&self, text: String) -> Result<(), TransferError> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransferError::Cancelled);
        }
        let config = &self.inner.config;
        tokio::select! {
            _ = wait_until_drained(
                self.inner.channel.as_ref(),
                config.backpressure_threshold,
                config.backpressure_poll,
            ) => {}
            _ = closed.wait_for(|closed| *closed) => return Err(TransferError::Cancelled),
        }
        self.inner.channel.send_text(text).await?;
        Ok(())
    }

    /// Handles one text frame from the peer. Acks are consumed here; chat,
    /// completed files and control envelopes are returned to the caller.
    pub async fn handle_incoming(&self, text: &str) -> Option<TransportEvent> {
        match Inbound::parse(text) {
            Err(err) => {
                warn!(error = %err, "dropping malformed data channel message");
                None
            }
            Ok(Inbound::Control(value)) => Some(TransportEvent::Control(value)),
            Ok(Inbound::Envelope(Envelope::Chat { content })) => {
                Some(TransportEvent::Message(Message::Text {
                    sender: Sender::Peer,
                    content,
                }))
            }
            Ok(Inbound::Envelope(Envelope::ChunkAck(ack))) => {
                self.resolve_ack(ack);
                None
            }
            Ok(Inbound::Envelope(Envelope::FileChunk(chunk))) => self.receive_chunk(chunk),
        }
    }

    fn resolve_ack(&self, ack: ChunkAck) {
        let key = (ack.file_id, ack.index);
        match self.inner.pending.lock().remove(&key) {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => debug!(file_id = %key.0, index = key.1, "ack for chunk no longer pending"),
        }
    }

    fn receive_chunk(&self, chunk: FileChunk) -> Option<TransportEvent> {
        let receipt = self.inner.reassembler.lock().ingest(&chunk, Instant::now());
        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(err) => {
                warn!(file_id = %chunk.file_id, index = chunk.index, error = %err, "dropping malformed chunk");
                return None;
            }
        };

        let ack = Envelope::ChunkAck(ChunkAck {
            file_id: chunk.file_id.clone(),
            index: chunk.index,
        });
        match ack.to_text() {
            Ok(text) => self.spawn_ack(text, chunk.file_id.clone(), chunk.index),
            Err(err) => warn!(error = %err, "failed to encode chunk ack"),
        }

        match receipt {
            Receipt::Completed(file) => {
                info!(
                    file_id = %file.file_id,
                    file_name = %file.file_name,
                    size = file.bytes.len(),
                    chunks = file.chunks,
                    elapsed = ?file.elapsed,
                    "file received"
                );
                let size = file.bytes.len() as u64;
                Some(TransportEvent::Message(Message::File {
                    sender: Sender::Peer,
                    file_name: file.file_name,
                    size,
                    content: self.materialize(file.bytes),
                }))
            }
            Receipt::Duplicate => {
                debug!(file_id = %chunk.file_id, index = chunk.index, "duplicate chunk re-acked");
                None
            }
            Receipt::Stored { .. } => None,
        }
    }

    /// Sends an ack from a spawned task; backpressure on the ack never holds
    /// up the caller.
    fn spawn_ack(&self, text: String, file_id: String, index: u32) {
        let transport = self.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.send_raw(text).await {
                warn!(file_id = %file_id, index, error = %err, "failed to ack chunk");
            }
        });
    }

    fn materialize(&self, bytes: Bytes) -> Content {
        let config = &self.inner.config;
        if bytes.len() < config.inline_threshold {
            Content::inline(&bytes)
        } else {
            Content::Blob(self.inner.blobs.insert_expiring(bytes, config.blob_cleanup_delay))
        }
    }

    /// Stops the transport: rejects every pending ack, discards partial
    /// transfers and releases every blob. Idempotent.
    pub fn shutdown(&self) {
        let rejected = {
            let mut pending = self.inner.pending.lock();
            self.inner.closed.send_replace(true);
            let rejected = pending.len();
            pending.clear();
            rejected
        };
        let partials = self.inner.reassembler.lock().clear();
        let blobs = self.inner.blobs.release_all();
        debug!(rejected, partials, blobs, "transport shut down");
    }
}

fn percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).round() as u8
}
