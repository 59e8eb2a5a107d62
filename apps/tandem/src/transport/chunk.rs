use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};
use tandem_proto::FileChunk;
use thiserror::Error;
use tracing::{debug, warn};

use super::retry::RetryPolicy;

pub const DESKTOP_CHUNK_BYTES: usize = 64 * 1024;
pub const CONSTRAINED_CHUNK_BYTES: usize = 16 * 1024;
pub const DESKTOP_WINDOW: usize = 4;
pub const CONSTRAINED_WINDOW: usize = 2;
pub const MAX_RETRIES: u32 = 5;
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(15);
pub const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(300);
pub const BACKPRESSURE_THRESHOLD: usize = 1024 * 1024;
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const INLINE_THRESHOLD: usize = 5 * 1024 * 1024;
pub const BLOB_CLEANUP_DELAY: Duration = Duration::from_secs(60);
pub const MAX_FILE_BYTES: u64 = 1024 * 1024 * 1024;
pub const MAX_PARTIAL_TRANSFERS: usize = 8;
/// Longer than a sender's full retry cycle for one chunk.
pub const PARTIAL_TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);
const MIN_CHUNK_BYTES: usize = 1024;
const COMPLETED_MEMORY: usize = 64;
const FILE_ID_LEN: usize = 10;

/// Which tuning profile the transfer engine runs with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeviceClass {
    #[default]
    Desktop,
    /// Phones and other memory-constrained peers: smaller chunks, narrower window.
    Constrained,
}

impl std::str::FromStr for DeviceClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(Self::Desktop),
            "constrained" | "mobile" => Ok(Self::Constrained),
            other => Err(format!("unknown device class `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_bytes: usize,
    pub window: usize,
    pub max_retries: u32,
    pub chunk_timeout: Duration,
    pub retry_backoff: Duration,
    pub backpressure_threshold: usize,
    pub backpressure_poll: Duration,
    pub inline_threshold: usize,
    pub blob_cleanup_delay: Duration,
    pub max_file_bytes: u64,
    /// Files the receiver reassembles concurrently.
    pub max_partial_transfers: usize,
    /// A partial file with no new chunk for this long is discarded.
    pub partial_transfer_timeout: Duration,
}

impl TransferConfig {
    pub fn for_device(class: DeviceClass) -> Self {
        let (chunk_bytes, window) = match class {
            DeviceClass::Desktop => (DESKTOP_CHUNK_BYTES, DESKTOP_WINDOW),
            DeviceClass::Constrained => (CONSTRAINED_CHUNK_BYTES, CONSTRAINED_WINDOW),
        };
        Self {
            chunk_bytes,
            window,
            max_retries: MAX_RETRIES,
            chunk_timeout: CHUNK_TIMEOUT,
            retry_backoff: RETRY_BACKOFF_STEP,
            backpressure_threshold: BACKPRESSURE_THRESHOLD,
            backpressure_poll: BACKPRESSURE_POLL_INTERVAL,
            inline_threshold: INLINE_THRESHOLD,
            blob_cleanup_delay: BLOB_CLEANUP_DELAY,
            max_file_bytes: MAX_FILE_BYTES,
            max_partial_transfers: MAX_PARTIAL_TRANSFERS,
            partial_transfer_timeout: PARTIAL_TRANSFER_TIMEOUT,
        }
    }

    /// Device profile with `TANDEM_CHUNK_BYTES` / `TANDEM_WINDOW` overrides applied.
    pub fn from_env(class: DeviceClass) -> Self {
        let mut config = Self::for_device(class);
        config.chunk_bytes = parse_usize_env("TANDEM_CHUNK_BYTES", config.chunk_bytes, MIN_CHUNK_BYTES);
        config.window = parse_usize_env("TANDEM_WINDOW", config.window, 1);
        config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            attempt_timeout: self.chunk_timeout,
            backoff_step: self.retry_backoff,
        }
    }

    /// Largest `total` a receiver will allocate slots for.
    pub fn max_chunks(&self) -> u32 {
        let chunks = self.max_file_bytes.div_ceil(MIN_CHUNK_BYTES as u64);
        u32::try_from(chunks).unwrap_or(u32::MAX)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::for_device(DeviceClass::Desktop)
    }
}

/// Number of chunks a payload of `len` bytes is split into. Never zero.
pub fn chunk_total(len: usize, chunk_bytes: usize) -> u32 {
    let chunks = len.div_ceil(chunk_bytes.max(1)).max(1);
    u32::try_from(chunks).unwrap_or(u32::MAX)
}

pub fn chunk_slice(payload: &Bytes, index: u32, chunk_bytes: usize) -> Bytes {
    let start = (index as usize).saturating_mul(chunk_bytes).min(payload.len());
    let end = start.saturating_add(chunk_bytes).min(payload.len());
    payload.slice(start..end)
}

pub fn encode_chunk(file_id: &str, file_name: &str, index: u32, total: u32, bytes: &[u8]) -> FileChunk {
    FileChunk {
        file_id: file_id.to_owned(),
        index,
        total,
        file_name: file_name.to_owned(),
        chunk: STANDARD.encode(bytes),
    }
}

pub fn new_file_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(FILE_ID_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk total cannot be zero")]
    ZeroTotal,
    #[error("chunk index {index} out of range for total {total}")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("chunk total {total} exceeds limit of {limit}")]
    TooManyChunks { total: u32, limit: u32 },
    #[error("chunk total changed from {expected} to {got}")]
    TotalMismatch { expected: u32, got: u32 },
    #[error("chunk of {size} bytes exceeds limit of {limit}")]
    ChunkTooLarge { size: usize, limit: usize },
    #[error("file exceeds limit of {limit} bytes")]
    FileTooLarge { limit: u64 },
    #[error("already receiving {limit} files")]
    TooManyTransfers { limit: usize },
    #[error("chunk payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub file_id: String,
    pub file_name: String,
    pub bytes: Bytes,
    pub chunks: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// First copy of this index; transfer still incomplete.
    Stored { received: u32, total: u32 },
    /// Index already held, or the transfer already completed.
    Duplicate,
    Completed(CompletedFile),
}

#[derive(Debug)]
struct Transfer {
    file_name: String,
    total: u32,
    started_at: Instant,
    last_chunk_at: Instant,
    slots: HashMap<u32, Bytes>,
    received_bytes: u64,
}

impl Transfer {
    fn new(file_name: String, total: u32, now: Instant) -> Self {
        Self {
            file_name,
            total,
            started_at: now,
            last_chunk_at: now,
            slots: HashMap::new(),
            received_bytes: 0,
        }
    }
}

/// Receive side of file transfer: collects chunks that may arrive in any
/// order, any number of times, and yields each file exactly once.
///
/// Memory held for partial transfers is bounded: slots are only allocated for
/// chunks that actually arrive, each chunk and each file is size-capped, at
/// most `max_partial_transfers` files are open at once and a file that goes
/// quiet for `partial_transfer_timeout` is dropped.
#[derive(Debug)]
pub struct Reassembler {
    transfers: HashMap<String, Transfer>,
    completed: VecDeque<String>,
    max_chunks: u32,
    max_chunk_bytes: usize,
    max_file_bytes: u64,
    max_partials: usize,
    partial_timeout: Duration,
}

impl Reassembler {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            transfers: HashMap::new(),
            completed: VecDeque::with_capacity(COMPLETED_MEMORY),
            max_chunks: config.max_chunks(),
            // Peers may run a different device profile than ours.
            max_chunk_bytes: config.chunk_bytes.max(DESKTOP_CHUNK_BYTES),
            max_file_bytes: config.max_file_bytes,
            max_partials: config.max_partial_transfers,
            partial_timeout: config.partial_transfer_timeout,
        }
    }

    pub fn ingest(&mut self, chunk: &FileChunk, now: Instant) -> Result<Receipt, ChunkError> {
        if chunk.total == 0 {
            return Err(ChunkError::ZeroTotal);
        }
        if chunk.index >= chunk.total {
            return Err(ChunkError::IndexOutOfRange {
                index: chunk.index,
                total: chunk.total,
            });
        }
        if chunk.total > self.max_chunks {
            return Err(ChunkError::TooManyChunks {
                total: chunk.total,
                limit: self.max_chunks,
            });
        }
        let encoded_limit = self.max_chunk_bytes.div_ceil(3) * 4;
        if chunk.chunk.len() > encoded_limit {
            return Err(ChunkError::ChunkTooLarge {
                size: chunk.chunk.len() / 4 * 3,
                limit: self.max_chunk_bytes,
            });
        }
        if self.completed.iter().any(|id| id == &chunk.file_id) {
            return Ok(Receipt::Duplicate);
        }
        self.expire(now);
        match self.transfers.get(&chunk.file_id) {
            Some(transfer) => {
                if transfer.total != chunk.total {
                    return Err(ChunkError::TotalMismatch {
                        expected: transfer.total,
                        got: chunk.total,
                    });
                }
                if transfer.slots.contains_key(&chunk.index) {
                    return Ok(Receipt::Duplicate);
                }
            }
            None if self.transfers.len() >= self.max_partials => {
                return Err(ChunkError::TooManyTransfers {
                    limit: self.max_partials,
                });
            }
            None => {}
        }

        let payload = Bytes::from(STANDARD.decode(chunk.chunk.as_bytes())?);
        if payload.len() > self.max_chunk_bytes {
            return Err(ChunkError::ChunkTooLarge {
                size: payload.len(),
                limit: self.max_chunk_bytes,
            });
        }
        let transfer = self
            .transfers
            .entry(chunk.file_id.clone())
            .or_insert_with(|| Transfer::new(chunk.file_name.clone(), chunk.total, now));
        let received_bytes = transfer.received_bytes.saturating_add(payload.len() as u64);
        if received_bytes > self.max_file_bytes {
            self.transfers.remove(&chunk.file_id);
            return Err(ChunkError::FileTooLarge {
                limit: self.max_file_bytes,
            });
        }
        transfer.received_bytes = received_bytes;
        transfer.last_chunk_at = now;
        transfer.slots.insert(chunk.index, payload);

        let received = transfer.slots.len() as u32;
        let total = transfer.total;
        if received < total {
            return Ok(Receipt::Stored { received, total });
        }

        let Some(mut transfer) = self.transfers.remove(&chunk.file_id) else {
            return Ok(Receipt::Duplicate);
        };
        let mut combined = Vec::with_capacity(transfer.received_bytes as usize);
        for index in 0..total {
            if let Some(slot) = transfer.slots.remove(&index) {
                combined.extend_from_slice(&slot);
            }
        }
        self.remember_completed(chunk.file_id.clone());
        Ok(Receipt::Completed(CompletedFile {
            file_id: chunk.file_id.clone(),
            file_name: transfer.file_name,
            bytes: Bytes::from(combined),
            chunks: total,
            elapsed: now.saturating_duration_since(transfer.started_at),
        }))
    }

    pub fn in_progress(&self) -> usize {
        self.transfers.len()
    }

    /// Drops every partial transfer and returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.transfers.len();
        self.transfers.clear();
        self.completed.clear();
        dropped
    }

    fn expire(&mut self, now: Instant) {
        let timeout = self.partial_timeout;
        self.transfers.retain(|file_id, transfer| {
            let idle = now.saturating_duration_since(transfer.last_chunk_at);
            if idle < timeout {
                return true;
            }
            debug!(
                file_id = %file_id,
                received = transfer.slots.len(),
                total = transfer.total,
                "dropping stalled partial transfer"
            );
            false
        });
    }

    fn remember_completed(&mut self, file_id: String) {
        if self.completed.len() == COMPLETED_MEMORY {
            self.completed.pop_front();
        }
        self.completed.push_back(file_id);
    }
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "tandem::transport::chunk",
                    var, parsed, min, default, "transfer config below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "tandem::transport::chunk",
                    var,
                    error = %err,
                    default,
                    "failed to parse transfer config from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
