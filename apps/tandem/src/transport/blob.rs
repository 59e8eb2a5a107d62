use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to a large received payload held by a [`BlobStore`].
#[derive(Clone)]
pub struct BlobRef {
    id: u64,
    size: usize,
    store: BlobStore,
}

impl BlobRef {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The payload, or `None` once the store has released it.
    pub fn bytes(&self) -> Option<Bytes> {
        self.store.get(self.id)
    }

    pub fn release(&self) -> bool {
        self.store.release(self.id)
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobRef")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob:tandem/{}", self.id)
    }
}

impl PartialEq for BlobRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.store.inner, &other.store.inner)
    }
}

impl Eq for BlobRef {}

#[derive(Default)]
struct BlobInner {
    next_id: u64,
    blobs: HashMap<u64, Bytes>,
    timers: HashMap<u64, JoinHandle<()>>,
}

/// Session-scoped store for payloads too large to inline. Entries expire after
/// a delay or when the session tears down.
#[derive(Clone, Default)]
pub struct BlobStore {
    inner: Arc<Mutex<BlobInner>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bytes: Bytes) -> BlobRef {
        let size = bytes.len();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.blobs.insert(id, bytes);
        BlobRef {
            id,
            size,
            store: self.clone(),
        }
    }

    /// Inserts `bytes` and schedules its release after `delay`. Must be
    /// called from within a Tokio runtime.
    pub fn insert_expiring(&self, bytes: Bytes, delay: Duration) -> BlobRef {
        let size = bytes.len();
        // Held until the timer handle is recorded; the timer takes the same
        // lock before it removes anything.
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.blobs.insert(id, bytes);
        let store = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = store.inner.lock();
            inner.timers.remove(&id);
            if inner.blobs.remove(&id).is_some() {
                debug!(blob = id, "expired blob released");
            }
        });
        inner.timers.insert(id, timer);
        drop(inner);
        BlobRef {
            id,
            size,
            store: self.clone(),
        }
    }

    fn get(&self, id: u64) -> Option<Bytes> {
        self.inner.lock().blobs.get(&id).cloned()
    }

    fn release(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        if let Some(timer) = inner.timers.remove(&id) {
            timer.abort();
        }
        inner.blobs.remove(&id).is_some()
    }

    /// Releases every blob and cancels pending expiry timers.
    pub fn release_all(&self) -> usize {
        let mut inner = self.inner.lock();
        for (_, timer) in inner.timers.drain() {
            timer.abort();
        }
        let released = inner.blobs.len();
        inner.blobs.clear();
        released
    }

    pub fn len(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
