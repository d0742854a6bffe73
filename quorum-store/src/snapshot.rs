//! Named, indexed binary snapshots.
//!
//! A snapshot captures the state machine at a specific log index. The
//! state machine writes one during compaction; the leader reads one to
//! install it on a lagging follower; a follower writes one while
//! receiving an install stream.
//!
//! A snapshot under construction is pending: `current_snapshot()` keeps
//! returning the previous snapshot until the writer completes, and
//! readers opened against the previous snapshot keep their bytes. This
//! makes installation safe against concurrent replication reads.
//!
//! Completed snapshots carry a CRC32 checksum over their bytes, which
//! readers verify before serving them.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

use bytes::{Bytes, BytesMut};
use quorum_core::Index;
use tracing::debug;

use crate::error::StoreError;

/// Store of snapshots keyed by index.
pub trait SnapshotStore: Send + Sync {
    /// Creates an empty pending snapshot identified by `index`.
    ///
    /// The snapshot becomes current once its writer completes.
    fn new_snapshot(&self, index: Index, timestamp_us: u64) -> Snapshot;

    /// Returns the highest-index completed snapshot, if any.
    fn current_snapshot(&self) -> Option<Snapshot>;
}

#[derive(Debug, Default)]
struct StoreInner {
    snapshots: RwLock<BTreeMap<u64, Snapshot>>,
}

/// In-memory snapshot store.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    inner: Arc<StoreInner>,
}

impl MemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn new_snapshot(&self, index: Index, timestamp_us: u64) -> Snapshot {
        debug!(index = %index, "creating pending snapshot");
        Snapshot {
            inner: Arc::new(SnapshotInner {
                index,
                timestamp_us,
                data: RwLock::new(None),
                store: Arc::downgrade(&self.inner),
            }),
        }
    }

    fn current_snapshot(&self) -> Option<Snapshot> {
        let snapshots = self.inner.snapshots.read().expect("snapshot lock poisoned");
        snapshots.values().next_back().cloned()
    }
}

#[derive(Debug)]
struct SnapshotData {
    bytes: Bytes,
    /// CRC32 of `bytes`, computed when the writer completed.
    checksum: u32,
}

#[derive(Debug)]
struct SnapshotInner {
    index: Index,
    timestamp_us: u64,
    /// `None` while pending; set exactly once when the writer completes.
    data: RwLock<Option<SnapshotData>>,
    store: Weak<StoreInner>,
}

/// A handle to a snapshot, cheap to clone.
#[derive(Debug, Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    /// The log index this snapshot covers up to (inclusive).
    #[must_use]
    pub fn index(&self) -> Index {
        self.inner.index
    }

    /// Leader wall clock when the snapshot was started, in microseconds.
    #[must_use]
    pub fn timestamp_us(&self) -> u64 {
        self.inner.timestamp_us
    }

    /// Returns true once the writer has completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.data.read().expect("snapshot lock poisoned").is_some()
    }

    /// The checksum of the snapshot bytes, or `None` while pending.
    #[must_use]
    pub fn checksum(&self) -> Option<u32> {
        self.inner
            .data
            .read()
            .expect("snapshot lock poisoned")
            .as_ref()
            .map(|data| data.checksum)
    }

    /// Verifies the stored bytes against their checksum. Returns false
    /// for a pending snapshot.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        self.inner
            .data
            .read()
            .expect("snapshot lock poisoned")
            .as_ref()
            .is_some_and(|data| crc32fast::hash(&data.bytes) == data.checksum)
    }

    /// Opens a writer for a pending snapshot.
    ///
    /// # Errors
    /// Returns an error if the snapshot is already complete.
    pub fn writer(&self) -> Result<SnapshotWriter, StoreError> {
        if self.is_complete() {
            return Err(StoreError::SnapshotComplete {
                index: self.inner.index,
            });
        }
        Ok(SnapshotWriter {
            snapshot: self.clone(),
            buf: BytesMut::new(),
        })
    }

    /// Opens a reader over the completed snapshot bytes, verifying
    /// them against the stored checksum first.
    ///
    /// # Errors
    /// Returns an error if the snapshot is still pending or the bytes
    /// fail verification.
    pub fn reader(&self) -> Result<SnapshotReader, StoreError> {
        let data = self.inner.data.read().expect("snapshot lock poisoned");
        let Some(data) = data.as_ref() else {
            return Err(StoreError::NotFound {
                index: self.inner.index,
            });
        };
        let actual = crc32fast::hash(&data.bytes);
        if actual != data.checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: data.checksum,
                actual,
            });
        }
        Ok(SnapshotReader {
            data: data.bytes.clone(),
        })
    }
}

/// Accumulates snapshot bytes; the snapshot becomes current on
/// [`SnapshotWriter::complete`]. Dropping the writer without completing
/// abandons the pending snapshot.
#[derive(Debug)]
pub struct SnapshotWriter {
    snapshot: Snapshot,
    buf: BytesMut,
}

impl SnapshotWriter {
    /// Appends bytes to the snapshot.
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the number of bytes written so far.
    #[must_use]
    pub fn written(&self) -> usize {
        self.buf.len()
    }

    /// Seals the snapshot and publishes it as current.
    pub fn complete(self) {
        let bytes = self.buf.freeze();
        let size = bytes.len();
        let checksum = crc32fast::hash(&bytes);
        *self
            .snapshot
            .inner
            .data
            .write()
            .expect("snapshot lock poisoned") = Some(SnapshotData { bytes, checksum });

        if let Some(store) = self.snapshot.inner.store.upgrade() {
            let mut snapshots = store.snapshots.write().expect("snapshot lock poisoned");
            snapshots.insert(self.snapshot.inner.index.get(), self.snapshot.clone());
        }
        debug!(index = %self.snapshot.index(), size, checksum, "snapshot complete");
    }
}

/// Reads a completed snapshot, whole or in chunks.
///
/// The reader holds the snapshot bytes it was opened against; a snapshot
/// installed concurrently does not affect it.
#[derive(Debug)]
pub struct SnapshotReader {
    data: Bytes,
}

impl SnapshotReader {
    /// Total size of the snapshot in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if no bytes remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the remaining bytes without consuming them.
    #[must_use]
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Takes the next chunk of at most `max_len` bytes, or `None` when
    /// drained.
    pub fn chunk(&mut self, max_len: usize) -> Option<Bytes> {
        if self.data.is_empty() {
            return None;
        }
        let len = self.data.len().min(max_len);
        Some(self.data.split_to(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_snapshot_is_not_current() {
        let store = MemorySnapshotStore::new();
        let snapshot = store.new_snapshot(Index::new(10), 0);

        assert!(!snapshot.is_complete());
        assert!(store.current_snapshot().is_none());
        assert!(snapshot.reader().is_err());
    }

    #[test]
    fn test_complete_publishes_current() {
        let store = MemorySnapshotStore::new();
        let snapshot = store.new_snapshot(Index::new(10), 42);

        let mut writer = snapshot.writer().unwrap();
        writer.write(b"state");
        writer.complete();

        let current = store.current_snapshot().unwrap();
        assert_eq!(current.index(), Index::new(10));
        assert_eq!(current.timestamp_us(), 42);
        assert_eq!(current.reader().unwrap().bytes(), Bytes::from("state"));
    }

    #[test]
    fn test_current_is_highest_index() {
        let store = MemorySnapshotStore::new();

        for index in [5u64, 20, 10] {
            let snapshot = store.new_snapshot(Index::new(index), 0);
            let writer = snapshot.writer().unwrap();
            writer.complete();
        }

        assert_eq!(store.current_snapshot().unwrap().index(), Index::new(20));
    }

    #[test]
    fn test_reader_unaffected_by_concurrent_install() {
        let store = MemorySnapshotStore::new();

        let old = store.new_snapshot(Index::new(5), 0);
        let mut writer = old.writer().unwrap();
        writer.write(b"old");
        writer.complete();

        let mut reader = store.current_snapshot().unwrap().reader().unwrap();

        // Install a newer snapshot while the reader is open.
        let new = store.new_snapshot(Index::new(9), 0);
        let mut writer = new.writer().unwrap();
        writer.write(b"new");
        writer.complete();

        assert_eq!(reader.chunk(16).unwrap(), Bytes::from("old"));
        assert_eq!(store.current_snapshot().unwrap().index(), Index::new(9));
    }

    #[test]
    fn test_chunked_read() {
        let store = MemorySnapshotStore::new();
        let snapshot = store.new_snapshot(Index::new(1), 0);
        let mut writer = snapshot.writer().unwrap();
        writer.write(b"abcdefgh");
        writer.complete();

        let mut reader = snapshot.reader().unwrap();
        assert_eq!(reader.len(), 8);
        assert_eq!(reader.chunk(3).unwrap(), Bytes::from("abc"));
        assert_eq!(reader.chunk(3).unwrap(), Bytes::from("def"));
        assert_eq!(reader.chunk(3).unwrap(), Bytes::from("gh"));
        assert!(reader.chunk(3).is_none());
    }

    #[test]
    fn test_writer_rejected_after_complete() {
        let store = MemorySnapshotStore::new();
        let snapshot = store.new_snapshot(Index::new(1), 0);
        snapshot.writer().unwrap().complete();

        assert!(matches!(
            snapshot.writer(),
            Err(StoreError::SnapshotComplete { .. })
        ));
    }

    #[test]
    fn test_checksum_computed_on_complete() {
        let store = MemorySnapshotStore::new();
        let snapshot = store.new_snapshot(Index::new(1), 0);
        assert!(snapshot.checksum().is_none());
        assert!(!snapshot.verify_checksum());

        let mut writer = snapshot.writer().unwrap();
        writer.write(b"state");
        writer.complete();

        assert_eq!(snapshot.checksum(), Some(crc32fast::hash(b"state")));
        assert!(snapshot.verify_checksum());
    }

    #[test]
    fn test_reader_rejects_corrupted_bytes() {
        let store = MemorySnapshotStore::new();
        let snapshot = store.new_snapshot(Index::new(1), 0);
        let mut writer = snapshot.writer().unwrap();
        writer.write(b"good");
        writer.complete();

        // Swap the stored bytes without touching the checksum.
        snapshot
            .inner
            .data
            .write()
            .unwrap()
            .as_mut()
            .unwrap()
            .bytes = Bytes::from_static(b"bad!");

        assert!(!snapshot.verify_checksum());
        assert!(matches!(
            snapshot.reader(),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }
}
