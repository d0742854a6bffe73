//! The append-only replicated log.
//!
//! The log is an ordered sequence of indexed entries starting at index 1.
//! The leader appends locally; followers append while handling replicated
//! batches. Readers are cheap, hold an independent cursor, and observe
//! any write completed before they were last reset or advanced.

use std::sync::{Arc, RwLock};

use quorum_core::{Index, IndexedEntry, LogEntry};

/// The replicated log consumed by the consensus core.
///
/// Implementations carry their own internal synchronization; concurrent
/// readers against a single writer are legal.
pub trait Log: Send + Sync {
    /// Appends an entry, assigning it the next index.
    fn append(&self, entry: LogEntry) -> IndexedEntry;

    /// Opens a reader positioned at `from`.
    fn open_reader(&self, from: Index) -> Box<dyn LogReader>;

    /// Returns the index of the first retained entry, or the index
    /// after the last compacted entry if the log is empty.
    fn first_index(&self) -> Index;

    /// Returns the index of the last entry, or of the compaction point
    /// if the log is empty.
    fn last_index(&self) -> Index;

    /// Returns the last entry, if any entry is retained.
    fn last_entry(&self) -> Option<IndexedEntry>;

    /// Returns the entry at `index` if retained.
    fn entry(&self, index: Index) -> Option<IndexedEntry>;

    /// Drops all entries with `index > to` (follower conflict handling).
    fn truncate(&self, to: Index);

    /// Drops all entries with `index <= to` (post-snapshot compaction).
    fn compact(&self, to: Index);
}

/// An independent cursor over the log.
pub trait LogReader: Send {
    /// The index of the most recently returned entry, or the position
    /// before the cursor if none has been returned.
    fn current_index(&self) -> Index;

    /// The last index of the underlying log at this moment.
    fn last_index(&self) -> Index;

    /// Repositions the cursor so the next entry returned is at `index`.
    fn reset(&mut self, index: Index);

    /// Returns the next entry and advances, or `None` at the tail.
    fn next_entry(&mut self) -> Option<IndexedEntry>;
}

#[derive(Debug)]
struct LogInner {
    /// Index of `entries[0]`; stays meaningful when empty (next append
    /// goes at `first + entries.len()`).
    first: u64,
    entries: Vec<LogEntry>,
}

impl LogInner {
    fn last(&self) -> u64 {
        self.first + self.entries.len() as u64 - 1
    }

    fn get(&self, index: u64) -> Option<&LogEntry> {
        if index < self.first || self.entries.is_empty() || index > self.last() {
            return None;
        }
        self.entries.get((index - self.first) as usize)
    }
}

/// In-memory log implementation.
///
/// On-disk segment encodings are a deployment concern; this implementation
/// provides the full log contract with interior locking.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    inner: Arc<RwLock<LogInner>>,
}

impl MemoryLog {
    /// Creates a new empty log; the first appended entry gets index 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(LogInner {
                first: 1,
                entries: Vec::new(),
            })),
        }
    }

    /// Returns the number of retained entries.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.read().expect("log lock poisoned").entries.len() as u64
    }

    /// Returns true if no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().expect("log lock poisoned").entries.is_empty()
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for MemoryLog {
    fn append(&self, entry: LogEntry) -> IndexedEntry {
        let mut inner = self.inner.write().expect("log lock poisoned");
        let index = inner.first + inner.entries.len() as u64;
        inner.entries.push(entry.clone());
        IndexedEntry::new(Index::new(index), entry)
    }

    fn open_reader(&self, from: Index) -> Box<dyn LogReader> {
        Box::new(MemoryLogReader {
            inner: Arc::clone(&self.inner),
            next: from.get().max(1),
        })
    }

    fn first_index(&self) -> Index {
        Index::new(self.inner.read().expect("log lock poisoned").first)
    }

    fn last_index(&self) -> Index {
        let inner = self.inner.read().expect("log lock poisoned");
        Index::new(inner.first + inner.entries.len() as u64 - 1)
    }

    fn last_entry(&self) -> Option<IndexedEntry> {
        let inner = self.inner.read().expect("log lock poisoned");
        inner
            .entries
            .last()
            .map(|entry| IndexedEntry::new(Index::new(inner.last()), entry.clone()))
    }

    fn entry(&self, index: Index) -> Option<IndexedEntry> {
        let inner = self.inner.read().expect("log lock poisoned");
        inner
            .get(index.get())
            .map(|entry| IndexedEntry::new(index, entry.clone()))
    }

    fn truncate(&self, to: Index) {
        let mut inner = self.inner.write().expect("log lock poisoned");
        if inner.entries.is_empty() {
            return;
        }
        if to.get() < inner.first {
            inner.entries.clear();
            return;
        }
        let keep = (to.get() - inner.first + 1) as usize;
        if keep < inner.entries.len() {
            inner.entries.truncate(keep);
        }
    }

    fn compact(&self, to: Index) {
        let mut inner = self.inner.write().expect("log lock poisoned");
        if to.get() < inner.first {
            return;
        }
        let last = inner.first + inner.entries.len() as u64 - 1;
        let drop_to = to.get().min(last);
        let drop_count = (drop_to - inner.first + 1) as usize;
        inner.entries.drain(..drop_count);
        inner.first = drop_to + 1;
    }
}

struct MemoryLogReader {
    inner: Arc<RwLock<LogInner>>,
    /// Index of the next entry to return.
    next: u64,
}

impl LogReader for MemoryLogReader {
    fn current_index(&self) -> Index {
        Index::new(self.next - 1)
    }

    fn last_index(&self) -> Index {
        let inner = self.inner.read().expect("log lock poisoned");
        Index::new(inner.first + inner.entries.len() as u64 - 1)
    }

    fn reset(&mut self, index: Index) {
        self.next = index.get().max(1);
    }

    fn next_entry(&mut self) -> Option<IndexedEntry> {
        let inner = self.inner.read().expect("log lock poisoned");
        // A cursor that fell behind the compaction point skips forward.
        if self.next < inner.first {
            self.next = inner.first;
        }
        let entry = inner.get(self.next)?.clone();
        let index = Index::new(self.next);
        self.next += 1;
        Some(IndexedEntry::new(index, entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use quorum_core::Term;

    fn command(term: u64, value: &str) -> LogEntry {
        LogEntry::command(Term::new(term), 0, Bytes::from(value.to_owned()))
    }

    #[test]
    fn test_empty_log() {
        let log = MemoryLog::new();

        assert!(log.is_empty());
        assert_eq!(log.first_index(), Index::new(1));
        assert_eq!(log.last_index(), Index::ZERO);
        assert!(log.last_entry().is_none());
        assert!(log.entry(Index::new(1)).is_none());
    }

    #[test]
    fn test_append_assigns_sequential_indexes() {
        let log = MemoryLog::new();

        let first = log.append(command(1, "a"));
        let second = log.append(command(1, "b"));

        assert_eq!(first.index, Index::new(1));
        assert_eq!(second.index, Index::new(2));
        assert_eq!(log.last_index(), Index::new(2));
        assert_eq!(log.entry(Index::new(1)).unwrap().entry, command(1, "a"));
    }

    #[test]
    fn test_truncate_drops_suffix() {
        let log = MemoryLog::new();
        for value in ["a", "b", "c"] {
            log.append(command(1, value));
        }

        log.truncate(Index::new(1));

        assert_eq!(log.last_index(), Index::new(1));
        assert!(log.entry(Index::new(2)).is_none());

        // A fresh append continues after the truncation point.
        let appended = log.append(command(2, "d"));
        assert_eq!(appended.index, Index::new(2));
    }

    #[test]
    fn test_compact_drops_prefix_and_preserves_positions() {
        let log = MemoryLog::new();
        for value in ["a", "b", "c", "d"] {
            log.append(command(1, value));
        }

        log.compact(Index::new(2));

        assert_eq!(log.first_index(), Index::new(3));
        assert_eq!(log.last_index(), Index::new(4));
        assert!(log.entry(Index::new(2)).is_none());
        assert_eq!(log.entry(Index::new(3)).unwrap().entry, command(1, "c"));

        // Compacting the whole log leaves the append position intact.
        log.compact(Index::new(4));
        assert!(log.is_empty());
        assert_eq!(log.last_index(), Index::new(4));
        let appended = log.append(command(1, "e"));
        assert_eq!(appended.index, Index::new(5));
    }

    #[test]
    fn test_reader_observes_later_writes() {
        let log = MemoryLog::new();
        log.append(command(1, "a"));

        let mut reader = log.open_reader(Index::new(1));
        assert_eq!(reader.next_entry().unwrap().index, Index::new(1));
        assert!(reader.next_entry().is_none());

        // A write completed after the reader drained is visible.
        log.append(command(1, "b"));
        assert_eq!(reader.next_entry().unwrap().index, Index::new(2));
        assert_eq!(reader.current_index(), Index::new(2));
    }

    #[test]
    fn test_reader_reset() {
        let log = MemoryLog::new();
        for value in ["a", "b", "c"] {
            log.append(command(1, value));
        }

        let mut reader = log.open_reader(Index::new(1));
        reader.reset(Index::new(3));
        assert_eq!(reader.next_entry().unwrap().index, Index::new(3));

        reader.reset(Index::new(2));
        assert_eq!(reader.next_entry().unwrap().index, Index::new(2));
    }

    #[test]
    fn test_reader_skips_past_compaction() {
        let log = MemoryLog::new();
        for value in ["a", "b", "c"] {
            log.append(command(1, value));
        }
        let mut reader = log.open_reader(Index::new(1));

        log.compact(Index::new(2));

        let entry = reader.next_entry().unwrap();
        assert_eq!(entry.index, Index::new(3));
    }
}
