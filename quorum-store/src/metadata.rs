//! Durable term and vote storage.
//!
//! Raft requires the current term and the vote cast in it to survive
//! restarts; both must be durable before the RPC response that depends
//! on them (a vote grant, a term bump) is emitted.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quorum_core::{MemberId, Term};
use tracing::debug;

use crate::error::StoreError;

/// Magic bytes for the metadata file format ("QMET").
const METADATA_MAGIC: u32 = 0x514D_4554;

/// Current version of the metadata file format.
const METADATA_VERSION: u32 = 1;

/// Stores the two durable slots of a Raft member: term and vote.
pub trait MetadataStore: Send + Sync {
    /// Durably stores the current term.
    ///
    /// # Errors
    /// Returns an error if the term cannot be persisted.
    fn store_term(&self, term: Term) -> Result<(), StoreError>;

    /// Loads the stored term, or `None` on a fresh start.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    fn load_term(&self) -> Result<Option<Term>, StoreError>;

    /// Durably stores the vote for the current term (or clears it).
    ///
    /// # Errors
    /// Returns an error if the vote cannot be persisted.
    fn store_vote(&self, vote: Option<&MemberId>) -> Result<(), StoreError>;

    /// Loads the stored vote.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    fn load_vote(&self) -> Result<Option<MemberId>, StoreError>;
}

/// In-memory metadata store for tests and simulations.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    state: Mutex<(Option<Term>, Option<MemberId>)>,
}

impl MemoryMetadataStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn store_term(&self, term: Term) -> Result<(), StoreError> {
        self.state.lock().expect("metadata lock poisoned").0 = Some(term);
        Ok(())
    }

    fn load_term(&self) -> Result<Option<Term>, StoreError> {
        Ok(self.state.lock().expect("metadata lock poisoned").0)
    }

    fn store_vote(&self, vote: Option<&MemberId>) -> Result<(), StoreError> {
        self.state.lock().expect("metadata lock poisoned").1 = vote.cloned();
        Ok(())
    }

    fn load_vote(&self) -> Result<Option<MemberId>, StoreError> {
        Ok(self.state.lock().expect("metadata lock poisoned").1.clone())
    }
}

/// File-backed metadata store.
///
/// The whole state is tiny, so every mutation rewrites the file:
/// magic, version, term, optional vote string, CRC32 of the body.
/// Writes go to a sibling temp file which is fsynced and renamed over
/// the live file, so a crash mid-write leaves the previous state.
#[derive(Debug)]
pub struct FileMetadataStore {
    path: PathBuf,
    state: Mutex<(Option<Term>, Option<MemberId>)>,
}

impl FileMetadataStore {
    /// Opens (or creates) the store at `path`, loading any existing state.
    ///
    /// # Errors
    /// Returns an error if an existing file cannot be read or fails
    /// validation.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match File::open(&path) {
            Ok(mut file) => {
                let mut raw = Vec::new();
                file.read_to_end(&mut raw)
                    .map_err(|e| StoreError::io("metadata read", e))?;
                Self::decode(&Bytes::from(raw))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (None, None),
            Err(e) => return Err(StoreError::io("metadata open", e)),
        };
        debug!(path = %path.display(), term = ?state.0, vote = ?state.1, "opened metadata store");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn decode(raw: &Bytes) -> Result<(Option<Term>, Option<MemberId>), StoreError> {
        let mut buf = raw.clone();
        if buf.remaining() < 8 {
            return Err(StoreError::corrupt("metadata file too short"));
        }
        if buf.get_u32_le() != METADATA_MAGIC {
            return Err(StoreError::corrupt("bad metadata magic"));
        }
        if buf.get_u32_le() != METADATA_VERSION {
            return Err(StoreError::corrupt("unsupported metadata version"));
        }

        // Checksum covers everything after the 8-byte header except the
        // trailing checksum itself.
        if buf.remaining() < 4 {
            return Err(StoreError::corrupt("metadata file truncated"));
        }
        let body = &raw[8..raw.len() - 4];
        let stored_crc = (&raw[raw.len() - 4..]).get_u32_le();
        let actual_crc = crc32fast::hash(body);
        if stored_crc != actual_crc {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: actual_crc,
            });
        }

        let mut body = Bytes::copy_from_slice(body);
        if body.remaining() < 9 {
            return Err(StoreError::corrupt("metadata body truncated"));
        }
        let term = match body.get_u64_le() {
            0 => None,
            t => Some(Term::new(t)),
        };
        let vote = if body.get_u8() == 1 {
            if body.remaining() < 2 {
                return Err(StoreError::corrupt("metadata vote truncated"));
            }
            let len = body.get_u16_le() as usize;
            if body.remaining() < len {
                return Err(StoreError::corrupt("metadata vote truncated"));
            }
            let bytes = body.copy_to_bytes(len);
            let id = std::str::from_utf8(&bytes)
                .map_err(|_| StoreError::corrupt("metadata vote is not utf-8"))?;
            Some(MemberId::from(id))
        } else {
            None
        };
        Ok((term, vote))
    }

    fn persist(&self, term: Option<Term>, vote: Option<&MemberId>) -> Result<(), StoreError> {
        let mut body = BytesMut::new();
        body.put_u64_le(term.map_or(0, Term::get));
        match vote {
            Some(id) => {
                body.put_u8(1);
                body.put_u16_le(id.as_str().len() as u16);
                body.extend_from_slice(id.as_str().as_bytes());
            }
            None => body.put_u8(0),
        }

        let mut file_bytes = BytesMut::new();
        file_bytes.put_u32_le(METADATA_MAGIC);
        file_bytes.put_u32_le(METADATA_VERSION);
        file_bytes.extend_from_slice(&body);
        file_bytes.put_u32_le(crc32fast::hash(&body));

        let tmp = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| StoreError::io("metadata create", e))?;
        file.write_all(&file_bytes)
            .map_err(|e| StoreError::io("metadata write", e))?;
        file.sync_all()
            .map_err(|e| StoreError::io("metadata sync", e))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io("metadata rename", e))?;
        Ok(())
    }
}

impl MetadataStore for FileMetadataStore {
    fn store_term(&self, term: Term) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("metadata lock poisoned");
        self.persist(Some(term), state.1.as_ref())?;
        state.0 = Some(term);
        Ok(())
    }

    fn load_term(&self) -> Result<Option<Term>, StoreError> {
        Ok(self.state.lock().expect("metadata lock poisoned").0)
    }

    fn store_vote(&self, vote: Option<&MemberId>) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("metadata lock poisoned");
        self.persist(state.0, vote)?;
        state.1 = vote.cloned();
        Ok(())
    }

    fn load_vote(&self) -> Result<Option<MemberId>, StoreError> {
        Ok(self.state.lock().expect("metadata lock poisoned").1.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryMetadataStore::new();

        assert!(store.load_term().unwrap().is_none());
        assert!(store.load_vote().unwrap().is_none());

        store.store_term(Term::new(3)).unwrap();
        store.store_vote(Some(&MemberId::from("foo"))).unwrap();

        assert_eq!(store.load_term().unwrap(), Some(Term::new(3)));
        assert_eq!(store.load_vote().unwrap(), Some(MemberId::from("foo")));

        store.store_vote(None).unwrap();
        assert!(store.load_vote().unwrap().is_none());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta");

        {
            let store = FileMetadataStore::open(&path).unwrap();
            store.store_term(Term::new(7)).unwrap();
            store.store_vote(Some(&MemberId::from("bar"))).unwrap();
        }

        let store = FileMetadataStore::open(&path).unwrap();
        assert_eq!(store.load_term().unwrap(), Some(Term::new(7)));
        assert_eq!(store.load_vote().unwrap(), Some(MemberId::from("bar")));
    }

    #[test]
    fn test_file_store_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMetadataStore::open(dir.path().join("meta")).unwrap();

        assert!(store.load_term().unwrap().is_none());
        assert!(store.load_vote().unwrap().is_none());
    }

    #[test]
    fn test_file_store_rejects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta");

        {
            let store = FileMetadataStore::open(&path).unwrap();
            store.store_term(Term::new(1)).unwrap();
        }

        // Flip a byte in the body.
        let mut raw = fs::read(&path).unwrap();
        raw[9] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        assert!(matches!(
            FileMetadataStore::open(&path),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }
}
