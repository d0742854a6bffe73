//! Quorum Store - storage collaborators consumed by the consensus core.
//!
//! Three stores, each with its own internal synchronization:
//!
//! - [`Log`]: the append-only replicated log with independent readers
//! - [`MetadataStore`]: durable term and vote slots
//! - [`SnapshotStore`]: named, indexed binary snapshots
//!
//! In-memory implementations are provided for every store; the metadata
//! store additionally has a durable file-backed implementation.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod error;
mod log;
mod metadata;
mod snapshot;

pub use error::StoreError;
pub use log::{Log, LogReader, MemoryLog};
pub use metadata::{FileMetadataStore, MemoryMetadataStore, MetadataStore};
pub use snapshot::{MemorySnapshotStore, Snapshot, SnapshotReader, SnapshotStore, SnapshotWriter};
