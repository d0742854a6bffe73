//! Quorum Core - Strongly-typed identifiers and the replicated-log data
//! model shared by the storage and consensus crates.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: a `Term` is not an `Index` is not a raw u64
//! - **Explicit limits**: every resource has a bounded maximum
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod entry;
mod member;
mod types;

pub mod limits;

pub use entry::{EntryDecodeError, EntryPayload, IndexedEntry, LogEntry};
pub use member::{Member, MemberType};
pub use types::{Index, MemberId, SessionId, StreamId, Term};
