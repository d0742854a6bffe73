//! Replicated log entry data model.
//!
//! Every entry carries the term it was created in and a timestamp taken
//! on the leader. The timestamp is replicated with the entry so that
//! time-dependent decisions (session expiry) are evaluated against the
//! same clock value on every replica.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::member::{Member, MemberType};
use crate::types::{Index, MemberId, Term};

/// Payload tag bytes for the entry codec.
mod tags {
    pub const COMMAND: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const INITIALIZE: u8 = 3;
}

/// The payload of a replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPayload {
    /// An opaque client command for the state machine.
    Command(Bytes),
    /// A cluster membership change.
    Configuration(Vec<Member>),
    /// A no-op appended by a newly elected leader to commit entries
    /// from prior terms.
    Initialize,
}

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// The term in which the entry was created.
    pub term: Term,
    /// Leader wall clock at creation, in microseconds since the epoch.
    pub timestamp_us: u64,
    /// The payload.
    pub payload: EntryPayload,
}

impl LogEntry {
    /// Creates a command entry.
    #[must_use]
    pub const fn command(term: Term, timestamp_us: u64, value: Bytes) -> Self {
        Self {
            term,
            timestamp_us,
            payload: EntryPayload::Command(value),
        }
    }

    /// Creates a configuration entry.
    #[must_use]
    pub const fn configuration(term: Term, timestamp_us: u64, members: Vec<Member>) -> Self {
        Self {
            term,
            timestamp_us,
            payload: EntryPayload::Configuration(members),
        }
    }

    /// Creates an initialize (leader no-op) entry.
    #[must_use]
    pub const fn initialize(term: Term, timestamp_us: u64) -> Self {
        Self {
            term,
            timestamp_us,
            payload: EntryPayload::Initialize,
        }
    }

    /// Returns the serialized size of this entry in bytes.
    ///
    /// Used for append-batch accounting against `MAX_BATCH_BYTES`.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        // term(8) + timestamp(8) + tag(1)
        let header = 17;
        let payload = match &self.payload {
            EntryPayload::Command(value) => 4 + value.len(),
            EntryPayload::Configuration(members) => {
                let mut len = 4;
                for member in members {
                    len += 4 + member.id.as_str().len() + 4 + member.host.len() + 2 + 1;
                }
                len
            }
            EntryPayload::Initialize => 0,
        };
        header + payload
    }

    /// Encodes the entry into the buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.term.get());
        buf.put_u64_le(self.timestamp_us);
        match &self.payload {
            EntryPayload::Command(value) => {
                buf.put_u8(tags::COMMAND);
                buf.put_u32_le(value.len() as u32);
                buf.extend_from_slice(value);
            }
            EntryPayload::Configuration(members) => {
                buf.put_u8(tags::CONFIGURATION);
                buf.put_u32_le(members.len() as u32);
                for member in members {
                    put_str(buf, member.id.as_str());
                    put_str(buf, &member.host);
                    buf.put_u16_le(member.port);
                    buf.put_u8(member.member_type.as_u8());
                }
            }
            EntryPayload::Initialize => buf.put_u8(tags::INITIALIZE),
        }
    }

    /// Decodes an entry from the buffer.
    ///
    /// # Errors
    /// Returns an error if the buffer is truncated or the payload tag
    /// is unknown.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, EntryDecodeError> {
        if buf.remaining() < 17 {
            return Err(EntryDecodeError::Truncated);
        }
        let term = Term::new(buf.get_u64_le());
        let timestamp_us = buf.get_u64_le();
        let tag = buf.get_u8();

        let payload = match tag {
            tags::COMMAND => {
                let len = read_len(buf)?;
                if buf.remaining() < len {
                    return Err(EntryDecodeError::Truncated);
                }
                EntryPayload::Command(buf.copy_to_bytes(len))
            }
            tags::CONFIGURATION => {
                let count = read_len(buf)?;
                let mut members = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let id = get_str(buf)?;
                    let host = get_str(buf)?;
                    if buf.remaining() < 3 {
                        return Err(EntryDecodeError::Truncated);
                    }
                    let port = buf.get_u16_le();
                    let member_type = MemberType::from_u8(buf.get_u8())
                        .ok_or(EntryDecodeError::InvalidMemberType)?;
                    members.push(Member {
                        id: MemberId::from(id),
                        host,
                        port,
                        member_type,
                    });
                }
                EntryPayload::Configuration(members)
            }
            tags::INITIALIZE => EntryPayload::Initialize,
            other => return Err(EntryDecodeError::UnknownTag(other)),
        };

        Ok(Self {
            term,
            timestamp_us,
            payload,
        })
    }
}

/// An entry paired with its position in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEntry {
    /// The log index of the entry.
    pub index: Index,
    /// The entry itself.
    pub entry: LogEntry,
}

impl IndexedEntry {
    /// Creates a new indexed entry.
    #[must_use]
    pub const fn new(index: Index, entry: LogEntry) -> Self {
        Self { index, entry }
    }
}

/// Errors from decoding a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDecodeError {
    /// The buffer ended before the entry did.
    Truncated,
    /// The payload tag byte is not a known payload kind.
    UnknownTag(u8),
    /// A configuration member carried an invalid type byte.
    InvalidMemberType,
    /// A length-prefixed string is not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for EntryDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => f.write_str("entry truncated"),
            Self::UnknownTag(tag) => write!(f, "unknown entry payload tag {tag}"),
            Self::InvalidMemberType => f.write_str("invalid member type"),
            Self::InvalidUtf8 => f.write_str("invalid utf-8 in entry"),
        }
    }
}

impl std::error::Error for EntryDecodeError {}

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

fn get_str(buf: &mut impl Buf) -> Result<String, EntryDecodeError> {
    let len = read_len(buf)?;
    if buf.remaining() < len {
        return Err(EntryDecodeError::Truncated);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| EntryDecodeError::InvalidUtf8)
}

fn read_len(buf: &mut impl Buf) -> Result<usize, EntryDecodeError> {
    if buf.remaining() < 4 {
        return Err(EntryDecodeError::Truncated);
    }
    Ok(buf.get_u32_le() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(entry: &LogEntry) -> Bytes {
        let mut buf = BytesMut::new();
        entry.encode(&mut buf);
        buf.freeze()
    }

    #[test]
    fn test_command_roundtrip() {
        let entry = LogEntry::command(Term::new(2), 1000, Bytes::from("set x"));
        let mut encoded = encode(&entry);

        assert_eq!(encoded.len(), entry.encoded_len());
        let decoded = LogEntry::decode(&mut encoded).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_configuration_roundtrip() {
        let members = vec![
            Member::new("foo", "localhost", 5001),
            Member::new("bar", "localhost", 5002).with_type(MemberType::Passive),
        ];
        let entry = LogEntry::configuration(Term::new(1), 42, members);
        let mut encoded = encode(&entry);

        assert_eq!(encoded.len(), entry.encoded_len());
        let decoded = LogEntry::decode(&mut encoded).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_initialize_roundtrip() {
        let entry = LogEntry::initialize(Term::new(7), 9);
        let mut encoded = encode(&entry);

        assert_eq!(encoded.len(), entry.encoded_len());
        let decoded = LogEntry::decode(&mut encoded).unwrap();
        assert_eq!(decoded.payload, EntryPayload::Initialize);
        assert_eq!(decoded.term, Term::new(7));
    }

    #[test]
    fn test_decode_truncated() {
        let entry = LogEntry::command(Term::new(1), 1, Bytes::from("value"));
        let encoded = encode(&entry);
        let mut short = encoded.slice(..encoded.len() - 2);

        assert_eq!(LogEntry::decode(&mut short), Err(EntryDecodeError::Truncated));
    }

    #[test]
    fn test_decode_unknown_tag() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(1);
        buf.put_u64_le(1);
        buf.put_u8(99);

        let mut encoded = buf.freeze();
        assert_eq!(
            LogEntry::decode(&mut encoded),
            Err(EntryDecodeError::UnknownTag(99))
        );
    }
}
