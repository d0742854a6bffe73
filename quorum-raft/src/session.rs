//! Client sessions and the session request envelope.
//!
//! A session is created by a committed `OpenSession` command and named
//! by the log index of that command. Sessions give clients exactly-once
//! command semantics (per-sequence deduplication with cached responses)
//! and server-push event streams. Expiry is evaluated against entry
//! timestamps during apply, so every replica expires the same session
//! at the same log position.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quorum_core::limits::STREAM_BUFFER_ENTRIES_MAX;
use quorum_core::{Index, SessionId, StreamId};

use crate::protocol::ResponseError;

/// The outcome of applying a session command, cached for deduplication.
pub(crate) type CommandResult = Result<Bytes, (ResponseError, Option<String>)>;

/// One client session.
#[derive(Debug)]
pub(crate) struct Session {
    /// The index of the `OpenSession` entry.
    pub id: SessionId,
    /// Expiry timeout in milliseconds.
    pub timeout_ms: u64,
    /// Highest command sequence applied for this session.
    pub last_command_sequence: u64,
    /// Entry timestamp of the last command or keep-alive.
    pub kept_alive_us: u64,
    /// Cached responses keyed by sequence, pruned by keep-alive acks.
    results: HashMap<u64, CommandResult>,
    /// Event streams keyed by stream ID.
    streams: HashMap<StreamId, EventStream>,
}

/// A server-push stream within a session.
#[derive(Debug, Default)]
pub(crate) struct EventStream {
    /// Highest event index acknowledged by the client.
    pub last_response_index: Index,
    /// Buffered events awaiting acknowledgement.
    buffer: Vec<(Index, Bytes)>,
}

impl Session {
    pub(crate) fn new(id: SessionId, timeout_ms: u64, opened_at_us: u64) -> Self {
        Self {
            id,
            timeout_ms,
            last_command_sequence: 0,
            kept_alive_us: opened_at_us,
            results: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    /// Whether the session has expired as of `now_us` (an entry
    /// timestamp, not wall clock).
    pub(crate) fn is_expired(&self, now_us: u64) -> bool {
        now_us.saturating_sub(self.kept_alive_us) > self.timeout_ms * 1000
    }

    /// Returns the cached result for a sequence at or below the
    /// dedup horizon, if still cached.
    pub(crate) fn cached_result(&self, sequence: u64) -> Option<&CommandResult> {
        self.results.get(&sequence)
    }

    /// Records the result of a freshly applied command.
    pub(crate) fn record_result(&mut self, sequence: u64, result: CommandResult) {
        self.last_command_sequence = sequence;
        self.results.insert(sequence, result);
    }

    /// Processes a keep-alive: refreshes the expiry clock, prunes
    /// result caches at or below the acknowledged sequence, and
    /// releases stream buffers at or below the acknowledged indexes.
    pub(crate) fn keep_alive(
        &mut self,
        now_us: u64,
        command_sequence: u64,
        stream_acks: &[(StreamId, Index)],
    ) {
        self.kept_alive_us = now_us;
        self.results.retain(|&seq, _| seq > command_sequence);
        for (stream_id, last_received) in stream_acks {
            if let Some(stream) = self.streams.get_mut(stream_id) {
                stream.last_response_index = (*last_received).max(stream.last_response_index);
                stream.buffer.retain(|(index, _)| index > last_received);
            }
        }
    }

    /// Buffers an event published by the state machine. The oldest
    /// unacknowledged event is dropped once the buffer is full.
    pub(crate) fn publish(&mut self, stream_id: StreamId, index: Index, event: Bytes) {
        let stream = self.streams.entry(stream_id).or_default();
        if stream.buffer.len() >= STREAM_BUFFER_ENTRIES_MAX {
            stream.buffer.remove(0);
        }
        stream.buffer.push((index, event));
    }

    /// Returns the buffered, unacknowledged events of a stream.
    pub(crate) fn pending_events(&self, stream_id: StreamId) -> Vec<(Index, Bytes)> {
        self.streams
            .get(&stream_id)
            .map(|s| s.buffer.clone())
            .unwrap_or_default()
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id.get());
        buf.put_u64_le(self.timeout_ms);
        buf.put_u64_le(self.last_command_sequence);
        buf.put_u64_le(self.kept_alive_us);
        buf.put_u32_le(self.results.len() as u32);
        for (sequence, result) in &self.results {
            buf.put_u64_le(*sequence);
            match result {
                Ok(output) => {
                    buf.put_u8(1);
                    buf.put_u32_le(output.len() as u32);
                    buf.extend_from_slice(output);
                }
                Err(_) => buf.put_u8(0),
            }
        }
        buf.put_u32_le(self.streams.len() as u32);
        for (stream_id, stream) in &self.streams {
            buf.put_u64_le(stream_id.get());
            buf.put_u64_le(stream.last_response_index.get());
        }
    }

    pub(crate) fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 36 {
            return None;
        }
        let id = SessionId::new(buf.get_u64_le());
        let timeout_ms = buf.get_u64_le();
        let last_command_sequence = buf.get_u64_le();
        let kept_alive_us = buf.get_u64_le();

        let result_count = buf.get_u32_le() as usize;
        let mut results = HashMap::with_capacity(result_count.min(64));
        for _ in 0..result_count {
            if buf.remaining() < 9 {
                return None;
            }
            let sequence = buf.get_u64_le();
            let result = if buf.get_u8() == 1 {
                if buf.remaining() < 4 {
                    return None;
                }
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return None;
                }
                Ok(buf.copy_to_bytes(len))
            } else {
                Err((ResponseError::ApplicationError, None))
            };
            results.insert(sequence, result);
        }

        if buf.remaining() < 4 {
            return None;
        }
        let stream_count = buf.get_u32_le() as usize;
        let mut streams = HashMap::with_capacity(stream_count.min(64));
        for _ in 0..stream_count {
            if buf.remaining() < 16 {
                return None;
            }
            let stream_id = StreamId::new(buf.get_u64_le());
            let last_response_index = Index::new(buf.get_u64_le());
            streams.insert(
                stream_id,
                EventStream {
                    last_response_index,
                    buffer: Vec::new(),
                },
            );
        }

        Some(Self {
            id,
            timeout_ms,
            last_command_sequence,
            kept_alive_us,
            results,
            streams,
        })
    }
}

/// Request tag bytes for the session envelope codec.
mod tags {
    pub const OPEN_SESSION: u8 = 1;
    pub const KEEP_ALIVE: u8 = 2;
    pub const CLOSE_SESSION: u8 = 3;
    pub const COMMAND: u8 = 4;
}

/// The session-layer envelope inside a `Command` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    /// Opens a new session with the given expiry timeout.
    OpenSession {
        /// Session expiry timeout in milliseconds.
        timeout_ms: u64,
    },
    /// Refreshes a session and acknowledges deliveries.
    KeepAlive {
        /// The session.
        session_id: SessionId,
        /// Highest command sequence whose response the client received.
        command_sequence: u64,
        /// Per-stream highest received event index.
        streams: Vec<(StreamId, Index)>,
    },
    /// Closes a session.
    CloseSession {
        /// The session.
        session_id: SessionId,
    },
    /// A state-machine command within a session.
    Command {
        /// The session.
        session_id: SessionId,
        /// The client's sequence number, used for deduplication.
        sequence: u64,
        /// State-machine input.
        input: Bytes,
    },
}

impl SessionRequest {
    /// Encodes the envelope to bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::OpenSession { timeout_ms } => {
                buf.put_u8(tags::OPEN_SESSION);
                buf.put_u64_le(*timeout_ms);
            }
            Self::KeepAlive {
                session_id,
                command_sequence,
                streams,
            } => {
                buf.put_u8(tags::KEEP_ALIVE);
                buf.put_u64_le(session_id.get());
                buf.put_u64_le(*command_sequence);
                buf.put_u32_le(streams.len() as u32);
                for (stream_id, index) in streams {
                    buf.put_u64_le(stream_id.get());
                    buf.put_u64_le(index.get());
                }
            }
            Self::CloseSession { session_id } => {
                buf.put_u8(tags::CLOSE_SESSION);
                buf.put_u64_le(session_id.get());
            }
            Self::Command {
                session_id,
                sequence,
                input,
            } => {
                buf.put_u8(tags::COMMAND);
                buf.put_u64_le(session_id.get());
                buf.put_u64_le(*sequence);
                buf.put_u32_le(input.len() as u32);
                buf.extend_from_slice(input);
            }
        }
        buf.freeze()
    }

    /// Decodes an envelope from bytes.
    #[must_use]
    pub fn decode(value: &Bytes) -> Option<Self> {
        let mut buf = value.clone();
        if buf.remaining() < 1 {
            return None;
        }
        match buf.get_u8() {
            tags::OPEN_SESSION => {
                if buf.remaining() < 8 {
                    return None;
                }
                Some(Self::OpenSession {
                    timeout_ms: buf.get_u64_le(),
                })
            }
            tags::KEEP_ALIVE => {
                if buf.remaining() < 20 {
                    return None;
                }
                let session_id = SessionId::new(buf.get_u64_le());
                let command_sequence = buf.get_u64_le();
                let count = buf.get_u32_le() as usize;
                let mut streams = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    if buf.remaining() < 16 {
                        return None;
                    }
                    streams.push((
                        StreamId::new(buf.get_u64_le()),
                        Index::new(buf.get_u64_le()),
                    ));
                }
                Some(Self::KeepAlive {
                    session_id,
                    command_sequence,
                    streams,
                })
            }
            tags::CLOSE_SESSION => {
                if buf.remaining() < 8 {
                    return None;
                }
                Some(Self::CloseSession {
                    session_id: SessionId::new(buf.get_u64_le()),
                })
            }
            tags::COMMAND => {
                if buf.remaining() < 20 {
                    return None;
                }
                let session_id = SessionId::new(buf.get_u64_le());
                let sequence = buf.get_u64_le();
                let len = buf.get_u32_le() as usize;
                if buf.remaining() < len {
                    return None;
                }
                Some(Self::Command {
                    session_id,
                    sequence,
                    input: buf.copy_to_bytes(len),
                })
            }
            _ => None,
        }
    }
}

/// The session-layer envelope inside a `Query` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionQuery {
    /// The session, or zero for a sessionless read.
    pub session_id: SessionId,
    /// The highest log index the client has observed.
    pub last_index: Index,
    /// The highest command sequence the client has completed.
    pub last_sequence: u64,
    /// State-machine query input.
    pub input: Bytes,
}

impl SessionQuery {
    /// Encodes the query envelope to bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.session_id.get());
        buf.put_u64_le(self.last_index.get());
        buf.put_u64_le(self.last_sequence);
        buf.put_u32_le(self.input.len() as u32);
        buf.extend_from_slice(&self.input);
        buf.freeze()
    }

    /// Decodes a query envelope from bytes.
    #[must_use]
    pub fn decode(value: &Bytes) -> Option<Self> {
        let mut buf = value.clone();
        if buf.remaining() < 28 {
            return None;
        }
        let session_id = SessionId::new(buf.get_u64_le());
        let last_index = Index::new(buf.get_u64_le());
        let last_sequence = buf.get_u64_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return None;
        }
        Some(Self {
            session_id,
            last_index,
            last_sequence,
            input: buf.copy_to_bytes(len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_expiry_uses_entry_time() {
        let session = Session::new(SessionId::new(1), 1000, 5_000_000);

        assert!(!session.is_expired(5_500_000));
        assert!(!session.is_expired(6_000_000));
        assert!(session.is_expired(6_000_001));
    }

    #[test]
    fn test_dedup_cache_pruned_by_keep_alive() {
        let mut session = Session::new(SessionId::new(1), 1000, 0);
        session.record_result(1, Ok(Bytes::from("one")));
        session.record_result(2, Ok(Bytes::from("two")));

        assert!(session.cached_result(1).is_some());

        session.keep_alive(10, 1, &[]);
        assert!(session.cached_result(1).is_none());
        assert!(session.cached_result(2).is_some());
        assert_eq!(session.kept_alive_us, 10);
    }

    #[test]
    fn test_stream_buffer_released_by_ack() {
        let mut session = Session::new(SessionId::new(1), 1000, 0);
        let stream = StreamId::new(7);
        session.publish(stream, Index::new(3), Bytes::from("a"));
        session.publish(stream, Index::new(5), Bytes::from("b"));

        assert_eq!(session.pending_events(stream).len(), 2);

        session.keep_alive(0, 0, &[(stream, Index::new(3))]);
        let pending = session.pending_events(stream);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, Index::new(5));
    }

    #[test]
    fn test_request_envelope_roundtrip() {
        let requests = vec![
            SessionRequest::OpenSession { timeout_ms: 30_000 },
            SessionRequest::KeepAlive {
                session_id: SessionId::new(9),
                command_sequence: 4,
                streams: vec![(StreamId::new(1), Index::new(17))],
            },
            SessionRequest::CloseSession {
                session_id: SessionId::new(9),
            },
            SessionRequest::Command {
                session_id: SessionId::new(9),
                sequence: 5,
                input: Bytes::from("payload"),
            },
        ];

        for request in requests {
            let encoded = request.encode();
            assert_eq!(SessionRequest::decode(&encoded), Some(request));
        }
    }

    #[test]
    fn test_query_envelope_roundtrip() {
        let query = SessionQuery {
            session_id: SessionId::new(3),
            last_index: Index::new(12),
            last_sequence: 2,
            input: Bytes::from("get"),
        };

        let encoded = query.encode();
        assert_eq!(SessionQuery::decode(&encoded), Some(query));
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        assert!(SessionRequest::decode(&Bytes::from_static(&[42])).is_none());
        assert!(SessionQuery::decode(&Bytes::from_static(b"short")).is_none());
    }

    #[test]
    fn test_session_state_roundtrip() {
        let mut session = Session::new(SessionId::new(8), 2000, 100);
        session.record_result(3, Ok(Bytes::from("cached")));
        session.publish(StreamId::new(2), Index::new(4), Bytes::from("evt"));
        session.keep_alive(200, 0, &[(StreamId::new(2), Index::new(4))]);

        let mut buf = BytesMut::new();
        session.encode(&mut buf);
        let decoded = Session::decode(&mut buf.freeze()).unwrap();

        assert_eq!(decoded.id, session.id);
        assert_eq!(decoded.timeout_ms, 2000);
        assert_eq!(decoded.kept_alive_us, 200);
        assert_eq!(
            decoded.cached_result(3),
            Some(&Ok(Bytes::from("cached")))
        );
        assert_eq!(
            decoded.streams.get(&StreamId::new(2)).unwrap().last_response_index,
            Index::new(4)
        );
    }
}
