//! RPC protocol types.
//!
//! Field semantics are binding across the cluster; the encoding used by
//! a transport is an implementation choice, but must be stable within a
//! deployment. The in-process transport passes these types directly.

use bytes::Bytes;
use quorum_core::{Index, LogEntry, Member, MemberId, Term};

/// Outcome classification carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// The request was handled.
    Ok,
    /// The request failed; see the error field.
    Error,
}

/// Protocol-level error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseError {
    /// No leader is available to handle the request.
    NoLeader,
    /// A query could not reach the required state in time.
    QueryFailure,
    /// A command could not be committed.
    CommandFailure,
    /// The state machine returned an error.
    ApplicationError,
    /// The receiving member's role cannot serve this request.
    IllegalMemberState,
    /// The client is unknown.
    UnknownClient,
    /// The session is unknown.
    UnknownSession,
    /// The named service is not registered.
    UnknownService,
    /// The session has been closed.
    ClosedSession,
    /// The request was malformed.
    ProtocolError,
    /// The requested membership change is invalid.
    ConfigurationError,
    /// The member is temporarily unable to serve requests.
    Unavailable,
}

/// Read consistency levels for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConsistency {
    /// Served by any member once it has applied the client's last seen
    /// index. Reads never go backwards relative to the client's writes.
    Sequential,
    /// Served by the leader after checking its lease; no quorum round.
    LinearizableLease,
    /// Served by the leader after verifying its leadership with a
    /// heartbeat quorum round.
    Linearizable,
}

impl Default for ReadConsistency {
    fn default() -> Self {
        Self::Sequential
    }
}

/// Request to add a member to the cluster.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    /// The joining member.
    pub member: Member,
}

/// Request to remove a member from the cluster.
#[derive(Debug, Clone)]
pub struct LeaveRequest {
    /// The leaving member.
    pub member: Member,
}

/// Request to change an existing member (e.g. promote a Reserve).
#[derive(Debug, Clone)]
pub struct ReconfigureRequest {
    /// The member in its new shape.
    pub member: Member,
    /// The configuration index the change is based on.
    pub index: Index,
    /// The configuration term the change is based on.
    pub term: Term,
}

/// Response to a membership change (`Join`, `Leave`, `Reconfigure`).
#[derive(Debug, Clone)]
pub struct ConfigurationResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Error code when `status` is `Error`.
    pub error: Option<ResponseError>,
    /// Index of the committed configuration entry.
    pub index: Index,
    /// Term of the committed configuration entry.
    pub term: Term,
    /// Timestamp of the committed configuration entry.
    pub timestamp_us: u64,
    /// The resulting roster.
    pub members: Vec<Member>,
}

impl ConfigurationResponse {
    /// An error response carrying the current roster.
    #[must_use]
    pub fn error(error: ResponseError, members: Vec<Member>) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(error),
            index: Index::ZERO,
            term: Term::ZERO,
            timestamp_us: 0,
            members,
        }
    }
}

/// Leader push of the current configuration to a non-voting member.
#[derive(Debug, Clone)]
pub struct ConfigureRequest {
    /// Leader's term.
    pub term: Term,
    /// The leader.
    pub leader: MemberId,
    /// Index of the configuration entry.
    pub index: Index,
    /// Timestamp of the configuration entry.
    pub timestamp_us: u64,
    /// The roster.
    pub members: Vec<Member>,
}

/// Response to a `Configure` push.
#[derive(Debug, Clone)]
pub struct ConfigureResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Error code when `status` is `Error`.
    pub error: Option<ResponseError>,
}

/// Pre-vote request: a non-binding election probe sent at the
/// candidate's *current* term before any term inflation.
#[derive(Debug, Clone)]
pub struct PollRequest {
    /// The candidate's current term.
    pub term: Term,
    /// The polling member.
    pub candidate: MemberId,
    /// Index of the candidate's last log entry.
    pub last_log_index: Index,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// Response to a `Poll`.
#[derive(Debug, Clone)]
pub struct PollResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Error code when `status` is `Error`.
    pub error: Option<ResponseError>,
    /// The responder's term.
    pub term: Term,
    /// Whether the responder would vote for the candidate.
    pub accepted: bool,
}

/// Vote request for an election at `term`.
#[derive(Debug, Clone)]
pub struct VoteRequest {
    /// The candidate's (already incremented) term.
    pub term: Term,
    /// The candidate.
    pub candidate: MemberId,
    /// Index of the candidate's last log entry.
    pub last_log_index: Index,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// Response to a `Vote`.
#[derive(Debug, Clone)]
pub struct VoteResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Error code when `status` is `Error`.
    pub error: Option<ResponseError>,
    /// The responder's term.
    pub term: Term,
    /// Whether the vote was granted.
    pub voted: bool,
}

/// Request to transfer leadership to another member.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// The member that should become leader.
    pub member: MemberId,
}

/// Response to a `Transfer`.
#[derive(Debug, Clone)]
pub struct TransferResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Error code when `status` is `Error`.
    pub error: Option<ResponseError>,
}

/// Log replication request (also the heartbeat when `entries` is empty).
#[derive(Debug, Clone)]
pub struct AppendRequest {
    /// Leader's term.
    pub term: Term,
    /// The leader.
    pub leader: MemberId,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: Index,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Entries to append; empty for a heartbeat.
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub commit_index: Index,
}

/// Response to an `Append`.
///
/// On success `last_log_index` equals
/// `prev_log_index + entries.len()`; on rejection it is the follower's
/// actual last index, which the leader uses as a convergence hint.
#[derive(Debug, Clone)]
pub struct AppendResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Error code when `status` is `Error`.
    pub error: Option<ResponseError>,
    /// The responder's term.
    pub term: Term,
    /// Whether the entries were appended.
    pub succeeded: bool,
    /// See the type-level contract.
    pub last_log_index: Index,
}

impl AppendResponse {
    /// A successful append acknowledging entries up to `last_log_index`.
    #[must_use]
    pub fn succeeded(term: Term, last_log_index: Index) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            term,
            succeeded: true,
            last_log_index,
        }
    }

    /// A rejection carrying the follower's last index as a hint.
    #[must_use]
    pub fn rejected(term: Term, last_log_index: Index) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            term,
            succeeded: false,
            last_log_index,
        }
    }

    /// A protocol-level error response.
    #[must_use]
    pub fn error(error: ResponseError, term: Term) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(error),
            term,
            succeeded: false,
            last_log_index: Index::ZERO,
        }
    }
}

/// One chunk of a snapshot installation stream.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Leader's term.
    pub term: Term,
    /// The leader.
    pub leader: MemberId,
    /// The index the snapshot covers up to.
    pub index: Index,
    /// The snapshot timestamp.
    pub timestamp_us: u64,
    /// Chunk payload.
    pub data: Bytes,
}

/// Response to a completed `Install` stream.
#[derive(Debug, Clone)]
pub struct InstallResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Error code when `status` is `Error`.
    pub error: Option<ResponseError>,
}

impl InstallResponse {
    /// A successful installation.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
        }
    }

    /// A failed installation.
    #[must_use]
    pub fn error(error: ResponseError) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(error),
        }
    }
}

/// A client write carrying an opaque state-machine payload.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Opaque payload interpreted by the session layer.
    pub value: Bytes,
}

/// One element of a command response stream.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Error code when `status` is `Error`.
    pub error: Option<ResponseError>,
    /// Human-readable failure detail.
    pub message: Option<String>,
    /// The leader, when known.
    pub leader: Option<MemberId>,
    /// The responder's term.
    pub term: Term,
    /// The voting roster, for client-side routing.
    pub members: Vec<MemberId>,
    /// The log index the command committed at.
    pub index: Index,
    /// State-machine output.
    pub output: Bytes,
}

impl CommandResponse {
    /// An error response carrying routing hints.
    #[must_use]
    pub fn error(
        error: ResponseError,
        leader: Option<MemberId>,
        term: Term,
        members: Vec<MemberId>,
    ) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(error),
            message: None,
            leader,
            term,
            members,
            index: Index::ZERO,
            output: Bytes::new(),
        }
    }
}

/// A client read carrying an opaque state-machine payload.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Opaque payload interpreted by the session layer.
    pub value: Bytes,
    /// The consistency level the read requires.
    pub read_consistency: ReadConsistency,
}

/// One element of a query response stream.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Error code when `status` is `Error`.
    pub error: Option<ResponseError>,
    /// Human-readable failure detail.
    pub message: Option<String>,
    /// State-machine output.
    pub output: Bytes,
}

impl QueryResponse {
    /// A successful query result.
    #[must_use]
    pub fn ok(output: Bytes) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error: None,
            message: None,
            output,
        }
    }

    /// A failed query.
    #[must_use]
    pub fn error(error: ResponseError) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(error),
            message: None,
            output: Bytes::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_response_contract() {
        let ok = AppendResponse::succeeded(Term::new(2), Index::new(10));
        assert!(ok.succeeded);
        assert_eq!(ok.status, ResponseStatus::Ok);

        let rejected = AppendResponse::rejected(Term::new(2), Index::new(4));
        assert!(!rejected.succeeded);
        assert_eq!(rejected.last_log_index, Index::new(4));

        let error = AppendResponse::error(ResponseError::IllegalMemberState, Term::new(2));
        assert_eq!(error.status, ResponseStatus::Error);
        assert_eq!(error.error, Some(ResponseError::IllegalMemberState));
    }

    #[test]
    fn test_default_consistency_is_sequential() {
        assert_eq!(ReadConsistency::default(), ReadConsistency::Sequential);
    }
}
