//! Consensus error types.

use quorum_core::MemberId;
use quorum_store::StoreError;
use thiserror::Error;

use crate::protocol::ResponseError;

/// Errors surfaced by the consensus core.
#[derive(Debug, Error)]
pub enum RaftError {
    /// No leader is currently known to route the request to.
    #[error("no leader known")]
    NoLeader,

    /// The cluster answered with a protocol-level error.
    #[error("request failed: {0:?}")]
    Response(ResponseError),

    /// The entry could not be committed (step-down or quorum loss).
    #[error("failed to commit entry")]
    CommitFailed,

    /// A heartbeat round failed to reach a quorum.
    #[error("failed to verify quorum")]
    QuorumFailed,

    /// The server has been stopped.
    #[error("server stopped")]
    Stopped,

    /// A storage operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A transport operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from the transport layer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The member could not be reached.
    #[error("member {0} unreachable")]
    Unreachable(MemberId),

    /// The connection was reset mid-request.
    #[error("connection to {0} reset")]
    ConnectionReset(MemberId),

    /// The request exceeded its deadline.
    #[error("request to {0} timed out")]
    Timeout(MemberId),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}
