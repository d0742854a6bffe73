//! Role variants and the RPC handlers they share.
//!
//! Roles form a capability ladder: Reserve receives nothing, Passive
//! receives the log, Follower and Candidate additionally vote, the
//! Leader replicates. Shared handler logic lives in free functions over
//! the server handle; each role module adds only what it refines.
//! Role transitions run under the server write lock: the old role is
//! stopped, the pointer replaced, and the new role started.

pub(crate) mod candidate;
pub(crate) mod follower;
pub(crate) mod leader;
pub(crate) mod passive;

use std::fmt;
use std::sync::Arc;

use quorum_core::Index;

use crate::appender::Appender;
use crate::protocol::{
    PollRequest, PollResponse, ResponseError, ResponseStatus, VoteRequest, VoteResponse,
};
use crate::server::RaftInner;

/// The observable role of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    /// Receives nothing until promoted.
    Reserve,
    /// Receives the log but does not vote.
    Passive,
    /// Votes and applies; the default Active role.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// Owns replication and accepts commands.
    Leader,
    /// Not running.
    Stopped,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reserve => "reserve",
            Self::Passive => "passive",
            Self::Follower => "follower",
            Self::Candidate => "candidate",
            Self::Leader => "leader",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The current role plus its private state.
pub(crate) enum Role {
    Reserve,
    Passive,
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
    Stopped,
}

impl Role {
    pub(crate) fn kind(&self) -> RoleKind {
        match self {
            Self::Reserve => RoleKind::Reserve,
            Self::Passive => RoleKind::Passive,
            Self::Follower(_) => RoleKind::Follower,
            Self::Candidate(_) => RoleKind::Candidate,
            Self::Leader(_) => RoleKind::Leader,
            Self::Stopped => RoleKind::Stopped,
        }
    }

    /// Whether this role participates in elections.
    pub(crate) fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Follower(_) | Self::Candidate(_) | Self::Leader(_)
        )
    }

    /// Whether this role receives log replication.
    pub(crate) fn receives_log(&self) -> bool {
        self.is_active() || matches!(self, Self::Passive)
    }
}

/// Follower role state: the generation of its armed heartbeat timer.
/// A firing timer whose generation no longer matches is stale and must
/// do nothing.
pub(crate) struct FollowerState {
    pub generation: u64,
}

/// Candidate role state: the generation of its running election.
pub(crate) struct CandidateState {
    pub generation: u64,
}

/// Leader role state: the replication engine and the index of the
/// term-opening `Initialize` entry.
pub(crate) struct LeaderState {
    pub appender: Arc<Appender>,
    pub init_index: Index,
}

/// Shared Vote handler for the active roles.
///
/// Grants iff the request term is current, the vote slot is free (or
/// already bound to this candidate), and the candidate's log is at
/// least as up to date as ours. The vote is durable before the
/// response.
pub(crate) fn handle_vote(server: &Arc<RaftInner>, request: &VoteRequest) -> VoteResponse {
    let mut core = server.core_write();

    if request.term > core.term {
        server.bump_term(&mut core, request.term);
        if matches!(core.role, Role::Candidate(_) | Role::Leader(_)) {
            server.set_role_locked(&mut core, RoleKind::Follower);
        }
    }

    if request.term < core.term {
        return VoteResponse {
            status: ResponseStatus::Ok,
            error: None,
            term: core.term,
            voted: false,
        };
    }

    let vote_free = core
        .voted_for
        .as_ref()
        .map_or(true, |voted| voted == &request.candidate);
    let up_to_date = server.log_up_to_date(request.last_log_term, request.last_log_index);

    let voted = if vote_free && up_to_date {
        if let Err(error) = server.metadata.store_vote(Some(&request.candidate)) {
            tracing::warn!(error = %error, "failed to persist vote");
            return VoteResponse {
                status: ResponseStatus::Error,
                error: Some(ResponseError::Unavailable),
                term: core.term,
                voted: false,
            };
        }
        core.voted_for = Some(request.candidate.clone());
        true
    } else {
        false
    };

    let term = core.term;
    drop(core);

    if voted {
        tracing::debug!(candidate = %request.candidate, term = %term, "vote granted");
        follower::reset_heartbeat_timeout(server);
    }

    VoteResponse {
        status: ResponseStatus::Ok,
        error: None,
        term,
        voted,
    }
}

/// Shared Poll (pre-vote) handler for the active roles.
///
/// Accepts under the same log-freshness rule as a vote, but binds
/// nothing: no vote slot, no timer reset. A higher observed term is
/// still adopted.
pub(crate) fn handle_poll(server: &Arc<RaftInner>, request: &PollRequest) -> PollResponse {
    let mut core = server.core_write();

    if request.term > core.term {
        server.bump_term(&mut core, request.term);
        if matches!(core.role, Role::Candidate(_) | Role::Leader(_)) {
            server.set_role_locked(&mut core, RoleKind::Follower);
        }
    }

    let accepted = request.term >= core.term
        && server.log_up_to_date(request.last_log_term, request.last_log_index);

    PollResponse {
        status: ResponseStatus::Ok,
        error: None,
        term: core.term,
        accepted,
    }
}
