//! The Leader role: command handling, leader-side queries, membership
//! changes, and leadership transfer.
//!
//! On entry the leader appends a term-opening `Initialize` entry and
//! starts the replication engine; the commit index does not advance
//! until that entry reaches a majority, which is what makes entries
//! from earlier terms safe to commit.

use std::sync::Arc;
use std::time::Instant;

use quorum_core::limits::CLUSTER_SIZE_MAX;
use quorum_core::{LogEntry, Member, Term};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::appender::Appender;
use crate::protocol::{
    CommandRequest, CommandResponse, ConfigurationResponse, ConfigureRequest, JoinRequest,
    LeaveRequest, QueryRequest, QueryResponse, ReadConsistency, ReconfigureRequest,
    ResponseError, ResponseStatus, TransferRequest, TransferResponse,
};
use crate::roles::Role;
use crate::server::{now_us, Core, RaftInner};

/// Starts the leader role. Runs under the server write lock.
pub(crate) fn start(server: &Arc<RaftInner>, core: &mut Core) -> Role {
    server.set_leader(core, Some(server.cluster.local_id().clone()));

    let entry = LogEntry::initialize(core.term, now_us());
    let indexed = server.log.append(entry);
    let appender = Appender::start(server, indexed.index);

    if server.cluster.replica_peers().is_empty() {
        // Nothing to replicate to; the no-op commits immediately.
        server.set_commit_index(core, indexed.index);
    } else {
        // Committed asynchronously by the aggregator.
        drop(appender.replicate(indexed.clone()));
    }

    info!(
        member = %server.cluster.local_id(),
        term = %core.term,
        "elected leader"
    );
    push_configuration(server, core.term);

    Role::Leader(super::LeaderState {
        appender,
        init_index: indexed.index,
    })
}

/// Returns the appender and term if this member currently leads.
pub(crate) fn leader_context(server: &Arc<RaftInner>) -> Option<(Arc<Appender>, Term)> {
    let core = server.core_read();
    match &core.role {
        Role::Leader(state) => Some((Arc::clone(&state.appender), core.term)),
        _ => None,
    }
}

/// Pushes the current roster to the Passive members, which do not see
/// `Configuration` entries commit the way voting members do.
pub(crate) fn push_configuration(server: &Arc<RaftInner>, term: Term) {
    let members = server.cluster.members();
    let passive: Vec<Member> = members
        .iter()
        .filter(|m| m.member_type == quorum_core::MemberType::Passive)
        .cloned()
        .collect();
    if passive.is_empty() {
        return;
    }

    let request = ConfigureRequest {
        term,
        leader: server.cluster.local_id().clone(),
        index: server.cluster.config_index(),
        timestamp_us: now_us(),
        members,
    };
    for member in passive {
        let server = Arc::clone(server);
        let request = request.clone();
        tokio::spawn(async move {
            if let Ok(client) = server.cluster.client(&member.id).await {
                let _ = tokio::time::timeout(
                    server.config.election_timeout,
                    client.configure(request),
                )
                .await;
            }
        });
    }
}

/// Handles a client command on the leader: append, replicate, await
/// commitment, then await the state-machine outcome.
pub(crate) async fn handle_command(
    server: &Arc<RaftInner>,
    request: CommandRequest,
) -> CommandResponse {
    let Some((appender, term)) = leader_context(server) else {
        return server.no_leader_response();
    };

    let entry = LogEntry::command(term, now_us(), request.value);
    let indexed = server.log.append(entry);
    // Register the outcome waiter before replication so the apply task
    // cannot outrun it.
    let result_rx = server.sm.register_result(indexed.index);
    let commit_rx = appender.replicate(indexed);

    match commit_rx.await {
        Ok(Ok(_)) => {}
        _ => return server.command_error(ResponseError::CommandFailure, None),
    }

    match result_rx.await {
        Ok(Ok((index, output))) => {
            let (leader, term, members) = server.routing();
            CommandResponse {
                status: ResponseStatus::Ok,
                error: None,
                message: None,
                leader,
                term,
                members,
                index,
                output,
            }
        }
        Ok(Err((error, message))) => server.command_error(error, message),
        Err(_) => server.command_error(ResponseError::CommandFailure, None),
    }
}

/// Handles a leader-only query at the requested consistency level.
pub(crate) async fn handle_query(server: &Arc<RaftInner>, request: QueryRequest) -> QueryResponse {
    let Some((appender, _term)) = leader_context(server) else {
        return QueryResponse::error(ResponseError::NoLeader);
    };

    match request.read_consistency {
        ReadConsistency::LinearizableLease => {
            // The lease holds while the last quorum round is fresher
            // than one election timeout.
            if appender.last_quorum_elapsed() >= server.config.election_timeout {
                debug!(member = %server.cluster.local_id(), "leader lease expired");
                return QueryResponse::error(ResponseError::QueryFailure);
            }
        }
        ReadConsistency::Linearizable => {
            if appender.heartbeat().await.is_err() {
                return QueryResponse::error(ResponseError::QueryFailure);
            }
        }
        ReadConsistency::Sequential => {}
    }

    // Execute against the state current at confirmation time.
    let commit_index = server.core_read().commit_index;
    server.execute_query(request.value, commit_index).await
}

/// Appends a configuration entry and waits for it to commit.
async fn commit_configuration(
    server: &Arc<RaftInner>,
    members: Vec<Member>,
) -> Result<ConfigurationResponse, ResponseError> {
    let Some((appender, term)) = leader_context(server) else {
        return Err(ResponseError::NoLeader);
    };

    let timestamp_us = now_us();
    let entry = LogEntry::configuration(term, timestamp_us, members.clone());
    let indexed = server.log.append(entry);
    let index = indexed.index;

    match appender.replicate(indexed).await {
        Ok(Ok(_)) => Ok(ConfigurationResponse {
            status: ResponseStatus::Ok,
            error: None,
            index,
            term,
            timestamp_us,
            members,
        }),
        _ => Err(ResponseError::ConfigurationError),
    }
}

pub(crate) async fn handle_join(
    server: &Arc<RaftInner>,
    request: JoinRequest,
) -> ConfigurationResponse {
    let mut members = server.cluster.members();
    if members.iter().any(|m| m.id == request.member.id) {
        return ConfigurationResponse::error(ResponseError::ConfigurationError, members);
    }
    if members.len() >= CLUSTER_SIZE_MAX {
        return ConfigurationResponse::error(ResponseError::ConfigurationError, members);
    }
    debug!(member = %request.member.id, "adding member");
    members.push(request.member);

    match commit_configuration(server, members).await {
        Ok(response) => response,
        Err(error) => ConfigurationResponse::error(error, server.cluster.members()),
    }
}

pub(crate) async fn handle_leave(
    server: &Arc<RaftInner>,
    request: LeaveRequest,
) -> ConfigurationResponse {
    let mut members = server.cluster.members();
    let before = members.len();
    members.retain(|m| m.id != request.member.id);
    if members.len() == before {
        return ConfigurationResponse::error(ResponseError::ConfigurationError, members);
    }
    debug!(member = %request.member.id, "removing member");

    match commit_configuration(server, members).await {
        Ok(response) => response,
        Err(error) => ConfigurationResponse::error(error, server.cluster.members()),
    }
}

pub(crate) async fn handle_reconfigure(
    server: &Arc<RaftInner>,
    request: ReconfigureRequest,
) -> ConfigurationResponse {
    let members = server.cluster.members();
    // Optimistic concurrency: the change must be based on the current
    // configuration.
    if request.index < server.cluster.config_index() {
        return ConfigurationResponse::error(ResponseError::ConfigurationError, members);
    }
    if !members.iter().any(|m| m.id == request.member.id) {
        return ConfigurationResponse::error(ResponseError::ConfigurationError, members);
    }

    let updated: Vec<Member> = members
        .into_iter()
        .map(|m| {
            if m.id == request.member.id {
                request.member.clone()
            } else {
                m
            }
        })
        .collect();
    debug!(member = %request.member.id, member_type = %request.member.member_type, "reconfiguring member");

    match commit_configuration(server, updated).await {
        Ok(response) => response,
        Err(error) => ConfigurationResponse::error(error, server.cluster.members()),
    }
}

/// Transfers leadership: wait until the target has the full log, then
/// step down so the freshest member wins the ensuing election.
pub(crate) async fn handle_transfer(
    server: &Arc<RaftInner>,
    request: TransferRequest,
) -> TransferResponse {
    let Some((appender, _term)) = leader_context(server) else {
        return TransferResponse {
            status: ResponseStatus::Error,
            error: Some(ResponseError::IllegalMemberState),
        };
    };

    if &request.member == server.cluster.local_id() {
        return TransferResponse {
            status: ResponseStatus::Ok,
            error: None,
        };
    }
    let Some(target) = server.cluster.member(&request.member) else {
        return TransferResponse {
            status: ResponseStatus::Error,
            error: Some(ResponseError::ConfigurationError),
        };
    };
    if !target.is_voting() {
        return TransferResponse {
            status: ResponseStatus::Error,
            error: Some(ResponseError::IllegalMemberState),
        };
    }

    let deadline = Instant::now() + server.config.election_timeout;
    loop {
        if appender.match_index(&request.member) >= server.log.last_index() {
            break;
        }
        if Instant::now() >= deadline {
            return TransferResponse {
                status: ResponseStatus::Error,
                error: Some(ResponseError::CommandFailure),
            };
        }
        sleep(server.config.election_timeout / 50).await;
    }

    info!(member = %server.cluster.local_id(), target = %request.member, "transferring leadership");
    server.step_down();
    TransferResponse {
        status: ResponseStatus::Ok,
        error: None,
    }
}
