//! The Follower role: the heartbeat timer and the pre-vote phase.
//!
//! A follower arms a randomized heartbeat timer on entry. Valid
//! appends, installs, configures, and granted votes reset it. When it
//! expires, the follower polls the Active members with a non-binding
//! pre-vote at its current term, and only transitions to Candidate
//! (inflating the term) if a majority would vote for it and no leader
//! has surfaced in the meantime.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::protocol::PollRequest;
use crate::roles::{Role, RoleKind};
use crate::server::RaftInner;

/// Arms the follower heartbeat timer for `generation`.
///
/// The timeout is uniform in `[election_timeout, 2 * election_timeout)`.
/// A firing whose generation is stale does nothing; `Stop` may race
/// with firing, so the check happens after re-acquiring the lock.
pub(crate) fn arm_heartbeat_timer(server: &Arc<RaftInner>, generation: u64) {
    let election_timeout = server.config.election_timeout;
    let jitter_ms = election_timeout.as_millis().max(1) as u64;
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms));
    let server = Arc::clone(server);
    tokio::spawn(async move {
        sleep(election_timeout + jitter).await;
        on_heartbeat_timeout(&server, generation).await;
    });
}

/// Re-arms the heartbeat timer under a fresh generation. A no-op
/// unless the current role is Follower.
pub(crate) fn reset_heartbeat_timeout(server: &Arc<RaftInner>) {
    let generation = {
        let mut core = server.core_write();
        let Role::Follower(state) = &mut core.role else {
            return;
        };
        let generation = server.next_generation();
        state.generation = generation;
        generation
    };
    arm_heartbeat_timer(server, generation);
}

/// Re-arms only if `generation` is still current, so a stale poll
/// round cannot cancel a live timer.
fn rearm_if_current(server: &Arc<RaftInner>, generation: u64) {
    let next = {
        let mut core = server.core_write();
        let Role::Follower(state) = &mut core.role else {
            return;
        };
        if state.generation != generation {
            return;
        }
        let next = server.next_generation();
        state.generation = next;
        next
    };
    arm_heartbeat_timer(server, next);
}

async fn on_heartbeat_timeout(server: &Arc<RaftInner>, generation: u64) {
    {
        let mut core = server.core_write();
        match &core.role {
            Role::Follower(state) if state.generation == generation => {}
            _ => return,
        }
        debug!(member = %server.cluster.local_id(), "heartbeat timed out");
        server.set_leader(&mut core, None);
    }
    send_poll_requests(server, generation).await;
}

/// Polls every Active member; a majority of acceptances (with no
/// leader discovered meanwhile) transitions to Candidate, anything
/// else resets the heartbeat timer.
async fn send_poll_requests(server: &Arc<RaftInner>, generation: u64) {
    let (term, last_log_index, last_log_term) = {
        let core = server.core_read();
        let tail = server.log.last_entry();
        (
            core.term,
            tail.as_ref().map_or(server.log.last_index(), |e| e.index),
            tail.map_or(quorum_core::Term::ZERO, |e| e.entry.term),
        )
    };

    let voting = server.cluster.voting_members();
    let quorum = server.cluster.quorum_size();
    let request = PollRequest {
        term,
        candidate: server.cluster.local_id().clone(),
        last_log_index,
        last_log_term,
    };
    debug!(member = %server.cluster.local_id(), term = %term, "polling members");

    let (vote_tx, mut vote_rx) = mpsc::channel(voting.len().max(1));
    for member in voting {
        if &member == server.cluster.local_id() {
            // Vote for yourself!
            let _ = vote_tx.try_send(true);
            continue;
        }
        let server = Arc::clone(server);
        let request = request.clone();
        let vote_tx = vote_tx.clone();
        tokio::spawn(async move {
            let accepted = poll_member(&server, &member, request).await;
            let _ = vote_tx.send(accepted).await;
        });
    }
    drop(vote_tx);

    let mut accepts = 0usize;
    let mut rejects = 0usize;
    let deadline = sleep(server.config.election_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => {
                debug!(member = %server.cluster.local_id(), "failed to poll a majority in time");
                break;
            }
            vote = vote_rx.recv() => {
                match vote {
                    None => break,
                    Some(true) => {
                        accepts += 1;
                        if accepts >= quorum {
                            let mut core = server.core_write();
                            let still_current = matches!(
                                &core.role,
                                Role::Follower(state) if state.generation == generation
                            );
                            if still_current && core.leader.is_none() {
                                debug!(
                                    member = %server.cluster.local_id(),
                                    accepts, "pre-votes granted; transitioning to candidate"
                                );
                                server.set_role_locked(&mut core, RoleKind::Candidate);
                                return;
                            }
                            break;
                        }
                    }
                    Some(false) => {
                        rejects += 1;
                        if rejects >= quorum {
                            debug!(
                                member = %server.cluster.local_id(),
                                rejects, "pre-votes rejected; resetting heartbeat timeout"
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    rearm_if_current(server, generation);
}

async fn poll_member(
    server: &Arc<RaftInner>,
    member: &quorum_core::MemberId,
    request: PollRequest,
) -> bool {
    let client = match server.cluster.client(member).await {
        Ok(client) => client,
        Err(error) => {
            warn!(member = %member, error = %error, "poll request failed");
            return false;
        }
    };

    let sent_term = request.term;
    match timeout(server.config.election_timeout, client.poll(request)).await {
        Ok(Ok(response)) => {
            if response.term > sent_term {
                server.observe_term(response.term);
            }
            response.accepted && response.term == sent_term
        }
        Ok(Err(error)) => {
            warn!(member = %member, error = %error, "poll request failed");
            false
        }
        Err(_) => {
            warn!(member = %member, "poll request timed out");
            false
        }
    }
}
