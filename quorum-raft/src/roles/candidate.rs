//! The Candidate role: campaigning.
//!
//! Entering the role (under the write lock) already incremented the
//! term and bound the vote to self; this module runs the broadcast and
//! the tally. A majority of grants promotes to Leader; a majority of
//! rejections or an expired election timer restarts the election at a
//! fresh term; any higher observed term falls back to Follower.

use std::sync::Arc;
use std::time::Duration;

use quorum_core::{MemberId, Term};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::protocol::VoteRequest;
use crate::roles::{Role, RoleKind};
use crate::server::RaftInner;

/// Spawns the election task for the candidacy identified by
/// (`term`, `generation`).
pub(crate) fn start_election(server: &Arc<RaftInner>, term: Term, generation: u64) {
    let server = Arc::clone(server);
    tokio::spawn(async move {
        run_election(&server, term, generation).await;
    });
}

async fn run_election(server: &Arc<RaftInner>, term: Term, generation: u64) {
    let (last_log_index, last_log_term) = {
        let tail = server.log.last_entry();
        (
            tail.as_ref().map_or(server.log.last_index(), |e| e.index),
            tail.map_or(Term::ZERO, |e| e.entry.term),
        )
    };

    let voting = server.cluster.voting_members();
    let quorum = server.cluster.quorum_size();
    let request = VoteRequest {
        term,
        candidate: server.cluster.local_id().clone(),
        last_log_index,
        last_log_term,
    };
    debug!(member = %server.cluster.local_id(), term = %term, "requesting votes");

    let (vote_tx, mut vote_rx) = mpsc::channel(voting.len().max(1));
    for member in voting {
        if &member == server.cluster.local_id() {
            let _ = vote_tx.try_send(true);
            continue;
        }
        let server = Arc::clone(server);
        let request = request.clone();
        let vote_tx = vote_tx.clone();
        tokio::spawn(async move {
            let granted = request_vote(&server, &member, request).await;
            let _ = vote_tx.send(granted).await;
        });
    }
    drop(vote_tx);

    // Election timer: election timeout plus random jitter up to one
    // more timeout.
    let election_timeout = server.config.election_timeout;
    let jitter_ms = election_timeout.as_millis().max(1) as u64;
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms));
    let deadline = sleep(election_timeout + jitter);
    tokio::pin!(deadline);

    let mut grants = 0usize;
    let mut rejects = 0usize;
    let mut drained = false;
    loop {
        tokio::select! {
            () = &mut deadline => {
                debug!(member = %server.cluster.local_id(), term = %term, "election timed out");
                restart_election(server, generation);
                return;
            }
            vote = vote_rx.recv(), if !drained => {
                match vote {
                    None => drained = true,
                    Some(true) => {
                        grants += 1;
                        if grants >= quorum {
                            let mut core = server.core_write();
                            let still_current = matches!(
                                &core.role,
                                Role::Candidate(state) if state.generation == generation
                            );
                            if still_current && core.term == term {
                                server.set_role_locked(&mut core, RoleKind::Leader);
                            }
                            return;
                        }
                    }
                    Some(false) => {
                        rejects += 1;
                        if rejects >= quorum {
                            debug!(
                                member = %server.cluster.local_id(),
                                term = %term, "votes rejected; restarting election"
                            );
                            restart_election(server, generation);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Restarts the election at a fresh term, if this candidacy is still
/// the current role.
fn restart_election(server: &Arc<RaftInner>, generation: u64) {
    let mut core = server.core_write();
    let still_current = matches!(
        &core.role,
        Role::Candidate(state) if state.generation == generation
    );
    if still_current {
        server.set_role_locked(&mut core, RoleKind::Candidate);
    }
}

async fn request_vote(server: &Arc<RaftInner>, member: &MemberId, request: VoteRequest) -> bool {
    let client = match server.cluster.client(member).await {
        Ok(client) => client,
        Err(error) => {
            warn!(member = %member, error = %error, "vote request failed");
            return false;
        }
    };

    let sent_term = request.term;
    match timeout(server.config.election_timeout, client.vote(request)).await {
        Ok(Ok(response)) => {
            if response.term > sent_term {
                server.observe_term(response.term);
                return false;
            }
            response.voted && response.term == sent_term
        }
        Ok(Err(error)) => {
            warn!(member = %member, error = %error, "vote request failed");
            false
        }
        Err(_) => {
            warn!(member = %member, "vote request timed out");
            false
        }
    }
}
