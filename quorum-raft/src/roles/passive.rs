//! Handlers shared by every role that receives the log: Append,
//! Install, and Configure. Follower, Candidate, and Leader reuse these
//! and layer their own behavior (timer resets, step-downs) on top.

use std::sync::Arc;

use quorum_core::Index;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{
    AppendRequest, AppendResponse, ConfigureRequest, ConfigureResponse, InstallRequest,
    InstallResponse, ResponseError, ResponseStatus,
};
use crate::roles::{Role, RoleKind};
use crate::server::RaftInner;

/// Handles a replication request.
///
/// Rejections carry the local last log index so the leader converges
/// on the match index without walking back one entry at a time. A
/// success acknowledges exactly `prev_log_index + entries.len()`.
pub(crate) fn handle_append(server: &Arc<RaftInner>, request: &AppendRequest) -> AppendResponse {
    let mut core = server.core_write();

    if request.term > core.term {
        server.bump_term(&mut core, request.term);
    }
    if request.term < core.term {
        return AppendResponse::rejected(core.term, server.log.last_index());
    }

    // A valid append from the current term identifies the leader; a
    // candidate or stale leader at this term steps down.
    if core.leader.as_ref() != Some(&request.leader) {
        server.set_leader(&mut core, Some(request.leader.clone()));
    }
    if matches!(core.role, Role::Candidate(_) | Role::Leader(_)) {
        server.set_role_locked(&mut core, RoleKind::Follower);
    }

    let snapshot_index = server
        .snapshots
        .current_snapshot()
        .map_or(0, |snapshot| snapshot.index().get());

    // Consistency check: the entry before the batch must match, unless
    // it is covered by a snapshot (then it is known committed).
    let prev = request.prev_log_index.get();
    if prev > 0 && prev > snapshot_index {
        match server.log.entry(request.prev_log_index) {
            Some(existing) if existing.entry.term == request.prev_log_term => {}
            Some(_) => {
                // The entry at prev is from a divergent term and
                // therefore uncommitted; drop it and everything after
                // so the rejection hint converges the leader on the
                // match point.
                server.log.truncate(Index::new(prev - 1));
                return AppendResponse::rejected(core.term, server.log.last_index());
            }
            None => {
                return AppendResponse::rejected(core.term, server.log.last_index());
            }
        }
    }

    let mut index = prev;
    for entry in &request.entries {
        index += 1;
        if index <= snapshot_index {
            continue;
        }
        match server.log.entry(Index::new(index)) {
            Some(existing) if existing.entry.term == entry.term => {}
            Some(_) => {
                // Conflict: drop the divergent suffix, then append.
                server.log.truncate(Index::new(index - 1));
                let appended = server.log.append(entry.clone());
                debug_assert_eq!(appended.index.get(), index);
            }
            None => {
                let appended = server.log.append(entry.clone());
                debug_assert_eq!(appended.index.get(), index);
            }
        }
    }

    let last_new = prev + request.entries.len() as u64;
    let new_commit = request.commit_index.get().min(last_new);
    if new_commit > core.commit_index.get() {
        server.set_commit_index(&mut core, Index::new(new_commit));
    }

    AppendResponse::succeeded(core.term, Index::new(last_new))
}

/// Handles a snapshot installation stream.
///
/// Chunks accumulate in a pending snapshot; only the stream terminator
/// publishes it, compacts the log behind it, and reinitializes the
/// state machine from it. Readers of the previous snapshot are
/// unaffected until the swap.
pub(crate) async fn handle_install(
    server: &Arc<RaftInner>,
    mut chunks: mpsc::Receiver<InstallRequest>,
) -> InstallResponse {
    let Some(first) = chunks.recv().await else {
        return InstallResponse::error(ResponseError::ProtocolError);
    };

    {
        let mut core = server.core_write();
        if first.term > core.term {
            server.bump_term(&mut core, first.term);
        }
        if first.term < core.term {
            return InstallResponse::error(ResponseError::IllegalMemberState);
        }
        if core.leader.as_ref() != Some(&first.leader) {
            server.set_leader(&mut core, Some(first.leader.clone()));
        }
        if matches!(core.role, Role::Candidate(_) | Role::Leader(_)) {
            server.set_role_locked(&mut core, RoleKind::Follower);
        }
    }

    let snapshot = server.snapshots.new_snapshot(first.index, first.timestamp_us);
    let mut writer = match snapshot.writer() {
        Ok(writer) => writer,
        Err(error) => {
            warn!(index = %first.index, error = %error, "cannot open snapshot writer");
            return InstallResponse::error(ResponseError::ProtocolError);
        }
    };
    writer.write(&first.data);

    while let Some(chunk) = chunks.recv().await {
        if chunk.index != first.index {
            return InstallResponse::error(ResponseError::ProtocolError);
        }
        writer.write(&chunk.data);
    }

    debug!(index = %first.index, size = writer.written(), "snapshot received");
    writer.complete();

    // Everything at or below the snapshot is superseded by it.
    server.log.compact(first.index);
    server.sm.restore(snapshot);
    {
        let mut core = server.core_write();
        if first.index > core.commit_index {
            server.set_commit_index(&mut core, first.index);
        }
    }

    InstallResponse::ok()
}

/// Handles a configuration push from the leader.
pub(crate) fn handle_configure(
    server: &Arc<RaftInner>,
    request: &ConfigureRequest,
) -> ConfigureResponse {
    {
        let mut core = server.core_write();
        if request.term > core.term {
            server.bump_term(&mut core, request.term);
        }
        if request.term >= core.term && core.leader.as_ref() != Some(&request.leader) {
            server.set_leader(&mut core, Some(request.leader.clone()));
        }
    }

    server.cluster.update(request.index, request.members.clone());
    server.sync_role_with_roster();

    ConfigureResponse {
        status: ResponseStatus::Ok,
        error: None,
    }
}
