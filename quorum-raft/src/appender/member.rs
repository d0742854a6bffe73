//! Per-peer replication worker.
//!
//! One task per replication peer. The worker keeps `next_index` /
//! `match_index` for its peer, batches entries (serving them from an
//! in-memory queue before touching the log reader), falls back to
//! snapshot installation when the peer is behind the compaction point,
//! and backs off exponentially on repeated failures. At most one
//! append-like RPC is in flight per peer, in `next_index` order.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use quorum_core::limits::{BACKOFF_FAILURE_COUNT_MIN, BACKOFF_WAIT_MAX};
use quorum_core::{Index, IndexedEntry, Member, Term};
use quorum_store::{LogReader, Snapshot};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, trace};

use crate::appender::{AppenderShared, MemberCommit};
use crate::protocol::{AppendRequest, InstallRequest, ResponseStatus};
use crate::server::RaftInner;

/// What to do after one replication round.
enum SendOutcome {
    /// More work is immediately available; go again.
    Retry,
    /// Wait for the next event.
    Done,
    /// The leader stepped down; the worker is being torn down.
    Stop,
}

pub(crate) fn spawn(
    server: &Arc<RaftInner>,
    shared: Arc<AppenderShared>,
    member: Member,
    entry_rx: mpsc::UnboundedReceiver<IndexedEntry>,
    heartbeat_rx: mpsc::UnboundedReceiver<Instant>,
    commit_tx: mpsc::UnboundedSender<MemberCommit>,
    fail_tx: mpsc::UnboundedSender<Instant>,
) -> JoinHandle<()> {
    let worker = MemberAppender {
        server: Arc::downgrade(server),
        shared,
        member,
        election_timeout: server.config.election_timeout,
        max_batch: server.config.max_batch_bytes,
        reader: server.log.open_reader(Index::new(1)),
        queue: VecDeque::new(),
        next_index: server.log.last_index().get() + 1,
        match_index: 0,
        prev_term: server
            .log
            .last_entry()
            .map_or(Term::ZERO, |e| e.entry.term),
        snapshot_index: 0,
        failure_count: 0,
        first_failure: None,
        entry_rx,
        heartbeat_rx,
        commit_tx,
        fail_tx,
    };
    tokio::spawn(worker.run())
}

struct MemberAppender {
    server: Weak<RaftInner>,
    shared: Arc<AppenderShared>,
    member: Member,
    election_timeout: Duration,
    max_batch: usize,
    reader: Box<dyn LogReader>,
    /// Entries handed over by the leader path, consulted before the
    /// log reader to avoid re-reading what is already in memory.
    queue: VecDeque<IndexedEntry>,
    next_index: u64,
    match_index: u64,
    /// Term of the entry at `next_index - 1`.
    prev_term: Term,
    /// Highest snapshot index known installed on the peer.
    snapshot_index: u64,
    failure_count: u32,
    first_failure: Option<Instant>,
    entry_rx: mpsc::UnboundedReceiver<IndexedEntry>,
    heartbeat_rx: mpsc::UnboundedReceiver<Instant>,
    commit_tx: mpsc::UnboundedSender<MemberCommit>,
    fail_tx: mpsc::UnboundedSender<Instant>,
}

impl MemberAppender {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.election_timeout / 2);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                entry = self.entry_rx.recv() => {
                    let Some(entry) = entry else { break };
                    if self.failure_count == 0 {
                        self.queue.push_back(entry);
                    }
                    self.replicate().await;
                }
                time = self.heartbeat_rx.recv() => {
                    if time.is_none() {
                        break;
                    }
                    if let Some(request) = self.empty_request() {
                        self.send_append(request).await;
                    }
                }
                _ = tick.tick() => {
                    self.replicate().await;
                }
            }
            if self.shared.is_stopped() {
                break;
            }
        }
    }

    fn server(&self) -> Option<Arc<RaftInner>> {
        self.server.upgrade()
    }

    async fn replicate(&mut self) {
        if self.failure_count >= BACKOFF_FAILURE_COUNT_MIN {
            // Suppress attempts until the back-off window has passed.
            let wait = backoff_wait(self.failure_count, self.election_timeout);
            let waited = self
                .first_failure
                .map_or(true, |first| first.elapsed() >= wait);
            if !waited {
                return;
            }
            if let Some(request) = self.next_request() {
                self.send_append(request).await;
            }
            return;
        }

        let Some(server) = self.server() else { return };
        if let Some(snapshot) = server.snapshots.current_snapshot() {
            if snapshot.index().get() > self.snapshot_index
                && snapshot.index().get() >= self.next_index
            {
                debug!(
                    member = %self.member.id,
                    index = %snapshot.index(),
                    "replicating snapshot"
                );
                self.send_install(&server, snapshot).await;
                return;
            }
        }
        drop(server);

        loop {
            let Some(request) = self.next_request() else { return };
            match self.send_append(request).await {
                SendOutcome::Retry => {}
                SendOutcome::Done | SendOutcome::Stop => return,
            }
        }
    }

    fn empty_request(&self) -> Option<AppendRequest> {
        let server = self.server()?;
        let (term, commit_index) = {
            let core = server.core_read();
            (core.term, core.commit_index)
        };
        Some(AppendRequest {
            term,
            leader: server.cluster.local_id().clone(),
            prev_log_index: Index::new(self.next_index - 1),
            prev_log_term: self.prev_term,
            entries: Vec::new(),
            commit_index,
        })
    }

    fn next_request(&mut self) -> Option<AppendRequest> {
        let server = self.server()?;
        let last = server.log.last_index().get();
        // A recently failed peer gets an empty probe first so the
        // expensive batch work waits until the peer is known healthy.
        if self.failure_count > 0 || last == 0 || self.next_index > last {
            return self.empty_request();
        }

        let mut request = self.empty_request()?;
        let mut entries = Vec::new();
        let mut size = 0usize;
        let mut next = self.next_index;
        while next <= last {
            // Drop queue entries that fell behind the cursor.
            while self
                .queue
                .front()
                .is_some_and(|front| front.index.get() < next)
            {
                self.queue.pop_front();
            }

            let entry = match self.queue.front() {
                Some(front) if front.index.get() == next => {
                    self.queue.pop_front().map(|indexed| indexed.entry)
                }
                _ => {
                    self.reader.reset(Index::new(next));
                    self.reader.next_entry().and_then(|indexed| {
                        (indexed.index.get() == next).then_some(indexed.entry)
                    })
                }
            };
            let Some(entry) = entry else { break };

            size += entry.encoded_len();
            entries.push(entry);
            next += 1;
            if size >= self.max_batch {
                break;
            }
        }

        request.entries = entries;
        Some(request)
    }

    async fn send_append(&mut self, request: AppendRequest) -> SendOutcome {
        let Some(server) = self.server() else {
            return SendOutcome::Stop;
        };
        let start = Instant::now();

        let client = match server.cluster.client(&self.member.id).await {
            Ok(client) => client,
            Err(_) => {
                self.fail(start);
                return SendOutcome::Done;
            }
        };

        let prev = request.prev_log_index.get();
        let sent = request.entries.clone();
        let response = match timeout(self.election_timeout, client.append(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) | Err(_) => {
                server.cluster.reset_client(&self.member.id);
                self.fail(start);
                return SendOutcome::Done;
            }
        };

        if response.status == ResponseStatus::Error {
            self.fail(start);
            return SendOutcome::Done;
        }

        // Any protocol-level response means the peer is reachable.
        self.succeed();

        if response.succeeded {
            self.match_index = response.last_log_index.get();
            self.next_index = self.match_index + 1;

            if !sent.is_empty() {
                // Success contract: the peer's last index equals
                // prev_log_index + entries.len().
                let accepted = response.last_log_index.get().saturating_sub(prev) as usize;
                debug_assert_eq!(accepted, sent.len());
                if accepted > 0 && accepted <= sent.len() {
                    self.prev_term = sent[accepted - 1].term;
                }
            }

            let _ = self.commit_tx.send(MemberCommit {
                member: self.member.id.clone(),
                index: Index::new(self.match_index),
                time: start,
            });

            if !sent.is_empty() && server.log.last_index().get() >= self.next_index {
                SendOutcome::Retry
            } else {
                SendOutcome::Done
            }
        } else {
            // Double-checked upgrade: adopt a higher term and step down.
            if response.term > server.core_read().term {
                if server.observe_term(response.term) {
                    return SendOutcome::Stop;
                }
            }

            // The peer told us its actual last index; converge on it
            // instead of walking back one index at a time.
            if response.last_log_index.get() < self.match_index {
                self.match_index = response.last_log_index.get();
                trace!(member = %self.member.id, index = self.match_index, "reset match index");
            }
            let hint = response.last_log_index.get() + 1;
            if hint < self.next_index {
                self.next_index = hint.max(1);
                trace!(member = %self.member.id, index = self.next_index, "reset next index");
            } else if self.next_index > 1 {
                // The hint made no progress; fall back to stepping one
                // entry at a time so a retry loop always terminates.
                self.next_index -= 1;
            }
            self.prev_term = server
                .log
                .entry(Index::new(self.next_index - 1))
                .map_or(Term::ZERO, |e| e.entry.term);
            SendOutcome::Retry
        }
    }

    async fn send_install(&mut self, server: &Arc<RaftInner>, snapshot: Snapshot) {
        let start = Instant::now();
        let client = match server.cluster.client(&self.member.id).await {
            Ok(client) => client,
            Err(_) => {
                self.fail(start);
                return;
            }
        };
        let Ok(mut reader) = snapshot.reader() else {
            return;
        };

        let term = server.core_read().term;
        let leader = server.cluster.local_id().clone();
        let index = snapshot.index();
        let timestamp_us = snapshot.timestamp_us();
        let max_batch = self.max_batch;

        let (tx, rx) = mpsc::channel(4);
        let feeder = tokio::spawn(async move {
            let mut sent_any = false;
            while let Some(data) = reader.chunk(max_batch) {
                sent_any = true;
                let chunk = InstallRequest {
                    term,
                    leader: leader.clone(),
                    index,
                    timestamp_us,
                    data,
                };
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            if !sent_any {
                let _ = tx
                    .send(InstallRequest {
                        term,
                        leader,
                        index,
                        timestamp_us,
                        data: Bytes::new(),
                    })
                    .await;
            }
        });

        let result = timeout(self.election_timeout, client.install(rx)).await;
        feeder.abort();

        match result {
            Ok(Ok(response)) if response.status == ResponseStatus::Ok => {
                self.succeed();
                self.snapshot_index = snapshot.index().get();
                self.match_index = self.match_index.max(snapshot.index().get());
                self.next_index = self.next_index.max(snapshot.index().get() + 1);
                self.prev_term = server
                    .log
                    .entry(Index::new(self.next_index - 1))
                    .map_or(Term::ZERO, |e| e.entry.term);
                let _ = self.commit_tx.send(MemberCommit {
                    member: self.member.id.clone(),
                    index: Index::new(self.match_index),
                    time: start,
                });
            }
            Ok(Ok(_)) => {
                // Install rejected; await the next heartbeat tick so a
                // failing peer doesn't spin on installation.
                debug!(member = %self.member.id, "snapshot install rejected");
            }
            Ok(Err(_)) | Err(_) => {
                server.cluster.reset_client(&self.member.id);
                self.fail(start);
            }
        }
    }

    fn succeed(&mut self) {
        self.failure_count = 0;
        self.first_failure = None;
    }

    fn fail(&mut self, time: Instant) {
        if self.failure_count == 0 {
            self.first_failure = Some(time);
        }
        self.failure_count += 1;
        let _ = self.fail_tx.send(time);
    }
}

fn backoff_wait(failure_count: u32, election_timeout: Duration) -> Duration {
    let squared = u64::from(failure_count) * u64::from(failure_count);
    let wait = election_timeout.saturating_mul(u32::try_from(squared.min(u64::from(u32::MAX))).unwrap_or(u32::MAX));
    wait.min(BACKOFF_WAIT_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let timeout = Duration::from_secs(5);

        assert_eq!(backoff_wait(5, timeout), Duration::from_secs(60));
        assert_eq!(
            backoff_wait(2, Duration::from_secs(1)),
            Duration::from_secs(4)
        );
        // Far past the cap.
        assert_eq!(backoff_wait(100, timeout), BACKOFF_WAIT_MAX);
    }
}
