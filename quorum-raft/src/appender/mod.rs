//! Leader-side replication: the aggregating appender.
//!
//! The appender owns one worker per replication peer (see [`member`])
//! and a single aggregator task that folds per-peer match indexes into
//! the commit index, folds per-peer response times into the heartbeat
//! quorum, and watches for partition symptoms.

pub(crate) mod member;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use quorum_core::{Index, IndexedEntry, Member, MemberId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::RaftError;
use crate::server::RaftInner;

/// A replication progress event from one member appender.
pub(crate) struct MemberCommit {
    pub member: MemberId,
    pub index: Index,
    /// When the acknowledged request was sent.
    pub time: Instant,
}

struct HeartbeatWaiter {
    time: Instant,
    respond: oneshot::Sender<bool>,
}

pub(crate) struct AppenderShared {
    pub server: Weak<RaftInner>,
    pub election_timeout: Duration,
    /// Index of the leader's `Initialize` entry; the commit index does
    /// not advance until this index reaches a majority.
    init_index: u64,
    started_at: Instant,
    commit_waiters: Mutex<HashMap<u64, oneshot::Sender<Result<Index, RaftError>>>>,
    heartbeat_waiters: Mutex<VecDeque<HeartbeatWaiter>>,
    match_indexes: Mutex<HashMap<MemberId, u64>>,
    last_quorum: Mutex<Instant>,
    stopped: AtomicBool,
}

impl AppenderShared {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

struct MemberHandle {
    entry_tx: mpsc::UnboundedSender<IndexedEntry>,
    heartbeat_tx: mpsc::UnboundedSender<Instant>,
    task: JoinHandle<()>,
}

/// The leader's replication engine.
pub(crate) struct Appender {
    shared: Arc<AppenderShared>,
    members: Mutex<HashMap<MemberId, MemberHandle>>,
    commit_tx: mpsc::UnboundedSender<MemberCommit>,
    fail_tx: mpsc::UnboundedSender<Instant>,
    aggregator: JoinHandle<()>,
}

impl Appender {
    /// Starts member appenders for every replication peer plus the
    /// aggregator task. Called while the caller holds the server write
    /// lock; everything here is synchronous.
    pub(crate) fn start(server: &Arc<RaftInner>, init_index: Index) -> Arc<Self> {
        let (commit_tx, commit_rx) = mpsc::unbounded_channel();
        let (fail_tx, fail_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(AppenderShared {
            server: Arc::downgrade(server),
            election_timeout: server.config.election_timeout,
            init_index: init_index.get(),
            started_at: Instant::now(),
            commit_waiters: Mutex::new(HashMap::new()),
            heartbeat_waiters: Mutex::new(VecDeque::new()),
            match_indexes: Mutex::new(HashMap::new()),
            last_quorum: Mutex::new(Instant::now()),
            stopped: AtomicBool::new(false),
        });

        let mut members = HashMap::new();
        for peer in server.cluster.replica_peers() {
            members.insert(
                peer.id.clone(),
                spawn_member(server, &shared, peer, &commit_tx, &fail_tx),
            );
        }

        let aggregator = tokio::spawn(
            Aggregator {
                shared: Arc::clone(&shared),
                commit_times: HashMap::new(),
                commit_rx,
                fail_rx,
            }
            .run(),
        );

        Arc::new(Self {
            shared,
            members: Mutex::new(members),
            commit_tx,
            fail_tx,
            aggregator,
        })
    }

    /// Hands an entry to every member appender and returns a waiter
    /// that resolves when the entry commits. With no peers the entry
    /// commits immediately.
    pub(crate) fn replicate(
        &self,
        entry: IndexedEntry,
    ) -> oneshot::Receiver<Result<Index, RaftError>> {
        let (tx, rx) = oneshot::channel();
        if self.shared.is_stopped() {
            let _ = tx.send(Err(RaftError::CommitFailed));
            return rx;
        }

        let members = self.members.lock().expect("appender lock poisoned");
        if members.is_empty() {
            drop(members);
            if let Some(server) = self.shared.server.upgrade() {
                let mut core = server.core_write();
                server.set_commit_index(&mut core, entry.index);
                drop(core);
                let _ = tx.send(Ok(entry.index));
            } else {
                let _ = tx.send(Err(RaftError::CommitFailed));
            }
            return rx;
        }

        self.shared
            .commit_waiters
            .lock()
            .expect("appender lock poisoned")
            .insert(entry.index.get(), tx);
        for handle in members.values() {
            let _ = handle.entry_tx.send(entry.clone());
        }
        drop(members);

        // Stop may have drained the waiters between the check above and
        // the insert; fail the waiter rather than leave it hanging.
        if self.shared.is_stopped() {
            if let Some(waiter) = self
                .shared
                .commit_waiters
                .lock()
                .expect("appender lock poisoned")
                .remove(&entry.index.get())
            {
                let _ = waiter.send(Err(RaftError::CommitFailed));
            }
        }
        rx
    }

    /// Verifies leadership with a quorum of heartbeats. Resolves once
    /// the median response time passes the request time.
    pub(crate) async fn heartbeat(&self) -> Result<(), RaftError> {
        if self.shared.is_stopped() {
            return Err(RaftError::QuorumFailed);
        }
        let rx = {
            let members = self.members.lock().expect("appender lock poisoned");
            if members.is_empty() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let now = Instant::now();
            self.shared
                .heartbeat_waiters
                .lock()
                .expect("appender lock poisoned")
                .push_back(HeartbeatWaiter {
                    time: now,
                    respond: tx,
                });
            for handle in members.values() {
                let _ = handle.heartbeat_tx.send(now);
            }
            rx
        };
        if self.shared.is_stopped() {
            for waiter in self
                .shared
                .heartbeat_waiters
                .lock()
                .expect("appender lock poisoned")
                .drain(..)
            {
                let _ = waiter.respond.send(false);
            }
        }
        match rx.await {
            Ok(true) => Ok(()),
            _ => Err(RaftError::QuorumFailed),
        }
    }

    /// The highest log index known replicated on `member`.
    pub(crate) fn match_index(&self, member: &MemberId) -> Index {
        Index::new(
            self.shared
                .match_indexes
                .lock()
                .expect("appender lock poisoned")
                .get(member)
                .copied()
                .unwrap_or(0),
        )
    }

    /// Time since the last heartbeat quorum, for lease reads.
    pub(crate) fn last_quorum_elapsed(&self) -> Duration {
        if self.members.lock().expect("appender lock poisoned").is_empty() {
            return Duration::ZERO;
        }
        self.shared
            .last_quorum
            .lock()
            .expect("appender lock poisoned")
            .elapsed()
    }

    /// Aligns the member appender set with a new roster.
    pub(crate) fn reconfigure(&self, server: &Arc<RaftInner>, peers: Vec<Member>) {
        if self.shared.is_stopped() {
            return;
        }
        let mut members = self.members.lock().expect("appender lock poisoned");
        members.retain(|id, handle| {
            let keep = peers.iter().any(|p| &p.id == id);
            if !keep {
                debug!(member = %id, "stopping appender for removed member");
                handle.task.abort();
            }
            keep
        });
        for peer in peers {
            if !members.contains_key(&peer.id) {
                debug!(member = %peer.id, "starting appender for new member");
                members.insert(
                    peer.id.clone(),
                    spawn_member(server, &self.shared, peer, &self.commit_tx, &self.fail_tx),
                );
            }
        }
    }

    /// Stops every worker and fails all outstanding waiters.
    pub(crate) fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.aggregator.abort();
        for handle in self.members.lock().expect("appender lock poisoned").values() {
            handle.task.abort();
        }
        for (_, waiter) in self
            .shared
            .commit_waiters
            .lock()
            .expect("appender lock poisoned")
            .drain()
        {
            let _ = waiter.send(Err(RaftError::CommitFailed));
        }
        for waiter in self
            .shared
            .heartbeat_waiters
            .lock()
            .expect("appender lock poisoned")
            .drain(..)
        {
            let _ = waiter.respond.send(false);
        }
    }
}

fn spawn_member(
    server: &Arc<RaftInner>,
    shared: &Arc<AppenderShared>,
    peer: Member,
    commit_tx: &mpsc::UnboundedSender<MemberCommit>,
    fail_tx: &mpsc::UnboundedSender<Instant>,
) -> MemberHandle {
    let (entry_tx, entry_rx) = mpsc::unbounded_channel();
    let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
    let task = member::spawn(
        server,
        Arc::clone(shared),
        peer,
        entry_rx,
        heartbeat_rx,
        commit_tx.clone(),
        fail_tx.clone(),
    );
    MemberHandle {
        entry_tx,
        heartbeat_tx,
        task,
    }
}

/// Folds member events into the commit index and heartbeat quorum.
struct Aggregator {
    shared: Arc<AppenderShared>,
    commit_times: HashMap<MemberId, Instant>,
    commit_rx: mpsc::UnboundedReceiver<MemberCommit>,
    fail_rx: mpsc::UnboundedReceiver<Instant>,
}

impl Aggregator {
    async fn run(mut self) {
        loop {
            tokio::select! {
                commit = self.commit_rx.recv() => {
                    match commit {
                        None => break,
                        Some(commit) => {
                            self.advance_commit_index(&commit);
                            self.advance_commit_time(&commit);
                        }
                    }
                }
                fail = self.fail_rx.recv() => {
                    match fail {
                        None => break,
                        Some(time) => self.check_partition(time),
                    }
                }
            }
        }
    }

    /// Updates a peer's match index and advances the commit index to
    /// the median of the voting peers' match indexes (the highest index
    /// replicated on a majority, the leader included implicitly).
    fn advance_commit_index(&mut self, commit: &MemberCommit) {
        let Some(server) = self.shared.server.upgrade() else {
            return;
        };

        {
            let mut matches = self
                .shared
                .match_indexes
                .lock()
                .expect("appender lock poisoned");
            let current = matches.entry(commit.member.clone()).or_insert(0);
            if commit.index.get() <= *current {
                return;
            }
            *current = commit.index.get();
        }

        let voting: Vec<MemberId> = server
            .cluster
            .voting_members()
            .into_iter()
            .filter(|id| id != server.cluster.local_id())
            .collect();
        if voting.is_empty() {
            return;
        }
        let mut indexes: Vec<u64> = {
            let matches = self
                .shared
                .match_indexes
                .lock()
                .expect("appender lock poisoned");
            voting
                .iter()
                .map(|id| matches.get(id).copied().unwrap_or(0))
                .collect()
        };
        indexes.sort_unstable();
        let median = indexes[indexes.len() / 2];

        // Entries from earlier terms are only committed together with
        // the leader's own Initialize entry.
        if median < self.shared.init_index {
            return;
        }

        let mut core = server.core_write();
        let mut resolved = Vec::new();
        let mut next = core.commit_index.get() + 1;
        while next <= median {
            server.set_commit_index(&mut core, Index::new(next));
            resolved.push(next);
            next += 1;
        }
        drop(core);

        if !resolved.is_empty() {
            let mut waiters = self
                .shared
                .commit_waiters
                .lock()
                .expect("appender lock poisoned");
            for index in resolved {
                if let Some(waiter) = waiters.remove(&index) {
                    let _ = waiter.send(Ok(Index::new(index)));
                }
            }
        }
    }

    /// Advances the heartbeat commit time to the median of peer
    /// response times and resolves pending heartbeat futures in FIFO
    /// order.
    fn advance_commit_time(&mut self, commit: &MemberCommit) {
        let Some(server) = self.shared.server.upgrade() else {
            return;
        };

        let current = self
            .commit_times
            .entry(commit.member.clone())
            .or_insert(self.shared.started_at);
        if commit.time <= *current {
            return;
        }
        *current = commit.time;

        let voting: Vec<MemberId> = server
            .cluster
            .voting_members()
            .into_iter()
            .filter(|id| id != server.cluster.local_id())
            .collect();
        if voting.is_empty() {
            return;
        }
        let mut times: Vec<Instant> = voting
            .iter()
            .map(|id| {
                self.commit_times
                    .get(id)
                    .copied()
                    .unwrap_or(self.shared.started_at)
            })
            .collect();
        times.sort_unstable();
        let commit_time = times[times.len() / 2];

        {
            let mut waiters = self
                .shared
                .heartbeat_waiters
                .lock()
                .expect("appender lock poisoned");
            while waiters
                .front()
                .is_some_and(|waiter| waiter.time < commit_time)
            {
                let waiter = waiters.pop_front().expect("front checked");
                let _ = waiter.respond.send(true);
            }
        }

        let mut last_quorum = self
            .shared
            .last_quorum
            .lock()
            .expect("appender lock poisoned");
        if commit_time > *last_quorum {
            *last_quorum = commit_time;
        }
    }

    /// Steps the leader down once no quorum has been reached for more
    /// than two election timeouts.
    fn check_partition(&self, fail_time: Instant) {
        let last_quorum = *self
            .shared
            .last_quorum
            .lock()
            .expect("appender lock poisoned");
        if fail_time.saturating_duration_since(last_quorum) > self.shared.election_timeout * 2 {
            if let Some(server) = self.shared.server.upgrade() {
                warn!(member = %server.cluster.local_id(), "suspected network partition; stepping down");
                server.step_down();
            }
        }
    }
}
