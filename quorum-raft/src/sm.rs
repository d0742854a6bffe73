//! The state-machine manager: applies committed entries in index order,
//! owns the session table, executes queries, and takes periodic
//! snapshots for log compaction.
//!
//! The manager runs in a single task, so user state machines need no
//! internal locking. Everything else talks to it through messages and
//! two watch channels (commit index in, applied index out).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quorum_core::{EntryPayload, Index, SessionId, StreamId};
use quorum_store::{Log, Snapshot, SnapshotStore};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::protocol::ResponseError;
use crate::server::RaftInner;
use crate::session::{Session, SessionQuery, SessionRequest};

/// A user state machine plugged into the replicated service.
///
/// Commands arrive deduplicated and in log order; queries run against
/// the state as of the last applied entry. All calls happen on one
/// task.
pub trait StateMachine: Send + 'static {
    /// Applies a committed command and returns its output.
    ///
    /// # Errors
    /// An error string is surfaced to the client as an application
    /// error; the command still consumes its sequence number.
    fn apply(&mut self, ctx: &mut ApplyContext<'_>, input: &Bytes) -> Result<Bytes, String>;

    /// Executes a read-only query.
    ///
    /// # Errors
    /// An error string is surfaced to the client as an application
    /// error.
    fn query(&self, input: &Bytes) -> Result<Bytes, String>;

    /// Serializes the full state for a snapshot.
    fn snapshot(&self) -> Bytes;

    /// Replaces the state from a snapshot.
    fn restore(&mut self, data: &Bytes);
}

/// Context handed to [`StateMachine::apply`].
pub struct ApplyContext<'a> {
    index: Index,
    timestamp_us: u64,
    session: &'a mut Session,
}

impl ApplyContext<'_> {
    /// The log index of the command being applied.
    #[must_use]
    pub fn index(&self) -> Index {
        self.index
    }

    /// The replicated timestamp of the command entry.
    #[must_use]
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// The session the command belongs to.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    /// Publishes an event on one of the session's push streams.
    pub fn publish(&mut self, stream: StreamId, event: Bytes) {
        self.session.publish(stream, self.index, event);
    }
}

/// Outcome of a committed command: the index it applied at plus its
/// output, or a client-visible error.
pub(crate) type CommandOutcome = Result<(Index, Bytes), (ResponseError, Option<String>)>;

/// Outcome of a query.
pub(crate) type QueryOutcome = Result<Bytes, (ResponseError, Option<String>)>;

pub(crate) enum SmMessage {
    RegisterResult {
        index: Index,
        respond: oneshot::Sender<CommandOutcome>,
    },
    Query {
        value: Bytes,
        respond: oneshot::Sender<QueryOutcome>,
    },
    Events {
        session_id: SessionId,
        stream_id: StreamId,
        respond: oneshot::Sender<Vec<(Index, Bytes)>>,
    },
    Restore {
        snapshot: Snapshot,
    },
    TakeSnapshot {
        respond: oneshot::Sender<Option<Index>>,
    },
    Shutdown,
}

/// Handle through which the server talks to the manager task.
#[derive(Clone)]
pub(crate) struct SmHandle {
    msg_tx: mpsc::UnboundedSender<SmMessage>,
    applied_rx: watch::Receiver<Index>,
}

impl SmHandle {
    /// Registers a waiter for the outcome of the command at `index`.
    /// Must be called before the entry can possibly apply.
    pub(crate) fn register_result(&self, index: Index) -> oneshot::Receiver<CommandOutcome> {
        let (respond, rx) = oneshot::channel();
        let _ = self.msg_tx.send(SmMessage::RegisterResult { index, respond });
        rx
    }

    pub(crate) async fn query(&self, value: Bytes) -> QueryOutcome {
        let (respond, rx) = oneshot::channel();
        if self
            .msg_tx
            .send(SmMessage::Query { value, respond })
            .is_err()
        {
            return Err((ResponseError::QueryFailure, None));
        }
        rx.await
            .unwrap_or(Err((ResponseError::QueryFailure, None)))
    }

    pub(crate) async fn events(
        &self,
        session_id: SessionId,
        stream_id: StreamId,
    ) -> Vec<(Index, Bytes)> {
        let (respond, rx) = oneshot::channel();
        if self
            .msg_tx
            .send(SmMessage::Events {
                session_id,
                stream_id,
                respond,
            })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub(crate) fn restore(&self, snapshot: Snapshot) {
        let _ = self.msg_tx.send(SmMessage::Restore { snapshot });
    }

    pub(crate) async fn take_snapshot(&self) -> Option<Index> {
        let (respond, rx) = oneshot::channel();
        self.msg_tx.send(SmMessage::TakeSnapshot { respond }).ok()?;
        rx.await.ok().flatten()
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.msg_tx.send(SmMessage::Shutdown);
    }

    /// The index of the last applied entry.
    pub(crate) fn applied(&self) -> Index {
        *self.applied_rx.borrow()
    }

    /// Waits until the applied index reaches `index`, bounded by
    /// `deadline`. Returns false on timeout.
    pub(crate) async fn wait_for_applied(
        &self,
        index: Index,
        deadline: std::time::Duration,
    ) -> bool {
        let mut rx = self.applied_rx.clone();
        let result = timeout(deadline, rx.wait_for(|applied| *applied >= index)).await;
        matches!(result, Ok(Ok(_)))
    }
}

/// The manager's ends of the handle channels; created with
/// [`channels`] before the server exists, consumed by
/// [`spawn_manager`] once it does.
pub(crate) struct SmReceivers {
    msg_rx: mpsc::UnboundedReceiver<SmMessage>,
    applied_tx: watch::Sender<Index>,
}

/// Creates the handle/receiver pair for a manager.
pub(crate) fn channels() -> (SmHandle, SmReceivers) {
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (applied_tx, applied_rx) = watch::channel(Index::ZERO);
    (
        SmHandle { msg_tx, applied_rx },
        SmReceivers { msg_rx, applied_tx },
    )
}

/// Spawns the manager task.
pub(crate) fn spawn_manager(
    server: Weak<RaftInner>,
    state_machine: Box<dyn StateMachine>,
    log: Arc<dyn Log>,
    snapshots: Arc<dyn SnapshotStore>,
    cluster: Arc<Cluster>,
    compaction_threshold: u64,
    commit_rx: watch::Receiver<Index>,
    receivers: SmReceivers,
) {
    let SmReceivers { msg_rx, applied_tx } = receivers;
    let manager = StateMachineManager {
        server,
        state_machine,
        log,
        snapshots,
        cluster,
        compaction_threshold,
        sessions: HashMap::new(),
        last_applied: Index::ZERO,
        last_timestamp_us: 0,
        applied_since_snapshot: 0,
        result_waiters: HashMap::new(),
        commit_rx,
        applied_tx,
        msg_rx,
    };
    tokio::spawn(manager.run());
}

struct StateMachineManager {
    server: Weak<RaftInner>,
    state_machine: Box<dyn StateMachine>,
    log: Arc<dyn Log>,
    snapshots: Arc<dyn SnapshotStore>,
    cluster: Arc<Cluster>,
    compaction_threshold: u64,
    sessions: HashMap<SessionId, Session>,
    last_applied: Index,
    /// Timestamp of the last applied entry, reused as the snapshot
    /// timestamp so it is identical on every replica.
    last_timestamp_us: u64,
    applied_since_snapshot: u64,
    result_waiters: HashMap<u64, oneshot::Sender<CommandOutcome>>,
    commit_rx: watch::Receiver<Index>,
    applied_tx: watch::Sender<Index>,
    msg_rx: mpsc::UnboundedReceiver<SmMessage>,
}

impl StateMachineManager {
    async fn run(mut self) {
        // Resume from the latest snapshot when restarting over an
        // existing store.
        if let Some(snapshot) = self.snapshots.current_snapshot() {
            self.restore(&snapshot);
        }
        self.apply_committed();

        loop {
            // Biased toward control messages: a result waiter sent
            // before an entry replicated must be registered before the
            // commit that applies the entry is observed.
            tokio::select! {
                biased;
                msg = self.msg_rx.recv() => {
                    match msg {
                        None | Some(SmMessage::Shutdown) => break,
                        Some(msg) => self.handle_message(msg),
                    }
                }
                changed = self.commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.apply_committed();
                }
            }
        }
        debug!("state machine manager stopped");
    }

    fn handle_message(&mut self, msg: SmMessage) {
        match msg {
            SmMessage::RegisterResult { index, respond } => {
                if index <= self.last_applied {
                    let _ = respond.send(Err((
                        ResponseError::CommandFailure,
                        Some("entry already applied".to_owned()),
                    )));
                } else {
                    self.result_waiters.insert(index.get(), respond);
                }
            }
            SmMessage::Query { value, respond } => {
                let _ = respond.send(self.execute_query(&value));
            }
            SmMessage::Events {
                session_id,
                stream_id,
                respond,
            } => {
                let events = self
                    .sessions
                    .get(&session_id)
                    .map(|s| s.pending_events(stream_id))
                    .unwrap_or_default();
                let _ = respond.send(events);
            }
            SmMessage::Restore { snapshot } => self.restore(&snapshot),
            SmMessage::TakeSnapshot { respond } => {
                let _ = respond.send(self.take_snapshot());
            }
            SmMessage::Shutdown => unreachable!("handled in run"),
        }
    }

    fn apply_committed(&mut self) {
        let commit = *self.commit_rx.borrow();
        while self.last_applied < commit {
            let index = self.last_applied.next();
            let Some(indexed) = self.log.entry(index) else {
                // The entry is gone; a snapshot restore will move
                // last_applied past this point.
                warn!(index = %index, "committed entry missing from log");
                break;
            };
            self.apply_entry(index, indexed.entry);
            self.last_applied = index;
            let _ = self.applied_tx.send(self.last_applied);

            self.applied_since_snapshot += 1;
            if self.applied_since_snapshot >= self.compaction_threshold {
                self.take_snapshot();
            }
        }
    }

    fn apply_entry(&mut self, index: Index, entry: quorum_core::LogEntry) {
        self.last_timestamp_us = self.last_timestamp_us.max(entry.timestamp_us);
        match entry.payload {
            EntryPayload::Initialize => {
                self.resolve_waiter(index, Ok((index, Bytes::new())));
            }
            EntryPayload::Configuration(members) => {
                self.cluster.update(index, members);
                if let Some(server) = self.server.upgrade() {
                    server.on_configuration_committed(index);
                }
                self.resolve_waiter(index, Ok((index, Bytes::new())));
            }
            EntryPayload::Command(value) => {
                self.apply_command(index, entry.timestamp_us, &value);
            }
        }
    }

    fn apply_command(&mut self, index: Index, timestamp_us: u64, value: &Bytes) {
        self.expire_sessions(timestamp_us);

        let Some(request) = SessionRequest::decode(value) else {
            self.resolve_waiter(index, Err((ResponseError::ProtocolError, None)));
            return;
        };

        let outcome: CommandOutcome = match request {
            SessionRequest::OpenSession { timeout_ms } => {
                let id = SessionId::new(index.get());
                self.sessions
                    .insert(id, Session::new(id, timeout_ms, timestamp_us));
                debug!(session = %id, timeout_ms, "session opened");
                let mut output = BytesMut::with_capacity(8);
                output.put_u64_le(id.get());
                Ok((index, output.freeze()))
            }
            SessionRequest::KeepAlive {
                session_id,
                command_sequence,
                streams,
            } => match self.sessions.get_mut(&session_id) {
                None => Err((ResponseError::UnknownSession, None)),
                Some(session) => {
                    session.keep_alive(timestamp_us, command_sequence, &streams);
                    Ok((index, Bytes::new()))
                }
            },
            SessionRequest::CloseSession { session_id } => {
                if self.sessions.remove(&session_id).is_some() {
                    debug!(session = %session_id, "session closed");
                    Ok((index, Bytes::new()))
                } else {
                    Err((ResponseError::UnknownSession, None))
                }
            }
            SessionRequest::Command {
                session_id,
                sequence,
                input,
            } => match self.sessions.get_mut(&session_id) {
                None => Err((ResponseError::UnknownSession, None)),
                Some(session) => {
                    if sequence <= session.last_command_sequence {
                        // Duplicate: return the cached response without
                        // re-applying.
                        match session.cached_result(sequence) {
                            Some(Ok(output)) => Ok((index, output.clone())),
                            Some(Err(error)) => Err(error.clone()),
                            None => Err((
                                ResponseError::CommandFailure,
                                Some("response no longer cached".to_owned()),
                            )),
                        }
                    } else {
                        session.kept_alive_us = timestamp_us;
                        let mut ctx = ApplyContext {
                            index,
                            timestamp_us,
                            session,
                        };
                        let result = self.state_machine.apply(&mut ctx, &input);
                        let cached = result
                            .clone()
                            .map_err(|msg| (ResponseError::ApplicationError, Some(msg)));
                        session.record_result(sequence, cached.clone());
                        cached.map(|output| (index, output))
                    }
                }
            },
        };

        self.resolve_waiter(index, outcome);
    }

    fn expire_sessions(&mut self, now_us: u64) {
        self.sessions.retain(|id, session| {
            let expired = session.is_expired(now_us);
            if expired {
                debug!(session = %id, "session expired");
            }
            !expired
        });
    }

    fn resolve_waiter(&mut self, index: Index, outcome: CommandOutcome) {
        if let Some(waiter) = self.result_waiters.remove(&index.get()) {
            let _ = waiter.send(outcome);
        }
    }

    fn execute_query(&self, value: &Bytes) -> QueryOutcome {
        let Some(query) = SessionQuery::decode(value) else {
            return Err((ResponseError::ProtocolError, None));
        };
        if query.session_id != SessionId::ZERO && !self.sessions.contains_key(&query.session_id) {
            return Err((ResponseError::UnknownSession, None));
        }
        self.state_machine
            .query(&query.input)
            .map_err(|msg| (ResponseError::ApplicationError, Some(msg)))
    }

    fn take_snapshot(&mut self) -> Option<Index> {
        if self.last_applied == Index::ZERO {
            return None;
        }

        let snapshot = self
            .snapshots
            .new_snapshot(self.last_applied, self.last_timestamp_us);
        let Ok(mut writer) = snapshot.writer() else {
            warn!(index = %self.last_applied, "snapshot already exists at index");
            return None;
        };

        let mut body = BytesMut::new();
        body.put_u32_le(self.sessions.len() as u32);
        for session in self.sessions.values() {
            session.encode(&mut body);
        }
        let user = self.state_machine.snapshot();
        body.put_u32_le(user.len() as u32);
        body.extend_from_slice(&user);

        // The payload carries its own checksum so a snapshot restored
        // from an install stream is verified end to end.
        writer.write(&crc32fast::hash(&body).to_le_bytes());
        writer.write(&body);
        writer.complete();

        self.log.compact(self.last_applied);
        self.applied_since_snapshot = 0;
        info!(index = %self.last_applied, "snapshot taken, log compacted");
        Some(self.last_applied)
    }

    fn restore(&mut self, snapshot: &Snapshot) {
        let Ok(reader) = snapshot.reader() else {
            warn!(index = %snapshot.index(), "cannot restore from pending snapshot");
            return;
        };
        let mut buf = reader.bytes();

        if buf.remaining() < 4 {
            warn!(index = %snapshot.index(), "snapshot payload truncated");
            return;
        }
        let stored_crc = buf.get_u32_le();
        let actual_crc = crc32fast::hash(&buf);
        if stored_crc != actual_crc {
            warn!(
                index = %snapshot.index(),
                expected = stored_crc,
                actual = actual_crc,
                "snapshot payload checksum mismatch"
            );
            return;
        }

        if buf.remaining() < 4 {
            warn!(index = %snapshot.index(), "snapshot payload truncated");
            return;
        }
        let session_count = buf.get_u32_le() as usize;
        let mut sessions = HashMap::with_capacity(session_count.min(1024));
        for _ in 0..session_count {
            let Some(session) = Session::decode(&mut buf) else {
                warn!(index = %snapshot.index(), "snapshot session table truncated");
                return;
            };
            sessions.insert(session.id, session);
        }
        if buf.remaining() < 4 {
            warn!(index = %snapshot.index(), "snapshot payload truncated");
            return;
        }
        let user_len = buf.get_u32_le() as usize;
        if buf.remaining() < user_len {
            warn!(index = %snapshot.index(), "snapshot payload truncated");
            return;
        }
        let user = buf.copy_to_bytes(user_len);

        self.state_machine.restore(&user);
        self.sessions = sessions;
        self.last_applied = snapshot.index();
        self.last_timestamp_us = snapshot.timestamp_us();
        self.applied_since_snapshot = 0;
        let _ = self.applied_tx.send(self.last_applied);
        info!(index = %snapshot.index(), "state restored from snapshot");
    }
}
