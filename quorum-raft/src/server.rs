//! The Raft server facade.
//!
//! Serializes role transitions under a single readers-writer lock over
//! the core fields (term, vote, leader, commit index, role pointer),
//! exposes the RPC surface, and signals readiness once the first role
//! has started. Handlers take the lock in short synchronous scopes and
//! never hold it across network I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use quorum_core::{Index, MemberId, MemberType, SessionId, StreamId, Term};
use quorum_store::{Log, MemoryLog, MemoryMetadataStore, MemorySnapshotStore, MetadataStore, SnapshotStore};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, ConfigurationResponse,
    ConfigureRequest, ConfigureResponse, InstallRequest, InstallResponse, JoinRequest,
    LeaveRequest, PollRequest, PollResponse, QueryRequest, QueryResponse, ReadConsistency,
    ReconfigureRequest, ResponseError, ResponseStatus, TransferRequest, TransferResponse,
    VoteRequest, VoteResponse,
};
use crate::roles::{
    candidate, follower, leader, passive, CandidateState, FollowerState, Role, RoleKind,
};
use crate::session::SessionQuery;
use crate::sm::{self, SmHandle, StateMachine};
use crate::transport::Transport;

/// Wall clock in microseconds since the Unix epoch. Stamped onto log
/// entries by the leader and replicated, so time-dependent apply logic
/// is deterministic across replicas.
pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64)
}

/// The lock-guarded server core.
pub(crate) struct Core {
    pub term: Term,
    pub voted_for: Option<MemberId>,
    pub leader: Option<MemberId>,
    pub commit_index: Index,
    pub role: Role,
}

pub(crate) struct RaftInner {
    pub(crate) config: RaftConfig,
    pub(crate) cluster: Arc<Cluster>,
    pub(crate) log: Arc<dyn Log>,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) snapshots: Arc<dyn SnapshotStore>,
    pub(crate) sm: SmHandle,
    core: RwLock<Core>,
    commit_tx: watch::Sender<Index>,
    ready_tx: watch::Sender<bool>,
    timer_generation: AtomicU64,
}

impl RaftInner {
    pub(crate) fn core_read(&self) -> RwLockReadGuard<'_, Core> {
        self.core.read().expect("server lock poisoned")
    }

    pub(crate) fn core_write(&self) -> RwLockWriteGuard<'_, Core> {
        self.core.write().expect("server lock poisoned")
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.timer_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Adopts a higher term: persists it, clears the vote, forgets the
    /// leader.
    pub(crate) fn bump_term(&self, core: &mut Core, term: Term) {
        debug_assert!(term > core.term);
        if let Err(error) = self.metadata.store_term(term) {
            warn!(error = %error, "failed to persist term");
        }
        if let Err(error) = self.metadata.store_vote(None) {
            warn!(error = %error, "failed to clear persisted vote");
        }
        core.term = term;
        core.voted_for = None;
        core.leader = None;
    }

    pub(crate) fn set_leader(&self, core: &mut Core, leader: Option<MemberId>) {
        if core.leader != leader {
            debug!(member = %self.cluster.local_id(), leader = ?leader, "leader changed");
            core.leader = leader;
        }
    }

    /// Advances the commit index (never backwards) and wakes the
    /// state-machine manager.
    pub(crate) fn set_commit_index(&self, core: &mut Core, index: Index) {
        if index > core.commit_index {
            core.commit_index = index;
            // send_replace stores the value even with no live receiver.
            self.commit_tx.send_replace(index);
        }
    }

    /// Whether a candidate with the given log tail is at least as up
    /// to date as we are, comparing (term, index) lexicographically.
    pub(crate) fn log_up_to_date(&self, last_term: Term, last_index: Index) -> bool {
        let (my_term, my_index) = match self.log.last_entry() {
            Some(tail) => (tail.entry.term, tail.index),
            None => (Term::ZERO, self.log.last_index()),
        };
        last_term > my_term || (last_term == my_term && last_index >= my_index)
    }

    /// Double-checked adoption of a higher term observed in a
    /// response. Returns true if the term was adopted.
    pub(crate) fn observe_term(self: &Arc<Self>, term: Term) -> bool {
        if term <= self.core_read().term {
            return false;
        }
        let mut core = self.core_write();
        if term <= core.term {
            return false;
        }
        self.bump_term(&mut core, term);
        if core.role.is_active() {
            self.set_role_locked(&mut core, RoleKind::Follower);
        }
        true
    }

    /// Leader voluntarily abandons leadership without a term change.
    pub(crate) fn step_down(self: &Arc<Self>) {
        let mut core = self.core_write();
        if matches!(core.role, Role::Leader(_)) {
            self.set_leader(&mut core, None);
            self.set_role_locked(&mut core, RoleKind::Follower);
        }
    }

    /// Reacts to a committed configuration entry: adjusts the local
    /// role to the roster's view of this member and, on the leader,
    /// realigns the member appenders and pushes the roster to
    /// non-voting members.
    pub(crate) fn on_configuration_committed(self: &Arc<Self>, _index: Index) {
        self.sync_role_with_roster();

        let leader_ctx = {
            let core = self.core_read();
            match &core.role {
                Role::Leader(state) => Some((Arc::clone(&state.appender), core.term)),
                _ => None,
            }
        };
        if let Some((appender, term)) = leader_ctx {
            appender.reconfigure(self, self.cluster.replica_peers());
            leader::push_configuration(self, term);
        }
    }

    /// Moves this member to the role its roster entry declares.
    pub(crate) fn sync_role_with_roster(self: &Arc<Self>) {
        let mut core = self.core_write();
        if matches!(core.role, Role::Stopped) {
            return;
        }
        let desired = match self.cluster.local_member().map(|m| m.member_type) {
            Some(MemberType::Active) => {
                if core.role.is_active() {
                    return;
                }
                RoleKind::Follower
            }
            Some(MemberType::Passive) => RoleKind::Passive,
            // Removed members go inert.
            Some(MemberType::Reserve) | None => RoleKind::Reserve,
        };
        if core.role.kind() == desired {
            return;
        }
        info!(member = %self.cluster.local_id(), role = %desired, "roster changed local member type");
        self.set_role_locked(&mut core, desired);
    }

    /// Stops the current role and starts `kind`. The caller holds the
    /// write lock; the old role's teardown (appender stop, timer
    /// invalidation by generation) happens before the new role starts.
    pub(crate) fn set_role_locked(self: &Arc<Self>, core: &mut Core, kind: RoleKind) {
        let old = std::mem::replace(&mut core.role, Role::Stopped);
        let old_kind = old.kind();
        if let Role::Leader(state) = &old {
            state.appender.stop();
        }
        drop(old);

        match kind {
            RoleKind::Reserve => core.role = Role::Reserve,
            RoleKind::Passive => core.role = Role::Passive,
            RoleKind::Stopped => core.role = Role::Stopped,
            RoleKind::Follower => {
                let voting = self.cluster.voting_members();
                let local_votes = voting.iter().any(|id| id == self.cluster.local_id());
                if local_votes && voting.len() == 1 {
                    debug!(member = %self.cluster.local_id(), "single active member; starting election");
                    self.set_role_locked(core, RoleKind::Candidate);
                    return;
                }
                let generation = self.next_generation();
                core.role = Role::Follower(FollowerState { generation });
                follower::arm_heartbeat_timer(self, generation);
            }
            RoleKind::Candidate => {
                let term = core.term.next();
                if let Err(error) = self.metadata.store_term(term) {
                    warn!(error = %error, "failed to persist term; staying follower");
                    let generation = self.next_generation();
                    core.role = Role::Follower(FollowerState { generation });
                    follower::arm_heartbeat_timer(self, generation);
                    self.signal_ready();
                    return;
                }
                core.term = term;
                core.voted_for = Some(self.cluster.local_id().clone());
                if let Err(error) = self.metadata.store_vote(Some(self.cluster.local_id())) {
                    warn!(error = %error, "failed to persist vote");
                }
                core.leader = None;
                let generation = self.next_generation();
                core.role = Role::Candidate(CandidateState { generation });
                candidate::start_election(self, term, generation);
            }
            RoleKind::Leader => {
                core.role = leader::start(self, core);
            }
        }

        if old_kind != core.role.kind() {
            debug!(
                member = %self.cluster.local_id(),
                from = %old_kind,
                to = %core.role.kind(),
                term = %core.term,
                "role transition"
            );
        }
        self.signal_ready();
    }

    fn signal_ready(&self) {
        // send_replace: readiness may be signaled before anyone waits.
        self.ready_tx.send_replace(true);
    }

    /// Routing hints for client responses.
    pub(crate) fn routing(&self) -> (Option<MemberId>, Term, Vec<MemberId>) {
        let core = self.core_read();
        (
            core.leader.clone(),
            core.term,
            self.cluster.voting_members(),
        )
    }

    pub(crate) fn no_leader_response(&self) -> CommandResponse {
        let (leader, term, members) = self.routing();
        CommandResponse::error(ResponseError::NoLeader, leader, term, members)
    }

    pub(crate) fn command_error(
        &self,
        error: ResponseError,
        message: Option<String>,
    ) -> CommandResponse {
        let (leader, term, members) = self.routing();
        let mut response = CommandResponse::error(error, leader, term, members);
        response.message = message;
        response
    }

    /// Waits (bounded) until the applied index reaches `min_index`,
    /// then runs the query on the state machine.
    pub(crate) async fn execute_query(&self, value: Bytes, min_index: Index) -> QueryResponse {
        if min_index > Index::ZERO
            && !self
                .sm
                .wait_for_applied(min_index, self.config.election_timeout)
                .await
        {
            return QueryResponse::error(ResponseError::QueryFailure);
        }
        match self.sm.query(value).await {
            Ok(output) => QueryResponse::ok(output),
            Err((error, message)) => {
                let mut response = QueryResponse::error(error);
                response.message = message;
                response
            }
        }
    }
}

/// A member of the replicated state-machine service.
///
/// Cheap to clone; all clones share the same underlying server.
#[derive(Clone)]
pub struct RaftServer {
    inner: Arc<RaftInner>,
}

impl RaftServer {
    /// Creates a server over the given collaborators. Must be called
    /// within a tokio runtime (the state-machine manager task starts
    /// immediately).
    pub fn new(
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        log: Arc<dyn Log>,
        metadata: Arc<dyn MetadataStore>,
        snapshots: Arc<dyn SnapshotStore>,
        state_machine: Box<dyn StateMachine>,
    ) -> Self {
        let cluster = Arc::new(Cluster::new(
            config.local.clone(),
            config.members.clone(),
            transport,
        ));
        let (commit_tx, commit_rx) = watch::channel(Index::ZERO);
        let (ready_tx, _) = watch::channel(false);
        let (sm_handle, sm_receivers) = sm::channels();
        let compaction_threshold = config.compaction_threshold;

        let inner = Arc::new(RaftInner {
            config,
            cluster: Arc::clone(&cluster),
            log: Arc::clone(&log),
            metadata,
            snapshots: Arc::clone(&snapshots),
            sm: sm_handle,
            core: RwLock::new(Core {
                term: Term::ZERO,
                voted_for: None,
                leader: None,
                commit_index: Index::ZERO,
                role: Role::Stopped,
            }),
            commit_tx,
            ready_tx,
            timer_generation: AtomicU64::new(0),
        });

        sm::spawn_manager(
            Arc::downgrade(&inner),
            state_machine,
            log,
            snapshots,
            cluster,
            compaction_threshold,
            commit_rx,
            sm_receivers,
        );

        Self { inner }
    }

    /// Creates a server backed by in-memory stores.
    pub fn with_memory_stores(
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        state_machine: Box<dyn StateMachine>,
    ) -> Self {
        Self::new(
            config,
            transport,
            Arc::new(MemoryLog::new()),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MemorySnapshotStore::new()),
            state_machine,
        )
    }

    /// Loads persisted state and starts the member in its declared
    /// role, returning once the server is ready to handle RPCs.
    ///
    /// # Errors
    /// Returns an error if the metadata store cannot be read.
    pub async fn start(&self) -> Result<(), RaftError> {
        let term = self.inner.metadata.load_term()?;
        let vote = self.inner.metadata.load_vote()?;
        {
            let mut core = self.inner.core_write();
            if let Some(term) = term {
                core.term = term;
            }
            core.voted_for = vote;

            let kind = match self.inner.config.local_member().member_type {
                MemberType::Active => RoleKind::Follower,
                MemberType::Passive => RoleKind::Passive,
                MemberType::Reserve => RoleKind::Reserve,
            };
            info!(member = %self.inner.cluster.local_id(), role = %kind, "starting server");
            self.inner.set_role_locked(&mut core, kind);
        }
        self.wait_for_ready().await;
        Ok(())
    }

    /// Resolves once the first role has started.
    pub async fn wait_for_ready(&self) {
        let mut rx = self.inner.ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Stops the server: role first (which stops the appender
    /// workers), then the state-machine manager. Stores are left to
    /// their owners.
    pub fn stop(&self) {
        info!(member = %self.inner.cluster.local_id(), "stopping server");
        {
            let mut core = self.inner.core_write();
            self.inner.set_role_locked(&mut core, RoleKind::Stopped);
        }
        self.inner.sm.shutdown();
    }

    /// This member's ID.
    #[must_use]
    pub fn id(&self) -> &MemberId {
        self.inner.cluster.local_id()
    }

    /// The current role.
    #[must_use]
    pub fn role(&self) -> RoleKind {
        self.inner.core_read().role.kind()
    }

    /// The current term.
    #[must_use]
    pub fn term(&self) -> Term {
        self.inner.core_read().term
    }

    /// The known leader, if any.
    #[must_use]
    pub fn leader(&self) -> Option<MemberId> {
        self.inner.core_read().leader.clone()
    }

    /// The commit index.
    #[must_use]
    pub fn commit_index(&self) -> Index {
        self.inner.core_read().commit_index
    }

    /// The last applied index.
    #[must_use]
    pub fn last_applied(&self) -> Index {
        self.inner.sm.applied()
    }

    /// Whether this member currently leads.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self.inner.core_read().role, Role::Leader(_))
    }

    /// Returns the buffered, unacknowledged events of a session push
    /// stream. Entries are released once a `KeepAlive` acknowledges
    /// them.
    pub async fn session_events(
        &self,
        session: SessionId,
        stream: StreamId,
    ) -> Vec<(Index, Bytes)> {
        self.inner.sm.events(session, stream).await
    }

    // --- RPC surface -----------------------------------------------------

    /// Handles a pre-vote probe.
    pub async fn poll(&self, request: PollRequest) -> PollResponse {
        {
            let core = self.inner.core_read();
            if !core.role.is_active() {
                return PollResponse {
                    status: ResponseStatus::Error,
                    error: Some(ResponseError::IllegalMemberState),
                    term: core.term,
                    accepted: false,
                };
            }
        }
        crate::roles::handle_poll(&self.inner, &request)
    }

    /// Handles a vote request.
    pub async fn vote(&self, request: VoteRequest) -> VoteResponse {
        {
            let core = self.inner.core_read();
            if !core.role.is_active() {
                return VoteResponse {
                    status: ResponseStatus::Error,
                    error: Some(ResponseError::IllegalMemberState),
                    term: core.term,
                    voted: false,
                };
            }
        }
        crate::roles::handle_vote(&self.inner, &request)
    }

    /// Handles log replication.
    pub async fn append(&self, request: AppendRequest) -> AppendResponse {
        {
            let core = self.inner.core_read();
            if !core.role.receives_log() {
                return AppendResponse::error(ResponseError::IllegalMemberState, core.term);
            }
        }
        let response = passive::handle_append(&self.inner, &request);
        // A stale-term append is not a sign of a live leader; only
        // valid appends reset the election timer.
        if request.term >= response.term {
            follower::reset_heartbeat_timeout(&self.inner);
        }
        response
    }

    /// Handles a snapshot installation stream.
    pub async fn install(&self, chunks: mpsc::Receiver<InstallRequest>) -> InstallResponse {
        {
            let core = self.inner.core_read();
            if matches!(core.role, Role::Leader(_)) || !core.role.receives_log() {
                return InstallResponse::error(ResponseError::IllegalMemberState);
            }
        }
        let response = passive::handle_install(&self.inner, chunks).await;
        follower::reset_heartbeat_timeout(&self.inner);
        response
    }

    /// Handles a configuration push. Unlike other replication RPCs
    /// this is also accepted by Reserve members; it is the only way a
    /// promotion can reach them.
    pub async fn configure(&self, request: ConfigureRequest) -> ConfigureResponse {
        if matches!(self.inner.core_read().role, Role::Stopped) {
            return ConfigureResponse {
                status: ResponseStatus::Error,
                error: Some(ResponseError::IllegalMemberState),
            };
        }
        let response = passive::handle_configure(&self.inner, &request);
        follower::reset_heartbeat_timeout(&self.inner);
        response
    }

    /// Handles a client command; non-leaders forward to the leader.
    pub async fn command(&self, request: CommandRequest) -> mpsc::Receiver<CommandResponse> {
        let (tx, rx) = mpsc::channel(8);
        let server = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if matches!(server.core_read().role, Role::Leader(_)) {
                let response = leader::handle_command(&server, request).await;
                let _ = tx.send(response).await;
            } else {
                forward_command(&server, request, tx).await;
            }
        });
        rx
    }

    /// Handles a client query at its requested consistency level.
    pub async fn query(&self, request: QueryRequest) -> mpsc::Receiver<QueryResponse> {
        let (tx, rx) = mpsc::channel(8);
        let server = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let response = match request.read_consistency {
                ReadConsistency::Sequential => {
                    // Served locally by any member once the client's
                    // observed index has been applied.
                    let min_index = SessionQuery::decode(&request.value)
                        .map_or(Index::ZERO, |q| q.last_index);
                    server.execute_query(request.value, min_index).await
                }
                ReadConsistency::LinearizableLease | ReadConsistency::Linearizable => {
                    if matches!(server.core_read().role, Role::Leader(_)) {
                        leader::handle_query(&server, request).await
                    } else {
                        forward_query(&server, request).await
                    }
                }
            };
            let _ = tx.send(response).await;
        });
        rx
    }

    /// Adds a member to the cluster.
    pub async fn join(&self, request: JoinRequest) -> ConfigurationResponse {
        if self.is_leader() {
            return leader::handle_join(&self.inner, request).await;
        }
        let Some(leader_id) = self.forwardable_leader() else {
            return ConfigurationResponse::error(
                ResponseError::NoLeader,
                self.inner.cluster.members(),
            );
        };
        match self.inner.cluster.client(&leader_id).await {
            Ok(client) => match timeout(self.rpc_deadline(), client.join(request)).await {
                Ok(Ok(response)) => response,
                _ => ConfigurationResponse::error(
                    ResponseError::Unavailable,
                    self.inner.cluster.members(),
                ),
            },
            Err(_) => ConfigurationResponse::error(
                ResponseError::Unavailable,
                self.inner.cluster.members(),
            ),
        }
    }

    /// Removes a member from the cluster.
    pub async fn leave(&self, request: LeaveRequest) -> ConfigurationResponse {
        if self.is_leader() {
            return leader::handle_leave(&self.inner, request).await;
        }
        let Some(leader_id) = self.forwardable_leader() else {
            return ConfigurationResponse::error(
                ResponseError::NoLeader,
                self.inner.cluster.members(),
            );
        };
        match self.inner.cluster.client(&leader_id).await {
            Ok(client) => match timeout(self.rpc_deadline(), client.leave(request)).await {
                Ok(Ok(response)) => response,
                _ => ConfigurationResponse::error(
                    ResponseError::Unavailable,
                    self.inner.cluster.members(),
                ),
            },
            Err(_) => ConfigurationResponse::error(
                ResponseError::Unavailable,
                self.inner.cluster.members(),
            ),
        }
    }

    /// Changes an existing member.
    pub async fn reconfigure(&self, request: ReconfigureRequest) -> ConfigurationResponse {
        if self.is_leader() {
            return leader::handle_reconfigure(&self.inner, request).await;
        }
        let Some(leader_id) = self.forwardable_leader() else {
            return ConfigurationResponse::error(
                ResponseError::NoLeader,
                self.inner.cluster.members(),
            );
        };
        match self.inner.cluster.client(&leader_id).await {
            Ok(client) => match timeout(self.rpc_deadline(), client.reconfigure(request)).await {
                Ok(Ok(response)) => response,
                _ => ConfigurationResponse::error(
                    ResponseError::Unavailable,
                    self.inner.cluster.members(),
                ),
            },
            Err(_) => ConfigurationResponse::error(
                ResponseError::Unavailable,
                self.inner.cluster.members(),
            ),
        }
    }

    /// Transfers leadership to another member.
    pub async fn transfer(&self, request: TransferRequest) -> TransferResponse {
        if self.is_leader() {
            return leader::handle_transfer(&self.inner, request).await;
        }
        let Some(leader_id) = self.forwardable_leader() else {
            return TransferResponse {
                status: ResponseStatus::Error,
                error: Some(ResponseError::NoLeader),
            };
        };
        match self.inner.cluster.client(&leader_id).await {
            Ok(client) => match timeout(self.rpc_deadline(), client.transfer(request)).await {
                Ok(Ok(response)) => response,
                _ => TransferResponse {
                    status: ResponseStatus::Error,
                    error: Some(ResponseError::Unavailable),
                },
            },
            Err(_) => TransferResponse {
                status: ResponseStatus::Error,
                error: Some(ResponseError::Unavailable),
            },
        }
    }

    fn forwardable_leader(&self) -> Option<MemberId> {
        let leader = self.inner.core_read().leader.clone()?;
        (&leader != self.inner.cluster.local_id()).then_some(leader)
    }

    fn rpc_deadline(&self) -> std::time::Duration {
        self.inner.config.election_timeout
    }
}

async fn forward_command(
    server: &Arc<RaftInner>,
    request: CommandRequest,
    tx: mpsc::Sender<CommandResponse>,
) {
    let leader = {
        let core = server.core_read();
        core.leader.clone()
    };
    let Some(leader) = leader.filter(|id| id != server.cluster.local_id()) else {
        let _ = tx.send(server.no_leader_response()).await;
        return;
    };

    let client = match server.cluster.client(&leader).await {
        Ok(client) => client,
        Err(_) => {
            let _ = tx
                .send(server.command_error(ResponseError::Unavailable, None))
                .await;
            return;
        }
    };

    match client.command(request).await {
        Ok(mut responses) => {
            while let Some(response) = responses.recv().await {
                if tx.send(response).await.is_err() {
                    return;
                }
            }
        }
        Err(_) => {
            server.cluster.reset_client(&leader);
            let _ = tx
                .send(server.command_error(ResponseError::Unavailable, None))
                .await;
        }
    }
}

async fn forward_query(server: &Arc<RaftInner>, request: QueryRequest) -> QueryResponse {
    let leader = server.core_read().leader.clone();
    let Some(leader) = leader.filter(|id| id != server.cluster.local_id()) else {
        return QueryResponse::error(ResponseError::NoLeader);
    };

    let client = match server.cluster.client(&leader).await {
        Ok(client) => client,
        Err(_) => return QueryResponse::error(ResponseError::Unavailable),
    };
    match client.query(request).await {
        Ok(mut responses) => responses
            .recv()
            .await
            .unwrap_or_else(|| QueryResponse::error(ResponseError::Unavailable)),
        Err(_) => {
            server.cluster.reset_client(&leader);
            QueryResponse::error(ResponseError::Unavailable)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::{BufMut, BytesMut};
    use quorum_core::{LogEntry, Member};

    use super::*;
    use crate::local::LocalNetwork;
    use crate::sm::ApplyContext;

    struct EchoMachine;

    impl StateMachine for EchoMachine {
        fn apply(&mut self, _ctx: &mut ApplyContext<'_>, input: &Bytes) -> Result<Bytes, String> {
            Ok(input.clone())
        }

        fn query(&self, _input: &Bytes) -> Result<Bytes, String> {
            Ok(Bytes::new())
        }

        fn snapshot(&self) -> Bytes {
            Bytes::new()
        }

        fn restore(&mut self, _data: &Bytes) {}
    }

    /// A Passive member next to an unreachable leader: handlers can be
    /// exercised directly with no election traffic interfering.
    fn passive_server(network: &LocalNetwork) -> RaftServer {
        let members = vec![
            Member::new("leader", "localhost", 5001),
            Member::new("local", "localhost", 5002).with_type(MemberType::Passive),
        ];
        let config = RaftConfig::new("local", members)
            .with_election_timeout(Duration::from_millis(200));
        RaftServer::with_memory_stores(config, network.transport("local"), Box::new(EchoMachine))
    }

    fn follower_server(network: &LocalNetwork) -> RaftServer {
        let members = vec![
            Member::new("foo", "localhost", 5001),
            Member::new("bar", "localhost", 5002),
            Member::new("baz", "localhost", 5003),
        ];
        let config = RaftConfig::new("foo", members)
            .with_election_timeout(Duration::from_millis(200));
        RaftServer::with_memory_stores(config, network.transport("foo"), Box::new(EchoMachine))
    }

    fn entry(term: u64, value: &str) -> LogEntry {
        LogEntry::command(Term::new(term), 0, Bytes::from(value.to_owned()))
    }

    fn append(
        term: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        commit: u64,
    ) -> AppendRequest {
        AppendRequest {
            term: Term::new(term),
            leader: MemberId::from("leader"),
            prev_log_index: Index::new(prev_index),
            prev_log_term: Term::new(prev_term),
            entries,
            commit_index: Index::new(commit),
        }
    }

    #[tokio::test]
    async fn test_append_extends_matching_tail() {
        let network = LocalNetwork::new();
        let server = passive_server(&network);
        server.start().await.unwrap();
        assert_eq!(server.role(), RoleKind::Passive);

        let response = server
            .append(append(1, 0, 0, vec![entry(1, "a"), entry(1, "b")], 0))
            .await;
        assert!(response.succeeded);
        assert_eq!(response.last_log_index, Index::new(2));

        // A heartbeat against the matching tail commits up to the
        // leader's commit index.
        let response = server.append(append(1, 2, 1, vec![], 2)).await;
        assert!(response.succeeded);
        assert_eq!(response.last_log_index, Index::new(2));
        assert_eq!(server.commit_index(), Index::new(2));
        assert_eq!(server.leader(), Some(MemberId::from("leader")));
    }

    #[tokio::test]
    async fn test_append_rejects_missing_prev_with_hint() {
        let network = LocalNetwork::new();
        let server = passive_server(&network);
        server.start().await.unwrap();

        server
            .append(append(1, 0, 0, vec![entry(1, "a")], 0))
            .await;

        let response = server.append(append(1, 5, 1, vec![entry(1, "f")], 0)).await;
        assert!(!response.succeeded);
        assert_eq!(response.last_log_index, Index::new(1));
    }

    #[tokio::test]
    async fn test_append_truncates_conflicting_suffix() {
        let network = LocalNetwork::new();
        let server = passive_server(&network);
        server.start().await.unwrap();

        server
            .append(append(1, 0, 0, vec![entry(1, "a"), entry(1, "b"), entry(1, "c")], 0))
            .await;

        // A new leader at term 2 overwrites index 2 onward.
        let response = server
            .append(append(2, 1, 1, vec![entry(2, "B")], 0))
            .await;
        assert!(response.succeeded);
        assert_eq!(response.last_log_index, Index::new(2));

        // The tail now matches term 2 at index 2.
        let response = server.append(append(2, 2, 2, vec![], 0)).await;
        assert!(response.succeeded);

        // And no longer matches term 1 at index 2.
        let response = server.append(append(2, 2, 1, vec![], 0)).await;
        assert!(!response.succeeded);
    }

    #[tokio::test]
    async fn test_append_stale_term_rejected() {
        let network = LocalNetwork::new();
        let server = passive_server(&network);
        server.start().await.unwrap();

        server.append(append(3, 0, 0, vec![], 0)).await;
        assert_eq!(server.term(), Term::new(3));

        let response = server.append(append(1, 0, 0, vec![entry(1, "x")], 0)).await;
        assert!(!response.succeeded);
        assert_eq!(response.term, Term::new(3));
        // Term never decreases.
        assert_eq!(server.term(), Term::new(3));
    }

    #[tokio::test]
    async fn test_vote_binds_once_per_term() {
        let network = LocalNetwork::new();
        let server = follower_server(&network);
        server.start().await.unwrap();

        let request = |candidate: &str| VoteRequest {
            term: Term::new(1),
            candidate: MemberId::from(candidate),
            last_log_index: Index::ZERO,
            last_log_term: Term::ZERO,
        };

        let response = server.vote(request("bar")).await;
        assert!(response.voted);

        // Same term, different candidate: the vote is already bound.
        let response = server.vote(request("baz")).await;
        assert!(!response.voted);

        // Same candidate again: still granted.
        let response = server.vote(request("bar")).await;
        assert!(response.voted);
    }

    #[tokio::test]
    async fn test_vote_requires_up_to_date_log() {
        let network = LocalNetwork::new();
        let server = passive_server(&network);
        server.start().await.unwrap();
        // Passive members do not vote at all.
        let response = server
            .vote(VoteRequest {
                term: Term::new(1),
                candidate: MemberId::from("leader"),
                last_log_index: Index::ZERO,
                last_log_term: Term::ZERO,
            })
            .await;
        assert_eq!(response.error, Some(ResponseError::IllegalMemberState));

        let network = LocalNetwork::new();
        let server = follower_server(&network);
        server.start().await.unwrap();
        server
            .append(append(2, 0, 0, vec![entry(2, "a"), entry(2, "b")], 0))
            .await;

        // A candidate whose log ends at (term 1, index 5) is behind
        // ours at (term 2, index 2).
        let response = server
            .vote(VoteRequest {
                term: Term::new(3),
                candidate: MemberId::from("bar"),
                last_log_index: Index::new(5),
                last_log_term: Term::new(1),
            })
            .await;
        assert!(!response.voted);
        // But the higher term was adopted.
        assert_eq!(server.term(), Term::new(3));
    }

    #[tokio::test]
    async fn test_poll_does_not_bind_vote() {
        let network = LocalNetwork::new();
        let server = follower_server(&network);
        server.start().await.unwrap();

        let poll = server
            .poll(PollRequest {
                term: Term::new(1),
                candidate: MemberId::from("baz"),
                last_log_index: Index::ZERO,
                last_log_term: Term::ZERO,
            })
            .await;
        assert!(poll.accepted);

        // The poll left the vote slot free for a different candidate.
        let response = server
            .vote(VoteRequest {
                term: Term::new(1),
                candidate: MemberId::from("bar"),
                last_log_index: Index::ZERO,
                last_log_term: Term::ZERO,
            })
            .await;
        assert!(response.voted);
    }

    #[tokio::test]
    async fn test_install_stream_restores_and_resumes() {
        let network = LocalNetwork::new();
        let server = passive_server(&network);
        server.start().await.unwrap();

        // Manager snapshot payload: checksum, session table, user state.
        let mut body = BytesMut::new();
        body.put_u32_le(0);
        body.put_u32_le(5);
        body.extend_from_slice(b"state");
        let mut payload = BytesMut::new();
        payload.put_u32_le(crc32fast::hash(&body));
        payload.extend_from_slice(&body);
        let payload = payload.freeze();

        let (tx, rx) = mpsc::channel(4);
        let half = payload.len() / 2;
        for chunk in [payload.slice(..half), payload.slice(half..)] {
            tx.send(InstallRequest {
                term: Term::new(2),
                leader: MemberId::from("leader"),
                index: Index::new(10),
                timestamp_us: 1,
                data: chunk,
            })
            .await
            .unwrap();
        }
        drop(tx);

        let response = server.install(rx).await;
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(server.commit_index(), Index::new(10));

        // Replication resumes right after the snapshot.
        let response = server.append(append(2, 10, 0, vec![entry(2, "next")], 10)).await;
        assert!(response.succeeded);
        assert_eq!(response.last_log_index, Index::new(11));
    }
}
