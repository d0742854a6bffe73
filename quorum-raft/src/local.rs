//! In-process transport connecting servers in one address space.
//!
//! The production deployment puts a real RPC stack behind
//! [`Transport`]; this implementation wires servers together directly
//! and adds partition and isolation controls, which is what the
//! cluster tests drive fault scenarios with.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quorum_core::{Member, MemberId};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::TransportError;
use crate::protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, ConfigurationResponse,
    ConfigureRequest, ConfigureResponse, InstallRequest, InstallResponse, JoinRequest,
    LeaveRequest, PollRequest, PollResponse, QueryRequest, QueryResponse, ReconfigureRequest,
    TransferRequest, TransferResponse, VoteRequest, VoteResponse,
};
use crate::server::RaftServer;
use crate::transport::{RaftPeer, Transport};

#[derive(Default)]
struct NetworkInner {
    servers: Mutex<HashMap<MemberId, RaftServer>>,
    /// Blocked unordered pairs.
    partitions: Mutex<HashSet<(MemberId, MemberId)>>,
    /// Members cut off from everyone.
    isolated: Mutex<HashSet<MemberId>>,
}

/// A shared registry of in-process servers.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl LocalNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a transport bound to `local` as its source member.
    #[must_use]
    pub fn transport(&self, local: impl Into<MemberId>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            source: local.into(),
        })
    }

    /// Makes a server reachable under its member ID.
    pub fn register(&self, server: &RaftServer) {
        self.inner
            .servers
            .lock()
            .expect("network lock poisoned")
            .insert(server.id().clone(), server.clone());
    }

    /// Removes a server from the network.
    pub fn deregister(&self, id: &MemberId) {
        self.inner
            .servers
            .lock()
            .expect("network lock poisoned")
            .remove(id);
    }

    /// Blocks traffic between two members, both directions.
    pub fn partition(&self, a: impl Into<MemberId>, b: impl Into<MemberId>) {
        self.inner
            .partitions
            .lock()
            .expect("network lock poisoned")
            .insert(pair(a.into(), b.into()));
    }

    /// Restores traffic between two members.
    pub fn heal(&self, a: impl Into<MemberId>, b: impl Into<MemberId>) {
        self.inner
            .partitions
            .lock()
            .expect("network lock poisoned")
            .remove(&pair(a.into(), b.into()));
    }

    /// Cuts a member off from every other member.
    pub fn isolate(&self, id: impl Into<MemberId>) {
        self.inner
            .isolated
            .lock()
            .expect("network lock poisoned")
            .insert(id.into());
    }

    /// Reconnects an isolated member.
    pub fn rejoin(&self, id: impl Into<MemberId>) {
        self.inner
            .isolated
            .lock()
            .expect("network lock poisoned")
            .remove(&id.into());
    }

    fn route(&self, from: &MemberId, to: &MemberId) -> Result<RaftServer, TransportError> {
        {
            let isolated = self.inner.isolated.lock().expect("network lock poisoned");
            if isolated.contains(from) || isolated.contains(to) {
                trace!(from = %from, to = %to, "dropping message: member isolated");
                return Err(TransportError::Unreachable(to.clone()));
            }
        }
        {
            let partitions = self.inner.partitions.lock().expect("network lock poisoned");
            if partitions.contains(&pair(from.clone(), to.clone())) {
                trace!(from = %from, to = %to, "dropping message: partitioned");
                return Err(TransportError::Unreachable(to.clone()));
            }
        }
        self.inner
            .servers
            .lock()
            .expect("network lock poisoned")
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.clone()))
    }
}

fn pair(a: MemberId, b: MemberId) -> (MemberId, MemberId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A [`Transport`] bound to one source member of a [`LocalNetwork`].
pub struct LocalTransport {
    network: LocalNetwork,
    source: MemberId,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&self, member: &Member) -> Result<Arc<dyn RaftPeer>, TransportError> {
        // Reachability is re-checked per call so partitions formed
        // after connect still cut existing clients.
        self.network.route(&self.source, &member.id)?;
        Ok(Arc::new(LocalPeer {
            network: self.network.clone(),
            source: self.source.clone(),
            target: member.id.clone(),
        }))
    }
}

struct LocalPeer {
    network: LocalNetwork,
    source: MemberId,
    target: MemberId,
}

impl LocalPeer {
    fn server(&self) -> Result<RaftServer, TransportError> {
        self.network.route(&self.source, &self.target)
    }
}

#[async_trait]
impl RaftPeer for LocalPeer {
    async fn join(&self, request: JoinRequest) -> Result<ConfigurationResponse, TransportError> {
        Ok(self.server()?.join(request).await)
    }

    async fn leave(&self, request: LeaveRequest) -> Result<ConfigurationResponse, TransportError> {
        Ok(self.server()?.leave(request).await)
    }

    async fn configure(
        &self,
        request: ConfigureRequest,
    ) -> Result<ConfigureResponse, TransportError> {
        Ok(self.server()?.configure(request).await)
    }

    async fn reconfigure(
        &self,
        request: ReconfigureRequest,
    ) -> Result<ConfigurationResponse, TransportError> {
        Ok(self.server()?.reconfigure(request).await)
    }

    async fn poll(&self, request: PollRequest) -> Result<PollResponse, TransportError> {
        Ok(self.server()?.poll(request).await)
    }

    async fn vote(&self, request: VoteRequest) -> Result<VoteResponse, TransportError> {
        Ok(self.server()?.vote(request).await)
    }

    async fn transfer(
        &self,
        request: TransferRequest,
    ) -> Result<TransferResponse, TransportError> {
        Ok(self.server()?.transfer(request).await)
    }

    async fn append(&self, request: AppendRequest) -> Result<AppendResponse, TransportError> {
        Ok(self.server()?.append(request).await)
    }

    async fn install(
        &self,
        chunks: mpsc::Receiver<InstallRequest>,
    ) -> Result<InstallResponse, TransportError> {
        Ok(self.server()?.install(chunks).await)
    }

    async fn command(
        &self,
        request: CommandRequest,
    ) -> Result<mpsc::Receiver<CommandResponse>, TransportError> {
        Ok(self.server()?.command(request).await)
    }

    async fn query(
        &self,
        request: QueryRequest,
    ) -> Result<mpsc::Receiver<QueryResponse>, TransportError> {
        Ok(self.server()?.query(request).await)
    }
}
