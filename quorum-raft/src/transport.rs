//! The transport seam between the consensus core and the network.
//!
//! The core never opens sockets; it asks the [`Transport`] for a
//! [`RaftPeer`] per member and speaks the protocol types through it.
//! Streaming RPCs are modeled with bounded `mpsc` channels: `Install`
//! streams requests to the peer, `Command`/`Query` stream responses
//! back.

use std::sync::Arc;

use async_trait::async_trait;
use quorum_core::Member;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, ConfigurationResponse,
    ConfigureRequest, ConfigureResponse, InstallRequest, InstallResponse, JoinRequest,
    LeaveRequest, PollRequest, PollResponse, QueryRequest, QueryResponse, ReconfigureRequest,
    TransferRequest, TransferResponse, VoteRequest, VoteResponse,
};

/// Produces an RPC client per cluster member.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connects to a member, returning its RPC client.
    ///
    /// # Errors
    /// Returns an error if the member cannot be reached.
    async fn connect(&self, member: &Member) -> Result<Arc<dyn RaftPeer>, TransportError>;
}

/// The RPC surface of one remote member.
///
/// All methods carry the caller's deadline externally (callers wrap
/// sends in `tokio::time::timeout` with the election timeout).
#[async_trait]
pub trait RaftPeer: Send + Sync {
    /// Adds a member to the cluster.
    async fn join(&self, request: JoinRequest) -> Result<ConfigurationResponse, TransportError>;

    /// Removes a member from the cluster.
    async fn leave(&self, request: LeaveRequest) -> Result<ConfigurationResponse, TransportError>;

    /// Pushes the current configuration to the peer.
    async fn configure(
        &self,
        request: ConfigureRequest,
    ) -> Result<ConfigureResponse, TransportError>;

    /// Changes an existing member.
    async fn reconfigure(
        &self,
        request: ReconfigureRequest,
    ) -> Result<ConfigurationResponse, TransportError>;

    /// Pre-vote probe.
    async fn poll(&self, request: PollRequest) -> Result<PollResponse, TransportError>;

    /// Election vote.
    async fn vote(&self, request: VoteRequest) -> Result<VoteResponse, TransportError>;

    /// Leadership transfer.
    async fn transfer(&self, request: TransferRequest)
        -> Result<TransferResponse, TransportError>;

    /// Log replication / heartbeat.
    async fn append(&self, request: AppendRequest) -> Result<AppendResponse, TransportError>;

    /// Snapshot installation; the caller streams chunks through the
    /// channel and the response arrives after the stream is closed.
    async fn install(
        &self,
        chunks: mpsc::Receiver<InstallRequest>,
    ) -> Result<InstallResponse, TransportError>;

    /// Client command; responses stream back.
    async fn command(
        &self,
        request: CommandRequest,
    ) -> Result<mpsc::Receiver<CommandResponse>, TransportError>;

    /// Client query; responses stream back.
    async fn query(
        &self,
        request: QueryRequest,
    ) -> Result<mpsc::Receiver<QueryResponse>, TransportError>;
}
