//! Quorum Raft - the consensus core of the replicated state-machine
//! service.
//!
//! A cluster of [`RaftServer`]s totally orders opaque client commands
//! with the Raft protocol and applies them to a pluggable
//! [`StateMachine`] behind a session layer that deduplicates client
//! retries. Queries execute at a selectable consistency level.
//!
//! The core stays off the network: it talks to peers through the
//! [`Transport`] seam and to storage through the `quorum-store`
//! traits. [`LocalNetwork`] provides an in-process transport used by
//! the cluster tests.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

mod appender;
mod client;
mod cluster;
mod config;
mod error;
mod local;
mod protocol;
mod roles;
mod server;
mod session;
mod sm;
mod transport;

pub use client::{RaftClient, RaftSession};
pub use cluster::Cluster;
pub use config::RaftConfig;
pub use error::{RaftError, TransportError};
pub use local::{LocalNetwork, LocalTransport};
pub use protocol::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, ConfigurationResponse,
    ConfigureRequest, ConfigureResponse, InstallRequest, InstallResponse, JoinRequest,
    LeaveRequest, PollRequest, PollResponse, QueryRequest, QueryResponse, ReadConsistency,
    ReconfigureRequest, ResponseError, ResponseStatus, TransferRequest, TransferResponse,
    VoteRequest, VoteResponse,
};
pub use roles::RoleKind;
pub use server::RaftServer;
pub use session::{SessionQuery, SessionRequest};
pub use sm::{ApplyContext, StateMachine};
pub use transport::{RaftPeer, Transport};
