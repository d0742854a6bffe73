//! Session-oriented client.
//!
//! The client opens a session against the cluster and then issues
//! commands with monotonically increasing sequence numbers and queries
//! carrying the last index it has observed. `NO_LEADER` and
//! `UNAVAILABLE` responses are retried against other members with the
//! same sequence number, so the session layer deduplicates redeliveries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes};
use quorum_core::{Index, Member, MemberId, SessionId};
use tokio::time::sleep;
use tracing::debug;

use crate::error::{RaftError, TransportError};
use crate::protocol::{
    CommandRequest, CommandResponse, QueryRequest, QueryResponse, ReadConsistency, ResponseError,
    ResponseStatus,
};
use crate::session::{SessionQuery, SessionRequest};
use crate::transport::Transport;

struct ClientInner {
    transport: Arc<dyn Transport>,
    members: Vec<Member>,
    leader: Mutex<Option<MemberId>>,
    consistency: ReadConsistency,
    next_target: AtomicUsize,
}

/// A client of the replicated state-machine service.
#[derive(Clone)]
pub struct RaftClient {
    inner: Arc<ClientInner>,
}

impl RaftClient {
    /// Creates a client that reads at the given consistency level.
    #[must_use]
    pub fn new(
        members: Vec<Member>,
        transport: Arc<dyn Transport>,
        consistency: ReadConsistency,
    ) -> Self {
        assert!(!members.is_empty(), "client needs at least one member");
        Self {
            inner: Arc::new(ClientInner {
                transport,
                members,
                leader: Mutex::new(None),
                consistency,
                next_target: AtomicUsize::new(0),
            }),
        }
    }

    /// Opens a session with the given expiry timeout.
    ///
    /// # Errors
    /// Returns an error if no member can commit the open.
    pub async fn open_session(&self, timeout: Duration) -> Result<RaftSession, RaftError> {
        let value = SessionRequest::OpenSession {
            timeout_ms: timeout.as_millis() as u64,
        }
        .encode();
        let response = self.submit(value).await?;

        let mut output = response.output.clone();
        if output.remaining() < 8 {
            return Err(RaftError::Response(ResponseError::ProtocolError));
        }
        let id = SessionId::new(output.get_u64_le());
        debug!(session = %id, "session opened");
        Ok(RaftSession {
            client: self.clone(),
            id,
            next_sequence: 1,
            last_sequence: 0,
            last_index: response.index,
        })
    }

    /// Submits a raw command value, following leader hints and
    /// retrying `NO_LEADER`/`UNAVAILABLE` against other members.
    pub(crate) async fn submit(&self, value: Bytes) -> Result<CommandResponse, RaftError> {
        let request = CommandRequest { value };
        let attempts = self.inner.members.len() * 2 + 1;
        let mut last_error = RaftError::NoLeader;

        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(Duration::from_millis(50)).await;
            }
            let target = self.pick_target();
            match self.try_command(&target, request.clone()).await {
                Ok(response) => {
                    if let Some(leader) = &response.leader {
                        *self.inner.leader.lock().expect("client lock poisoned") =
                            Some(leader.clone());
                    }
                    match response.error {
                        Some(ResponseError::NoLeader | ResponseError::Unavailable) => {
                            last_error = RaftError::Response(
                                response.error.expect("error checked above"),
                            );
                        }
                        _ => return Ok(response),
                    }
                }
                Err(error) => {
                    *self.inner.leader.lock().expect("client lock poisoned") = None;
                    last_error = error.into();
                }
            }
        }
        Err(last_error)
    }

    pub(crate) async fn submit_query(&self, value: Bytes) -> Result<QueryResponse, RaftError> {
        let request = QueryRequest {
            value,
            read_consistency: self.inner.consistency,
        };
        let attempts = self.inner.members.len() * 2 + 1;
        let mut last_error = RaftError::NoLeader;

        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(Duration::from_millis(50)).await;
            }
            let target = self.pick_target();
            match self.try_query(&target, request.clone()).await {
                Ok(response) => match response.error {
                    Some(ResponseError::NoLeader | ResponseError::Unavailable) => {
                        last_error =
                            RaftError::Response(response.error.expect("error checked above"));
                    }
                    _ => return Ok(response),
                },
                Err(error) => last_error = error.into(),
            }
        }
        Err(last_error)
    }

    fn pick_target(&self) -> MemberId {
        if let Some(leader) = self
            .inner
            .leader
            .lock()
            .expect("client lock poisoned")
            .clone()
        {
            if self.inner.members.iter().any(|m| m.id == leader) {
                return leader;
            }
        }
        let index = self.inner.next_target.fetch_add(1, Ordering::Relaxed);
        self.inner.members[index % self.inner.members.len()].id.clone()
    }

    fn member(&self, id: &MemberId) -> Result<&Member, TransportError> {
        self.inner
            .members
            .iter()
            .find(|m| &m.id == id)
            .ok_or_else(|| TransportError::Unreachable(id.clone()))
    }

    async fn try_command(
        &self,
        target: &MemberId,
        request: CommandRequest,
    ) -> Result<CommandResponse, TransportError> {
        let member = self.member(target)?;
        let peer = self.inner.transport.connect(member).await?;
        let mut responses = peer.command(request).await?;
        responses.recv().await.ok_or(TransportError::Closed)
    }

    async fn try_query(
        &self,
        target: &MemberId,
        request: QueryRequest,
    ) -> Result<QueryResponse, TransportError> {
        let member = self.member(target)?;
        let peer = self.inner.transport.connect(member).await?;
        let mut responses = peer.query(request).await?;
        responses.recv().await.ok_or(TransportError::Closed)
    }
}

/// An open session against the cluster.
pub struct RaftSession {
    client: RaftClient,
    id: SessionId,
    next_sequence: u64,
    last_sequence: u64,
    last_index: Index,
}

impl RaftSession {
    /// The session ID (the log index of its `OpenSession` entry).
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The highest log index this session has observed.
    #[must_use]
    pub fn last_index(&self) -> Index {
        self.last_index
    }

    /// Submits a command; retries reuse the same sequence number so
    /// the cluster applies it exactly once.
    ///
    /// # Errors
    /// Returns an error if the command fails or the session is gone.
    pub async fn command(&mut self, input: Bytes) -> Result<Bytes, RaftError> {
        let sequence = self.next_sequence;
        let value = SessionRequest::Command {
            session_id: self.id,
            sequence,
            input,
        }
        .encode();
        let response = self.client.submit(value).await?;
        if response.status == ResponseStatus::Error {
            return Err(RaftError::Response(
                response.error.unwrap_or(ResponseError::CommandFailure),
            ));
        }
        self.next_sequence += 1;
        self.last_sequence = sequence;
        self.last_index = response.index;
        Ok(response.output)
    }

    /// Executes a query at the client's configured consistency level.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn query(&self, input: Bytes) -> Result<Bytes, RaftError> {
        let value = SessionQuery {
            session_id: self.id,
            last_index: self.last_index,
            last_sequence: self.last_sequence,
            input,
        }
        .encode();
        let response = self.client.submit_query(value).await?;
        if response.status == ResponseStatus::Error {
            return Err(RaftError::Response(
                response.error.unwrap_or(ResponseError::QueryFailure),
            ));
        }
        Ok(response.output)
    }

    /// Refreshes the session's expiry clock and acknowledges received
    /// responses.
    ///
    /// # Errors
    /// Returns an error if the session is gone.
    pub async fn keep_alive(&mut self) -> Result<(), RaftError> {
        let value = SessionRequest::KeepAlive {
            session_id: self.id,
            command_sequence: self.last_sequence,
            streams: Vec::new(),
        }
        .encode();
        let response = self.client.submit(value).await?;
        if response.status == ResponseStatus::Error {
            return Err(RaftError::Response(
                response.error.unwrap_or(ResponseError::UnknownSession),
            ));
        }
        self.last_index = response.index;
        Ok(())
    }

    /// Closes the session.
    ///
    /// # Errors
    /// Returns an error if the close cannot be committed.
    pub async fn close(self) -> Result<(), RaftError> {
        let value = SessionRequest::CloseSession { session_id: self.id }.encode();
        let response = self.client.submit(value).await?;
        if response.status == ResponseStatus::Error {
            return Err(RaftError::Response(
                response.error.unwrap_or(ResponseError::UnknownSession),
            ));
        }
        Ok(())
    }
}
