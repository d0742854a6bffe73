//! The cluster view: the member roster and the per-peer client cache.
//!
//! The roster changes when a `Configuration` entry commits (or when a
//! leader pushes `Configure` to a non-voting member); clients are cached
//! per peer and reset on transport errors so the next use reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use quorum_core::{Index, Member, MemberId, MemberType};
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{RaftPeer, Transport};

/// The local view of cluster membership.
pub struct Cluster {
    local: MemberId,
    transport: Arc<dyn Transport>,
    members: RwLock<Roster>,
    clients: Mutex<HashMap<MemberId, Arc<dyn RaftPeer>>>,
}

#[derive(Debug, Clone)]
struct Roster {
    members: Vec<Member>,
    /// Index of the configuration entry this roster came from.
    config_index: Index,
}

impl Cluster {
    /// Creates a cluster view from the bootstrap roster.
    pub fn new(local: MemberId, members: Vec<Member>, transport: Arc<dyn Transport>) -> Self {
        Self {
            local,
            transport,
            members: RwLock::new(Roster {
                members,
                config_index: Index::ZERO,
            }),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// This member's ID.
    #[must_use]
    pub fn local_id(&self) -> &MemberId {
        &self.local
    }

    /// This member's roster entry, if still in the roster.
    #[must_use]
    pub fn local_member(&self) -> Option<Member> {
        self.member(&self.local)
    }

    /// The full roster.
    #[must_use]
    pub fn members(&self) -> Vec<Member> {
        self.members.read().expect("cluster lock poisoned").members.clone()
    }

    /// Looks up one member.
    #[must_use]
    pub fn member(&self, id: &MemberId) -> Option<Member> {
        self.members
            .read()
            .expect("cluster lock poisoned")
            .members
            .iter()
            .find(|m| &m.id == id)
            .cloned()
    }

    /// IDs of the voting (Active) members, including the local member.
    #[must_use]
    pub fn voting_members(&self) -> Vec<MemberId> {
        self.members
            .read()
            .expect("cluster lock poisoned")
            .members
            .iter()
            .filter(|m| m.is_voting())
            .map(|m| m.id.clone())
            .collect()
    }

    /// Members that receive the log (Active and Passive), excluding the
    /// local member. These are the replication targets of a leader.
    #[must_use]
    pub fn replica_peers(&self) -> Vec<Member> {
        self.members
            .read()
            .expect("cluster lock poisoned")
            .members
            .iter()
            .filter(|m| m.id != self.local && m.member_type != MemberType::Reserve)
            .cloned()
            .collect()
    }

    /// The quorum size: a majority of Active members.
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        let voting = self
            .members
            .read()
            .expect("cluster lock poisoned")
            .members
            .iter()
            .filter(|m| m.is_voting())
            .count();
        voting / 2 + 1
    }

    /// The index of the configuration the current roster came from.
    #[must_use]
    pub fn config_index(&self) -> Index {
        self.members.read().expect("cluster lock poisoned").config_index
    }

    /// Replaces the roster with a committed configuration.
    ///
    /// Stale updates (older configuration index) are ignored.
    pub fn update(&self, config_index: Index, members: Vec<Member>) {
        let mut roster = self.members.write().expect("cluster lock poisoned");
        if config_index < roster.config_index {
            return;
        }
        debug!(member = %self.local, index = %config_index, count = members.len(), "updating roster");
        roster.members = members;
        roster.config_index = config_index;
    }

    /// Returns the cached client for a peer, connecting if necessary.
    ///
    /// # Errors
    /// Returns an error if the peer is unknown or unreachable.
    pub async fn client(&self, id: &MemberId) -> Result<Arc<dyn RaftPeer>, TransportError> {
        if let Some(client) = self
            .clients
            .lock()
            .expect("cluster lock poisoned")
            .get(id)
            .cloned()
        {
            return Ok(client);
        }

        let member = self
            .member(id)
            .ok_or_else(|| TransportError::Unreachable(id.clone()))?;
        let client = self.transport.connect(&member).await?;
        self.clients
            .lock()
            .expect("cluster lock poisoned")
            .insert(id.clone(), Arc::clone(&client));
        Ok(client)
    }

    /// Drops the cached client for a peer so the next use reconnects.
    pub fn reset_client(&self, id: &MemberId) {
        self.clients.lock().expect("cluster lock poisoned").remove(id);
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("local", &self.local)
            .field("members", &self.members.read().expect("cluster lock poisoned").members)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn connect(&self, member: &Member) -> Result<Arc<dyn RaftPeer>, TransportError> {
            Err(TransportError::Unreachable(member.id.clone()))
        }
    }

    fn cluster() -> Cluster {
        let members = vec![
            Member::new("foo", "localhost", 5001),
            Member::new("bar", "localhost", 5002),
            Member::new("baz", "localhost", 5003).with_type(MemberType::Passive),
            Member::new("qux", "localhost", 5004).with_type(MemberType::Reserve),
        ];
        Cluster::new(MemberId::from("foo"), members, Arc::new(NullTransport))
    }

    #[test]
    fn test_quorum_counts_active_only() {
        let cluster = cluster();
        // Two Active members; majority of 2 is 2.
        assert_eq!(cluster.quorum_size(), 2);
        assert_eq!(cluster.voting_members().len(), 2);
    }

    #[test]
    fn test_replica_peers_exclude_local_and_reserve() {
        let cluster = cluster();
        let peers = cluster.replica_peers();

        assert_eq!(peers.len(), 2);
        assert!(peers.iter().any(|m| m.id == MemberId::from("bar")));
        assert!(peers.iter().any(|m| m.id == MemberId::from("baz")));
    }

    #[test]
    fn test_stale_roster_update_ignored() {
        let cluster = cluster();
        cluster.update(Index::new(5), vec![Member::new("foo", "localhost", 5001)]);
        assert_eq!(cluster.members().len(), 1);

        // An older configuration must not roll the roster back.
        cluster.update(Index::new(3), cluster_roster_of_two());
        assert_eq!(cluster.members().len(), 1);
        assert_eq!(cluster.config_index(), Index::new(5));
    }

    fn cluster_roster_of_two() -> Vec<Member> {
        vec![
            Member::new("foo", "localhost", 5001),
            Member::new("bar", "localhost", 5002),
        ]
    }
}
