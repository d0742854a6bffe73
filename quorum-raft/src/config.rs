//! Server configuration.

use std::time::Duration;

use quorum_core::limits::{
    CLUSTER_SIZE_MAX, COMPACTION_THRESHOLD_DEFAULT, ELECTION_TIMEOUT_DEFAULT, MAX_BATCH_BYTES,
};
use quorum_core::{Member, MemberId};

/// Configuration for one Raft member.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This member's ID; must appear in `members`.
    pub local: MemberId,

    /// The initial cluster roster, including this member.
    pub members: Vec<Member>,

    /// Election timeout. Drives the heartbeat interval (half), the
    /// election jitter, and outbound RPC deadlines.
    pub election_timeout: Duration,

    /// Upper bound on the serialized size of one append batch and on
    /// snapshot install chunks.
    pub max_batch_bytes: usize,

    /// Applied entries between state-machine snapshots.
    pub compaction_threshold: u64,
}

impl RaftConfig {
    /// Creates a configuration with default timings.
    ///
    /// # Panics
    /// Panics if the roster is empty, too large, or does not contain
    /// the local member.
    #[must_use]
    pub fn new(local: impl Into<MemberId>, members: Vec<Member>) -> Self {
        let local = local.into();
        assert!(!members.is_empty(), "cluster cannot be empty");
        assert!(
            members.len() <= CLUSTER_SIZE_MAX,
            "cluster size {} exceeds maximum {}",
            members.len(),
            CLUSTER_SIZE_MAX
        );
        assert!(
            members.iter().any(|m| m.id == local),
            "local member must be in the roster"
        );

        Self {
            local,
            members,
            election_timeout: ELECTION_TIMEOUT_DEFAULT,
            max_batch_bytes: MAX_BATCH_BYTES,
            compaction_threshold: COMPACTION_THRESHOLD_DEFAULT,
        }
    }

    /// Sets the election timeout.
    #[must_use]
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        assert!(!timeout.is_zero(), "election timeout must be positive");
        self.election_timeout = timeout;
        self
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub fn with_compaction_threshold(mut self, threshold: u64) -> Self {
        assert!(threshold > 0, "compaction threshold must be positive");
        self.compaction_threshold = threshold;
        self
    }

    /// The heartbeat period: half the election timeout.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.election_timeout / 2
    }

    /// The local member's roster entry.
    ///
    /// # Panics
    /// Panics if the local member is missing from the roster; `new`
    /// guarantees it is present.
    #[must_use]
    pub fn local_member(&self) -> &Member {
        self.members
            .iter()
            .find(|m| m.id == self.local)
            .expect("local member in roster")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_members() -> Vec<Member> {
        vec![
            Member::new("foo", "localhost", 5001),
            Member::new("bar", "localhost", 5002),
            Member::new("baz", "localhost", 5003),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = RaftConfig::new("foo", three_members());

        assert_eq!(config.election_timeout, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(2500));
        assert_eq!(config.max_batch_bytes, 1024 * 1024);
        assert_eq!(config.local_member().id, MemberId::from("foo"));
    }

    #[test]
    #[should_panic(expected = "local member must be in the roster")]
    fn test_local_must_be_in_roster() {
        let _ = RaftConfig::new("qux", three_members());
    }

    #[test]
    #[should_panic(expected = "cluster cannot be empty")]
    fn test_empty_roster_panics() {
        let _ = RaftConfig::new("foo", vec![]);
    }
}
