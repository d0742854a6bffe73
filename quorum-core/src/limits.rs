//! System limits and configuration bounds.
//!
//! Every queue, batch, and timeout has an explicit maximum so the
//! system stays predictable under load.

use std::time::Duration;

/// Default election timeout. Drives the heartbeat interval (half of
/// this), election jitter, and outbound RPC deadlines.
pub const ELECTION_TIMEOUT_DEFAULT: Duration = Duration::from_secs(5);

/// Maximum serialized size of the entries in one append request, and
/// the chunk size for snapshot installation (1 MiB).
pub const MAX_BATCH_BYTES: usize = 1024 * 1024;

/// Maximum number of members in a cluster.
pub const CLUSTER_SIZE_MAX: usize = 7;

/// Consecutive failures before a peer enters replication back-off.
pub const BACKOFF_FAILURE_COUNT_MIN: u32 = 5;

/// Upper bound on replication back-off regardless of failure count.
pub const BACKOFF_WAIT_MAX: Duration = Duration::from_secs(60);

/// Applied entries between state-machine snapshots (log compaction).
pub const COMPACTION_THRESHOLD_DEFAULT: u64 = 1000;

/// Maximum buffered entries per session event stream.
pub const STREAM_BUFFER_ENTRIES_MAX: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_are_consistent() {
        // Heartbeats at half the election timeout must fit at least
        // twice into the timeout window.
        assert!(ELECTION_TIMEOUT_DEFAULT / 2 < ELECTION_TIMEOUT_DEFAULT);
        assert!(MAX_BATCH_BYTES > 0);
        assert!(CLUSTER_SIZE_MAX >= 3);
        assert!(BACKOFF_WAIT_MAX > ELECTION_TIMEOUT_DEFAULT);
    }
}
