//! Cluster integration tests over the in-process transport.
//!
//! These drive whole servers end to end: elections, replication,
//! sessions, failover, partitions, and snapshot catch-up.

use std::sync::Once;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quorum_core::{Index, Member, SessionId, StreamId};
use quorum_raft::{
    ApplyContext, LocalNetwork, QueryRequest, RaftClient, RaftConfig, RaftError, RaftServer,
    ReadConsistency, ResponseError, ResponseStatus, SessionQuery, SessionRequest, StateMachine,
};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A single replicated register: every command overwrites the value,
/// every query reads it.
#[derive(Default)]
struct RegisterMachine {
    value: Bytes,
}

impl StateMachine for RegisterMachine {
    fn apply(&mut self, _ctx: &mut ApplyContext<'_>, input: &Bytes) -> Result<Bytes, String> {
        self.value = input.clone();
        Ok(input.clone())
    }

    fn query(&self, _input: &Bytes) -> Result<Bytes, String> {
        Ok(self.value.clone())
    }

    fn snapshot(&self) -> Bytes {
        self.value.clone()
    }

    fn restore(&mut self, data: &Bytes) {
        self.value = data.clone();
    }
}

/// A replicated counter; used to observe how many times a command
/// actually applied.
#[derive(Default)]
struct CounterMachine {
    count: u64,
}

impl CounterMachine {
    fn encode(count: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64_le(count);
        buf.freeze()
    }
}

impl StateMachine for CounterMachine {
    fn apply(&mut self, _ctx: &mut ApplyContext<'_>, _input: &Bytes) -> Result<Bytes, String> {
        self.count += 1;
        Ok(Self::encode(self.count))
    }

    fn query(&self, _input: &Bytes) -> Result<Bytes, String> {
        Ok(Self::encode(self.count))
    }

    fn snapshot(&self) -> Bytes {
        Self::encode(self.count)
    }

    fn restore(&mut self, data: &Bytes) {
        let mut buf = data.clone();
        self.count = if buf.remaining() >= 8 { buf.get_u64_le() } else { 0 };
    }
}

const ELECTION_TIMEOUT: Duration = Duration::from_millis(200);

fn roster(names: &[&str]) -> Vec<Member> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| Member::new(*name, "localhost", 5001 + i as u16))
        .collect()
}

fn make_server(
    network: &LocalNetwork,
    name: &str,
    members: Vec<Member>,
    threshold: u64,
    machine: Box<dyn StateMachine>,
) -> RaftServer {
    let config = RaftConfig::new(name, members)
        .with_election_timeout(ELECTION_TIMEOUT)
        .with_compaction_threshold(threshold);
    let server = RaftServer::with_memory_stores(config, network.transport(name), machine);
    network.register(&server);
    server
}

async fn start_register_cluster(
    network: &LocalNetwork,
    names: &[&str],
    threshold: u64,
) -> Vec<RaftServer> {
    let members = roster(names);
    let servers: Vec<RaftServer> = names
        .iter()
        .map(|name| {
            make_server(
                network,
                name,
                members.clone(),
                threshold,
                Box::new(RegisterMachine::default()),
            )
        })
        .collect();
    for server in &servers {
        server.start().await.expect("server starts");
    }
    servers
}

/// Polls `condition` until it holds or `deadline` passes.
async fn wait_until<F: FnMut() -> bool>(deadline: Duration, mut condition: F) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn current_leader(servers: &[RaftServer]) -> Option<RaftServer> {
    servers.iter().find(|s| s.is_leader()).cloned()
}

async fn wait_for_leader(servers: &[RaftServer], deadline: Duration) -> RaftServer {
    assert!(
        wait_until(deadline, || current_leader(servers).is_some()).await,
        "no leader elected within {deadline:?}"
    );
    current_leader(servers).expect("leader present")
}

/// Sessionless sequential read against one specific member.
async fn read_register(server: &RaftServer, last_index: Index) -> Bytes {
    let value = SessionQuery {
        session_id: SessionId::ZERO,
        last_index,
        last_sequence: 0,
        input: Bytes::new(),
    }
    .encode();
    let mut responses = server
        .query(QueryRequest {
            value,
            read_consistency: ReadConsistency::Sequential,
        })
        .await;
    let response = responses.recv().await.expect("query response");
    assert_eq!(
        response.status,
        ResponseStatus::Ok,
        "query failed: {:?}",
        response.error
    );
    response.output
}

#[tokio::test]
async fn test_single_node_write_read() {
    init_tracing();
    let network = LocalNetwork::new();
    let servers = start_register_cluster(&network, &["foo"], 1000).await;

    // A single member elects itself promptly.
    let leader = wait_for_leader(&servers, Duration::from_secs(5)).await;
    assert_eq!(leader.id().as_str(), "foo");

    let client = RaftClient::new(
        roster(&["foo"]),
        network.transport("client"),
        ReadConsistency::Sequential,
    );
    let mut session = client
        .open_session(Duration::from_secs(30))
        .await
        .expect("session opens");
    assert_ne!(session.id(), SessionId::ZERO);

    let output = session
        .command(Bytes::from("Hello world!"))
        .await
        .expect("command commits");
    assert_eq!(output, Bytes::from("Hello world!"));

    let value = session.query(Bytes::new()).await.expect("query runs");
    assert_eq!(value, Bytes::from("Hello world!"));
}

#[tokio::test]
async fn test_three_node_write_replicates_everywhere() {
    init_tracing();
    let network = LocalNetwork::new();
    let servers = start_register_cluster(&network, &["foo", "bar", "baz"], 1000).await;

    wait_for_leader(&servers, Duration::from_secs(10)).await;

    let client = RaftClient::new(
        roster(&["foo", "bar", "baz"]),
        network.transport("client"),
        ReadConsistency::Sequential,
    );
    let mut session = client
        .open_session(Duration::from_secs(30))
        .await
        .expect("session opens");
    session.command(Bytes::from("x")).await.expect("command commits");
    let written_at = session.last_index();

    // Every member applies the write at the same index and serves it.
    for server in &servers {
        let server = server.clone();
        assert!(
            wait_until(Duration::from_secs(5), || server.last_applied() >= written_at).await,
            "member {} did not apply index {written_at}",
            server.id()
        );
        assert_eq!(read_register(&server, written_at).await, Bytes::from("x"));
    }
}

#[tokio::test]
async fn test_leader_failover_preserves_committed_writes() {
    init_tracing();
    let network = LocalNetwork::new();
    let servers = start_register_cluster(&network, &["foo", "bar", "baz"], 1000).await;

    wait_for_leader(&servers, Duration::from_secs(10)).await;

    let client = RaftClient::new(
        roster(&["foo", "bar", "baz"]),
        network.transport("client"),
        ReadConsistency::Sequential,
    );
    let mut session = client
        .open_session(Duration::from_secs(30))
        .await
        .expect("session opens");
    session.command(Bytes::from("x")).await.expect("command commits");
    let written_at = session.last_index();

    // Kill the leader.
    let leader = current_leader(&servers).expect("leader present");
    leader.stop();
    network.deregister(leader.id());
    let survivors: Vec<RaftServer> = servers
        .iter()
        .filter(|s| s.id() != leader.id())
        .cloned()
        .collect();

    // One of the remaining members takes over.
    let new_leader = wait_for_leader(&survivors, Duration::from_secs(15)).await;
    assert_ne!(new_leader.id(), leader.id());

    // The committed write survived the failover.
    for server in &survivors {
        let server = server.clone();
        assert!(
            wait_until(Duration::from_secs(5), || server.last_applied() >= written_at).await
        );
        assert_eq!(read_register(&server, written_at).await, Bytes::from("x"));
    }
}

#[tokio::test]
async fn test_partitioned_leader_steps_down() {
    init_tracing();
    let network = LocalNetwork::new();
    let servers = start_register_cluster(&network, &["foo", "bar", "baz"], 1000).await;

    let leader = wait_for_leader(&servers, Duration::from_secs(10)).await;

    // Cut the leader off from both peers.
    network.isolate(leader.id().clone());

    // With no quorum for more than two election timeouts, it abandons
    // leadership on its own.
    let observed = leader.clone();
    assert!(
        wait_until(Duration::from_secs(20), || !observed.is_leader()).await,
        "partitioned leader kept leading"
    );

    // The majority side elects a replacement.
    let survivors: Vec<RaftServer> = servers
        .iter()
        .filter(|s| s.id() != leader.id())
        .cloned()
        .collect();
    wait_for_leader(&survivors, Duration::from_secs(15)).await;
}

#[tokio::test]
async fn test_slow_follower_catches_up_via_snapshot() {
    init_tracing();
    let network = LocalNetwork::new();
    // Aggressive compaction so the lagging follower's entries are gone
    // from the leader's log and only an install can catch it up.
    let servers = start_register_cluster(&network, &["foo", "bar", "baz"], 8).await;

    wait_for_leader(&servers, Duration::from_secs(10)).await;

    let client = RaftClient::new(
        roster(&["foo", "bar", "baz"]),
        network.transport("client"),
        ReadConsistency::Sequential,
    );
    let mut session = client
        .open_session(Duration::from_secs(60))
        .await
        .expect("session opens");

    // Pick a non-leader member to lag behind.
    let lagging = servers
        .iter()
        .find(|s| !s.is_leader())
        .expect("follower present")
        .clone();
    network.isolate(lagging.id().clone());

    let mut last = Bytes::new();
    for i in 0..24 {
        last = Bytes::from(format!("value-{i}"));
        session.command(last.clone()).await.expect("command commits");
    }
    let written_at = session.last_index();

    // The leader compacted past the follower's position.
    let leader = current_leader(&servers).expect("leader present");
    assert!(
        wait_until(Duration::from_secs(5), || {
            leader.commit_index() >= written_at
        })
        .await
    );

    // Reconnect; the follower must restore from an installed snapshot
    // and then serve the latest value.
    network.rejoin(lagging.id().clone());
    let observed = lagging.clone();
    assert!(
        wait_until(Duration::from_secs(30), || {
            observed.last_applied() >= written_at
        })
        .await,
        "lagging follower never caught up"
    );
    assert_eq!(read_register(&lagging, written_at).await, last);
}

#[tokio::test]
async fn test_session_expires_without_keep_alive() {
    init_tracing();
    let network = LocalNetwork::new();
    let servers = start_register_cluster(&network, &["foo"], 1000).await;
    wait_for_leader(&servers, Duration::from_secs(5)).await;

    let client = RaftClient::new(
        roster(&["foo"]),
        network.transport("client"),
        ReadConsistency::Sequential,
    );
    let mut session = client
        .open_session(Duration::from_secs(1))
        .await
        .expect("session opens");

    tokio::time::sleep(Duration::from_secs(2)).await;

    let result = session.command(Bytes::from("late")).await;
    match result {
        Err(RaftError::Response(
            ResponseError::UnknownSession | ResponseError::ClosedSession,
        )) => {}
        other => panic!("expected expired-session error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_keep_alive_prevents_expiry() {
    init_tracing();
    let network = LocalNetwork::new();
    let servers = start_register_cluster(&network, &["foo"], 1000).await;
    wait_for_leader(&servers, Duration::from_secs(5)).await;

    let client = RaftClient::new(
        roster(&["foo"]),
        network.transport("client"),
        ReadConsistency::Sequential,
    );
    let mut session = client
        .open_session(Duration::from_secs(1))
        .await
        .expect("session opens");

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        session.keep_alive().await.expect("keep-alive accepted");
    }

    session
        .command(Bytes::from("still here"))
        .await
        .expect("session alive");
}

#[tokio::test]
async fn test_duplicate_command_applies_once() {
    init_tracing();
    let network = LocalNetwork::new();
    let members = roster(&["foo"]);
    let server = make_server(
        &network,
        "foo",
        members,
        1000,
        Box::new(CounterMachine::default()),
    );
    server.start().await.expect("server starts");
    wait_for_leader(&[server.clone()], Duration::from_secs(5)).await;

    // Open a session by hand so the duplicate can reuse a sequence
    // number explicitly.
    let open = submit(&server, SessionRequest::OpenSession { timeout_ms: 30_000 }.encode()).await;
    assert_eq!(open.status, ResponseStatus::Ok);
    let session_id = SessionId::new(open.output.clone().get_u64_le());

    let command = SessionRequest::Command {
        session_id,
        sequence: 7,
        input: Bytes::from("bump"),
    }
    .encode();

    let first = submit(&server, command.clone()).await;
    let second = submit(&server, command).await;

    // Both carry the same output, and the counter moved only once.
    assert_eq!(first.status, ResponseStatus::Ok);
    assert_eq!(second.status, ResponseStatus::Ok);
    assert_eq!(first.output, second.output);

    let next = submit(
        &server,
        SessionRequest::Command {
            session_id,
            sequence: 8,
            input: Bytes::from("bump"),
        }
        .encode(),
    )
    .await;
    let mut output = next.output.clone();
    assert_eq!(output.get_u64_le(), 2);
}

async fn submit(server: &RaftServer, value: Bytes) -> quorum_raft::CommandResponse {
    let mut responses = server
        .command(quorum_raft::CommandRequest { value })
        .await;
    responses.recv().await.expect("command response")
}

/// Echoes every command onto push stream 1.
#[derive(Default)]
struct StreamingMachine;

impl StateMachine for StreamingMachine {
    fn apply(&mut self, ctx: &mut ApplyContext<'_>, input: &Bytes) -> Result<Bytes, String> {
        ctx.publish(StreamId::new(1), input.clone());
        Ok(Bytes::new())
    }

    fn query(&self, _input: &Bytes) -> Result<Bytes, String> {
        Ok(Bytes::new())
    }

    fn snapshot(&self) -> Bytes {
        Bytes::new()
    }

    fn restore(&mut self, _data: &Bytes) {}
}

#[tokio::test]
async fn test_stream_events_buffer_until_acknowledged() {
    init_tracing();
    let network = LocalNetwork::new();
    let server = make_server(
        &network,
        "foo",
        roster(&["foo"]),
        1000,
        Box::new(StreamingMachine),
    );
    server.start().await.expect("server starts");
    wait_for_leader(&[server.clone()], Duration::from_secs(5)).await;

    let open = submit(&server, SessionRequest::OpenSession { timeout_ms: 30_000 }.encode()).await;
    let session_id = SessionId::new(open.output.clone().get_u64_le());
    let stream = StreamId::new(1);

    for (sequence, event) in [(1, "a"), (2, "b")] {
        let response = submit(
            &server,
            SessionRequest::Command {
                session_id,
                sequence,
                input: Bytes::from(event),
            }
            .encode(),
        )
        .await;
        assert_eq!(response.status, ResponseStatus::Ok);
    }

    let events = server.session_events(session_id, stream).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].1, Bytes::from("a"));

    // Acknowledging the first event releases its buffer slot.
    let ack_up_to = events[0].0;
    let keep_alive = submit(
        &server,
        SessionRequest::KeepAlive {
            session_id,
            command_sequence: 0,
            streams: vec![(stream, ack_up_to)],
        }
        .encode(),
    )
    .await;
    assert_eq!(keep_alive.status, ResponseStatus::Ok);

    let remaining = server.session_events(session_id, stream).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].1, Bytes::from("b"));
}

#[tokio::test]
async fn test_linearizable_query_requires_quorum() {
    init_tracing();
    let network = LocalNetwork::new();
    let servers = start_register_cluster(&network, &["foo", "bar", "baz"], 1000).await;
    wait_for_leader(&servers, Duration::from_secs(10)).await;

    let client = RaftClient::new(
        roster(&["foo", "bar", "baz"]),
        network.transport("client"),
        ReadConsistency::Linearizable,
    );
    let mut session = client
        .open_session(Duration::from_secs(30))
        .await
        .expect("session opens");
    session.command(Bytes::from("lin")).await.expect("command commits");

    // Quorum is healthy: the linearizable read round-trips.
    let value = session.query(Bytes::new()).await.expect("query runs");
    assert_eq!(value, Bytes::from("lin"));
}

#[tokio::test]
async fn test_commit_index_never_decreases() {
    init_tracing();
    let network = LocalNetwork::new();
    let servers = start_register_cluster(&network, &["foo", "bar", "baz"], 1000).await;
    wait_for_leader(&servers, Duration::from_secs(10)).await;

    let client = RaftClient::new(
        roster(&["foo", "bar", "baz"]),
        network.transport("client"),
        ReadConsistency::Sequential,
    );
    let mut session = client
        .open_session(Duration::from_secs(30))
        .await
        .expect("session opens");

    let mut high_water: Vec<(String, Index)> = servers
        .iter()
        .map(|s| (s.id().as_str().to_owned(), s.commit_index()))
        .collect();

    for i in 0..5 {
        session
            .command(Bytes::from(format!("w{i}")))
            .await
            .expect("command commits");
        for (name, watermark) in &mut high_water {
            let server = servers
                .iter()
                .find(|s| s.id().as_str() == name)
                .expect("member present");
            let now = server.commit_index();
            assert!(now >= *watermark, "commit index went backwards on {name}");
            *watermark = now;
        }
    }
}
