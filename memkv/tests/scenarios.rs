//! Integration tests exercising a simulated cluster against the scenarios
//! the engine is expected to satisfy: election, commit, redirect,
//! partition/recovery, snapshot install, and duplicate-append tolerance.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use memkv::network::MemRouter;
use memkv::network::NodeNetwork;
use memkv::KvCommand;
use memkv::KvResponse;
use memkv::KvStateMachine;
use raft_core::storage::SnapshotDescriptor;
use raft_core::core::State;
use raft_core::raft::ClientWriteRequest;
use raft_core::storage::LogStore;
use raft_core::Config;
use raft_core::Raft;

type MemRaft = Raft<KvCommand, KvResponse>;

async fn spawn_cluster(n: u64) -> (Arc<MemRouter>, Vec<MemRaft>) {
    let ids: Vec<u64> = (1..=n).collect();
    let mut cluster = BTreeMap::new();
    for id in &ids {
        cluster.insert(*id, format!("node-{}", id));
    }

    let router = MemRouter::new(0);
    let mut nodes = Vec::new();
    for id in &ids {
        let config = Arc::new(
            Config::build(*id, cluster.clone())
                .election_timeout_min(50)
                .election_timeout_max(100)
                .heartbeat_interval_min(5)
                .heartbeat_interval_max(10)
                .validate()
                .expect("valid config"),
        );
        let dir = temp_dir_for(*id);
        let log = LogStore::open(dir, KvStateMachine::new()).await.expect("open log store");
        let network: Arc<NodeNetwork> = router.network_for(*id);
        let raft = Raft::spawn(config, network, log);
        router.register(*id, raft.clone()).await;
        nodes.push(raft);
    }
    (router, nodes)
}

fn temp_dir_for(id: u64) -> std::path::PathBuf {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    std::env::temp_dir().join(format!("memkv-scenario-{}-{}-{}", pid, n, id))
}

async fn await_single_leader(nodes: &[MemRaft], timeout: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let leaders: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.metrics().borrow().state == State::Leader)
            .map(|(i, _)| i)
            .collect();
        if leaders.len() == 1 {
            return leaders[0];
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("expected exactly one leader within {:?}, saw {:?}", timeout, leaders);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s1_bootstrap_election() {
    let (_router, nodes) = spawn_cluster(3).await;
    let leader_idx = await_single_leader(&nodes, Duration::from_millis(500)).await;

    let leader_id = nodes[leader_idx].metrics().borrow().id;
    for (i, node) in nodes.iter().enumerate() {
        if i == leader_idx {
            continue;
        }
        node.wait(Some(Duration::from_millis(500))).current_leader(leader_id).await.expect("follower learns leader");
        assert_eq!(node.metrics().borrow().state, State::Follower);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s2_single_entry_commit() {
    let (_router, nodes) = spawn_cluster(3).await;
    let leader_idx = await_single_leader(&nodes, Duration::from_millis(500)).await;

    let resp = nodes[leader_idx]
        .client_write(ClientWriteRequest::new(KvCommand::Set {
            key: "x".into(),
            value: "1".into(),
        }))
        .await
        .expect("leader accepts write");
    assert_eq!(resp.index, 1);

    for node in &nodes {
        node.wait(Some(Duration::from_millis(500))).commit_index(1).await.expect("entry commits everywhere");
    }

    let value = nodes[leader_idx].client_read().await.expect("read succeeds");
    match value {
        KvResponse::Snapshot(map) => assert_eq!(map.get("x"), Some(&"1".to_string())),
        _ => panic!("expected a snapshot response"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s3_follower_redirect() {
    let (_router, nodes) = spawn_cluster(3).await;
    let leader_idx = await_single_leader(&nodes, Duration::from_millis(500)).await;
    let follower_idx = (0..nodes.len()).find(|i| *i != leader_idx).unwrap();

    let before = nodes[follower_idx].metrics().borrow().last_log_index;
    let err = nodes[follower_idx]
        .client_write(ClientWriteRequest::new(KvCommand::Set {
            key: "x".into(),
            value: "1".into(),
        }))
        .await
        .expect_err("a follower must redirect rather than accept a write");

    match err {
        raft_core::error::ClientWriteError::NotLeader { leader_id } => {
            assert_eq!(leader_id, Some(nodes[leader_idx].metrics().borrow().id));
        }
        other => panic!("expected NotLeader, got {:?}", other),
    }
    assert_eq!(nodes[follower_idx].metrics().borrow().last_log_index, before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s4_leader_partition_and_recovery() {
    let (router, nodes) = spawn_cluster(3).await;
    let leader_idx = await_single_leader(&nodes, Duration::from_millis(500)).await;
    let old_leader_id = nodes[leader_idx].metrics().borrow().id;
    let old_term = nodes[leader_idx].metrics().borrow().current_term;

    router.isolate(old_leader_id).await;

    // A new leader should emerge among the remaining majority.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1000);
    let mut new_leader_idx = None;
    while tokio::time::Instant::now() < deadline {
        for (i, node) in nodes.iter().enumerate() {
            let m = node.metrics().borrow().clone();
            if i != leader_idx && m.state == State::Leader && m.current_term > old_term {
                new_leader_idx = Some(i);
            }
        }
        if new_leader_idx.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let new_leader_idx = new_leader_idx.expect("a new leader emerges in the majority partition");

    let resp = nodes[new_leader_idx]
        .client_write(ClientWriteRequest::new(KvCommand::Set {
            key: "y".into(),
            value: "2".into(),
        }))
        .await
        .expect("the new leader accepts writes");
    assert!(resp.index >= 1);

    router.restore(old_leader_id).await;

    nodes[leader_idx]
        .wait(Some(Duration::from_millis(1000)))
        .state(State::Follower)
        .await
        .expect("the old leader steps down once it hears the higher term");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s5_snapshot_install_replaces_a_lagging_follower_log() {
    let (_router, nodes) = spawn_cluster(3).await;
    let leader_idx = await_single_leader(&nodes, Duration::from_millis(500)).await;
    let follower_idx = (0..nodes.len()).find(|i| *i != leader_idx).unwrap();

    nodes[leader_idx]
        .client_write(ClientWriteRequest::new(KvCommand::Set {
            key: "stale".into(),
            value: "entry".into(),
        }))
        .await
        .expect("leader accepts the write that the snapshot will subsume");
    for node in &nodes {
        node.wait(Some(Duration::from_millis(500))).commit_index(1).await.expect("entry commits everywhere");
    }

    let term = nodes[leader_idx].metrics().borrow().current_term;
    let leader_id = nodes[leader_idx].metrics().borrow().id;

    let mut state = BTreeMap::new();
    state.insert("k".to_string(), "v".to_string());
    let snapshot = SnapshotDescriptor {
        index: 5,
        term,
        data: serde_json::to_vec(&state).unwrap(),
        count: 5,
    };

    // A leader only inlines a snapshot once a peer's next_index has fallen
    // at or below its compaction horizon (core/leader.rs); this constructs
    // that situation directly rather than waiting on engine-driven
    // compaction, which this crate does not trigger on its own.
    let rpc = raft_core::raft::AppendEntriesRequest {
        term,
        leader_id,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: Vec::new(),
        leader_commit: 5,
        snapshot: Some(snapshot.clone()),
    };

    let resp = nodes[follower_idx].append_entries(rpc).await.expect("snapshot install succeeds");
    assert!(resp.success);
    assert_eq!(resp.next_index, snapshot.index + 1);

    let report = nodes[follower_idx].diagnostic().await.expect("diagnostic succeeds");
    assert_eq!(report.last_log_index, snapshot.index);
    assert_eq!(report.compacted_index, snapshot.index);

    let value = nodes[follower_idx].client_read().await.expect("read succeeds");
    match value {
        KvResponse::Snapshot(map) => {
            assert_eq!(map.get("k"), Some(&"v".to_string()));
            assert_eq!(map.get("stale"), None, "the snapshot must replace, not merge with, the old log's state");
        }
        _ => panic!("expected a snapshot response"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s6_duplicate_append_entries_is_idempotent() {
    let (_router, nodes) = spawn_cluster(3).await;
    let leader_idx = await_single_leader(&nodes, Duration::from_millis(500)).await;
    let follower_idx = (0..nodes.len()).find(|i| *i != leader_idx).unwrap();

    let rpc = raft_core::raft::AppendEntriesRequest {
        term: nodes[leader_idx].metrics().borrow().current_term,
        leader_id: nodes[leader_idx].metrics().borrow().id,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![raft_core::raft::Entry {
            log_id: raft_core::LogId::new(nodes[leader_idx].metrics().borrow().current_term, 1),
            data: KvCommand::Set {
                key: "z".into(),
                value: "3".into(),
            },
        }],
        leader_commit: 0,
        snapshot: None,
    };

    let first = nodes[follower_idx].append_entries(rpc.clone()).await.expect("first delivery succeeds");
    let second = nodes[follower_idx].append_entries(rpc).await.expect("duplicate delivery succeeds");
    assert_eq!(first.next_index, second.next_index);

    let report = nodes[follower_idx].diagnostic().await.expect("diagnostic succeeds");
    assert_eq!(report.last_log_index, 1);
}
