//! A tiny demo wiring three in-memory nodes together over the simulated
//! network, so the engine can be poked at interactively. This is test
//! tooling, not the command-line front end described as out of scope.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use memkv::network::MemRouter;
use memkv::KvCommand;
use memkv::KvStateMachine;
use raft_core::storage::LogStore;
use raft_core::Config;
use raft_core::Raft;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let ids = [1u64, 2, 3];
    let mut cluster = BTreeMap::new();
    for id in ids {
        cluster.insert(id, format!("node-{}", id));
    }

    let router = MemRouter::new(0);
    let mut nodes = Vec::new();
    for id in ids {
        let config = Arc::new(Config::build(id, cluster.clone()).debug(true).validate()?);
        let log = LogStore::open(format!("./target/demo-{}", id), KvStateMachine::new()).await?;
        let network = router.network_for(id);
        let raft = Raft::spawn(config, network, log);
        router.register(id, raft.clone()).await;
        nodes.push(raft);
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    for node in &nodes {
        let metrics = node.metrics().borrow().clone();
        println!("node {}: state={:?} term={} leader={:?}", metrics.id, metrics.state, metrics.current_term, metrics.current_leader);
    }

    let leader = nodes
        .iter()
        .find(|n| n.metrics().borrow().current_leader == Some(n.metrics().borrow().id))
        .unwrap_or(&nodes[0]);
    let resp = leader
        .client_write(raft_core::raft::ClientWriteRequest::new(KvCommand::Set {
            key: "hello".into(),
            value: "world".into(),
        }))
        .await;
    println!("write result: {:?}", resp.is_ok());

    Ok(())
}
