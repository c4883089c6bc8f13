//! A simulated in-process network: an in-memory routing table standing in
//! for a real transport, with per-node isolation for partition testing.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use raft_core::raft::AppendEntriesRequest;
use raft_core::raft::AppendEntriesResponse;
use raft_core::raft::VoteRequest;
use raft_core::raft::VoteResponse;
use raft_core::NodeId;
use raft_core::Raft;
use raft_core::RaftNetwork;
use tokio::sync::RwLock;

use crate::KvCommand;
use crate::KvResponse;

/// The concrete node type every test and the demo binary spawn.
pub type MemRaft = Raft<KvCommand, KvResponse>;

/// A shared routing table of in-memory node handles, standing in for a
/// real network so scenario tests can run many nodes in one process.
///
/// Isolating a node blocks traffic in both directions: sends that
/// originate from an isolated node, and sends addressed to one, both fail,
/// which is what a real network partition looks like from either side.
pub struct MemRouter {
    routing_table: RwLock<BTreeMap<NodeId, MemRaft>>,
    isolated_nodes: RwLock<HashSet<NodeId>>,
    send_delay_ms: u64,
}

impl MemRouter {
    pub fn new(send_delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            routing_table: RwLock::new(BTreeMap::new()),
            isolated_nodes: RwLock::new(HashSet::new()),
            send_delay_ms,
        })
    }

    pub async fn register(&self, id: NodeId, node: MemRaft) {
        self.routing_table.write().await.insert(id, node);
    }

    pub async fn node(&self, id: NodeId) -> Option<MemRaft> {
        self.routing_table.read().await.get(&id).cloned()
    }

    pub async fn isolate(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    pub async fn restore(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    async fn is_isolated(&self, id: NodeId) -> bool {
        self.isolated_nodes.read().await.contains(&id)
    }

    async fn jitter(&self) {
        if self.send_delay_ms == 0 {
            return;
        }
        let delay = rand::random::<u64>() % self.send_delay_ms;
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }

    /// Build the per-node facade a given node uses to reach its peers
    /// through this router.
    pub fn network_for(self: &Arc<Self>, id: NodeId) -> Arc<NodeNetwork> {
        Arc::new(NodeNetwork {
            router: self.clone(),
            id,
        })
    }
}

/// The `RaftNetwork` implementation handed to a single node: every call
/// checks whether either endpoint is currently isolated before looking up
/// the target in the shared routing table.
pub struct NodeNetwork {
    router: Arc<MemRouter>,
    id: NodeId,
}

impl NodeNetwork {
    async fn reachable(&self, target: NodeId) -> Result<MemRaft> {
        if self.router.is_isolated(self.id).await || self.router.is_isolated(target).await {
            return Err(anyhow!("node {} cannot reach isolated node {}", self.id, target));
        }
        self.router.node(target).await.ok_or_else(|| anyhow!("no such node: {}", target))
    }
}

#[async_trait]
impl RaftNetwork<KvCommand> for NodeNetwork {
    async fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<KvCommand>,
    ) -> Result<AppendEntriesResponse> {
        self.router.jitter().await;
        let node = self.reachable(target).await?;
        node.append_entries(rpc).await.map_err(|e| anyhow!("{}", e))
    }

    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.router.jitter().await;
        let node = self.reachable(target).await?;
        node.vote(rpc).await.map_err(|e| anyhow!("{}", e))
    }
}
