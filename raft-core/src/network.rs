//! The network interface a Raft node uses to reach its peers.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for a Raft network, responsible for
/// sending RPCs to other members of the cluster.
///
/// Sends are fire-and-forget from the perspective of the consensus core:
/// the core never blocks waiting on a peer. An implementation is free to
/// drop, delay, or duplicate messages — the protocol is designed to
/// tolerate all three — but must preserve per-peer ordering of delivered
/// messages.
#[async_trait]
pub trait RaftNetwork<D: AppData>: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target peer.
    async fn append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target peer.
    async fn vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;
}
