//! The leader role: replicates the log to every peer, advances the commit
//! index once a quorum has confirmed an entry, and answers client writes.

use std::collections::BTreeMap;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::time::Instant;

use super::client::WaitingClients;
use super::random_timeout;
use super::RaftCore;
use super::State;
use crate::error::RaftResult;
use crate::raft::AppendEntriesRequest;
use crate::raft::RaftMsg;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::StateMachine;

type AppendFuture = std::pin::Pin<Box<dyn std::future::Future<Output = (NodeId, anyhow::Result<(bool, u64)>)> + Send>>;

pub(crate) struct LeaderState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> {
    core: &'a mut RaftCore<D, R, N, SM>,
    next_index: BTreeMap<NodeId, u64>,
    waiting: WaitingClients<R>,
    heartbeat_deadline: Instant,
    pending: FuturesUnordered<AppendFuture>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> LeaderState<'a, D, R, N, SM> {
    pub(crate) fn new(core: &'a mut RaftCore<D, R, N, SM>) -> Self {
        core.target_state = State::Leader;
        core.current_leader = Some(core.config.id);
        let start = core.log.commit_index() + 1;
        let mut next_index = BTreeMap::new();
        next_index.insert(core.config.id, core.log.index() + 1);
        for peer in core.peers() {
            next_index.insert(peer, start);
        }
        tracing::info!("node {} became leader for term {}", core.config.id, core.persist.current_term());
        core.report_metrics();
        Self {
            core,
            next_index,
            waiting: WaitingClients::new(),
            heartbeat_deadline: Instant::now(),
            pending: FuturesUnordered::new(),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.config.id))]
    pub(crate) async fn run(mut self) -> RaftResult<()> {
        self.send_append_entries();

        loop {
            if !matches!(self.core.target_state, State::Leader) {
                self.waiting.clear();
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep_until(self.heartbeat_deadline) => {
                    self.send_append_entries();
                }

                Some((peer, result)) = self.pending.next(), if !self.pending.is_empty() => {
                    if let Ok((success, next_index)) = result {
                        self.on_peer_response_append(peer, success, next_index).await?;
                        if !matches!(self.core.target_state, State::Leader) {
                            self.waiting.clear();
                            return Ok(());
                        }
                    }
                }

                msg = self.core.rx_api.recv() => {
                    let (msg, _span) = match msg {
                        Some(m) => m,
                        None => return Ok(()),
                    };
                    self.handle(msg).await?;
                    if !matches!(self.core.target_state, State::Leader) {
                        self.waiting.clear();
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Build and send one round of `append_entries` to every peer, then
    /// reschedule the heartbeat timer. A peer whose `next_index` has
    /// fallen at or below the compaction horizon gets the current snapshot
    /// inlined instead of a log slice it no longer holds.
    fn send_append_entries(&mut self) {
        let id = self.core.config.id;
        let term = self.core.persist.current_term();
        let leader_commit = self.core.log.commit_index();
        let batch = self.core.config.max_payload_entries;

        for peer in self.core.peers() {
            let next = *self.next_index.get(&peer).unwrap_or(&1);
            let prev_log_index = next.saturating_sub(1);
            let prev_log_term = self.core.log.term(prev_log_index);

            let snapshot = if next <= self.core.log.compacted().index {
                Some(self.core.log.compacted().clone())
            } else {
                None
            };
            let entries = if snapshot.is_some() { Vec::new() } else { self.core.log.slice(next, next + batch) };

            let rpc = AppendEntriesRequest {
                term,
                leader_id: id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                snapshot,
            };

            let network = self.core.network.clone();
            let fut: AppendFuture = Box::pin(async move {
                let res = network.append_entries(peer, rpc).await.map(|resp| (resp.success, resp.next_index));
                (peer, res)
            });
            self.pending.push(fut);
        }

        let (min, max) = self.core.config.heartbeat_interval_range();
        self.heartbeat_deadline = Instant::now() + random_timeout(min, max);
    }

    /// Adopt the follower's reported `next_index` unconditionally, whether
    /// this round succeeded or failed — a failing follower still reports
    /// its true `log.index() + 1`, so the leader's view of that peer
    /// converges without a separate decrement-and-retry step.
    async fn on_peer_response_append(&mut self, peer: NodeId, _success: bool, next_index: u64) -> RaftResult<()> {
        self.next_index.insert(peer, next_index);
        self.next_index.insert(self.core.config.id, self.core.log.index() + 1);

        let values: Vec<u64> = self.next_index.values().copied().collect();
        let candidate = crate::quorum::quorum_commit_index(&values);

        let applied = self
            .core
            .log
            .commit(candidate)
            .await
            .map_err(|e| crate::error::RaftError::PersistIoFailure(e.to_string()))?;
        self.waiting.ack_committed(&applied);
        self.core.report_metrics();
        Ok(())
    }

    async fn handle(&mut self, msg: RaftMsg<D, R>) -> RaftResult<()> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                // Only reachable if another node believes it is leader; the
                // shared term-bump rule inside `handle_append_entries`
                // steps this node down whenever that peer's term is newer.
                let resp = self.core.handle_append_entries(rpc).await?;
                self.core.report_metrics();
                let _ = tx.send(resp);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let resp = self.core.handle_request_vote(rpc).await?;
                self.core.report_metrics();
                let _ = tx.send(resp);
            }
            RaftMsg::ClientWrite { rpc, tx } => {
                let term = self.core.persist.current_term();
                let index = self
                    .core
                    .log
                    .propose(term, rpc.data)
                    .await
                    .map_err(|e| crate::error::RaftError::PersistIoFailure(e.to_string()))?;
                self.next_index.insert(self.core.config.id, self.core.log.index() + 1);
                self.waiting.wait_for(index, tx);
                self.core.report_metrics();
                self.send_append_entries();
            }
            RaftMsg::ClientRead { tx } => {
                let value = self.core.log.state_machine().read().await;
                let _ = tx.send(Ok(value));
            }
            RaftMsg::Diagnostic { tx } => {
                let _ = tx.send(self.core.diagnostic_report());
            }
        }
        Ok(())
    }
}
