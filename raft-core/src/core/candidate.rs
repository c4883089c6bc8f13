//! The candidate role: runs an election by broadcasting `request_vote` to
//! every peer and counting affirmative replies.

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::time::Instant;

use super::random_timeout;
use super::RaftCore;
use super::State;
use crate::error::RaftResult;
use crate::raft::RaftMsg;
use crate::raft::VoteRequest;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::StateMachine;

type VoteFuture = std::pin::Pin<Box<dyn std::future::Future<Output = (NodeId, anyhow::Result<bool>)> + Send>>;

pub(crate) struct CandidateState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> {
    core: &'a mut RaftCore<D, R, N, SM>,
    election_deadline: Instant,
    votes: usize,
    pending: FuturesUnordered<VoteFuture>,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> CandidateState<'a, D, R, N, SM> {
    pub(crate) fn new(core: &'a mut RaftCore<D, R, N, SM>) -> Self {
        core.target_state = State::Candidate;
        Self {
            core,
            election_deadline: Instant::now(),
            votes: 0,
            pending: FuturesUnordered::new(),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.config.id))]
    pub(crate) async fn run(mut self) -> RaftResult<()> {
        self.start_election().await?;

        loop {
            if !matches!(self.core.target_state, State::Candidate) {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep_until(self.election_deadline) => {
                    tracing::info!("node {} election timed out with no majority, starting a new term", self.core.config.id);
                    self.start_election().await?;
                }

                Some((_peer, result)) = self.pending.next() => {
                    if let Ok(granted) = result {
                        if granted {
                            self.votes += 1;
                            let majority = crate::quorum::majority_of(self.core.cluster_size());
                            if self.votes >= majority {
                                tracing::info!("node {} won election for term {}", self.core.config.id, self.core.persist.current_term());
                                self.core.target_state = State::Leader;
                                return Ok(());
                            }
                        }
                    }
                }

                msg = self.core.rx_api.recv() => {
                    let (msg, _span) = match msg {
                        Some(m) => m,
                        None => return Ok(()),
                    };
                    self.handle(msg).await?;
                    if !matches!(self.core.target_state, State::Candidate) {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Start (or restart) an election: bump the term, vote for ourselves,
    /// and fan out `request_vote` to every peer.
    async fn start_election(&mut self) -> RaftResult<()> {
        let id = self.core.config.id;
        let new_term = self.core.persist.current_term() + 1;
        self.core
            .persist
            .set(crate::storage::HardState {
                current_term: new_term,
                voted_for: Some(id),
            })
            .await
            .map_err(|e| crate::error::RaftError::PersistIoFailure(e.to_string()))?;

        self.votes = 1; // our own vote
        self.core.report_metrics();

        let (min, max) = self.core.config.election_timeout_range();
        self.election_deadline = Instant::now() + random_timeout(min, max);

        let rpc = VoteRequest::new(new_term, id, self.core.log.index(), self.core.log.term(self.core.log.index()));

        self.pending = FuturesUnordered::new();
        for peer in self.core.peers() {
            let network = self.core.network.clone();
            let rpc = rpc.clone();
            let fut: VoteFuture = Box::pin(async move {
                let res = network.vote(peer, rpc).await.map(|resp| resp.vote_granted);
                (peer, res)
            });
            self.pending.push(fut);
        }

        let majority = crate::quorum::majority_of(self.core.cluster_size());
        if self.votes >= majority {
            tracing::info!("node {} won a single-node election for term {}", id, new_term);
            self.core.target_state = State::Leader;
        }

        Ok(())
    }

    async fn handle(&mut self, msg: RaftMsg<D, R>) -> RaftResult<()> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                // A valid append_entries at term >= ours means a leader
                // already exists for this term or later; step down and let
                // the follower role that the main loop constructs next
                // pick up where this left off. We still answer this RPC so
                // the leader's bookkeeping for this peer advances.
                let demoted = self.core.bump_term_if_newer(rpc.term).await?;
                if !demoted && rpc.term >= self.core.persist.current_term() {
                    self.core.target_state = State::Follower;
                }
                let resp = self.core.handle_append_entries(rpc).await?;
                self.core.report_metrics();
                let _ = tx.send(resp);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let resp = self.core.handle_request_vote(rpc).await?;
                self.core.report_metrics();
                let _ = tx.send(resp);
            }
            RaftMsg::ClientWrite { tx, .. } => {
                let _ = tx.send(Err(super::client::not_leader_write_error(self.core.current_leader)));
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
