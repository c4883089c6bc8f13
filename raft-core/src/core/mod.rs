//! The node's consensus core: shared state plus the main loop that
//! constructs one of the three role types and runs it until it asks for a
//! transition.
//!
//! Each role (`FollowerState`, `CandidateState`, `LeaderState`) borrows
//! `&mut RaftCore` for the lifetime of one call to `run()`. Role objects
//! are cheap to construct — they only ever reset role-local state such as
//! timers, vote counts, or per-peer replication progress — so the main
//! loop below simply builds a fresh one every time it re-enters the
//! `match`, which is also how a message that causes a mid-handler role
//! change (the term-bump rule promoting a candidate or leader back down to
//! follower) gets redispatched: the transient role handles the message
//! once, and the authoritative role for whatever state was requested is
//! constructed on the next loop iteration.

mod candidate;
mod client;
mod follower;
mod leader;

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Span;

pub(crate) use candidate::CandidateState;
pub(crate) use follower::FollowerState;
pub(crate) use leader::LeaderState;

use crate::config::Config;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::RaftMetrics;
use crate::raft::RaftMsg;
use crate::storage::LogStore;
use crate::storage::PersistentCell;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::StateMachine;

/// A node's consensus role.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum State {
    Follower,
    Candidate,
    Leader,
}

impl State {
    pub fn is_leader(&self) -> bool {
        matches!(self, State::Leader)
    }
}

/// Shared state visible to every role, plus the channels that connect this
/// node to its public `Raft` handle.
pub struct RaftCore<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> {
    pub(crate) config: Arc<Config>,
    pub(crate) network: Arc<N>,
    pub(crate) log: LogStore<D, R, SM>,
    pub(crate) persist: PersistentCell,

    /// Best known leader for the current term, or `None`.
    pub(crate) current_leader: Option<NodeId>,
    /// The role the main loop should construct next.
    pub(crate) target_state: State,

    pub(crate) rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
    pub(crate) tx_metrics: watch::Sender<RaftMetrics>,
    pub(crate) rx_shutdown: oneshot::Receiver<()>,

    _marker: std::marker::PhantomData<R>,
}

impl<D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> RaftCore<D, R, N, SM> {
    pub fn spawn(
        config: Arc<Config>,
        network: Arc<N>,
        log: LogStore<D, R, SM>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        tokio::spawn(async move {
            let persist = PersistentCell::open(Self::hard_state_path(&config))
                .await
                .map_err(|e| RaftError::PersistIoFailure(e.to_string()))?;
            let this = Self {
                config,
                network,
                log,
                persist,
                current_leader: None,
                target_state: State::Follower,
                rx_api,
                tx_metrics,
                rx_shutdown,
                _marker: std::marker::PhantomData,
            };
            this.main().await
        })
    }

    fn hard_state_path(config: &Config) -> PathBuf {
        Path::new(".").join(format!("raft-{}-hard-state.json", config.id))
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.config.id))]
    async fn main(mut self) -> RaftResult<()> {
        loop {
            if let Ok(()) | Err(oneshot::error::TryRecvError::Closed) = self.rx_shutdown.try_recv() {
                tracing::info!("node {} shutting down", self.config.id);
                return Ok(());
            }

            let res = match self.target_state {
                State::Follower => FollowerState::new(&mut self).run().await,
                State::Candidate => CandidateState::new(&mut self).run().await,
                State::Leader => LeaderState::new(&mut self).run().await,
            };
            res?;
        }
    }

    pub(crate) fn peers(&self) -> Vec<NodeId> {
        self.config.cluster.keys().copied().filter(|id| *id != self.config.id).collect()
    }

    pub(crate) fn cluster_size(&self) -> usize {
        self.config.cluster.len()
    }

    pub(crate) fn report_metrics(&self) {
        let m = RaftMetrics {
            id: self.config.id,
            state: self.target_state,
            current_term: self.persist.current_term(),
            last_log_index: self.log.index(),
            commit_index: self.log.commit_index(),
            current_leader: self.current_leader,
        };
        let _ = self.tx_metrics.send(m);
    }

    /// The class-level term-bump rule: if `msg_term` is newer than our
    /// own, adopt it, clear our vote, and request a demotion to follower.
    /// Returns `true` if a demotion was requested; callers that are not
    /// already the follower role must stop processing the current role's
    /// loop and let the main loop construct the follower that will finish
    /// handling whatever triggered this.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn bump_term_if_newer(&mut self, msg_term: u64) -> RaftResult<bool> {
        if msg_term > self.persist.current_term() {
            self.persist
                .set(crate::storage::HardState {
                    current_term: msg_term,
                    voted_for: None,
                })
                .await
                .map_err(|e| RaftError::PersistIoFailure(e.to_string()))?;
            self.current_leader = None;
            let was_follower = self.target_state == State::Follower;
            self.target_state = State::Follower;
            return Ok(!was_follower);
        }
        Ok(false)
    }

    /// Canonical "at least as up to date" check used when granting votes:
    /// a higher last-log term wins outright; on a tie, the longer log
    /// wins.
    pub(crate) fn candidate_log_is_up_to_date(&self, last_log_term: u64, last_log_index: u64) -> bool {
        let our_term = self.log.term(self.log.index());
        let our_index = self.log.index();
        last_log_term > our_term || (last_log_term == our_term && last_log_index >= our_index)
    }

    /// Handle a `request_vote` RPC. Shared by every role: granting a vote
    /// never depends on role-specific state, only on the persisted term
    /// and vote record and the log's tail.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn handle_request_vote(
        &mut self,
        rpc: crate::raft::VoteRequest,
    ) -> RaftResult<crate::raft::VoteResponse> {
        self.bump_term_if_newer(rpc.term).await?;

        let current_term = self.persist.current_term();
        if rpc.term < current_term {
            return Ok(crate::raft::VoteResponse {
                term: current_term,
                vote_granted: false,
            });
        }

        let can_vote = matches!(self.persist.voted_for(), None) || self.persist.voted_for() == Some(rpc.candidate_id);
        let up_to_date = self.candidate_log_is_up_to_date(rpc.last_log_term, rpc.last_log_index);
        let grant = can_vote && up_to_date;

        if grant {
            self.persist
                .set_voted_for(Some(rpc.candidate_id))
                .await
                .map_err(|e| RaftError::PersistIoFailure(e.to_string()))?;
        }

        Ok(crate::raft::VoteResponse {
            term: self.persist.current_term(),
            vote_granted: grant,
        })
    }

    /// Handle an `append_entries` RPC the way a follower would. Restarting
    /// the election timer on receipt is the caller's job — that timer is
    /// `FollowerState`'s, not shared state.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub(crate) async fn handle_append_entries(
        &mut self,
        rpc: crate::raft::AppendEntriesRequest<D>,
    ) -> RaftResult<crate::raft::AppendEntriesResponse> {
        self.bump_term_if_newer(rpc.term).await?;

        let current_term = self.persist.current_term();
        if rpc.term < current_term {
            return Ok(crate::raft::AppendEntriesResponse {
                term: current_term,
                success: false,
                next_index: self.log.index() + 1,
            });
        }

        self.current_leader = Some(rpc.leader_id);

        if let Some(snapshot) = rpc.snapshot {
            self.log
                .install_snapshot(snapshot)
                .await
                .map_err(|e| RaftError::PersistIoFailure(e.to_string()))?;
            return Ok(crate::raft::AppendEntriesResponse {
                term: self.persist.current_term(),
                success: true,
                next_index: self.log.index() + 1,
            });
        }

        let prev_matches = self.log.term(rpc.prev_log_index) == rpc.prev_log_term;
        if !prev_matches {
            return Ok(crate::raft::AppendEntriesResponse {
                term: self.persist.current_term(),
                success: false,
                next_index: self.log.index() + 1,
            });
        }

        self.log
            .append_entries(rpc.entries, rpc.prev_log_index)
            .await
            .map_err(|e| RaftError::PersistIoFailure(e.to_string()))?;
        self.log
            .commit(rpc.leader_commit)
            .await
            .map_err(|e| RaftError::PersistIoFailure(e.to_string()))?;

        Ok(crate::raft::AppendEntriesResponse {
            term: self.persist.current_term(),
            success: true,
            next_index: self.log.index() + 1,
        })
    }

    pub(crate) fn diagnostic_report(&self) -> crate::raft::DiagnosticReport {
        crate::raft::DiagnosticReport {
            id: self.config.id,
            state: self.target_state,
            current_term: self.persist.current_term(),
            voted_for: self.persist.voted_for(),
            current_leader: self.current_leader,
            last_log_index: self.log.index(),
            commit_index: self.log.commit_index(),
            compacted_index: self.log.compacted().index,
        }
    }
}

/// Draw a randomized timeout, in milliseconds, from `[min, max)`.
pub(crate) fn random_timeout(min: u64, max: u64) -> std::time::Duration {
    use rand::Rng;
    let millis = if min >= max { min } else { rand::thread_rng().gen_range(min, max) };
    std::time::Duration::from_millis(millis)
}
