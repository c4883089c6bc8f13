//! The follower role: waits for RPCs from a leader or candidate, and starts
//! an election if none arrive before its timeout.

use tokio::time::Instant;

use super::random_timeout;
use super::RaftCore;
use super::State;
use crate::error::RaftResult;
use crate::raft::RaftMsg;
use crate::AppData;
use crate::AppDataResponse;
use crate::RaftNetwork;
use crate::StateMachine;

pub(crate) struct FollowerState<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> {
    core: &'a mut RaftCore<D, R, N, SM>,
    election_deadline: Instant,
}

impl<'a, D: AppData, R: AppDataResponse, N: RaftNetwork<D>, SM: StateMachine<D, R>> FollowerState<'a, D, R, N, SM> {
    pub(crate) fn new(core: &'a mut RaftCore<D, R, N, SM>) -> Self {
        let deadline = Self::next_deadline(core);
        core.report_metrics();
        Self {
            core,
            election_deadline: deadline,
        }
    }

    fn next_deadline(core: &RaftCore<D, R, N, SM>) -> Instant {
        let (min, max) = core.config.election_timeout_range();
        Instant::now() + random_timeout(min, max)
    }

    fn restart_election_timer(&mut self) {
        self.election_deadline = Self::next_deadline(self.core);
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.core.config.id))]
    pub(crate) async fn run(mut self) -> RaftResult<()> {
        loop {
            if !matches!(self.core.target_state, State::Follower) {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep_until(self.election_deadline) => {
                    tracing::info!("node {} election timeout elapsed, becoming candidate", self.core.config.id);
                    self.core.target_state = State::Candidate;
                    return Ok(());
                }

                msg = self.core.rx_api.recv() => {
                    let (msg, _span) = match msg {
                        Some(m) => m,
                        None => return Ok(()),
                    };
                    self.handle(msg).await?;
                    if !matches!(self.core.target_state, State::Follower) {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle(&mut self, msg: RaftMsg<D, R>) -> RaftResult<()> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                self.restart_election_timer();
                let resp = self.core.handle_append_entries(rpc).await?;
                self.core.report_metrics();
                let _ = tx.send(resp);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                self.restart_election_timer();
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
