use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_futures::Instrument;

use crate::agent::VoteRequest;
use crate::agent::VoteResponse;
use crate::core::AgentCore;
use crate::core::CandidateState;
use crate::core::State;
use crate::error::AgencyResult;
use crate::AgentId;
use crate::LogId;
use crate::LogStore;
use crate::MessageSummary;
use crate::PeerTransport;

impl<T: PeerTransport, L: LogStore> AgentCore<T, L> {
    /// Handle an incoming vote request.
    ///
    /// A vote is granted iff the request's term is current, no other
    /// candidate received this node's vote in that term, and the
    /// candidate's log is at least as up-to-date as ours.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_vote_request(&mut self, req: VoteRequest) -> AgencyResult<VoteResponse> {
        // A differing multiplier on the wire adjusts our election timing
        // for the next term, so the agency stretches in lock step.
        if req.timeout_mult != -1 && req.timeout_mult != self.timeout_mult {
            tracing::warn!(
                timeout_mult = req.timeout_mult,
                "voter: setting timeout multiplier for next term"
            );
            self.adjust_timeout_mult(req.timeout_mult);
        }

        if req.term < self.current_term {
            tracing::debug!({candidate=req.candidate_id, req.term}, "vote request with stale term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.update_next_election_timeout(false);
            if self.target_state != State::Shutdown {
                self.set_target_state(State::Follower);
            }
            self.save_hard_state().await?;
        }

        // Election restriction: never elect a candidate whose log is behind
        // ours, or committed entries could be lost.
        let candidate_last_log = LogId::new(req.last_log_term, req.last_log_index);
        if candidate_last_log < self.last_log_id {
            tracing::debug!(
                candidate = req.candidate_id,
                %candidate_last_log,
                local = %self.last_log_id,
                "vote denied, candidate log is behind",
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        match &self.voted_for {
            Some(voted) if *voted != req.candidate_id => {
                tracing::debug!(candidate = req.candidate_id, voted = *voted, "vote already cast this term");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                })
            }
            _ => {
                self.voted_for = Some(req.candidate_id);
                self.save_hard_state().await?;
                self.update_next_election_timeout(false);
                self.report_metrics();
                tracing::debug!(candidate = req.candidate_id, term = self.current_term, "voted");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }
}

impl<'a, T: PeerTransport, L: LogStore> CandidateState<'a, T, L> {
    /// Handle a vote response.
    #[tracing::instrument(level = "debug", skip(self, res), fields(peer=peer))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, peer: AgentId) -> AgencyResult<()> {
        if res.term > self.core.current_term {
            tracing::debug!({ res.term }, "reverting to follower, potential leader detected");
            self.core.update_current_term(res.term, None);
            self.core.save_hard_state().await?;
            self.core.update_next_election_timeout(false);
            self.core.set_target_state(State::Follower);
            return Ok(());
        }

        if res.vote_granted {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                tracing::debug!(
                    id = self.core.id,
                    term = self.core.current_term,
                    "won election, transitioning to leader"
                );
                self.core.set_target_state(State::Leader);
                self.core.report_metrics();
            }
        }
        Ok(())
    }

    /// Spawn parallel vote requests to all active peers.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, AgentId)> {
        let peers: Vec<AgentId> =
            self.core.cluster.active.iter().copied().filter(|id| *id != self.core.id).collect();
        let (tx, rx) = mpsc::channel(peers.len().max(1));

        for peer in peers {
            let rpc = VoteRequest::new(
                self.core.current_term,
                self.core.id,
                self.core.last_log_id,
                self.core.timeout_mult,
            );
            let (transport, tx_inner) = (self.core.transport.clone(), tx.clone());
            let ttl = Duration::from_secs_f64(self.core.config.min_ping * self.core.timeout_mult as f64);
            let _ = tokio::spawn(
                async move {
                    match timeout(ttl, transport.send_request_vote(peer, rpc)).await {
                        Ok(Ok(res)) => {
                            let _ = tx_inner.send((res, peer)).await;
                        }
                        Ok(Err(err)) => tracing::warn!({error=%err, peer}, "error sending vote request"),
                        Err(_) => tracing::warn!({peer}, "timeout sending vote request"),
                    }
                }
                .instrument(tracing::debug_span!("spawn")),
            );
        }
        rx
    }
}
