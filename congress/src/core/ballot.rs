use tokio::sync::mpsc;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::CongressCore;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::CongressResult;
use crate::message::BallotRequest;
use crate::message::BallotResponse;
use crate::network::CongressNetwork;
use crate::storage::LogStore;
use crate::summary::MessageSummary;
use crate::NodeId;

impl<N: CongressNetwork, S: LogStore> CongressCore<N, S> {
    /// An RPC invoked by candidates to gather ballots.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_ballot_request(&mut self, req: BallotRequest) -> CongressResult<BallotResponse> {
        // Ballots from a stale term carry no weight.
        if req.term < self.current_term {
            tracing::debug!(%self.current_term, rpc_term = req.term, "rejecting ballot request as it is from an old term");
            return Ok(BallotResponse {
                term: self.current_term,
                granted: false,
            });
        }

        // Refuse disruptive candidates while the current leader is live.
        // Without this, a partitioned node rejoining with an inflated term
        // would depose a healthy leader.
        if let Some(inst) = self.last_heartbeat {
            let now = tokio::time::Instant::now();
            let delta = now.duration_since(inst);
            if self.config.election_timeout_min >= (delta.as_millis() as u64) {
                tracing::debug!(%req.candidate, "rejecting ballot request received within election timeout minimum");
                return Ok(BallotResponse {
                    term: self.current_term,
                    granted: false,
                });
            }
        }

        // Observing a higher term forces any candidate or leader back to follower.
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.update_next_election_timeout(false);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.set_target_role(Role::Follower);
            self.save_hard_state().await?;
        }

        // Nodes outside the voter set never cast ballots. An uninitialized
        // node has no topology at all and may vote so a cluster can bootstrap.
        if !self.topology.voters.is_empty() && !self.topology.contains_voter(&self.id) {
            return Ok(BallotResponse {
                term: self.current_term,
                granted: false,
            });
        }

        // A ballot goes only to candidates whose log is at least as up-to-date
        // as ours, compared by term first, then index.
        if req.last_log < self.last_log_id {
            return Ok(BallotResponse {
                term: self.current_term,
                granted: false,
            });
        }

        match &self.voted_for {
            // This node has already voted for the requesting node this term.
            Some(candidate) if candidate == &req.candidate => Ok(BallotResponse {
                term: self.current_term,
                granted: true,
            }),
            // This node has already voted for a different candidate this term.
            Some(_) => Ok(BallotResponse {
                term: self.current_term,
                granted: false,
            }),
            // This node has not yet voted this term. The ballot is persisted
            // before it is returned so a restart can not double-vote.
            None => {
                self.voted_for = Some(req.candidate);
                self.report_role(Role::Elector);
                self.save_hard_state().await?;
                self.update_next_election_timeout(false);
                self.report_metrics();
                tracing::debug!(%req.candidate, "casting ballot for candidate");
                Ok(BallotResponse {
                    term: self.current_term,
                    granted: true,
                })
            }
        }
    }
}

impl<'a, N: CongressNetwork, S: LogStore> CandidateState<'a, N, S> {
    /// Handle a ballot response returned from a peer.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_ballot_response(&mut self, res: BallotResponse, target: NodeId) -> CongressResult<()> {
        // A peer on a higher term ends this campaign.
        if res.term > self.core.current_term {
            tracing::debug!({candidate=self.core.id, target, term=res.term}, "reverting to follower, higher term observed in ballot response");
            self.core.update_current_term(res.term, None);
            self.core.update_next_election_timeout(false);
            self.core.save_hard_state().await?;
            self.core.set_target_role(Role::Follower);
            self.core.report_metrics();
            return Ok(());
        }

        // Count only ballots granted for the term being campaigned.
        if res.granted && res.term == self.core.current_term {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                tracing::debug!({candidate=self.core.id, term=self.core.current_term}, "transitioning to leader state, majority of ballots granted");
                self.core.set_target_role(Role::Leader);
            }
        }

        Ok(())
    }

    /// Fan a ballot request out to all voting peers in parallel.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) fn spawn_parallel_ballot_requests(&self) -> mpsc::Receiver<(BallotResponse, NodeId)> {
        let peers = self
            .core
            .topology
            .voters
            .iter()
            .filter(|member| *member != &self.core.id)
            .copied()
            .collect::<Vec<_>>();
        let (tx, rx) = mpsc::channel(peers.len().max(1));
        for peer in peers {
            let rpc = BallotRequest::new(self.core.current_term, self.core.id, self.core.last_log_id);
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.send_ballot(peer, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, peer)).await;
                        }
                        Err(err) => {
                            tracing::error!({error=%err, peer}, "error sending ballot request to peer")
                        }
                    }
                }
                .instrument(tracing::debug_span!("send-ballot", peer)),
            );
        }
        rx
    }
}
