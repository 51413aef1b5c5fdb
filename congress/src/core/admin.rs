use crate::congress::RespTx;
use crate::core::LearnerState;
use crate::core::LeaderState;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::ChangeTopologyError;
use crate::error::CongressResult;
use crate::error::InitializeError;
use crate::message::Entry;
use crate::message::EntryPayload;
use crate::message::Topology;
use crate::network::CongressNetwork;
use crate::replication::PeerEvent;
use crate::storage::LogStore;
use crate::summary::MessageSummary;
use crate::LogId;

impl<'a, N: CongressNetwork, S: LogStore> LearnerState<'a, N, S> {
    /// Initialize a pristine node with the given topology.
    ///
    /// The initial topology entry is written locally at index 1 and the node
    /// immediately stands for election. Replication of the entry to the other
    /// founding members is the first leader's job.
    #[tracing::instrument(level = "debug", skip(self), fields(topology=%topology.summary()))]
    pub(super) async fn handle_initialize(&mut self, mut topology: Topology) -> Result<(), InitializeError> {
        if self.core.last_log_id.index != 0 || self.core.current_term != 0 {
            tracing::error!({last_log=%self.core.last_log_id, term=self.core.current_term}, "rejecting initialize request, node is not pristine");
            return Err(InitializeError::NotAllowed);
        }
        topology.voters.insert(self.core.id);

        let log_id = LogId { term: 0, index: 1 };
        let entry = Entry::new_topology(log_id, topology.clone());
        self.core
            .storage
            .append_to_log(&[&entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = log_id;
        self.core.update_topology(topology);

        if self.core.topology.voters.len() == 1 {
            // Sole founding voter, become leader outright.
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.set_target_role(Role::Leader);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        } else {
            self.core.set_target_role(Role::Candidate);
        }
        self.core.report_metrics();
        Ok(())
    }
}

impl<'a, N: CongressNetwork, S: LogStore> LeaderState<'a, N, S> {
    /// Handle a topology change proposal on the leader.
    #[tracing::instrument(level = "debug", skip(self, tx), fields(topology=%topology.summary()))]
    pub(super) async fn handle_change_topology(
        &mut self, topology: Topology, tx: RespTx<(), ChangeTopologyError>,
    ) -> CongressResult<()> {
        if let Err(err) = self.validate_proposed_topology(&topology) {
            let _ = tx.send(Err(err));
            return Ok(());
        }

        let entry = match self.append_payload_to_log(EntryPayload::Topology(topology.clone())).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return Ok(());
            }
        };
        let index = entry.log_id.index;

        // The change takes effect for replication immediately; the role
        // consequence of removing ourselves is deferred until commit.
        let removes_self = !topology.contains_voter(&self.core.id);
        self.core.topology = topology;
        self.core.report_metrics();
        if removes_self {
            self.stepdown_after = Some(index);
        }

        // New peers get a stream now so they can receive this very entry;
        // removed peers keep theirs until the entry is committed, so they
        // learn of their removal.
        let targets = self.core.topology.all_nodes();
        for target in targets.iter().filter(|id| *id != &self.core.id) {
            if !self.nodes.contains_key(target) {
                let state = self.spawn_replication_stream(*target);
                self.nodes.insert(*target, state);
            }
        }
        let removed = self.nodes.keys().filter(|id| !targets.contains(*id)).copied().collect::<Vec<_>>();
        for target in removed {
            if let Some(state) = self.nodes.get_mut(&target) {
                state.remove_after_commit = Some(index);
            }
        }

        self.topology_in_flight = Some(index);
        self.replicate_submission(super::PendingSubmission {
            entry,
            responder: super::Responder::Topology(tx),
        })
        .await
    }

    /// Validate that the proposed topology is usable and a single-node delta.
    fn validate_proposed_topology(&self, topology: &Topology) -> Result<(), ChangeTopologyError> {
        if topology.voters.is_empty() {
            return Err(ChangeTopologyError::InoperableTopology("the voter set may not be empty".into()));
        }
        if let Some(id) = topology.voters.intersection(&topology.gates).next() {
            return Err(ChangeTopologyError::InoperableTopology(format!(
                "node {} may not be both a voter and a gate",
                id
            )));
        }
        if let Some(index) = self.topology_in_flight {
            return Err(ChangeTopologyError::InProgress(index));
        }
        match self.core.topology.delta(topology) {
            0 => Err(ChangeTopologyError::Noop),
            1 => Ok(()),
            _ => Err(ChangeTopologyError::TooManyChanges),
        }
    }

    /// Finish a committed topology change: tear down streams of removed
    /// peers, and step down if this node voted itself out.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_topology_committed(&mut self, index: u64) -> CongressResult<()> {
        if self.topology_in_flight == Some(index) {
            self.topology_in_flight = None;
        }

        let removed = self
            .nodes
            .iter()
            .filter(|(_, state)| state.remove_after_commit.map(|i| i <= self.core.commit).unwrap_or(false))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for target in removed {
            if let Some(state) = self.nodes.remove(&target) {
                tracing::debug!({target}, "terminating replication stream, peer removed from topology");
                let _ = state.stream.repl_tx.send(PeerEvent::Terminate);
            }
        }

        if self.stepdown_after.map(|i| i <= self.core.commit).unwrap_or(false) {
            tracing::info!(id = self.core.id, "leader removed itself from the voter set, stepping down");
            self.core.set_target_role(Role::Learner);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.report_metrics();
        }
        Ok(())
    }
}
