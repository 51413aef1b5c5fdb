use crate::core::LeaderState;
use crate::core::ReplicationState;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::CongressResult;
use crate::network::CongressNetwork;
use crate::replication::PeerEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::LogStore;
use crate::NodeId;

impl<'a, N: CongressNetwork, S: LogStore> LeaderState<'a, N, S> {
    /// Spawn a new replication stream for the target peer.
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState {
        let stream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: 0,
            stream,
            remove_after_commit: None,
        }
    }

    /// Handle an event coming from a replication stream.
    #[tracing::instrument(level = "trace", skip(self, event))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) -> CongressResult<()> {
        match event {
            ReplicaEvent::UpdateMatched { target, matched } => self.handle_update_matched(target, matched).await,
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
            ReplicaEvent::Shutdown => {
                self.core.set_target_role(Role::Shutdown);
                Ok(())
            }
        }
    }

    /// A replication stream observed a peer with a higher term; this
    /// leadership is over.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_revert_to_follower(&mut self, target: NodeId, term: u64) -> CongressResult<()> {
        if term > self.core.current_term {
            tracing::debug!({target, term}, "reverting to follower, higher term observed during replication");
            self.core.update_next_election_timeout(false);
            self.core.update_current_term(term, None);
            self.core.save_hard_state().await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_role(Role::Follower);
            self.core.report_metrics();
        }
        Ok(())
    }

    /// A peer confirmed its log matches the leader's through `matched`;
    /// update the peer record and advance the commit mark if a majority of
    /// voters has caught up.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_matched(&mut self, target: NodeId, matched: u64) -> CongressResult<()> {
        if let Some(state) = self.nodes.get_mut(&target) {
            state.matched = matched;
        } else {
            return Ok(());
        }

        // Only voters enter the majority calculation. Gates and learners
        // replicate but carry no weight.
        let mut indices = self
            .core
            .topology
            .voters
            .iter()
            .filter(|id| *id != &self.core.id)
            .filter_map(|id| self.nodes.get(id).map(|state| state.matched))
            .collect::<Vec<_>>();
        // A leader which removed itself from the voter set no longer weighs
        // its own log in the majority.
        if self.core.topology.contains_voter(&self.core.id) {
            indices.push(self.core.last_log_id.index);
        }

        let new_commit = calculate_new_commit_index(indices, self.core.commit);
        if new_commit <= self.core.commit {
            return Ok(());
        }

        // A leader only ever commits an entry of its own term directly.
        // Entries from prior terms are committed transitively once an entry
        // of the current term reaches a majority.
        let entry = self
            .core
            .storage
            .try_get_log_entry(new_commit)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        let current_term_at_commit = entry.map(|e| e.log_id.term == self.core.current_term).unwrap_or(false);
        if !current_term_at_commit {
            return Ok(());
        }

        self.core.commit = new_commit;
        self.core.save_log_meta().await?;
        for state in self.nodes.values() {
            let _ = state.stream.repl_tx.send(PeerEvent::UpdateCommit { commit: self.core.commit });
        }

        // Complete all submissions now covered by the commit mark, in order.
        let mut committed = Vec::new();
        while let Some(pending) = self.awaiting_committed.first() {
            if pending.entry.log_id.index > self.core.commit {
                break;
            }
            committed.push(self.awaiting_committed.remove(0));
        }
        for pending in committed {
            self.process_committed(pending).await?;
        }

        // Cover any committed entries which carried no parked responder here.
        self.core.replicate_to_state_machine_if_needed().await?;
        self.core.report_metrics();
        Ok(())
    }
}

/// Determine the new commit index from the matched indices of all voters.
///
/// The leader's own last log index must be included in `indices`. The result
/// never regresses below `current_commit`.
pub(super) fn calculate_new_commit_index(mut indices: Vec<u64>, current_commit: u64) -> u64 {
    if indices.is_empty() {
        return current_commit;
    }
    let len = indices.len();
    indices.sort_unstable();
    let offset = if (len % 2) == 0 { (len / 2) - 1 } else { len / 2 };
    let new_commit = indices[offset];
    if new_commit > current_commit {
        new_commit
    } else {
        current_commit
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! test_calculate_new_commit_index {
        ($name:ident, $expected:literal, $current:literal, $indices:expr) => {
            #[test]
            fn $name() {
                let indices = $indices;
                let output = calculate_new_commit_index(indices, $current);
                assert_eq!(output, $expected, "expected {}, got {}", $expected, output);
            }
        };
    }

    test_calculate_new_commit_index!(basic_values, 10, 5, vec![20, 5, 0, 15, 10]);

    test_calculate_new_commit_index!(len_zero_should_return_current_commit, 20, 20, vec![]);

    test_calculate_new_commit_index!(len_one_where_greater_than_current, 100, 0, vec![100]);

    test_calculate_new_commit_index!(len_one_where_less_than_current, 100, 100, vec![50]);

    test_calculate_new_commit_index!(even_number_of_nodes, 0, 0, vec![0, 100, 0, 100, 0, 100]);

    test_calculate_new_commit_index!(majority_wins, 100, 0, vec![0, 100, 0, 100, 0, 100, 100]);
}
