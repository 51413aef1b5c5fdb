use crate::core::CongressCore;
use crate::core::Role;
use crate::core::UpdateCurrentLeader;
use crate::error::CongressResult;
use crate::message::AppendOutcome;
use crate::message::AppendRequest;
use crate::message::AppendResponse;
use crate::message::Conflict;
use crate::message::Entry;
use crate::message::EntryPayload;
use crate::network::CongressNetwork;
use crate::storage::LogStore;
use crate::summary::MessageSummary;
use crate::LogId;

/// How many preceding entries a follower walks back through when computing a
/// conflict hint. Bounds the storage scan on a badly divergent log.
const CONFLICT_SCAN_WINDOW: u64 = 50;

impl<N: CongressNetwork, S: LogStore> CongressCore<N, S> {
    /// An RPC invoked by the leader to replicate log entries, also used as heartbeat.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_append_request(&mut self, req: AppendRequest) -> CongressResult<AppendResponse> {
        // A stale leader learns of the new term from the response and steps down.
        if req.term < self.current_term {
            tracing::debug!({term=self.current_term, rpc_term=req.term}, "rejecting append request from an old term");
            return Ok(AppendResponse {
                term: self.current_term,
                outcome: AppendOutcome::Reject { conflict: None },
            });
        }

        // Valid leader contact resets the election deadline.
        self.update_next_election_timeout(true);

        let mut report_changes = false;
        if req.term > self.current_term {
            self.update_current_term(req.term, None);
            self.save_hard_state().await?;
            report_changes = true;
        }
        if self.current_leader != Some(req.leader) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader));
            report_changes = true;
        }
        // An equal or higher term from a live leader ends any local campaign
        // or stale leadership.
        if self.target_role.is_leader() || self.target_role.is_candidate() {
            self.set_target_role(Role::Follower);
            report_changes = true;
        }
        if report_changes {
            self.report_metrics();
        }

        // Fast path for heartbeats and appends continuing from our log tail.
        if req.prev_log == self.last_log_id {
            if !req.entries.is_empty() {
                self.append_log_entries(&req.entries).await?;
            }
            let matched = self.last_log_id.index;
            self.update_commit(req.leader_commit).await?;
            return Ok(AppendResponse {
                term: self.current_term,
                outcome: AppendOutcome::Accept { matched },
            });
        }

        // Replication from the start of the log matches unconditionally at
        // the empty prefix. A local tail can only exist here uncommitted,
        // since any committed entry would also be in the leader's log and
        // the leader would not have backed off past it.
        if req.prev_log.index == 0 {
            if self.last_log_id.index > 0 {
                self.storage.delete_logs_from(1).await.map_err(|err| self.map_fatal_storage_error(err))?;
                self.last_log_id = LogId::default();
            }
            if !req.entries.is_empty() {
                self.append_log_entries(&req.entries).await?;
            }
            let matched = self.last_log_id.index;
            self.update_commit(req.leader_commit).await?;
            return Ok(AppendResponse {
                term: self.current_term,
                outcome: AppendOutcome::Accept { matched },
            });
        }

        // The previous entry the leader expects must exist here with the same term.
        let prev_entry = self.storage.try_get_log_entry(req.prev_log.index).await.map_err(|err| self.map_fatal_storage_error(err))?;
        let prev_entry = match prev_entry {
            Some(entry) => entry,
            None => {
                // Our log does not reach the leader's prev entry; hint with
                // our tail so the leader backs up to it directly.
                tracing::debug!(prev_log=%req.prev_log, last_log=%self.last_log_id, "rejecting append request, prev entry not found");
                return Ok(AppendResponse {
                    term: self.current_term,
                    outcome: AppendOutcome::Reject {
                        conflict: Some(Conflict { log_id: self.last_log_id }),
                    },
                });
            }
        };

        if prev_entry.log_id.term != req.prev_log.term {
            // Divergent history. Hint with the first entry of the conflicting
            // term so the leader jumps past the whole term in one round trip.
            let conflict = self.conflict_hint(&prev_entry).await?;
            tracing::debug!(prev_log=%req.prev_log, conflict=%conflict.log_id, "rejecting append request, prev entry term mismatch");
            return Ok(AppendResponse {
                term: self.current_term,
                outcome: AppendOutcome::Reject { conflict: Some(conflict) },
            });
        }

        // Point of agreement found behind our tail. Everything past it is
        // uncommitted divergence and is rolled back before appending.
        if self.last_log_id.index > req.prev_log.index {
            self.storage
                .delete_logs_from(req.prev_log.index + 1)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            self.last_log_id = prev_entry.log_id;
        }

        if !req.entries.is_empty() {
            self.append_log_entries(&req.entries).await?;
        }
        let matched = self.last_log_id.index;
        self.update_commit(req.leader_commit).await?;
        Ok(AppendResponse {
            term: self.current_term,
            outcome: AppendOutcome::Accept { matched },
        })
    }

    /// Compute the conflict hint for a rejected append: the first entry of
    /// the conflicting term, within a bounded scan window.
    async fn conflict_hint(&mut self, conflicting: &Entry) -> CongressResult<Conflict> {
        let start = conflicting.log_id.index.saturating_sub(CONFLICT_SCAN_WINDOW);
        let entries = self
            .storage
            .get_log_entries(start, conflicting.log_id.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;
        let first_of_term = entries
            .iter()
            .find(|entry| entry.log_id.term == conflicting.log_id.term)
            .map(|entry| entry.log_id)
            .unwrap_or(conflicting.log_id);
        Ok(Conflict { log_id: first_of_term })
    }

    /// Append the given entries to the log.
    ///
    /// Topology entries take effect here, at append time, so replication and
    /// role adjustments never lag behind the log.
    async fn append_log_entries(&mut self, entries: &[Entry]) -> CongressResult<()> {
        let topology = entries.iter().rev().find_map(|entry| match &entry.payload {
            EntryPayload::Topology(topology) => Some(topology.clone()),
            _ => None,
        });

        let refs = entries.iter().collect::<Vec<_>>();
        self.storage.append_to_log(refs.as_slice()).await.map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(entry) = entries.last() {
            self.last_log_id = entry.log_id;
        }

        if let Some(topology) = topology {
            self.update_topology(topology);
        }
        Ok(())
    }

    /// Advance the local commit mark from the leader's, never regressing and
    /// never past our own log, then apply any newly committed entries.
    async fn update_commit(&mut self, leader_commit: u64) -> CongressResult<()> {
        let new_commit = leader_commit.min(self.last_log_id.index).max(self.commit);
        if new_commit == self.commit {
            return Ok(());
        }
        self.commit = new_commit;
        self.save_log_meta().await?;
        self.replicate_to_state_machine_if_needed().await?;
        self.report_metrics();
        Ok(())
    }

    /// Apply all committed but unapplied entries, strictly in index order.
    ///
    /// Also drives the restart replay: a node that persisted a commit mark
    /// past its applied mark catches the state machine up here before it
    /// serves anything.
    pub(super) async fn replicate_to_state_machine_if_needed(&mut self) -> CongressResult<()> {
        while self.applied < self.commit {
            let stop = self.commit + 1;
            let entries = self
                .storage
                .get_log_entries(self.applied + 1, stop)
                .await
                .map_err(|err| self.map_fatal_storage_error(err))?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                self.storage
                    .apply_to_state_machine(&entry)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;
                self.applied = entry.log_id.index;
            }
            self.save_log_meta().await?;
        }
        Ok(())
    }
}
