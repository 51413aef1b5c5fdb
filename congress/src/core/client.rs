use crate::congress::RespTx;
use crate::core::LeaderState;
use crate::error::ChangeTopologyError;
use crate::error::CongressResult;
use crate::error::SubmitError;
use crate::message::Adjudicate;
use crate::message::ClientCommand;
use crate::message::Entry;
use crate::message::EntryPayload;
use crate::message::SubmitResponse;
use crate::network::CongressNetwork;
use crate::replication::PeerEvent;
use crate::storage::LogStore;
use crate::summary::MessageSummary;
use crate::LogId;

/// A submission which has been appended to the leader's log and is awaiting
/// commitment by a majority of voters.
pub(crate) struct PendingSubmission {
    pub entry: Entry,
    pub responder: Responder,
}

/// The response channel parked for a pending submission.
pub(crate) enum Responder {
    /// A client submission awaiting the apply callback's response.
    Submit(RespTx<SubmitResponse, SubmitError>),
    /// A topology change awaiting commitment.
    Topology(RespTx<(), ChangeTopologyError>),
    /// An internal entry with no caller, such as the leader's initial blank.
    None,
}

impl<'a, N: CongressNetwork, S: LogStore> LeaderState<'a, N, S> {
    /// Handle a client submission on the leader.
    #[tracing::instrument(level = "debug", skip(self, rpc, tx))]
    pub(super) async fn handle_submit(
        &mut self, rpc: ClientCommand, tx: RespTx<SubmitResponse, SubmitError>,
    ) -> CongressResult<()> {
        let entry = match self.append_payload_to_log(EntryPayload::Command(rpc)).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return Ok(());
            }
        };
        self.replicate_submission(PendingSubmission {
            entry,
            responder: Responder::Submit(tx),
        })
        .await
    }

    /// Handle a session-adjudication record on the leader.
    ///
    /// Adjudications travel the same append/commit/apply pipeline as client
    /// commands; the redirection policy is the apply callback's concern.
    #[tracing::instrument(level = "debug", skip(self, rpc, tx))]
    pub(super) async fn handle_adjudicate(
        &mut self, rpc: Adjudicate, tx: RespTx<SubmitResponse, SubmitError>,
    ) -> CongressResult<()> {
        let entry = match self.append_payload_to_log(EntryPayload::Adjudicate(rpc)).await {
            Ok(entry) => entry,
            Err(err) => {
                let _ = tx.send(Err(err.into()));
                return Ok(());
            }
        };
        self.replicate_submission(PendingSubmission {
            entry,
            responder: Responder::Submit(tx),
        })
        .await
    }

    /// Append a blank entry under the new leader's term and replicate it.
    ///
    /// Committing an entry of the current term is what unlocks commitment of
    /// any entries left over from prior terms.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> CongressResult<()> {
        let entry = self.append_payload_to_log(EntryPayload::Blank).await?;
        self.replicate_submission(PendingSubmission {
            entry,
            responder: Responder::None,
        })
        .await
    }

    /// Append the given payload to the log under the next index and the
    /// leader's current term.
    ///
    /// This runs on the single core task, so no two submissions can ever be
    /// assigned the same index.
    #[tracing::instrument(level = "debug", skip(self, payload), fields(payload=%payload.summary()))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload) -> CongressResult<Entry> {
        let log_id = LogId {
            term: self.core.current_term,
            index: self.core.last_log_id.index + 1,
        };
        let entry = Entry { log_id, payload };
        self.core
            .storage
            .append_to_log(&[&entry])
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id = log_id;
        Ok(entry)
    }

    /// Hand an appended submission to the replication streams, or commit it
    /// outright when this node is the sole voter.
    #[tracing::instrument(level = "debug", skip(self, pending), fields(index=pending.entry.log_id.index))]
    pub(super) async fn replicate_submission(&mut self, pending: PendingSubmission) -> CongressResult<()> {
        let index = pending.entry.log_id.index;
        let sole_voter = self.core.topology.voters.len() == 1 && self.core.topology.contains_voter(&self.core.id);
        if sole_voter {
            // No replication round needed, local append is commitment.
            self.core.commit = index;
            self.core.save_log_meta().await?;
        }
        for state in self.nodes.values() {
            let _ = state.stream.repl_tx.send(PeerEvent::Replicate {
                index,
                commit: self.core.commit,
            });
        }
        if sole_voter {
            self.process_committed(pending).await?;
            self.core.report_metrics();
        } else {
            self.awaiting_committed.push(pending);
        }
        Ok(())
    }

    /// Apply a committed submission and complete its parked responder.
    #[tracing::instrument(level = "debug", skip(self, pending), fields(index=pending.entry.log_id.index))]
    pub(super) async fn process_committed(&mut self, pending: PendingSubmission) -> CongressResult<()> {
        let index = pending.entry.log_id.index;
        // Entries committed transitively below this one carry no responder
        // on this node; they are applied first to keep apply strictly ordered.
        self.apply_outstanding_below(index).await?;

        let res = self
            .core
            .storage
            .apply_to_state_machine(&pending.entry)
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.applied = index;
        self.core.save_log_meta().await?;

        match pending.responder {
            Responder::Submit(tx) => {
                let _ = tx.send(Ok(SubmitResponse { index, payload: res }));
            }
            Responder::Topology(tx) => {
                let _ = tx.send(Ok(()));
                self.handle_topology_committed(index).await?;
            }
            Responder::None => {}
        }
        Ok(())
    }

    /// Apply all committed entries below `index` which have no parked responder.
    async fn apply_outstanding_below(&mut self, index: u64) -> CongressResult<()> {
        while self.core.applied + 1 < index {
            let entries = self
                .core
                .storage
                .get_log_entries(self.core.applied + 1, index)
                .await
                .map_err(|err| self.core.map_fatal_storage_error(err))?;
            if entries.is_empty() {
                return Ok(());
            }
            for entry in entries {
                self.core
                    .storage
                    .apply_to_state_machine(&entry)
                    .await
                    .map_err(|err| self.core.map_fatal_storage_error(err))?;
                self.core.applied = entry.log_id.index;
            }
        }
        Ok(())
    }
}
