//! Replication stream.

use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::CongressResult;
use crate::message::AppendOutcome;
use crate::message::AppendRequest;
use crate::message::Conflict;
use crate::network::CongressNetwork;
use crate::storage::LogStore;
use crate::LogId;
use crate::NodeId;

/// The public handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<PeerEvent>,
    /// The spawn handle of the replication task.
    pub handle: JoinHandle<()>,
}

impl ReplicationStream {
    /// Create a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<N: CongressNetwork, S: LogStore>(
        id: NodeId, target: NodeId, term: u64, config: Arc<Config>, last_log_id: LogId, commit: u64, network: Arc<N>,
        storage: Arc<S>, core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> Self {
        ReplicationCore::spawn(id, target, term, config, last_log_id, commit, network, storage, core_tx)
    }
}

/// A task responsible for replicating the log to one target peer.
struct ReplicationCore<N: CongressNetwork, S: LogStore> {
    /// The id of this congress node, the leader.
    id: NodeId,
    /// The id of the target peer.
    target: NodeId,
    /// The term of the leadership this stream serves. Never changes; a new
    /// term means a new leader and new streams.
    term: u64,

    network: Arc<N>,
    storage: Arc<S>,
    config: Arc<Config>,

    /// The last log id confirmed, or optimistically assumed, to be present
    /// on the target. Used as `prev_log` for the next payload.
    matched: LogId,
    /// The index of the last entry of the leader's log.
    last_log_index: u64,
    /// The leader's commit index, forwarded to the target on every payload.
    commit: u64,

    /// The events channel to the leader core.
    core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    /// The events channel from the leader core.
    repl_rx: mpsc::UnboundedReceiver<PeerEvent>,

    /// The heartbeat cadence, which also paces retries after errors.
    heartbeat: Interval,
    target_state: TargetReplState,
}

impl<N: CongressNetwork, S: LogStore> ReplicationCore<N, S> {
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        id: NodeId, target: NodeId, term: u64, config: Arc<Config>, last_log_id: LogId, commit: u64, network: Arc<N>,
        storage: Arc<S>, core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> ReplicationStream {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_interval = Duration::from_millis(config.heartbeat_interval);
        let this = Self {
            id,
            target,
            term,
            network,
            storage,
            config,
            // Optimistically assume the target matches the leader's log; the
            // first rejection walks this back.
            matched: last_log_id,
            last_log_index: last_log_id.index,
            commit,
            core_tx,
            repl_rx,
            heartbeat: interval(heartbeat_interval),
            target_state: TargetReplState::LineRate,
        };
        let handle = tokio::spawn(this.main().instrument(tracing::debug_span!("replication", id, target)));
        ReplicationStream { repl_tx, handle }
    }

    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, target=self.target))]
    async fn main(mut self) {
        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    /// Drive the target at line rate: ship outstanding entries as soon as
    /// they exist, heartbeat when there is nothing to ship.
    async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            if self.matched.index < self.last_log_index {
                self.send_append_entries().await;
                // Events may have arrived while the payload was in flight.
                self.drain_repl_rx();
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,
                event = self.repl_rx.recv() => match event {
                    Some(event) => {
                        self.process_event(event);
                        self.drain_repl_rx();
                    }
                    None => self.target_state = TargetReplState::Shutdown,
                }
            }
        }
    }

    /// Send an append RPC carrying the next chunk of outstanding entries, or
    /// an empty heartbeat when the target is caught up.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) {
        let start = self.matched.index + 1;
        let stop = std::cmp::min(self.last_log_index + 1, start + self.config.max_payload_entries);
        let entries = if start < stop {
            match self.storage.get_log_entries(start, stop).await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::error!(error=%err, "fatal storage error while loading entries for replication");
                    let _ = self.core_tx.send(ReplicaEvent::Shutdown);
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            }
        } else {
            Vec::new()
        };
        let last_sent = entries.last().map(|entry| entry.log_id);

        let rpc = AppendRequest {
            term: self.term,
            leader: self.id,
            prev_log: self.matched,
            entries,
            leader_commit: self.commit,
        };

        let heartbeat_timeout = Duration::from_millis(self.config.heartbeat_interval);
        let res = match timeout(heartbeat_timeout, self.network.send_append(self.target, rpc)).await {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, target=self.target, "error sending append RPC to target");
                // Pace the retry so a fast-failing transport does not spin.
                tokio::time::sleep(heartbeat_timeout).await;
                return;
            }
            Err(_) => {
                tracing::warn!(target=self.target, "timeout while sending append RPC to target");
                return;
            }
        };

        // A higher term on the wire means this leadership is over.
        if res.term > self.term {
            let _ = self.core_tx.send(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: res.term,
            });
            self.target_state = TargetReplState::Shutdown;
            return;
        }

        match res.outcome {
            AppendOutcome::Accept { matched } => {
                if let Some(log_id) = last_sent {
                    self.matched = log_id;
                }
                // An accept also confirms any probe position reached through
                // conflict backoff.
                let _ = self.core_tx.send(ReplicaEvent::UpdateMatched {
                    target: self.target,
                    matched: matched.min(self.matched.index),
                });
            }
            AppendOutcome::Reject { conflict } => {
                if let Some(conflict) = conflict {
                    self.handle_conflict(conflict).await;
                }
            }
        }
    }

    /// Walk `matched` back using the target's conflict hint.
    ///
    /// The hint names the first entry of the target's conflicting term, so a
    /// single response steps over the entire divergent term.
    #[tracing::instrument(level = "trace", skip(self), fields(conflict=%conflict.log_id))]
    async fn handle_conflict(&mut self, conflict: Conflict) {
        let hint = conflict.log_id;
        if hint.index == 0 {
            self.matched = LogId::default();
            let _ = self.core_tx.send(ReplicaEvent::UpdateMatched {
                target: self.target,
                matched: 0,
            });
            return;
        }

        // The hint may point past our log when the target's log is longer
        // than ours was at its term; clamp to our own tail.
        let probe = std::cmp::min(hint.index, self.last_log_index);
        match self.load_probe_point(probe, hint).await {
            Ok(log_id) => self.matched = log_id,
            Err(err) => {
                tracing::error!(error=%err, "fatal storage error while resolving conflict hint");
                let _ = self.core_tx.send(ReplicaEvent::Shutdown);
                self.target_state = TargetReplState::Shutdown;
            }
        }
    }

    /// Resolve the probe position for a conflict hint.
    async fn load_probe_point(&self, probe: u64, hint: LogId) -> CongressResult<LogId> {
        let entry = self
            .storage
            .try_get_log_entry(probe)
            .await
            .map_err(crate::error::CongressError::Storage)?;
        match entry {
            // The target's conflicting term exists here too; resume just
            // above its first entry.
            Some(entry) if probe == hint.index && entry.log_id.term == hint.term => Ok(entry.log_id),
            Some(_) if probe > 0 => {
                // No agreement at the hint; resume below it.
                let below = self
                    .storage
                    .try_get_log_entry(probe - 1)
                    .await
                    .map_err(crate::error::CongressError::Storage)?;
                Ok(below.map(|entry| entry.log_id).unwrap_or_default())
            }
            _ => Ok(LogId::default()),
        }
    }

    /// Process an event from the leader core.
    fn process_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Replicate { index, commit } => {
                self.last_log_index = index;
                self.commit = commit;
            }
            PeerEvent::UpdateCommit { commit } => {
                self.commit = commit;
            }
            PeerEvent::Terminate => {
                self.target_state = TargetReplState::Shutdown;
            }
        }
    }

    /// Drain any buffered events without blocking.
    fn drain_repl_rx(&mut self) {
        loop {
            match self.repl_rx.recv().now_or_never() {
                Some(Some(event)) => self.process_event(event),
                Some(None) => {
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
                None => return,
            }
        }
    }
}

/// The desired state of a replication stream.
#[derive(Debug, PartialEq, Eq)]
enum TargetReplState {
    /// The stream should be replicating entries at line rate.
    LineRate,
    /// The stream should shut down.
    Shutdown,
}

/// An event from a replication stream to the leader core.
pub(crate) enum ReplicaEvent {
    /// The target confirmed its log matches the leader's through `matched`.
    UpdateMatched { target: NodeId, matched: u64 },
    /// The target responded with a higher term than the leader's.
    RevertToFollower { target: NodeId, term: u64 },
    /// A replication stream hit a fatal storage error.
    Shutdown,
}

/// An event from the leader core to a replication stream.
pub(crate) enum PeerEvent {
    /// An entry through `index` is ready for replication.
    Replicate {
        /// The index of the most recent entry appended to the leader's log.
        index: u64,
        /// The leader's commit index.
        commit: u64,
    },
    /// The leader's commit index has advanced.
    UpdateCommit { commit: u64 },
    /// The stream should shut down.
    Terminate,
}
