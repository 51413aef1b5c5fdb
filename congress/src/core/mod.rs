//! The core logic of a congress node.

mod admin;
mod append;
mod ballot;
mod client;
mod replication;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

pub(crate) use client::PendingSubmission;
pub(crate) use client::Responder;

use crate::config::Config;
use crate::congress::ApiMessage;
use crate::error::ChangeTopologyError;
use crate::error::CongressError;
use crate::error::CongressResult;
use crate::error::InitializeError;
use crate::error::SubmitError;
use crate::message::Topology;
use crate::metrics::CongressMetrics;
use crate::network::CongressNetwork;
use crate::replication::PeerEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::HardState;
use crate::storage::LogMeta;
use crate::storage::LogStore;
use crate::LogId;
use crate::NodeId;

/// The core type implementing the consensus protocol.
pub struct CongressCore<N: CongressNetwork, S: LogStore> {
    /// This node's id.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster topology this node last observed in its log.
    topology: Topology,
    /// The `CongressNetwork` implementation.
    network: Arc<N>,
    /// The `LogStore` implementation.
    storage: Arc<S>,

    /// The target role of the node.
    ///
    /// Each role has a corresponding loop; when an event changes this value,
    /// the current loop exits and the loop for the new role begins.
    target_role: Role,

    /// The highest log index known to be committed cluster-wide.
    commit: u64,
    /// The highest log index applied to the state machine.
    applied: u64,
    /// The current term. Increases monotonically, never decreases.
    current_term: u64,
    /// The id of the current leader, if known.
    current_leader: Option<NodeId>,
    /// The id of the candidate which received this node's ballot in the current term.
    voted_for: Option<NodeId>,
    /// The id of the last entry in this node's log.
    last_log_id: LogId,

    /// The node's intake of API messages, the exclusive path into the core.
    rx_api: mpsc::UnboundedReceiver<ApiMessage>,
    /// The channel metrics are published on.
    tx_metrics: watch::Sender<CongressMetrics>,
    /// The channel used to receive the shutdown signal.
    rx_shutdown: oneshot::Receiver<()>,

    /// The deadline at which this node stands for election unless the leader
    /// asserts itself first. `None` while this node is itself the leader.
    next_election_timeout: Option<Instant>,
    /// The time of the last valid contact from the current leader, used to
    /// refuse disruptive ballots while the leader is live.
    last_heartbeat: Option<Instant>,
}

impl<N: CongressNetwork, S: LogStore> CongressCore<N, S> {
    pub(crate) fn spawn(
        id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<ApiMessage>, tx_metrics: watch::Sender<CongressMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<CongressResult<()>> {
        let this = Self {
            id,
            config,
            topology: Topology::default(),
            network,
            storage,
            target_role: Role::Follower,
            commit: 0,
            applied: 0,
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            rx_api,
            tx_metrics,
            rx_shutdown,
            next_election_timeout: None,
            last_heartbeat: None,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("congress-core")))
    }

    /// The main loop of the congress protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> CongressResult<()> {
        tracing::debug!("congress node is initializing");

        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.commit = state.meta.commit;
        self.applied = state.meta.applied;
        if let Some(topology) = state.topology {
            self.topology = topology;
        }

        // A restarted node may have committed entries it never applied.
        // Bring the state machine back up to the durable commit mark before
        // serving anything.
        if self.applied < self.commit {
            self.replicate_to_state_machine_if_needed().await?;
        }

        let is_voter = self.topology.contains_voter(&self.id);
        if is_voter && self.topology.voters.len() == 1 && self.last_log_id.index != 0 {
            // Sole voter with an existing log, no election needed.
            self.target_role = Role::Leader;
        } else if is_voter {
            self.target_role = Role::Follower;
            self.update_next_election_timeout(false);
        } else {
            self.target_role = Role::Learner;
        }
        self.report_metrics();

        loop {
            match self.target_role {
                Role::Leader => LeaderState::new(&mut self).run().await?,
                Role::Candidate => CandidateState::new(&mut self).run().await?,
                Role::Follower | Role::Elector => FollowerState::new(&mut self).run().await?,
                Role::Learner => LearnerState::new(&mut self).run().await?,
                Role::Shutdown => {
                    tracing::info!("congress node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the metrics channel.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&self) {
        self.report_role(self.target_role);
    }

    /// Report a metrics payload carrying the given role.
    ///
    /// Used for the transient `Elector` state published while a ballot is
    /// being granted and persisted.
    fn report_role(&self, role: Role) {
        let res = self.tx_metrics.send(CongressMetrics {
            id: self.id,
            role,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.applied,
            commit: self.commit,
            current_leader: self.current_leader,
            topology: self.topology.clone(),
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Persist the node's current hard state.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> CongressResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Persist the node's commit and applied marks.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_log_meta(&mut self) -> CongressResult<()> {
        let meta = LogMeta {
            commit: self.commit,
            applied: self.applied,
        };
        self.storage.save_log_meta(&meta).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update the value of the `current_term`, ensuring monotonicity.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Update the node's target role, ensuring only voters may campaign.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_role(&mut self, target_role: Role) {
        if target_role == Role::Follower && !self.topology.contains_voter(&self.id) {
            self.target_role = Role::Learner;
        } else {
            self.target_role = target_role;
        }
    }

    /// Get the next election timeout, generating a new value if none is cached.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let inst = Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout());
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a fresh election timeout, recording leader contact when `heartbeat` is true.
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Update the node's current leader hint.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id);
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.current_leader = Some(target);
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Adopt a new topology, adjusting this node's role to match its place in it.
    #[tracing::instrument(level = "debug", skip(self))]
    fn update_topology(&mut self, topology: Topology) {
        self.topology = topology;
        if !self.topology.contains_voter(&self.id) {
            self.target_role = Role::Learner;
        } else if self.target_role == Role::Learner {
            self.target_role = Role::Follower;
            self.update_next_election_timeout(false);
        }
        self.report_metrics();
    }

    /// Transition to the shutdown role as a result of an unrecoverable storage error.
    ///
    /// The node must never run on data it failed to persist.
    #[tracing::instrument(level = "debug", skip(self, err))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> CongressError {
        tracing::error!(error=%err, id=self.id, "fatal storage error, shutting down");
        self.set_target_role(Role::Shutdown);
        CongressError::Storage(err)
    }

    /// Reject a submission, directing the caller per this node's view of the cluster.
    fn reject_submission(&self) -> SubmitError {
        if !self.topology.contains_voter(&self.id) {
            SubmitError::NotInCongress
        } else if let Some(leader) = self.current_leader {
            SubmitError::NotLeader { leader_hint: Some(leader) }
        } else {
            SubmitError::Electing
        }
    }

    /// Reject a topology change with a leader redirect.
    fn reject_topology_change(&self, tx: crate::congress::RespTx<(), ChangeTopologyError>) {
        let _ = tx.send(Err(ChangeTopologyError::NodeNotLeader(self.current_leader)));
    }

    /// Reject an initialize request, only pristine nodes may be initialized.
    fn reject_initialize(&self, tx: crate::congress::RespTx<(), InitializeError>) {
        let _ = tx.send(Err(InitializeError::NotAllowed));
    }
}

/// An enum describing the way the current leader hint should be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

/// All possible roles of a congress node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The node is replicating the log but is not a voting member.
    ///
    /// Gateway peers and nodes removed from the voter set run in this role.
    Learner,
    /// The node is a voting member replicating entries from the leader.
    Follower,
    /// The node is casting a ballot for a candidate.
    ///
    /// A transient role, held only while the ballot is persisted and sent.
    Elector,
    /// The node has detected an election timeout and is campaigning.
    Candidate,
    /// The node is the cluster leader.
    Leader,
    /// The node is shutting down.
    Shutdown,
}

impl Role {
    /// Check if currently in learner role.
    pub fn is_learner(&self) -> bool {
        matches!(self, Self::Learner)
    }

    /// Check if currently in follower role.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate role.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader role.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the leader role.
struct LeaderState<'a, N: CongressNetwork, S: LogStore> {
    pub(super) core: &'a mut CongressCore<N, S>,
    /// A mapping of node ids to the state of their replication stream.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState>,
    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<ReplicaEvent>,
    /// The cloneable sender channel for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<ReplicaEvent>,
    /// Submissions which have been appended locally but are waiting for commitment.
    pub(super) awaiting_committed: Vec<PendingSubmission>,
    /// The index of an uncommitted topology entry, if one is in flight.
    pub(super) topology_in_flight: Option<u64>,
    /// Set when a committed topology change removes this node from the voter set.
    pub(super) stepdown_after: Option<u64>,
}

/// A per-peer record of replication state, addressed by node id.
struct ReplicationState {
    /// The highest log index confirmed to match the leader's log.
    pub matched: u64,
    /// The handle to the replication stream task.
    pub stream: ReplicationStream,
    /// Remove the stream once the entry at this index is committed.
    pub remove_after_commit: Option<u64>,
}

impl<'a, N: CongressNetwork, S: LogStore> LeaderState<'a, N, S> {
    pub(self) fn new(core: &'a mut CongressCore<N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            replication_rx,
            replication_tx,
            awaiting_committed: Vec::new(),
            topology_in_flight: None,
            stepdown_after: None,
        }
    }

    /// Transition to the congress leader role.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> CongressResult<()> {
        // Spawn a replication stream for every peer, voters and gates alike.
        let targets = self
            .core
            .topology
            .all_nodes()
            .into_iter()
            .filter(|id| id != &self.core.id)
            .collect::<Vec<_>>();
        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        // A leader has no election deadline of its own.
        self.core.next_election_timeout = None;
        self.core.last_heartbeat = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.core.report_metrics();

        self.commit_initial_leader_entry().await?;

        self.leader_loop().await
    }

    async fn leader_loop(mut self) -> CongressResult<()> {
        loop {
            if !self.core.target_role.is_leader() {
                for (_, state) in std::mem::take(&mut self.nodes) {
                    let _ = state.stream.repl_tx.send(PeerEvent::Terminate);
                }
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => match msg {
                    ApiMessage::AppendEntries{rpc, tx} => {
                        let _ = tx.send(self.core.handle_append_request(rpc).await);
                    }
                    ApiMessage::Ballot{rpc, tx} => {
                        let _ = tx.send(self.core.handle_ballot_request(rpc).await);
                    }
                    ApiMessage::Submit{rpc, tx} => {
                        self.handle_submit(rpc, tx).await?;
                    }
                    ApiMessage::Adjudicate{rpc, tx} => {
                        self.handle_adjudicate(rpc, tx).await?;
                    }
                    ApiMessage::Initialize{tx, ..} => {
                        self.core.reject_initialize(tx);
                    }
                    ApiMessage::ChangeTopology{topology, tx} => {
                        self.handle_change_topology(topology, tx).await?;
                    }
                },
                Some(event) = self.replication_rx.recv() => self.handle_replica_event(event).await?,
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(Role::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the candidate role.
struct CandidateState<'a, N: CongressNetwork, S: LogStore> {
    core: &'a mut CongressCore<N, S>,
    /// The number of ballots granted so far, always counting this node's own.
    votes_granted: u64,
    /// The number of ballots needed to win the election.
    votes_needed: u64,
}

impl<'a, N: CongressNetwork, S: LogStore> CandidateState<'a, N, S> {
    pub(self) fn new(core: &'a mut CongressCore<N, S>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> CongressResult<()> {
        // Each iteration of the outer loop is a new term.
        loop {
            if !self.core.target_role.is_candidate() {
                return Ok(());
            }

            self.votes_granted = 1; // Vote for ourselves.
            self.votes_needed = ((self.core.topology.voters.len() / 2) + 1) as u64;

            // New term, new randomized timeout.
            self.core.update_next_election_timeout(false);
            let timeout = self.core.get_next_election_timeout();

            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.report_metrics();

            if self.votes_granted >= self.votes_needed {
                // Single-voter cluster, no ballots to gather.
                self.core.set_target_role(Role::Leader);
                continue;
            }

            let mut pending_votes = self.spawn_parallel_ballot_requests();

            let mut timeout_fut = Box::pin(sleep_until(timeout));
            loop {
                if !self.core.target_role.is_candidate() {
                    return Ok(());
                }
                tokio::select! {
                    _ = &mut timeout_fut => break, // Election timed out, start a new term.
                    Some((res, peer)) = pending_votes.recv() => self.handle_ballot_response(res, peer).await?,
                    Some(msg) = self.core.rx_api.recv() => match msg {
                        ApiMessage::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_request(rpc).await);
                        }
                        ApiMessage::Ballot{rpc, tx} => {
                            let _ = tx.send(self.core.handle_ballot_request(rpc).await);
                        }
                        ApiMessage::Submit{tx, ..} => {
                            let _ = tx.send(Err(self.core.reject_submission()));
                        }
                        ApiMessage::Adjudicate{tx, ..} => {
                            let _ = tx.send(Err(self.core.reject_submission()));
                        }
                        ApiMessage::Initialize{tx, ..} => {
                            self.core.reject_initialize(tx);
                        }
                        ApiMessage::ChangeTopology{tx, ..} => {
                            self.core.reject_topology_change(tx);
                        }
                    },
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(Role::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the follower role.
struct FollowerState<'a, N: CongressNetwork, S: LogStore> {
    core: &'a mut CongressCore<N, S>,
}

impl<'a, N: CongressNetwork, S: LogStore> FollowerState<'a, N, S> {
    pub(self) fn new(core: &'a mut CongressCore<N, S>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> CongressResult<()> {
        loop {
            if !self.core.target_role.is_follower() && self.core.target_role != Role::Elector {
                return Ok(());
            }

            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                // The leader failed to assert itself in time, stand for election.
                _ = election_timeout => self.core.set_target_role(Role::Candidate),
                Some(msg) = self.core.rx_api.recv() => match msg {
                    ApiMessage::AppendEntries{rpc, tx} => {
                        let _ = tx.send(self.core.handle_append_request(rpc).await);
                    }
                    ApiMessage::Ballot{rpc, tx} => {
                        let _ = tx.send(self.core.handle_ballot_request(rpc).await);
                    }
                    ApiMessage::Submit{tx, ..} => {
                        let _ = tx.send(Err(self.core.reject_submission()));
                    }
                    ApiMessage::Adjudicate{tx, ..} => {
                        let _ = tx.send(Err(self.core.reject_submission()));
                    }
                    ApiMessage::Initialize{tx, ..} => {
                        self.core.reject_initialize(tx);
                    }
                    ApiMessage::ChangeTopology{tx, ..} => {
                        self.core.reject_topology_change(tx);
                    }
                },
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(Role::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the learner role.
struct LearnerState<'a, N: CongressNetwork, S: LogStore> {
    core: &'a mut CongressCore<N, S>,
}

impl<'a, N: CongressNetwork, S: LogStore> LearnerState<'a, N, S> {
    pub(self) fn new(core: &'a mut CongressCore<N, S>) -> Self {
        Self { core }
    }

    /// Run the learner loop.
    ///
    /// Learners replicate and apply entries but have no election timer and
    /// never campaign. A pristine node runs here until it is initialized or
    /// until it learns a topology placing it in the voter set.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="learner"))]
    pub(self) async fn run(mut self) -> CongressResult<()> {
        loop {
            if !self.core.target_role.is_learner() {
                return Ok(());
            }

            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => match msg {
                    ApiMessage::AppendEntries{rpc, tx} => {
                        let _ = tx.send(self.core.handle_append_request(rpc).await);
                    }
                    ApiMessage::Ballot{rpc, tx} => {
                        let _ = tx.send(self.core.handle_ballot_request(rpc).await);
                    }
                    ApiMessage::Submit{tx, ..} => {
                        let _ = tx.send(Err(SubmitError::NotInCongress));
                    }
                    ApiMessage::Adjudicate{tx, ..} => {
                        let _ = tx.send(Err(SubmitError::NotInCongress));
                    }
                    ApiMessage::Initialize{topology, tx} => {
                        let _ = tx.send(self.handle_initialize(topology).await);
                    }
                    ApiMessage::ChangeTopology{tx, ..} => {
                        self.core.reject_topology_change(tx);
                    }
                },
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_role(Role::Shutdown),
            }
        }
    }
}
