//! Fixtures for testing congress clusters.

#![allow(dead_code)]

pub mod logging;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use congress::message::AppendRequest;
use congress::message::AppendResponse;
use congress::message::BallotRequest;
use congress::message::BallotResponse;
use congress::message::ClientCommand;
use congress::message::SubmitResponse;
use congress::message::Topology;
use congress::metrics::CongressMetrics;
use congress::metrics::Wait;
use congress::Config;
use congress::Congress;
use congress::CongressNetwork;
use congress::NodeId;
use congress::Role;
use congress::SubmitError;
use memlog::MemLog;
use tokio::sync::Mutex;

/// The concrete congress node type used by the integration suite.
pub type CongressNode = Congress<Router, MemLog>;

/// Returns the name of the calling function, without the trailing `::f`.
macro_rules! func_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = &name[..name.len() - 3];
        name.replace("::{{closure}}", "")
    }};
}

/// Set up tracing and open a per-test span.
macro_rules! init_ut {
    () => {{
        crate::fixtures::logging::init_default_ut_tracing();
        let name = func_name!();
        tracing::debug_span!("ut", test = %name)
    }};
}

/// An in-process network and test harness for a congress cluster.
///
/// Routes RPCs between nodes over their API handles, with per-node isolation
/// switches to simulate partitions. An isolated node can neither receive
/// RPCs nor have its own RPCs delivered.
pub struct Router {
    /// The runtime config shared by all nodes in the cluster.
    pub config: Arc<Config>,
    /// The table of all nodes currently known to the router.
    routing_table: Mutex<BTreeMap<NodeId, (CongressNode, Arc<MemLog>)>>,
    /// The nodes currently cut off from the rest of the cluster.
    isolated_nodes: Mutex<HashSet<NodeId>>,
}

impl Router {
    /// Create a new router with the given config.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Mutex::new(BTreeMap::new()),
            isolated_nodes: Mutex::new(HashSet::new()),
        }
    }

    /// Create and register a new congress node with the given id, backed by
    /// a fresh in-memory store.
    pub async fn new_congress_node(self: &Arc<Self>, id: NodeId) {
        let store = Arc::new(MemLog::new(id));
        self.new_congress_node_with_store(id, store).await;
    }

    /// Create and register a new congress node backed by the given store.
    pub async fn new_congress_node_with_store(self: &Arc<Self>, id: NodeId, store: Arc<MemLog>) {
        let node = Congress::new(id, self.config.clone(), self.clone(), store.clone());
        let mut rt = self.routing_table.lock().await;
        rt.insert(id, (node, store));
    }

    /// Remove the target node from the routing table, returning its handles.
    pub async fn remove_node(&self, id: NodeId) -> Option<(CongressNode, Arc<MemLog>)> {
        let node = {
            let mut rt = self.routing_table.lock().await;
            rt.remove(&id)
        };
        let mut isolated = self.isolated_nodes.lock().await;
        isolated.remove(&id);
        node
    }

    /// Initialize the target node with a topology of all currently
    /// registered nodes as voters.
    pub async fn initialize_from_single_node(&self, id: NodeId) -> Result<()> {
        tracing::info!({ id }, "initializing cluster from single node");
        let (node, voters) = {
            let rt = self.routing_table.lock().await;
            let voters = rt.keys().copied().collect::<BTreeSet<_>>();
            let node = rt.get(&id).ok_or_else(|| anyhow!("node {} not found in routing table", id))?.0.clone();
            (node, voters)
        };
        node.initialize(Topology {
            voters,
            gates: BTreeSet::new(),
        })
        .await?;
        Ok(())
    }

    /// Isolate the target node from the rest of the cluster.
    pub async fn isolate_node(&self, id: NodeId) {
        tracing::info!({ id }, "isolating node");
        self.isolated_nodes.lock().await.insert(id);
    }

    /// Restore the target node to the cluster.
    pub async fn restore_node(&self, id: NodeId) {
        tracing::info!({ id }, "restoring node");
        self.isolated_nodes.lock().await.remove(&id);
    }

    /// Get the API handle of the target node.
    pub async fn get_node_handle(&self, id: NodeId) -> Result<CongressNode> {
        let rt = self.routing_table.lock().await;
        let node = rt.get(&id).ok_or_else(|| anyhow!("node {} not found in routing table", id))?;
        Ok(node.0.clone())
    }

    /// Get the storage handle of the target node.
    pub async fn get_storage_handle(&self, id: NodeId) -> Result<Arc<MemLog>> {
        let rt = self.routing_table.lock().await;
        let node = rt.get(&id).ok_or_else(|| anyhow!("node {} not found in routing table", id))?;
        Ok(node.1.clone())
    }

    /// Get the latest metrics of every registered node.
    pub async fn latest_metrics(&self) -> Vec<CongressMetrics> {
        let rt = self.routing_table.lock().await;
        rt.values().map(|(node, _)| node.metrics().borrow().clone()).collect()
    }

    /// The id of the current leader, if any non-isolated node reports
    /// leadership held by itself.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.lock().await.clone();
        let metrics = self.latest_metrics().await;
        metrics
            .iter()
            .filter(|m| !isolated.contains(&m.id))
            .find(|m| m.current_leader == Some(m.id))
            .map(|m| m.id)
    }

    /// Get a `Wait` for the target node.
    pub async fn wait(&self, id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let rt = self.routing_table.lock().await;
        let node = rt.get(id).ok_or_else(|| anyhow!("node {} not found in routing table", id))?;
        Ok(node.0.wait(timeout))
    }

    /// Wait for the given nodes to all have applied the log through `want_log`.
    pub async fn wait_for_log(
        &self, node_ids: &BTreeSet<NodeId>, want_log: u64, timeout: Option<Duration>, msg: &str,
    ) -> Result<()> {
        for id in node_ids {
            self.wait(id, timeout).await?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to all reach the given role.
    pub async fn wait_for_role(
        &self, node_ids: &BTreeSet<NodeId>, role: Role, timeout: Option<Duration>, msg: &str,
    ) -> Result<()> {
        for id in node_ids {
            self.wait(id, timeout).await?.role(role, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to all observe the given voter set.
    pub async fn wait_for_voters(
        &self, node_ids: &BTreeSet<NodeId>, voters: BTreeSet<NodeId>, timeout: Option<Duration>, msg: &str,
    ) -> Result<()> {
        for id in node_ids {
            self.wait(id, timeout).await?.voters(voters.clone(), msg).await?;
        }
        Ok(())
    }

    /// Submit a client command to the target node, returning the raw result.
    pub async fn send_client_request(&self, target: NodeId, client: u64, serial: u32) -> Result<SubmitResponse, SubmitError> {
        let node = {
            let rt = self.routing_table.lock().await;
            rt.get(&target)
                .unwrap_or_else(|| panic!("node {} not found in routing table", target))
                .0
                .clone()
        };
        let payload = format!("request-{}-{}", client, serial).into_bytes();
        node.submit(ClientCommand::new(client, serial, payload)).await
    }

    /// Submit a client command to the target node, panicking on rejection.
    pub async fn client_request(&self, target: NodeId, client: u64, serial: u32) {
        if let Err(err) = self.send_client_request(target, client, serial).await {
            panic!("submission to {} rejected: {}", target, err);
        }
    }

    /// Submit a sequence of client commands, returning the next free serial.
    pub async fn client_request_many(&self, target: NodeId, client: u64, start_serial: u32, count: usize) -> u32 {
        let mut serial = start_serial;
        for _ in 0..count {
            self.client_request(target, client, serial).await;
            serial += 1;
        }
        serial
    }

    /// Assert that all registered nodes are in the pristine pre-init state.
    pub async fn assert_pristine_cluster(&self) {
        for metrics in self.latest_metrics().await {
            assert_eq!(
                metrics.role,
                Role::Learner,
                "node {} is not a learner, got {:?}",
                metrics.id,
                metrics.role
            );
            assert_eq!(metrics.current_term, 0, "node {} has a non-zero term", metrics.id);
            assert_eq!(metrics.last_log_index, 0, "node {} has log entries", metrics.id);
            assert_eq!(metrics.current_leader, None, "node {} has a leader", metrics.id);
            assert!(metrics.topology.voters.is_empty(), "node {} has a voter set", metrics.id);
        }
    }

    /// Assert that the cluster has exactly one leader and that all
    /// non-isolated nodes agree on it, optionally asserting the term and the
    /// last applied log index.
    pub async fn assert_stable_cluster(&self, expect_term: Option<u64>, expect_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.lock().await.clone();
        let metrics = self
            .latest_metrics()
            .await
            .into_iter()
            .filter(|m| !isolated.contains(&m.id))
            .collect::<Vec<_>>();

        let leaders = metrics
            .iter()
            .filter(|m| m.role == Role::Leader)
            .map(|m| m.id)
            .collect::<Vec<_>>();
        assert_eq!(leaders.len(), 1, "expected exactly one leader, got {:?}", leaders);
        let leader = leaders[0];

        for m in metrics.iter() {
            assert_eq!(
                m.current_leader,
                Some(leader),
                "node {} sees leader {:?}, expected {}",
                m.id,
                m.current_leader,
                leader
            );
            if m.id != leader && m.topology.contains_voter(&m.id) {
                assert_eq!(m.role, Role::Follower, "voter {} is not a follower", m.id);
            }
            if let Some(term) = expect_term {
                assert_eq!(m.current_term, term, "node {} has term {}, expected {}", m.id, m.current_term, term);
            }
            if let Some(last_log) = expect_last_log {
                assert_eq!(
                    m.last_log_index, last_log,
                    "node {} has last log {}, expected {}",
                    m.id, m.last_log_index, last_log
                );
                assert_eq!(
                    m.last_applied, last_log,
                    "node {} has applied {}, expected {}",
                    m.id, m.last_applied, last_log
                );
            }
        }
    }

    /// Error if either end of an RPC is isolated.
    async fn ensure_connected(&self, origin: NodeId, target: NodeId) -> Result<()> {
        let isolated = self.isolated_nodes.lock().await;
        if isolated.contains(&target) {
            return Err(anyhow!("target node {} is isolated", target));
        }
        if isolated.contains(&origin) {
            return Err(anyhow!("origin node {} is isolated", origin));
        }
        Ok(())
    }
}

#[async_trait]
impl CongressNetwork for Router {
    async fn send_append(&self, target: NodeId, rpc: AppendRequest) -> Result<AppendResponse> {
        self.ensure_connected(rpc.leader, target).await?;
        let node = {
            let rt = self.routing_table.lock().await;
            rt.get(&target).ok_or_else(|| anyhow!("node {} not found in routing table", target))?.0.clone()
        };
        Ok(node.append_entries(rpc).await?)
    }

    async fn send_ballot(&self, target: NodeId, rpc: BallotRequest) -> Result<BallotResponse> {
        self.ensure_connected(rpc.candidate, target).await?;
        let node = {
            let rt = self.routing_table.lock().await;
            rt.get(&target).ok_or_else(|| anyhow!("node {} not found in routing table", target))?.0.clone()
        };
        Ok(node.ballot(rpc).await?)
    }
}
