//! Public Congress interface and data types.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::CongressCore;
use crate::error::ChangeTopologyError;
use crate::error::CongressError;
use crate::error::CongressResult;
use crate::error::InitializeError;
use crate::error::SubmitError;
use crate::message::Adjudicate;
use crate::message::AppendRequest;
use crate::message::AppendResponse;
use crate::message::BallotRequest;
use crate::message::BallotResponse;
use crate::message::ClientCommand;
use crate::message::SubmitResponse;
use crate::message::Topology;
use crate::metrics::CongressMetrics;
use crate::metrics::Wait;
use crate::network::CongressNetwork;
use crate::storage::LogStore;
use crate::NodeId;

struct CongressInner<N: CongressNetwork, S: LogStore> {
    tx_api: mpsc::UnboundedSender<ApiMessage>,
    rx_metrics: watch::Receiver<CongressMetrics>,
    core_handle: Mutex<Option<JoinHandle<CongressResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

/// The Congress API.
///
/// This handle is the interface to a single consensus node. It is cheap to
/// clone; all clones communicate with the same spawned core task, which is
/// the exclusive writer of the node's log.
pub struct Congress<N: CongressNetwork, S: LogStore> {
    inner: Arc<CongressInner<N, S>>,
}

impl<N: CongressNetwork, S: LogStore> Congress<N, S> {
    /// Create and spawn a new congress node.
    ///
    /// - `id` is the node's id, which must remain stable across restarts.
    /// - `config` is the validated runtime configuration, see `Config::build`.
    /// - `network` implements RPC transport to peers.
    /// - `storage` implements the node's durable log.
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(CongressMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle = CongressCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        let inner = CongressInner {
            tx_api,
            rx_metrics,
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an append RPC to this node.
    ///
    /// Applications are responsible for making this actually happen over the
    /// wire: receive the RPC from the network, invoke this method, return
    /// the response.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn append_entries(&self, rpc: AppendRequest) -> Result<AppendResponse, CongressError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(ApiMessage::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a ballot request to this node.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn ballot(&self, rpc: BallotRequest) -> Result<BallotResponse, CongressError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(ApiMessage::Ballot { rpc, tx }, rx).await
    }

    /// Submit a client command to be replicated and applied.
    ///
    /// The future resolves once the command has been committed by a majority
    /// of voters and applied on this node, carrying the apply callback's
    /// response. Non-leaders reject with `SubmitError::NotLeader` carrying a
    /// leader hint when one is known, with `SubmitError::Electing` when no
    /// leader is currently known, or with `SubmitError::NotInCongress` when
    /// this node is not a voting member at all.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn submit(&self, rpc: ClientCommand) -> Result<SubmitResponse, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(ApiMessage::Submit { rpc, tx }, rx).await
    }

    /// Submit a session-adjudication record through the replication pipeline.
    ///
    /// Adjudications are committed and applied exactly like client commands;
    /// the redirection policy resulting from the record is enacted by the
    /// apply callback on every node.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn adjudicate(&self, rpc: Adjudicate) -> Result<SubmitResponse, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(ApiMessage::Adjudicate { rpc, tx }, rx).await
    }

    /// Initialize a pristine congress node with the given topology.
    ///
    /// Only allowed when the node has an empty log and is at term 0,
    /// otherwise an `InitializeError::NotAllowed` is returned. The node
    /// writes the initial topology entry and immediately stands for
    /// election (or, for a single-voter topology, becomes leader outright).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, topology: Topology) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(ApiMessage::Initialize { topology, tx }, rx).await
    }

    /// Propose a new cluster topology, leader only.
    ///
    /// The proposed topology must differ from the current one by exactly one
    /// node, voters and gates counted alike. The change is replicated
    /// through the log; the future resolves once the topology entry is
    /// committed. If the change removes this node from the voter set, the
    /// leader steps down to learner after commit.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_topology(&self, topology: Topology) -> Result<(), ChangeTopologyError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(ApiMessage::ChangeTopology { topology, tx }, rx).await
    }

    /// Add a non-voting gateway peer, leader only.
    ///
    /// A convenience over `change_topology` which adds `id` to the gate set
    /// of the current topology. Gates receive replication but never count
    /// toward quorum and never stand for election.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn add_gate(&self, id: NodeId) -> Result<(), ChangeTopologyError> {
        let mut topology = self.inner.rx_metrics.borrow().topology.clone();
        if !topology.gates.insert(id) {
            return Err(ChangeTopologyError::Noop);
        }
        self.change_topology(topology).await
    }

    /// Invoke an API message on the core and await its response.
    async fn call_core<T, E>(&self, msg: ApiMessage, rx: oneshot::Receiver<Result<T, E>>) -> Result<T, E>
    where E: From<CongressError> {
        let span = tracing::Span::current();
        let send_res = span.in_scope(|| self.inner.tx_api.send(msg));
        if send_res.is_err() {
            return Err(CongressError::ShuttingDown.into());
        }
        rx.await.map_err(|_| <E as From<CongressError>>::from(CongressError::ShuttingDown))?
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<CongressMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// If `timeout` is none, a default of 500 ms is used.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this congress node and wait for the core task to exit.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<N: CongressNetwork, S: LogStore> Clone for Congress<N, S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

pub(crate) type RespTx<T, E> = oneshot::Sender<Result<T, E>>;

/// A message sent into the congress core by the public API.
pub(crate) enum ApiMessage {
    AppendEntries {
        rpc: AppendRequest,
        tx: RespTx<AppendResponse, CongressError>,
    },
    Ballot {
        rpc: BallotRequest,
        tx: RespTx<BallotResponse, CongressError>,
    },
    Submit {
        rpc: ClientCommand,
        tx: RespTx<SubmitResponse, SubmitError>,
    },
    Adjudicate {
        rpc: Adjudicate,
        tx: RespTx<SubmitResponse, SubmitError>,
    },
    Initialize {
        topology: Topology,
        tx: RespTx<(), InitializeError>,
    },
    ChangeTopology {
        topology: Topology,
        tx: RespTx<(), ChangeTopologyError>,
    },
}
