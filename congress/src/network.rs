//! The `CongressNetwork` interface used by the engine to send RPCs to peers.

use anyhow::Result;
use async_trait::async_trait;

use crate::message::AppendRequest;
use crate::message::AppendResponse;
use crate::message::BallotRequest;
use crate::message::BallotResponse;
use crate::NodeId;

/// A trait defining the interface for the network layer of a congress node.
///
/// Implementations own transport, serialization and routing. A returned
/// error is treated as a dropped message: the engine retries on its next
/// timer cadence rather than reasoning about the cause.
#[async_trait]
pub trait CongressNetwork: Send + Sync + 'static {
    /// Send an append RPC to the target node.
    async fn send_append(&self, target: NodeId, rpc: AppendRequest) -> Result<AppendResponse>;

    /// Send a ballot request to the target node.
    async fn send_ballot(&self, target: NodeId, rpc: BallotRequest) -> Result<BallotResponse>;
}
