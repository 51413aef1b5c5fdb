//! Congress metrics, observed through a `watch` channel.
//!
//! The core publishes a new snapshot on every material state change. Metrics
//! are how applications observe role changes, leadership, and replication
//! progress, and they are the synchronization primitive of the test suite
//! through the [`Wait`] helper.

mod wait;

pub use wait::Wait;
pub use wait::WaitError;

use serde::Deserialize;
use serde::Serialize;

use crate::core::Role;
use crate::message::Topology;
use crate::NodeId;

/// A set of metrics describing the current state of a congress node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CongressMetrics {
    /// The id of the node.
    pub id: NodeId,
    /// The role of the node.
    pub role: Role,
    /// The current term of the node.
    pub current_term: u64,
    /// The last log index of the node.
    pub last_log_index: u64,
    /// The last log index applied to the state machine.
    pub last_applied: u64,
    /// The highest log index known to be committed.
    pub commit: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<NodeId>,
    /// The current cluster topology of the node.
    pub topology: Topology,
}

impl CongressMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            commit: 0,
            current_leader: None,
            topology: Topology::default(),
        }
    }
}
