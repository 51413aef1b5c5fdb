//! Error types exposed by this crate.

use thiserror::Error;

use crate::NodeId;

/// A result type where the error variant is always a `CongressError`.
pub type CongressResult<T> = std::result::Result<T, CongressError>;

/// Error variants related to the internals of the congress engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CongressError {
    /// An error which has come from the storage layer.
    #[error("{0}")]
    Storage(anyhow::Error),
    /// The node is shutting down.
    #[error("the congress node is shutting down")]
    ShuttingDown,
}

/// An error related to a client submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// This node is not the leader; commands must be forwarded to the given node, if known.
    #[error("this node is not the congress leader")]
    NotLeader {
        /// The id of the current leader, if known.
        leader_hint: Option<NodeId>,
    },
    /// This node is not a voting member of the congress and can not accept commands.
    #[error("not in congress")]
    NotInCongress,
    /// An election is in progress and no leader is currently known.
    #[error("electing")]
    Electing,
    /// An internal engine error.
    #[error("{0}")]
    Congress(#[from] CongressError),
}

/// The set of errors which may take place when initializing a pristine congress node.
#[derive(Debug, Error)]
pub enum InitializeError {
    /// An internal engine error.
    #[error("{0}")]
    Congress(#[from] CongressError),
    /// The requested action is not allowed due to the node's current state.
    #[error("the requested action is not allowed due to the node's current state")]
    NotAllowed,
}

/// The set of errors which may take place when requesting to change the cluster topology.
#[derive(Debug, Error)]
pub enum ChangeTopologyError {
    /// An internal engine error.
    #[error("{0}")]
    Congress(#[from] CongressError),
    /// A topology change is already in progress.
    #[error("topology change in progress, entry {0} has not yet been committed")]
    InProgress(u64),
    /// The proposed topology is not usable.
    #[error("the proposed topology is not usable: {0}")]
    InoperableTopology(String),
    /// The node is not the leader; topology changes must go to the given node, if known.
    #[error("this node is not the congress leader")]
    NodeNotLeader(Option<NodeId>),
    /// The proposed change differs from the current topology by more than one node.
    #[error("the proposed topology changes more than one node at a time")]
    TooManyChanges,
    /// The proposed topology is identical to the current one.
    #[error("the proposed topology would leave the cluster unchanged")]
    Noop,
}

/// Error variants related to configuration.
#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The min & max election timeout values are invalid, min must be strictly less than max.
    #[error("given values for election timeout min & max are invalid, min must be strictly less than max")]
    InvalidElectionTimeoutMinMax,
    /// The heartbeat interval must be non-zero and strictly less than the election timeout minimum.
    #[error("heartbeat interval must be non-zero and strictly less than election timeout min")]
    InvalidHeartbeatInterval,
    /// The value for `max_payload_entries` is too small, must be greater than 0.
    #[error("the value for max_payload_entries is too small, must be greater than 0")]
    MaxPayloadEntriesTooSmall,
}
