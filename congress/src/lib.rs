//! A cluster consensus engine: term-based leader election, log replication
//! with majority acknowledgment, and an exactly-once in-order apply pipeline.
//!
//! Applications bring three things: a [`LogStore`](crate::storage::LogStore)
//! implementation for the durable log and the apply callback, a
//! [`CongressNetwork`](crate::network::CongressNetwork) implementation for
//! the RPC transport, and a validated [`Config`](crate::config::Config).
//! The [`Congress`] handle spawns the node and is the only interface to it.

pub mod config;
mod congress;
mod core;
pub mod error;
pub mod message;
pub mod metrics;
pub mod network;
pub mod storage;
mod replication;
mod summary;
mod types;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::congress::Congress;
pub use crate::core::Role;
pub use crate::error::ChangeTopologyError;
pub use crate::error::CongressError;
pub use crate::error::CongressResult;
pub use crate::error::ConfigError;
pub use crate::error::InitializeError;
pub use crate::error::SubmitError;
pub use crate::metrics::CongressMetrics;
pub use crate::network::CongressNetwork;
pub use crate::storage::LogStore;
pub use crate::summary::MessageSummary;
pub use crate::types::LogId;
pub use crate::types::NodeId;
