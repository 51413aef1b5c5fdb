//! The `LogStore` interface used by the congress engine to persist its data.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::message::Entry;
use crate::message::Topology;
use crate::LogId;
use crate::NodeId;

/// The term and ballot record a node must persist before it takes effect.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HardState {
    /// The last recorded term observed by this node.
    pub current_term: u64,
    /// The id of the node voted for in `current_term`.
    pub voted_for: Option<NodeId>,
}

/// The durable commit and applied marks, persisted so a restart can resume
/// the apply pipeline from where it left off.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct LogMeta {
    /// The highest log index known to be committed.
    pub commit: u64,
    /// The highest log index applied to the state machine.
    pub applied: u64,
}

/// A struct used to represent the initial state which a node comes online with.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The id of the last entry in the node's log.
    pub last_log_id: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The saved commit and applied marks.
    pub meta: LogMeta,
    /// The latest cluster topology found in the log, if any.
    pub topology: Option<Topology>,
}

impl InitialState {
    /// Create an initial state for a pristine node.
    pub fn new_initial() -> Self {
        Self {
            last_log_id: LogId::default(),
            hard_state: HardState::default(),
            meta: LogMeta::default(),
            topology: None,
        }
    }
}

/// A trait defining the interface for a congress storage system.
///
/// `append_to_log` and `save_hard_state` must be durable once they return.
/// Any error returned from a method of this trait causes the node to shut
/// down rather than continue on unpersisted data.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Get the latest state which the node previously persisted, or a
    /// pristine default when the node has never run before.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save the node's hard state. Must be durable before returning.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Save the commit and applied marks.
    async fn save_log_meta(&self, meta: &LogMeta) -> Result<()>;

    /// Get a series of log entries from storage, `start` inclusive.
    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry>>;

    /// Get a single log entry by index, if present.
    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry>>;

    /// Delete all logs starting from `start`, inclusive, through the end of the log.
    ///
    /// Used to roll back an uncommitted tail that conflicts with the leader's log.
    async fn delete_logs_from(&self, start: u64) -> Result<()>;

    /// Append a payload of entries to the log. Must be durable before returning.
    async fn append_to_log(&self, entries: &[&Entry]) -> Result<()>;

    /// Apply one committed entry to the state machine, returning the
    /// response bytes to surface to the submitter.
    ///
    /// Called exactly once per entry, strictly in index order. Errors here
    /// are treated as fatal.
    async fn apply_to_state_machine(&self, entry: &Entry) -> Result<Vec<u8>>;
}
