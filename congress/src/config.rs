//! Congress runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default maximum number of entries per replication payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default minimum log size before compaction becomes eligible (in entries).
pub const DEFAULT_SNAPSHOT_MIN_SIZE: u64 = 5000;
/// Default maximum snapshot fragment size (in bytes).
pub const DEFAULT_SNAPSHOT_FRAGMENT_MAX_SIZE: u64 = 1024 * 1024 * 3;

/// The runtime configuration for a congress node.
///
/// The election timeout range and the heartbeat interval must satisfy
/// `heartbeat_interval < election_timeout_min < election_timeout_max` so that
/// a live leader always asserts itself before any follower times out, and so
/// that the randomized timeouts keep split votes unlikely.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this cluster.
    ///
    /// This does not influence the protocol in any way, but is useful for observability.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The interval in milliseconds at which leaders send heartbeats to followers.
    ///
    /// This value is also used as the timeout for sending a replication payload.
    pub heartbeat_interval: u64,
    /// The maximum number of entries per payload allowed to be transmitted during replication.
    pub max_payload_entries: u64,
    /// The minimum number of applied entries before log compaction becomes eligible.
    ///
    /// Compaction itself is performed by the storage layer; this is only the trigger threshold.
    pub snapshot_min_size: u64,
    /// The maximum fragment size (in bytes) when a snapshot is transferred.
    pub snapshot_fragment_max_size: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            snapshot_min_size: None,
            snapshot_fragment_max_size: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBuilder {
    /// The application specific name of this cluster.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: Option<u64>,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: Option<u64>,
    /// The interval at which leaders send heartbeats to avoid election timeout.
    pub heartbeat_interval: Option<u64>,
    /// The maximum number of entries per replication payload.
    pub max_payload_entries: Option<u64>,
    /// The compaction eligibility threshold.
    pub snapshot_min_size: Option<u64>,
    /// The maximum snapshot fragment size.
    pub snapshot_fragment_max_size: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_payload_entries`.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the desired value for `snapshot_min_size`.
    pub fn snapshot_min_size(mut self, val: u64) -> Self {
        self.snapshot_min_size = Some(val);
        self
    }

    /// Set the desired value for `snapshot_fragment_max_size`.
    pub fn snapshot_fragment_max_size(mut self, val: u64) -> Self {
        self.snapshot_fragment_max_size = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval == 0 || heartbeat_interval >= election_timeout_min {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        let snapshot_min_size = self.snapshot_min_size.unwrap_or(DEFAULT_SNAPSHOT_MIN_SIZE);
        let snapshot_fragment_max_size = self.snapshot_fragment_max_size.unwrap_or(DEFAULT_SNAPSHOT_FRAGMENT_MAX_SIZE);
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            max_payload_entries,
            snapshot_min_size,
            snapshot_fragment_max_size,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
