//! An in-memory implementation of the `congress::LogStore` trait.
//!
//! Used as the reference store for the integration suite. The state machine
//! records every applied entry, tracks the last applied serial per client,
//! and answers a command by echoing its payload, which is enough to assert
//! ordering, exactly-once apply and duplicate detection from tests.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use congress::message::Entry;
use congress::message::EntryPayload;
use congress::storage::HardState;
use congress::storage::InitialState;
use congress::storage::LogMeta;
use congress::LogStore;
use congress::NodeId;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// The state machine of the `MemLog`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MemLogStateMachine {
    /// Every entry applied, in apply order.
    pub applied: Vec<Entry>,
    /// The last applied submission serial per client, for duplicate detection.
    pub client_serials: BTreeMap<u64, u32>,
}

/// An in-memory log store.
pub struct MemLog {
    /// The id of the node this store serves.
    id: NodeId,
    /// The congress log.
    log: RwLock<BTreeMap<u64, Entry>>,
    /// The node's hard state.
    hs: RwLock<Option<HardState>>,
    /// The node's durable commit and applied marks.
    meta: RwLock<Option<LogMeta>>,
    /// The state machine.
    sm: RwLock<MemLogStateMachine>,
}

impl MemLog {
    /// Create a new `MemLog` instance.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            hs: RwLock::new(None),
            meta: RwLock::new(None),
            sm: RwLock::new(MemLogStateMachine::default()),
        }
    }

    /// Create a new `MemLog` seeded with the given log and state, for
    /// exercising restart behavior.
    pub fn new_with_state(id: NodeId, log: BTreeMap<u64, Entry>, hs: HardState, meta: LogMeta, sm: MemLogStateMachine) -> Self {
        Self {
            id,
            log: RwLock::new(log),
            hs: RwLock::new(Some(hs)),
            meta: RwLock::new(Some(meta)),
            sm: RwLock::new(sm),
        }
    }

    /// Get a full copy of the current log, for test assertions.
    pub async fn get_log(&self) -> BTreeMap<u64, Entry> {
        self.log.read().await.clone()
    }

    /// Get a full copy of the current state machine, for test assertions.
    pub async fn get_state_machine(&self) -> MemLogStateMachine {
        self.sm.read().await.clone()
    }

    /// Get the node's persisted hard state, for test assertions.
    pub async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }

    /// Get the node's persisted commit and applied marks, for test assertions.
    pub async fn read_log_meta(&self) -> Option<LogMeta> {
        *self.meta.read().await
    }
}

#[async_trait]
impl LogStore for MemLog {
    #[tracing::instrument(level = "trace", skip(self), fields(id=self.id))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let mut hs = self.hs.write().await;
        let log = self.log.read().await;
        let meta = self.meta.read().await;
        match &mut *hs {
            Some(inner) => {
                let last_log_id = log.values().next_back().map(|entry| entry.log_id).unwrap_or_default();
                let topology = log.values().rev().find_map(|entry| match &entry.payload {
                    EntryPayload::Topology(topology) => Some(topology.clone()),
                    _ => None,
                });
                Ok(InitialState {
                    last_log_id,
                    hard_state: inner.clone(),
                    meta: meta.unwrap_or_default(),
                    topology,
                })
            }
            None => {
                let new = InitialState::new_initial();
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, hs), fields(id=self.id))]
    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hs.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, meta), fields(id=self.id))]
    async fn save_log_meta(&self, meta: &LogMeta) -> Result<()> {
        *self.meta.write().await = Some(*meta);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self), fields(id=self.id))]
    async fn get_log_entries(&self, start: u64, stop: u64) -> Result<Vec<Entry>> {
        if start > stop {
            tracing::error!({start, stop}, "invalid request to get_log_entries");
            return Ok(vec![]);
        }
        let log = self.log.read().await;
        Ok(log.range(start..stop).map(|(_, entry)| entry.clone()).collect())
    }

    #[tracing::instrument(level = "trace", skip(self), fields(id=self.id))]
    async fn try_get_log_entry(&self, index: u64) -> Result<Option<Entry>> {
        let log = self.log.read().await;
        Ok(log.get(&index).cloned())
    }

    #[tracing::instrument(level = "trace", skip(self), fields(id=self.id))]
    async fn delete_logs_from(&self, start: u64) -> Result<()> {
        let mut log = self.log.write().await;
        log.split_off(&start);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries), fields(id=self.id))]
    async fn append_to_log(&self, entries: &[&Entry]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entry), fields(id=self.id, index=entry.log_id.index))]
    async fn apply_to_state_machine(&self, entry: &Entry) -> Result<Vec<u8>> {
        let mut sm = self.sm.write().await;
        let response = match &entry.payload {
            EntryPayload::Command(cmd) => {
                // A serial at or below the last applied one for this client
                // is a duplicate delivery and must not take effect again.
                let duplicate = sm.client_serials.get(&cmd.client).map(|last| cmd.serial <= *last).unwrap_or(false);
                if duplicate {
                    tracing::debug!({client=cmd.client, serial=cmd.serial}, "skipping duplicate command delivery");
                    return Ok(Vec::new());
                }
                sm.client_serials.insert(cmd.client, cmd.serial);
                cmd.payload.clone()
            }
            _ => Vec::new(),
        };
        sm.applied.push(entry.clone());
        Ok(response)
    }
}
