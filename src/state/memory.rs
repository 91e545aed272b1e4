//! In-process store

use super::{TxStateStats, TxStateStore};
use crate::error::L1TxResult;
use crate::tx::TxState;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;

/// Keeps serialized states in memory.
///
/// Clones share the same records, so a "restarted" manager built from a
/// clone sees everything the previous one saved. Records are stored as JSON
/// to exercise the same encoding as the database store.
#[derive(Clone, Default)]
pub struct MemoryTxStateStore {
    records: Arc<DashMap<(Address, u64), String>>,
}

impl MemoryTxStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TxStateStore for MemoryTxStateStore {
    async fn save_state(&self, state: &TxState) -> L1TxResult<()> {
        let json = serde_json::to_string(state)?;
        self.records.insert((state.account, state.nonce), json);
        Ok(())
    }

    async fn load_state(&self, account: Address, nonce: u64) -> L1TxResult<Option<TxState>> {
        match self.records.get(&(account, nonce)) {
            Some(json) => Ok(Some(serde_json::from_str(json.value())?)),
            None => Ok(None),
        }
    }

    async fn load_pending_states(&self, account: Address) -> L1TxResult<Vec<TxState>> {
        let mut states = Vec::new();
        for entry in self.records.iter() {
            if entry.key().0 != account {
                continue;
            }
            let state: TxState = serde_json::from_str(entry.value())?;
            if !state.is_terminal() {
                states.push(state);
            }
        }
        states.sort_by_key(|s| s.nonce);
        Ok(states)
    }

    async fn delete_state(&self, account: Address, nonce: u64) -> L1TxResult<()> {
        self.records.remove(&(account, nonce));
        Ok(())
    }

    async fn stats(&self, account: Address) -> L1TxResult<TxStateStats> {
        let mut stats = TxStateStats::default();
        for entry in self.records.iter().filter(|e| e.key().0 == account) {
            let state: TxState = serde_json::from_str(entry.value())?;
            stats.record(state.status);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> L1TxResult<()> {
        Ok(())
    }
}
