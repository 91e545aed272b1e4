//! Persistence of in-flight transaction states
//!
//! Every checkpoint overwrites the full [`TxState`] record for its
//! `(account, nonce)`. Resumption loads the records that are not terminal.
//!
//! Two stores are provided:
//! - [`MemoryTxStateStore`]: process-local, for tests and ephemeral nodes
//! - [`PgTxStateStore`]: PostgreSQL, one JSONB row per nonce

mod memory;
mod postgres;

pub use memory::MemoryTxStateStore;
pub use postgres::PgTxStateStore;

use crate::error::L1TxResult;
use crate::tx::{TxState, TxStatus};

use async_trait::async_trait;
use ethers::types::Address;
use serde::Serialize;

/// Durable key-value record of transaction states, keyed by `(account, nonce)`
#[async_trait]
pub trait TxStateStore: Send + Sync {
    /// Insert or overwrite the record for `state.account` / `state.nonce`
    async fn save_state(&self, state: &TxState) -> L1TxResult<()>;

    async fn load_state(&self, account: Address, nonce: u64) -> L1TxResult<Option<TxState>>;

    /// Non-terminal states for `account`, ordered by nonce
    async fn load_pending_states(&self, account: Address) -> L1TxResult<Vec<TxState>>;

    async fn delete_state(&self, account: Address, nonce: u64) -> L1TxResult<()>;

    /// Count of stored records per status for `account`
    async fn stats(&self, account: Address) -> L1TxResult<TxStateStats>;

    async fn health_check(&self) -> L1TxResult<()>;
}

/// Stored record counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TxStateStats {
    /// `sent` and `speed_up`
    pub pending: u64,
    pub cancelled: u64,
    pub mined: u64,
    pub not_mined: u64,
}

impl TxStateStats {
    pub fn record(&mut self, status: TxStatus) {
        match status {
            TxStatus::Sent | TxStatus::SpeedUp => self.pending += 1,
            TxStatus::Cancelled => self.cancelled += 1,
            TxStatus::Mined => self.mined += 1,
            TxStatus::NotMined => self.not_mined += 1,
            TxStatus::Idle => {}
        }
    }
}
