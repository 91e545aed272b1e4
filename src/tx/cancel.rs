//! Cancellation of a stuck nonce
//!
//! A cancellation is a zero-value, empty-data transfer to the sending account
//! at the stuck nonce, priced strictly above the latest attempt. Blob
//! transactions are cancelled with a blob transaction carrying the same
//! sidecar, since mempools do not reliably accept a plain transaction as the
//! replacement of a blob one.

use super::sender::TransactionSender;
use super::types::{TxRequest, TxState, TxStatus};
use crate::error::{L1TxError, L1TxResult};
use crate::metrics;

use ethers::types::{Bytes, H256, U256};
use tracing::info;

/// Intrinsic gas of a plain value transfer
pub const CANCELLATION_GAS_LIMIT: u64 = 21_000;

/// The self-transfer that replaces `state`'s transaction
pub fn cancellation_request(state: &TxState) -> TxRequest {
    TxRequest {
        to: state.account,
        data: Bytes::default(),
        value: U256::zero(),
        blobs: state.request.blobs.clone(),
    }
}

impl TransactionSender {
    /// Abandon the transaction in `state` by replacing it with a cancellation
    pub async fn cancel(&self, state: &mut TxState, head: u64) -> L1TxResult<H256> {
        if state.is_terminal() || state.status == TxStatus::Cancelled {
            return Err(L1TxError::Internal(format!(
                "cannot cancel nonce {} in status {}",
                state.nonce, state.status
            )));
        }
        let tx_hash = self.send_cancellation(state, head).await?;
        state.status = TxStatus::Cancelled;
        state.cancelled_at = Some(state.last_sent_at);

        info!(
            "Cancelling nonce {} with {:?} (replacing {:?})",
            state.nonce,
            tx_hash,
            state.tx_hashes.last()
        );
        metrics::record_tx_sent("cancellation");
        Ok(tx_hash)
    }

    /// Re-price a stalled cancellation
    pub async fn speed_up_cancellation(&self, state: &mut TxState, head: u64) -> L1TxResult<H256> {
        if state.status != TxStatus::Cancelled {
            return Err(L1TxError::Internal(format!(
                "nonce {} has no cancellation to speed up (status {})",
                state.nonce, state.status
            )));
        }
        let tx_hash = self.send_cancellation(state, head).await?;

        info!(
            "Sped up cancellation of nonce {} with {:?} (attempt {})",
            state.nonce,
            tx_hash,
            state.cancel_speed_up_attempts()
        );
        metrics::record_tx_sent("cancellation_speed_up");
        Ok(tx_hash)
    }

    async fn send_cancellation(&self, state: &mut TxState, head: u64) -> L1TxResult<H256> {
        let price = self.replacement_price(state).await?;
        let request = cancellation_request(state);
        let unsigned = self.build_tx(
            state.nonce,
            &request,
            U256::from(CANCELLATION_GAS_LIMIT),
            &price,
        )?;
        let tx_hash = self.broadcast(&unsigned).await?;

        state.cancel_tx_hashes.push(tx_hash);
        state.gas_price = price;
        state.last_sent_at = self.now();
        state.last_sent_block = head;
        metrics::record_gas_price(&state.gas_price);
        Ok(tx_hash)
    }
}
