//! Chain module - the RPC and signing collaborators the manager depends on
//!
//! The manager never talks to a concrete client. It is written against three
//! narrow capabilities:
//! - [`GasOracle`]: fee market and gas estimation
//! - [`TxBroadcaster`]: raw submission and nonce counts
//! - [`ChainReader`]: blocks, transactions, receipts and simulation
//!
//! [`EthersClient`] implements all three over JSON-RPC with failover, and
//! [`WalletSigner`] signs with a local key.

pub mod provider;
pub mod signer;
pub mod types;

pub use provider::EthersClient;
pub use signer::WalletSigner;
pub use types::{
    AccountOverride, BlockOverrides, BlockTag, CallRequest, GasSuggestion, L1Block, L1Receipt,
    L1Transaction, ReceiptStatus, SignedTx, StateOverrides, UnsignedTx,
};

use crate::error::{L1TxResult, NodeError};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Attempts made by [`retry_transient`] before giving up
pub const TRANSIENT_RETRIES: u32 = 3;
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(100);

/// Fee market and gas estimation
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GasOracle: Send + Sync {
    async fn estimate_gas(
        &self,
        call: &CallRequest,
        block_overrides: Option<BlockOverrides>,
    ) -> Result<U256, NodeError>;

    async fn gas_price_suggestion(&self) -> Result<GasSuggestion, NodeError>;
}

/// Raw transaction submission
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TxBroadcaster: Send + Sync {
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, NodeError>;

    async fn transaction_count(&self, account: Address, tag: BlockTag) -> Result<u64, NodeError>;
}

/// Read access to chain state
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn block_number(&self) -> Result<u64, NodeError>;

    async fn get_block(&self, tag: BlockTag) -> Result<Option<L1Block>, NodeError>;

    async fn get_transaction(&self, hash: H256) -> Result<Option<L1Transaction>, NodeError>;

    async fn get_transaction_receipt(&self, hash: H256) -> Result<Option<L1Receipt>, NodeError>;

    /// `eth_call` with optional overrides, returning the call output
    async fn call(
        &self,
        call: &CallRequest,
        block_overrides: Option<BlockOverrides>,
        state_overrides: Option<StateOverrides>,
    ) -> Result<Bytes, NodeError>;
}

/// Everything the manager needs from a node
pub trait L1Client: GasOracle + TxBroadcaster + ChainReader {}

impl<T: GasOracle + TxBroadcaster + ChainReader + ?Sized> L1Client for T {}

/// Signs transactions for a single account
#[async_trait]
pub trait TxSigner: Send + Sync {
    fn address(&self) -> Address;

    fn chain_id(&self) -> u64;

    async fn sign_transaction(&self, tx: &UnsignedTx) -> L1TxResult<SignedTx>;
}

/// Run `op`, retrying transport failures with doubling backoff.
///
/// Non-transient errors return immediately.
pub async fn retry_transient<T, F, Fut>(what: &str, mut op: F) -> Result<T, NodeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NodeError>>,
{
    let mut delay = TRANSIENT_BACKOFF;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < TRANSIENT_RETRIES => {
                debug!(
                    "{} failed (attempt {}/{}): {}",
                    what, attempt, TRANSIENT_RETRIES, e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
