//! Transaction lifecycle: pricing, submission, monitoring and cancellation

mod cancel;
mod estimator;
mod gas;
mod manager;
mod monitor;
mod nonce;
mod sender;
mod types;

pub use cancel::{cancellation_request, CANCELLATION_GAS_LIMIT};
pub use estimator::{apply_buffer, decode_revert, GasEstimator};
pub use gas::{bump_by_percentage, gwei, GasPriceCalculator, WEI_PER_GWEI};
pub use manager::{L1TxManager, SentTx};
pub use monitor::FOREIGN_TX_SCAN_DEPTH;
pub use nonce::NonceManager;
pub use sender::{SendOptions, TransactionSender};
pub use types::{
    BlobInputs, GasPrice, PriceOverrides, TxRequest, TxState, TxStatus, BLOB_SIZE,
    KZG_ITEM_SIZE, VERSIONED_HASH_VERSION_KZG,
};
