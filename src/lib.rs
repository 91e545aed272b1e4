//! L1 transaction lifecycle manager
//!
//! Submits EIP-1559 and EIP-4844 transactions from a single account and drives
//! each nonce to a terminal outcome: mined, replaced by a cancellation, or
//! abandoned. Stalled transactions are re-priced, timed-out ones are cancelled
//! with a same-nonce self-transfer, and every state change is checkpointed so
//! monitoring resumes after a restart.

pub mod api;
pub mod chain;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod state;
pub mod tx;

pub use config::{L1TxConfig, Settings, TxConfigOverrides};
pub use error::{L1TxError, L1TxResult, NodeError, NodeErrorKind, TimeoutReason};
pub use tx::{L1TxManager, SendOptions, SentTx, TxRequest, TxState, TxStatus};
