//! Transaction lifecycle data model

use crate::chain::{CallRequest, L1Receipt};
use crate::config::TxConfigOverrides;
use crate::error::{L1TxError, L1TxResult};

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Size of one blob in bytes (4096 field elements of 32 bytes)
pub const BLOB_SIZE: usize = 131_072;
/// Size of a KZG commitment or proof
pub const KZG_ITEM_SIZE: usize = 48;
pub const VERSIONED_HASH_VERSION_KZG: u8 = 0x01;

/// Blob payload with the caller-supplied KZG material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInputs {
    pub blobs: Vec<Bytes>,
    pub kzg_commitments: Vec<Bytes>,
    pub kzg_proofs: Vec<Bytes>,
    /// Explicit `maxFeePerBlobGas` for the first attempt
    pub max_fee_per_blob_gas: Option<U256>,
}

impl BlobInputs {
    pub fn validate(&self) -> L1TxResult<()> {
        if self.blobs.is_empty() {
            return Err(L1TxError::InvalidBlobInputs("no blobs".into()));
        }
        if self.blobs.len() != self.kzg_commitments.len()
            || self.blobs.len() != self.kzg_proofs.len()
        {
            return Err(L1TxError::InvalidBlobInputs(format!(
                "{} blobs, {} commitments, {} proofs",
                self.blobs.len(),
                self.kzg_commitments.len(),
                self.kzg_proofs.len()
            )));
        }
        if let Some(blob) = self.blobs.iter().find(|b| b.len() != BLOB_SIZE) {
            return Err(L1TxError::InvalidBlobInputs(format!(
                "blob of {} bytes, expected {}",
                blob.len(),
                BLOB_SIZE
            )));
        }
        let bad_kzg = self
            .kzg_commitments
            .iter()
            .chain(self.kzg_proofs.iter())
            .any(|item| item.len() != KZG_ITEM_SIZE);
        if bad_kzg {
            return Err(L1TxError::InvalidBlobInputs(format!(
                "commitments and proofs must be {} bytes",
                KZG_ITEM_SIZE
            )));
        }
        Ok(())
    }

    /// `0x01 || sha256(commitment)[1..]` for every commitment
    pub fn versioned_hashes(&self) -> Vec<H256> {
        self.kzg_commitments
            .iter()
            .map(|commitment| {
                let mut hash: [u8; 32] = Sha256::digest(commitment.as_ref()).into();
                hash[0] = VERSIONED_HASH_VERSION_KZG;
                H256::from(hash)
            })
            .collect()
    }
}

/// What the caller wants sent. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub blobs: Option<BlobInputs>,
}

impl TxRequest {
    pub fn new(to: Address) -> Self {
        Self {
            to,
            data: Bytes::default(),
            value: U256::zero(),
            blobs: None,
        }
    }

    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn value(mut self, value: impl Into<U256>) -> Self {
        self.value = value.into();
        self
    }

    pub fn blobs(mut self, blobs: BlobInputs) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn is_blob(&self) -> bool {
        self.blobs.is_some()
    }

    pub fn to_call(&self, from: Address) -> CallRequest {
        CallRequest {
            from: Some(from),
            to: self.to,
            data: self.data.clone(),
            value: self.value,
            gas: None,
            blob_versioned_hashes: self
                .blobs
                .as_ref()
                .map(|b| b.versioned_hashes())
                .unwrap_or_default(),
            max_fee_per_blob_gas: None,
        }
    }
}

/// Fee parameters of one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasPrice {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_blob_gas: Option<U256>,
}

/// Caller-forced fee fields for the first attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceOverrides {
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub max_fee_per_blob_gas: Option<U256>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Idle,
    Sent,
    SpeedUp,
    Cancelled,
    Mined,
    NotMined,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Mined | TxStatus::NotMined)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Idle => "idle",
            TxStatus::Sent => "sent",
            TxStatus::SpeedUp => "speed_up",
            TxStatus::Cancelled => "cancelled",
            TxStatus::Mined => "mined",
            TxStatus::NotMined => "not_mined",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = L1TxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TxStatus::Idle),
            "sent" => Ok(TxStatus::Sent),
            "speed_up" => Ok(TxStatus::SpeedUp),
            "cancelled" => Ok(TxStatus::Cancelled),
            "mined" => Ok(TxStatus::Mined),
            "not_mined" => Ok(TxStatus::NotMined),
            other => Err(L1TxError::Internal(format!("unknown tx status {}", other))),
        }
    }
}

/// Lifecycle record of one logical transaction, keyed by account nonce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxState {
    pub account: Address,
    pub nonce: u64,
    pub request: TxRequest,
    pub gas_limit: U256,
    /// Original first, then speed-ups in submission order
    pub tx_hashes: Vec<H256>,
    pub cancel_tx_hashes: Vec<H256>,
    /// Price of the latest attempt, original or cancellation
    pub gas_price: GasPrice,
    pub status: TxStatus,
    pub sent_at: DateTime<Utc>,
    pub last_sent_at: DateTime<Utc>,
    /// Chain head when the latest attempt went out
    pub last_sent_block: u64,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Last time any tracked hash was visible to the node
    pub last_seen_at: Option<DateTime<Utc>>,
    pub config_overrides: TxConfigOverrides,
    pub receipt: Option<L1Receipt>,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Replacements sent for the original request
    pub fn speed_up_attempts(&self) -> u32 {
        self.tx_hashes.len().saturating_sub(1) as u32
    }

    /// Replacements sent for the cancellation
    pub fn cancel_speed_up_attempts(&self) -> u32 {
        self.cancel_tx_hashes.len().saturating_sub(1) as u32
    }

    /// Hashes that can currently resolve this nonce, newest first
    pub fn all_hashes(&self) -> impl Iterator<Item = &H256> {
        self.cancel_tx_hashes
            .iter()
            .rev()
            .chain(self.tx_hashes.iter().rev())
    }

    pub fn owns_hash(&self, hash: &H256) -> bool {
        self.tx_hashes.contains(hash) || self.cancel_tx_hashes.contains(hash)
    }
}
