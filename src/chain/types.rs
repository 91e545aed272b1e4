//! Chain-facing data types exchanged with the RPC collaborator

use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::tx::BlobInputs;

/// Block selector for reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
    Number(u64),
}

impl BlockTag {
    /// JSON-RPC representation
    pub fn as_rpc(&self) -> String {
        match self {
            BlockTag::Latest => "latest".to_string(),
            BlockTag::Pending => "pending".to_string(),
            BlockTag::Number(n) => format!("0x{:x}", n),
        }
    }
}

/// Fee market snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasSuggestion {
    pub base_fee: U256,
    pub priority_fee: U256,
    /// Only reported by nodes past the blob fork
    pub blob_base_fee: Option<U256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L1Receipt {
    pub transaction_hash: H256,
    pub block_number: u64,
    pub block_hash: Option<H256>,
    pub status: ReceiptStatus,
    pub from: Address,
    pub to: Option<Address>,
    pub gas_used: U256,
    pub effective_gas_price: U256,
    pub blob_gas_used: Option<U256>,
}

impl L1Receipt {
    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}

/// A transaction as reported by the node, pending or mined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L1Transaction {
    pub hash: H256,
    pub from: Address,
    pub nonce: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub max_fee_per_blob_gas: Option<U256>,
    pub blob_versioned_hashes: Vec<H256>,
    /// `None` while pending
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L1Block {
    pub number: u64,
    pub timestamp: u64,
    pub base_fee_per_gas: U256,
    pub gas_limit: U256,
    pub transactions: Vec<L1Transaction>,
}

/// Call description for estimation and simulation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<U256>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blob_versioned_hashes: Vec<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fee_per_blob_gas: Option<U256>,
}

/// Overrides applied to the simulated block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_fee: Option<U256>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_diff: Option<BTreeMap<H256, H256>>,
}

pub type StateOverrides = BTreeMap<Address, AccountOverride>;

/// Fully priced transaction ready for signing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTx {
    pub chain_id: u64,
    pub nonce: u64,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_blob_gas: Option<U256>,
    pub blob_versioned_hashes: Vec<H256>,
    /// Blob payload carried in the network wrapper, never in the signed body
    pub sidecar: Option<BlobInputs>,
}

impl UnsignedTx {
    pub fn is_blob(&self) -> bool {
        self.sidecar.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub hash: H256,
    /// Network encoding accepted by `eth_sendRawTransaction`
    pub raw: Bytes,
}
