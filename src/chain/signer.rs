//! Local-key transaction signing
//!
//! EIP-1559 transactions go through ethers' typed transaction support.
//! ethers has no EIP-4844 type, so blob transactions are encoded here:
//! the signed body is `0x03 || rlp([chain_id, nonce, tip, fee_cap, gas, to,
//! value, data, access_list, blob_fee_cap, blob_hashes, y, r, s])` and the
//! network form wraps it as `0x03 || rlp([body, blobs, commitments, proofs])`.

use super::types::{SignedTx, UnsignedTx};
use super::TxSigner;
use crate::error::{L1TxError, L1TxResult};
use crate::tx::BlobInputs;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, Signature, H256, U256};
use ethers::utils::keccak256;
use ethers::utils::rlp::RlpStream;

pub const BLOB_TX_TYPE: u8 = 0x03;

/// Signs with a private key held in memory
pub struct WalletSigner {
    wallet: LocalWallet,
    chain_id: u64,
}

impl WalletSigner {
    pub fn new(wallet: LocalWallet, chain_id: u64) -> Self {
        Self {
            wallet: wallet.with_chain_id(chain_id),
            chain_id,
        }
    }

    /// Load the key from the named environment variable
    pub fn from_env(var: &str, chain_id: u64) -> L1TxResult<Self> {
        let key = std::env::var(var)
            .map_err(|_| L1TxError::Config(format!("Signing key variable {} is not set", var)))?;
        let wallet = key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| L1TxError::Signing(format!("Invalid private key: {}", e)))?;
        Ok(Self::new(wallet, chain_id))
    }

    async fn sign_eip1559(&self, tx: &UnsignedTx) -> L1TxResult<SignedTx> {
        let request = Eip1559TransactionRequest::new()
            .from(self.wallet.address())
            .to(tx.to)
            .value(tx.value)
            .data(tx.data.clone())
            .nonce(tx.nonce)
            .gas(tx.gas_limit)
            .max_fee_per_gas(tx.max_fee_per_gas)
            .max_priority_fee_per_gas(tx.max_priority_fee_per_gas)
            .chain_id(tx.chain_id);
        let typed: TypedTransaction = request.into();

        let signature = self
            .wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| L1TxError::Signing(e.to_string()))?;
        let raw = typed.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));

        Ok(SignedTx { hash, raw })
    }

    fn sign_eip4844(&self, tx: &UnsignedTx, sidecar: &BlobInputs) -> L1TxResult<SignedTx> {
        let max_fee_per_blob_gas = match tx.max_fee_per_blob_gas {
            Some(fee) if !fee.is_zero() => fee,
            _ => {
                return Err(L1TxError::InvalidBlobInputs(
                    "blob transaction without max_fee_per_blob_gas".into(),
                ))
            }
        };
        if tx.blob_versioned_hashes.is_empty() {
            return Err(L1TxError::InvalidBlobInputs(
                "blob transaction without versioned hashes".into(),
            ));
        }

        let unsigned = eip4844_payload(tx, max_fee_per_blob_gas, None);
        let sighash = keccak256([&[BLOB_TX_TYPE][..], unsigned.as_raw()].concat());
        let signature = self
            .wallet
            .sign_hash(H256::from(sighash))
            .map_err(|e| L1TxError::Signing(e.to_string()))?;

        let body = eip4844_payload(tx, max_fee_per_blob_gas, Some(&signature));
        let hash = H256::from(keccak256([&[BLOB_TX_TYPE][..], body.as_raw()].concat()));

        let mut wrapper = RlpStream::new_list(4);
        wrapper.append_raw(body.as_raw(), 1);
        append_bytes_list(&mut wrapper, &sidecar.blobs);
        append_bytes_list(&mut wrapper, &sidecar.kzg_commitments);
        append_bytes_list(&mut wrapper, &sidecar.kzg_proofs);

        let raw = Bytes::from([&[BLOB_TX_TYPE][..], wrapper.as_raw()].concat());
        Ok(SignedTx { hash, raw })
    }
}

fn eip4844_payload(tx: &UnsignedTx, max_fee_per_blob_gas: U256, signature: Option<&Signature>) -> RlpStream {
    let mut stream = RlpStream::new();
    stream.begin_list(if signature.is_some() { 14 } else { 11 });

    stream.append(&tx.chain_id);
    stream.append(&tx.nonce);
    stream.append(&tx.max_priority_fee_per_gas);
    stream.append(&tx.max_fee_per_gas);
    stream.append(&tx.gas_limit);
    stream.append(&tx.to);
    stream.append(&tx.value);
    stream.append(&tx.data.as_ref());
    // Empty access list
    stream.begin_list(0);
    stream.append(&max_fee_per_blob_gas);
    stream.append_list(&tx.blob_versioned_hashes);

    if let Some(sig) = signature {
        let y_parity = if sig.v >= 35 {
            (sig.v - 35) % 2
        } else {
            sig.v.saturating_sub(27)
        };
        stream.append(&y_parity);
        stream.append(&sig.r);
        stream.append(&sig.s);
    }
    stream
}

fn append_bytes_list(stream: &mut RlpStream, items: &[Bytes]) {
    stream.begin_list(items.len());
    for item in items {
        stream.append(&item.as_ref());
    }
}

#[async_trait]
impl TxSigner for WalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn sign_transaction(&self, tx: &UnsignedTx) -> L1TxResult<SignedTx> {
        if tx.chain_id != self.chain_id {
            return Err(L1TxError::Signing(format!(
                "Transaction for chain {} given to signer for chain {}",
                tx.chain_id, self.chain_id
            )));
        }
        match &tx.sidecar {
            None => self.sign_eip1559(tx).await,
            Some(sidecar) => self.sign_eip4844(tx, sidecar),
        }
    }
}
