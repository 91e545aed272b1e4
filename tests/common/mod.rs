//! In-process base layer for driving the manager end to end
//!
//! `FakeChain` keeps a one-slot-per-nonce mempool, mines on demand (or on
//! every accepted broadcast with automine) and enforces the 10% replacement
//! rule. `FakeSigner` encodes transactions as JSON so the chain can read
//! them back.

#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use l1_tx_manager::chain::{
    BlockOverrides, BlockTag, CallRequest, ChainReader, GasOracle, GasSuggestion, L1Block,
    L1Receipt, L1Transaction, ReceiptStatus, SignedTx, StateOverrides, TxBroadcaster, TxSigner,
    UnsignedTx,
};
use l1_tx_manager::error::{L1TxResult, NodeError, NodeErrorKind};
use l1_tx_manager::state::MemoryTxStateStore;
use l1_tx_manager::tx::{gwei, BlobInputs, L1TxManager, BLOB_SIZE, KZG_ITEM_SIZE};
use l1_tx_manager::L1TxConfig;

pub const CHAIN_ID: u64 = 1337;
pub const BLOCK_GAS_LIMIT: u64 = 30_000_000;

pub fn account() -> Address {
    Address::repeat_byte(0xaa)
}

pub fn recipient() -> Address {
    Address::repeat_byte(0x01)
}

#[derive(Debug, Clone)]
struct PoolTx {
    hash: H256,
    from: Address,
    tx: UnsignedTx,
}

impl PoolTx {
    fn to_l1(&self, block_number: Option<u64>) -> L1Transaction {
        L1Transaction {
            hash: self.hash,
            from: self.from,
            nonce: self.tx.nonce,
            to: Some(self.tx.to),
            value: self.tx.value,
            input: self.tx.data.clone(),
            max_fee_per_gas: Some(self.tx.max_fee_per_gas),
            max_priority_fee_per_gas: Some(self.tx.max_priority_fee_per_gas),
            max_fee_per_blob_gas: self.tx.max_fee_per_blob_gas,
            blob_versioned_hashes: self.tx.blob_versioned_hashes.clone(),
            block_number,
        }
    }
}

struct ChainState {
    account: Address,
    automine: bool,
    fees: GasSuggestion,
    /// Pending transactions of `account`, one per nonce
    pool: BTreeMap<u64, PoolTx>,
    /// Mined nonce count of `account`
    mined_nonce: u64,
    blocks: Vec<L1Block>,
    receipts: HashMap<H256, L1Receipt>,
    mined_txs: HashMap<H256, L1Transaction>,
    broadcasts: Vec<UnsignedTx>,
    fail_next_broadcast: Option<NodeError>,
}

/// Scriptable single-account base layer
#[derive(Clone)]
pub struct FakeChain {
    inner: Arc<Mutex<ChainState>>,
}

impl FakeChain {
    pub fn new(account: Address) -> Self {
        let genesis = L1Block {
            number: 0,
            timestamp: 0,
            base_fee_per_gas: gwei(10),
            gas_limit: U256::from(BLOCK_GAS_LIMIT),
            transactions: vec![],
        };
        Self {
            inner: Arc::new(Mutex::new(ChainState {
                account,
                automine: false,
                fees: GasSuggestion {
                    base_fee: gwei(10),
                    priority_fee: gwei(1),
                    blob_base_fee: Some(gwei(1)),
                },
                pool: BTreeMap::new(),
                mined_nonce: 0,
                blocks: vec![genesis],
                receipts: HashMap::new(),
                mined_txs: HashMap::new(),
                broadcasts: vec![],
                fail_next_broadcast: None,
            })),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ChainState) -> R) -> R {
        let mut state = self.inner.lock().unwrap();
        f(&mut state)
    }

    pub fn set_automine(&self, on: bool) {
        self.with_state(|s| s.automine = on);
    }

    pub fn set_base_fee(&self, base_fee: U256) {
        self.with_state(|s| s.fees.base_fee = base_fee);
    }

    pub fn fail_next_broadcast(&self, error: NodeError) {
        self.with_state(|s| s.fail_next_broadcast = Some(error));
    }

    /// Mine a block including every pooled transaction that is next in line
    pub fn mine(&self) -> u64 {
        self.with_state(|s| s.mine_block(true))
    }

    /// Mine a block without including anything
    pub fn mine_empty(&self) -> u64 {
        self.with_state(|s| s.mine_block(false))
    }

    pub fn mine_empty_blocks(&self, n: u64) {
        for _ in 0..n {
            self.mine_empty();
        }
    }

    pub fn head(&self) -> u64 {
        self.with_state(|s| s.head())
    }

    /// Evict the pooled transaction at `nonce`, as a mempool eviction would
    pub fn drop_pending(&self, nonce: u64) -> Option<H256> {
        self.with_state(|s| s.pool.remove(&nonce).map(|p| p.hash))
    }

    /// Replace the pooled transaction at `nonce` with one this manager never
    /// built, as another process holding the same key would
    pub fn replace_with_foreign(&self, nonce: u64) -> H256 {
        self.with_state(|s| {
            let tx = UnsignedTx {
                chain_id: CHAIN_ID,
                nonce,
                to: Address::repeat_byte(0xee),
                value: U256::from(1),
                data: Bytes::from(vec![0xde, 0xad]),
                gas_limit: U256::from(21_000),
                max_fee_per_gas: gwei(1_000),
                max_priority_fee_per_gas: gwei(100),
                max_fee_per_blob_gas: None,
                blob_versioned_hashes: vec![],
                sidecar: None,
            };
            let hash = H256::from(keccak256([b"foreign".as_slice(), &nonce.to_be_bytes()].concat()));
            let from = s.account;
            s.pool.insert(nonce, PoolTx { hash, from, tx });
            hash
        })
    }

    pub fn pending_tx(&self, nonce: u64) -> Option<L1Transaction> {
        self.with_state(|s| s.pool.get(&nonce).map(|p| p.to_l1(None)))
    }

    pub fn pool_len(&self) -> usize {
        self.with_state(|s| s.pool.len())
    }

    /// Every transaction accepted by `send_raw_transaction`, in order
    pub fn broadcasts(&self) -> Vec<UnsignedTx> {
        self.with_state(|s| s.broadcasts.clone())
    }

    pub fn broadcast_count(&self) -> usize {
        self.with_state(|s| s.broadcasts.len())
    }

    pub fn receipt(&self, hash: H256) -> Option<L1Receipt> {
        self.with_state(|s| s.receipts.get(&hash).cloned())
    }
}

impl ChainState {
    fn head(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }

    fn mine_block(&mut self, include: bool) -> u64 {
        let number = self.head() + 1;
        let base_fee = self.fees.base_fee;
        let mut transactions = vec![];

        if include {
            while let Some(pending) = self.pool.remove(&self.mined_nonce) {
                let tx = pending.to_l1(Some(number));
                let effective_gas_price = pending
                    .tx
                    .max_fee_per_gas
                    .min(base_fee + pending.tx.max_priority_fee_per_gas);
                self.receipts.insert(
                    pending.hash,
                    L1Receipt {
                        transaction_hash: pending.hash,
                        block_number: number,
                        block_hash: Some(H256::from_low_u64_be(number)),
                        status: ReceiptStatus::Success,
                        from: pending.from,
                        to: Some(pending.tx.to),
                        gas_used: U256::from(21_000),
                        effective_gas_price,
                        blob_gas_used: (!pending.tx.blob_versioned_hashes.is_empty()).then(|| {
                            U256::from(131_072 * pending.tx.blob_versioned_hashes.len())
                        }),
                    },
                );
                self.mined_txs.insert(pending.hash, tx.clone());
                transactions.push(tx);
                self.mined_nonce += 1;
            }
        }

        self.blocks.push(L1Block {
            number,
            timestamp: number * 12,
            base_fee_per_gas: base_fee,
            gas_limit: U256::from(BLOCK_GAS_LIMIT),
            transactions,
        });
        number
    }

    fn accept(&mut self, tx: UnsignedTx, hash: H256) -> Result<(), NodeError> {
        if tx.nonce < self.mined_nonce {
            return Err(NodeError::new(NodeErrorKind::NonceTooLow, "nonce too low"));
        }
        if let Some(existing) = self.pool.get(&tx.nonce) {
            let min_bump = |old: U256| old + old / 10;
            let fee_ok = tx.max_fee_per_gas >= min_bump(existing.tx.max_fee_per_gas)
                && tx.max_priority_fee_per_gas >= min_bump(existing.tx.max_priority_fee_per_gas);
            let blob_ok = match (existing.tx.max_fee_per_blob_gas, tx.max_fee_per_blob_gas) {
                (Some(old), Some(new)) => new >= min_bump(old),
                (Some(_), None) => false,
                _ => true,
            };
            if !fee_ok || !blob_ok {
                return Err(NodeError::new(
                    NodeErrorKind::ReplacementUnderpriced,
                    "replacement transaction underpriced",
                ));
            }
        }

        self.broadcasts.push(tx.clone());
        let from = self.account;
        self.pool.insert(tx.nonce, PoolTx { hash, from, tx });
        if self.automine {
            self.mine_block(true);
        }
        Ok(())
    }
}

#[async_trait]
impl GasOracle for FakeChain {
    async fn estimate_gas(
        &self,
        call: &CallRequest,
        _block_overrides: Option<BlockOverrides>,
    ) -> Result<U256, NodeError> {
        Ok(if call.data.is_empty() {
            U256::from(21_000)
        } else {
            U256::from(60_000)
        })
    }

    async fn gas_price_suggestion(&self) -> Result<GasSuggestion, NodeError> {
        Ok(self.with_state(|s| s.fees.clone()))
    }
}

#[async_trait]
impl TxBroadcaster for FakeChain {
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, NodeError> {
        let tx: UnsignedTx = serde_json::from_slice(&raw)
            .map_err(|e| NodeError::new(NodeErrorKind::Other, e.to_string()))?;
        let hash = H256::from(keccak256(&raw));
        self.with_state(|s| {
            if let Some(e) = s.fail_next_broadcast.take() {
                return Err(e);
            }
            s.accept(tx, hash)
        })?;
        Ok(hash)
    }

    async fn transaction_count(&self, account: Address, tag: BlockTag) -> Result<u64, NodeError> {
        self.with_state(|s| {
            if account != s.account {
                return Ok(0);
            }
            Ok(match tag {
                BlockTag::Pending => {
                    let mut next = s.mined_nonce;
                    while s.pool.contains_key(&next) {
                        next += 1;
                    }
                    next
                }
                _ => s.mined_nonce,
            })
        })
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn block_number(&self) -> Result<u64, NodeError> {
        Ok(self.head())
    }

    async fn get_block(&self, tag: BlockTag) -> Result<Option<L1Block>, NodeError> {
        self.with_state(|s| {
            let number = match tag {
                BlockTag::Latest | BlockTag::Pending => s.head(),
                BlockTag::Number(n) => n,
            };
            Ok(s.blocks.get(number as usize).cloned())
        })
    }

    async fn get_transaction(&self, hash: H256) -> Result<Option<L1Transaction>, NodeError> {
        self.with_state(|s| {
            if let Some(tx) = s.mined_txs.get(&hash) {
                return Ok(Some(tx.clone()));
            }
            Ok(s.pool.values().find(|p| p.hash == hash).map(|p| p.to_l1(None)))
        })
    }

    async fn get_transaction_receipt(&self, hash: H256) -> Result<Option<L1Receipt>, NodeError> {
        Ok(self.receipt(hash))
    }

    async fn call(
        &self,
        _call: &CallRequest,
        _block_overrides: Option<BlockOverrides>,
        _state_overrides: Option<StateOverrides>,
    ) -> Result<Bytes, NodeError> {
        Ok(Bytes::default())
    }
}

/// Signs by JSON-encoding the transaction; the hash is keccak of the encoding
pub struct FakeSigner {
    address: Address,
}

impl FakeSigner {
    pub fn new(address: Address) -> Self {
        Self { address }
    }
}

#[async_trait]
impl TxSigner for FakeSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn chain_id(&self) -> u64 {
        CHAIN_ID
    }

    async fn sign_transaction(&self, tx: &UnsignedTx) -> L1TxResult<SignedTx> {
        let raw = serde_json::to_vec(tx)?;
        Ok(SignedTx {
            hash: H256::from(keccak256(&raw)),
            raw: Bytes::from(raw),
        })
    }
}

/// Fast polling and a two-block stall window
pub fn test_config() -> L1TxConfig {
    L1TxConfig {
        check_interval_ms: 100,
        stall_time_ms: 24_000,
        ..Default::default()
    }
}

pub struct Harness {
    pub chain: FakeChain,
    pub store: MemoryTxStateStore,
    pub manager: Arc<L1TxManager>,
}

impl Harness {
    pub fn new(config: L1TxConfig) -> Self {
        let chain = FakeChain::new(account());
        let store = MemoryTxStateStore::new();
        let manager = manager_for(&chain, &store, config);
        Self {
            chain,
            store,
            manager,
        }
    }
}

pub fn manager_for(
    chain: &FakeChain,
    store: &MemoryTxStateStore,
    config: L1TxConfig,
) -> Arc<L1TxManager> {
    Arc::new(
        L1TxManager::new(
            Arc::new(chain.clone()),
            Arc::new(FakeSigner::new(account())),
            Arc::new(store.clone()),
            config,
        )
        .unwrap(),
    )
}

pub fn blob_inputs() -> BlobInputs {
    BlobInputs {
        blobs: vec![Bytes::from(vec![0x11u8; BLOB_SIZE])],
        kzg_commitments: vec![Bytes::from(vec![0x22u8; KZG_ITEM_SIZE])],
        kzg_proofs: vec![Bytes::from(vec![0x33u8; KZG_ITEM_SIZE])],
        max_fee_per_blob_gas: None,
    }
}

/// Poll `cond` every 50ms of (paused) time, failing after `limit`
pub async fn wait_until(what: &str, limit: Duration, mut cond: impl FnMut() -> bool) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while !cond() {
        assert!(waited < limit, "timed out waiting for {}", what);
        tokio::time::sleep(step).await;
        waited += step;
    }
}
