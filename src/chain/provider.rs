//! JSON-RPC client with multi-endpoint failover

use super::types::{
    BlockOverrides, BlockTag, CallRequest, GasSuggestion, L1Block, L1Receipt, L1Transaction,
    ReceiptStatus, StateOverrides,
};
use super::{ChainReader, GasOracle, TxBroadcaster};
use crate::error::{L1TxError, L1TxResult, NodeError, NodeErrorKind};

use async_trait::async_trait;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use ethers::types::{
    Address, Block, Bytes, Transaction, TransactionReceipt, H256, U256, U64,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct EthersClient {
    chain_id: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EthersClient {
    /// Create a new client over the given endpoints
    pub fn new(chain_id: u64, rpc_urls: &[String]) -> L1TxResult<Self> {
        let mut http_providers = Vec::new();

        for url in rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(L1TxError::Config(format!(
                "No valid RPC providers for chain {}",
                chain_id
            )));
        }

        Ok(Self {
            chain_id,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.chain_id, e);
                false
            }
        }
    }

    /// Issue a request, rotating through providers on transport failures
    async fn request<P, R>(&self, method: &str, params: P) -> Result<R, NodeError>
    where
        P: Debug + Serialize + Send + Sync,
        R: Debug + Serialize + DeserializeOwned + Send,
    {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.http().request::<_, R>(method, &params).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let err = translate_error(e, method, &params);
                    if !err.is_transient() {
                        return Err(err);
                    }
                    warn!("{} failed on chain {}: {}", method, self.chain_id, err);
                    self.failover();
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| NodeError::transport("All providers failed")))
    }
}

/// Single translation point from ethers errors into [`NodeError`]
fn translate_error<P: Serialize>(err: ProviderError, method: &str, params: &P) -> NodeError {
    let request_body = serde_json::to_string(&serde_json::json!({
        "method": method,
        "params": params,
    }))
    .ok();

    if let Some(resp) = err.as_error_response() {
        let revert_data = resp
            .data
            .as_ref()
            .and_then(|d| d.as_str())
            .and_then(|s| s.parse::<Bytes>().ok());
        return NodeError::from_rpc_message(&resp.message, revert_data, request_body);
    }

    // Anything that never produced a JSON-RPC error body is a transport problem
    let mut node_err = NodeError::from_rpc_message(&err.to_string(), None, request_body);
    if node_err.kind == NodeErrorKind::Other {
        node_err.kind = NodeErrorKind::Transport;
    }
    node_err
}

fn convert_transaction(tx: Transaction) -> L1Transaction {
    let max_fee_per_blob_gas = tx
        .other
        .get_deserialized::<U256>("maxFeePerBlobGas")
        .and_then(Result::ok);
    let blob_versioned_hashes = tx
        .other
        .get_deserialized::<Vec<H256>>("blobVersionedHashes")
        .and_then(Result::ok)
        .unwrap_or_default();

    L1Transaction {
        hash: tx.hash,
        from: tx.from,
        nonce: tx.nonce.low_u64(),
        to: tx.to,
        value: tx.value,
        input: tx.input,
        max_fee_per_gas: tx.max_fee_per_gas,
        max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
        max_fee_per_blob_gas,
        blob_versioned_hashes,
        block_number: tx.block_number.map(|n| n.as_u64()),
    }
}

fn convert_receipt(receipt: TransactionReceipt) -> Option<L1Receipt> {
    // Some nodes return pending receipts without a block
    let block_number = receipt.block_number?.as_u64();
    let status = if receipt.status == Some(U64::from(1)) {
        ReceiptStatus::Success
    } else {
        ReceiptStatus::Reverted
    };
    let blob_gas_used = receipt
        .other
        .get_deserialized::<U256>("blobGasUsed")
        .and_then(Result::ok);

    Some(L1Receipt {
        transaction_hash: receipt.transaction_hash,
        block_number,
        block_hash: receipt.block_hash,
        status,
        from: receipt.from,
        to: receipt.to,
        gas_used: receipt.gas_used.unwrap_or_default(),
        effective_gas_price: receipt.effective_gas_price.unwrap_or_default(),
        blob_gas_used,
    })
}

fn convert_block(block: Block<Transaction>) -> Option<L1Block> {
    Some(L1Block {
        number: block.number?.as_u64(),
        timestamp: block.timestamp.low_u64(),
        base_fee_per_gas: block.base_fee_per_gas.unwrap_or_default(),
        gas_limit: block.gas_limit,
        transactions: block.transactions.into_iter().map(convert_transaction).collect(),
    })
}

#[async_trait]
impl GasOracle for EthersClient {
    async fn estimate_gas(
        &self,
        call: &CallRequest,
        block_overrides: Option<BlockOverrides>,
    ) -> Result<U256, NodeError> {
        match block_overrides {
            Some(block) => {
                let state = StateOverrides::new();
                self.request("eth_estimateGas", (call, "latest", state, block))
                    .await
            }
            None => self.request("eth_estimateGas", (call, "latest")).await,
        }
    }

    async fn gas_price_suggestion(&self) -> Result<GasSuggestion, NodeError> {
        let block: Option<Block<H256>> = self
            .request("eth_getBlockByNumber", ("latest", false))
            .await?;
        let block = block.ok_or_else(|| NodeError::new(NodeErrorKind::NotFound, "No latest block"))?;
        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| NodeError::new(NodeErrorKind::Other, "No base fee in block"))?;

        let priority_fee: U256 = self.request("eth_maxPriorityFeePerGas", ()).await?;

        // Pre-blob nodes reject the method; treat as absent
        let blob_base_fee = match self.request::<_, U256>("eth_blobBaseFee", ()).await {
            Ok(fee) => Some(fee),
            Err(e) => {
                debug!("eth_blobBaseFee unavailable on chain {}: {}", self.chain_id, e);
                None
            }
        };

        Ok(GasSuggestion {
            base_fee,
            priority_fee,
            blob_base_fee,
        })
    }
}

#[async_trait]
impl TxBroadcaster for EthersClient {
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, NodeError> {
        // Never rotate providers on a broadcast: the first node may already have it
        self.http()
            .request::<_, H256>("eth_sendRawTransaction", [&raw])
            .await
            .map_err(|e| translate_error(e, "eth_sendRawTransaction", &[&raw]))
    }

    async fn transaction_count(&self, account: Address, tag: BlockTag) -> Result<u64, NodeError> {
        let count: U256 = self
            .request("eth_getTransactionCount", (account, tag.as_rpc()))
            .await?;
        Ok(count.low_u64())
    }
}

#[async_trait]
impl ChainReader for EthersClient {
    async fn block_number(&self) -> Result<u64, NodeError> {
        let number: U64 = self.request("eth_blockNumber", ()).await?;
        Ok(number.as_u64())
    }

    async fn get_block(&self, tag: BlockTag) -> Result<Option<L1Block>, NodeError> {
        let block: Option<Block<Transaction>> = self
            .request("eth_getBlockByNumber", (tag.as_rpc(), true))
            .await?;
        Ok(block.and_then(convert_block))
    }

    async fn get_transaction(&self, hash: H256) -> Result<Option<L1Transaction>, NodeError> {
        let tx: Option<Transaction> = self.request("eth_getTransactionByHash", [hash]).await?;
        Ok(tx.map(convert_transaction))
    }

    async fn get_transaction_receipt(&self, hash: H256) -> Result<Option<L1Receipt>, NodeError> {
        let receipt: Option<TransactionReceipt> =
            self.request("eth_getTransactionReceipt", [hash]).await?;
        Ok(receipt.and_then(convert_receipt))
    }

    async fn call(
        &self,
        call: &CallRequest,
        block_overrides: Option<BlockOverrides>,
        state_overrides: Option<StateOverrides>,
    ) -> Result<Bytes, NodeError> {
        match (state_overrides, block_overrides) {
            (None, None) => self.request("eth_call", (call, "latest")).await,
            (Some(state), None) => self.request("eth_call", (call, "latest", state)).await,
            (state, Some(block)) => {
                let state = state.unwrap_or_default();
                self.request("eth_call", (call, "latest", state, block)).await
            }
        }
    }
}
