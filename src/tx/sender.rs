//! Transaction sender: pricing, signing and broadcasting
//!
//! The sender owns every path that puts a transaction on the wire: the first
//! attempt, speed-ups and (see `cancel.rs`) cancellations. It never waits for
//! inclusion; that is the monitor's job.

use super::estimator::GasEstimator;
use super::gas::GasPriceCalculator;
use super::nonce::NonceManager;
use super::types::{GasPrice, PriceOverrides, TxRequest, TxState, TxStatus};
use crate::chain::{retry_transient, GasSuggestion, L1Client, TxSigner, UnsignedTx};
use crate::clock::Clock;
use crate::config::{L1TxConfig, TxConfigOverrides};
use crate::error::{L1TxError, L1TxResult};
use crate::metrics;

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-call knobs for [`TransactionSender::send`]
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Skip estimation and use this gas limit
    pub gas_limit: Option<U256>,
    /// Estimate against the real block gas limit
    pub ignore_block_gas_limit: bool,
    pub gas_price: PriceOverrides,
    pub overrides: TxConfigOverrides,
}

/// Signs and broadcasts transactions for one account
pub struct TransactionSender {
    client: Arc<dyn L1Client>,
    signer: Arc<dyn TxSigner>,
    nonce_manager: Arc<NonceManager>,
    estimator: GasEstimator<dyn L1Client>,
    config: L1TxConfig,
    clock: Arc<dyn Clock>,
}

impl TransactionSender {
    pub fn new(
        client: Arc<dyn L1Client>,
        signer: Arc<dyn TxSigner>,
        nonce_manager: Arc<NonceManager>,
        config: L1TxConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            estimator: GasEstimator::new(client.clone()),
            client,
            signer,
            nonce_manager,
            config,
            clock,
        }
    }

    pub fn account(&self) -> Address {
        self.signer.address()
    }

    pub fn estimator(&self) -> &GasEstimator<dyn L1Client> {
        &self.estimator
    }

    /// Policy for one transaction: global config plus its overrides
    pub fn tx_config(&self, overrides: &TxConfigOverrides) -> L1TxConfig {
        self.config.with_overrides(overrides)
    }

    /// Price, sign and broadcast `request` under a freshly allocated nonce.
    ///
    /// A broadcast failure releases the nonce and is returned as is; the
    /// caller decides whether to resubmit.
    pub async fn send(&self, request: TxRequest, opts: SendOptions) -> L1TxResult<TxState> {
        let config = self.tx_config(&opts.overrides);
        config.validate()?;
        if let Some(blobs) = &request.blobs {
            blobs.validate()?;
        }

        let fees = self.fees().await?;
        let calculator = GasPriceCalculator::new(&config);
        let price = calculator.initial_price(&fees, request.blobs.as_ref())?;
        let price = calculator.apply_overrides(price, &opts.gas_price)?;

        let account = self.account();
        let mut call = request.to_call(account);
        call.max_fee_per_blob_gas = price.max_fee_per_blob_gas;
        let gas_limit = self
            .estimator
            .estimate_gas(
                &call,
                opts.gas_limit,
                opts.ignore_block_gas_limit,
                config.gas_limit_buffer_percentage,
            )
            .await?;

        let head = retry_transient("block number", || self.client.block_number()).await?;
        let nonce = self.nonce_manager.allocate(self.client.as_ref()).await?;

        let sent = async {
            let unsigned = self.build_tx(nonce, &request, gas_limit, &price)?;
            self.broadcast(&unsigned).await
        }
        .await;
        let tx_hash = match sent {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Failed to send transaction with nonce {}: {}", nonce, e);
                self.nonce_manager.release(nonce).await;
                return Err(e);
            }
        };

        info!(
            "Sent transaction {:?} with nonce {} (gas limit {}, max fee {}, priority fee {}{})",
            tx_hash,
            nonce,
            gas_limit,
            price.max_fee_per_gas,
            price.max_priority_fee_per_gas,
            blob_fee_suffix(&price)
        );
        metrics::record_tx_sent("original");
        metrics::record_gas_price(&price);

        let now = self.now();
        Ok(TxState {
            account,
            nonce,
            request,
            gas_limit,
            tx_hashes: vec![tx_hash],
            cancel_tx_hashes: Vec::new(),
            gas_price: price,
            status: TxStatus::Sent,
            sent_at: now,
            last_sent_at: now,
            last_sent_block: head,
            cancelled_at: None,
            last_seen_at: None,
            config_overrides: opts.overrides,
            receipt: None,
        })
    }

    /// Replace the pending transaction with a higher-priced copy of itself.
    ///
    /// The previous attempt is not cancelled; either may be mined.
    pub async fn speed_up(&self, state: &mut TxState, head: u64) -> L1TxResult<H256> {
        if !matches!(state.status, TxStatus::Sent | TxStatus::SpeedUp) {
            return Err(L1TxError::Internal(format!(
                "cannot speed up nonce {} in status {}",
                state.nonce, state.status
            )));
        }
        let price = self.replacement_price(state).await?;
        let unsigned = self.build_tx(state.nonce, &state.request, state.gas_limit, &price)?;
        let tx_hash = self.broadcast(&unsigned).await?;

        state.tx_hashes.push(tx_hash);
        state.gas_price = price;
        state.status = TxStatus::SpeedUp;
        state.last_sent_at = self.now();
        state.last_sent_block = head;

        info!(
            "Sped up nonce {} with {:?} (attempt {}, max fee {}, priority fee {}{})",
            state.nonce,
            tx_hash,
            state.speed_up_attempts(),
            state.gas_price.max_fee_per_gas,
            state.gas_price.max_priority_fee_per_gas,
            blob_fee_suffix(&state.gas_price)
        );
        metrics::record_tx_sent("speed_up");
        metrics::record_gas_price(&state.gas_price);
        Ok(tx_hash)
    }

    /// Sign and submit; returns the locally computed hash
    pub async fn broadcast(&self, tx: &UnsignedTx) -> L1TxResult<H256> {
        let signed = self.signer.sign_transaction(tx).await?;
        let node_hash = self.client.send_raw_transaction(signed.raw).await?;
        if node_hash != signed.hash {
            warn!(
                "Node reported hash {:?} for nonce {}, signed hash is {:?}",
                node_hash, tx.nonce, signed.hash
            );
        }
        Ok(signed.hash)
    }

    pub(super) async fn fees(&self) -> L1TxResult<GasSuggestion> {
        let fees = retry_transient("gas price suggestion", || {
            self.client.gas_price_suggestion()
        })
        .await?;
        debug!(
            "Fee market: base fee {}, priority fee {}, blob base fee {:?}",
            fees.base_fee, fees.priority_fee, fees.blob_base_fee
        );
        Ok(fees)
    }

    /// Strictly higher price for a same-nonce replacement of `state`
    pub(super) async fn replacement_price(&self, state: &TxState) -> L1TxResult<GasPrice> {
        let config = self.tx_config(&state.config_overrides);
        let fees = self.fees().await?;
        GasPriceCalculator::new(&config).retry_price(
            &state.gas_price,
            &fees,
            state.request.is_blob(),
        )
    }

    pub(super) fn build_tx(
        &self,
        nonce: u64,
        request: &TxRequest,
        gas_limit: U256,
        price: &GasPrice,
    ) -> L1TxResult<UnsignedTx> {
        let (blob_versioned_hashes, max_fee_per_blob_gas) = match &request.blobs {
            Some(blobs) => {
                let fee = price
                    .max_fee_per_blob_gas
                    .filter(|fee| !fee.is_zero())
                    .ok_or_else(|| {
                        L1TxError::InvalidBlobInputs(format!(
                            "missing max_fee_per_blob_gas for blob transaction with nonce {}",
                            nonce
                        ))
                    })?;
                (blobs.versioned_hashes(), Some(fee))
            }
            None => (Vec::new(), None),
        };

        Ok(UnsignedTx {
            chain_id: self.signer.chain_id(),
            nonce,
            to: request.to,
            value: request.value,
            data: request.data.clone(),
            gas_limit,
            max_fee_per_gas: price.max_fee_per_gas,
            max_priority_fee_per_gas: price.max_priority_fee_per_gas,
            max_fee_per_blob_gas,
            blob_versioned_hashes,
            sidecar: request.blobs.clone(),
        })
    }

    pub(super) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn blob_fee_suffix(price: &GasPrice) -> String {
    match price.max_fee_per_blob_gas {
        Some(fee) => format!(", blob fee {}", fee),
        None => String::new(),
    }
}
