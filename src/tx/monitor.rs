//! Monitor state machine
//!
//! One task per monitored nonce. Each check:
//! 1. Asks the node whether the nonce has been consumed. If so, looks for a
//!    receipt among the tracked hashes (cancellations first) and otherwise
//!    records the foreign transaction that took the nonce.
//! 2. For a pending transaction, applies the deadline, dropped and stall
//!    rules in that order; a stall triggers a same-nonce speed-up.
//! 3. For a cancelled transaction, applies the cancellation deadline and
//!    dropped rules, and speeds up the cancellation when it stalls.
//!
//! All mutation of a [`TxState`] happens inside its task. Every change of
//! status or hashes is checkpointed before the waiting caller is resolved.

use super::nonce::NonceManager;
use super::sender::TransactionSender;
use super::types::{TxState, TxStatus};
use crate::chain::{retry_transient, BlockTag, L1Client, L1Receipt};
use crate::clock::Clock;
use crate::config::L1TxConfig;
use crate::error::{L1TxError, L1TxResult, TimeoutReason};
use crate::metrics;
use crate::state::TxStateStore;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::{DashMap, DashSet};
use ethers::types::H256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// How far back to look for a foreign transaction that consumed a nonce
pub const FOREIGN_TX_SCAN_DEPTH: u64 = 64;

pub(crate) type MonitorOutcome = L1TxResult<L1Receipt>;

/// Collaborators shared by every monitor task of one manager
#[derive(Clone)]
pub(crate) struct MonitorContext {
    pub client: Arc<dyn L1Client>,
    pub sender: Arc<TransactionSender>,
    pub nonce_manager: Arc<NonceManager>,
    pub store: Arc<dyn TxStateStore>,
    pub clock: Arc<dyn Clock>,
    /// Latest snapshot of every state this manager has seen
    pub states: Arc<DashMap<u64, TxState>>,
    /// Nonces with a running monitor task
    pub monitoring: Arc<DashSet<u64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MinedBy {
    Own,
    Cancellation,
    Unknown,
}

impl MinedBy {
    fn as_str(&self) -> &'static str {
        match self {
            MinedBy::Own => "own",
            MinedBy::Cancellation => "cancellation",
            MinedBy::Unknown => "unknown",
        }
    }
}

pub(crate) struct TxMonitor {
    ctx: MonitorContext,
    state: TxState,
    config: L1TxConfig,
    interrupt: watch::Receiver<bool>,
    /// Caller waiting on the outcome; taken on first resolution
    waiter: Option<oneshot::Sender<MonitorOutcome>>,
}

impl TxMonitor {
    pub fn new(
        ctx: MonitorContext,
        state: TxState,
        interrupt: watch::Receiver<bool>,
        waiter: oneshot::Sender<MonitorOutcome>,
    ) -> Self {
        let config = ctx.sender.tx_config(&state.config_overrides);
        Self {
            ctx,
            state,
            config,
            interrupt,
            waiter: Some(waiter),
        }
    }

    /// Poll until the nonce resolves or monitoring is interrupted
    pub async fn run(mut self) {
        let nonce = self.state.nonce;
        let interval = Duration::from_millis(self.config.check_interval_ms);
        metrics::record_monitor_started();
        debug!(
            "Monitoring nonce {} ({}, hashes {:?})",
            nonce, self.state.status, self.state.tx_hashes
        );

        loop {
            if *self.interrupt.borrow_and_update() {
                info!(
                    "Monitoring of nonce {} interrupted in status {}",
                    nonce, self.state.status
                );
                self.stop_interrupted();
                break;
            }

            match self.check().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!("Check of nonce {} failed, retrying: {}", nonce, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = self.interrupt.changed() => {
                    if changed.is_err() {
                        debug!("Manager dropped, stopping monitor of nonce {}", nonce);
                        self.stop_interrupted();
                        break;
                    }
                }
            }
        }

        self.ctx.monitoring.remove(&nonce);
        metrics::record_monitor_stopped();
    }

    /// One pass of the state machine. Returns `true` once the nonce is resolved.
    async fn check(&mut self) -> L1TxResult<bool> {
        let account = self.state.account;
        let mined_count = retry_transient("transaction count", || {
            self.ctx.client.transaction_count(account, BlockTag::Latest)
        })
        .await?;

        if mined_count > self.state.nonce {
            self.on_nonce_consumed().await?;
            return Ok(true);
        }

        match self.state.status {
            TxStatus::Sent | TxStatus::SpeedUp => self.check_pending().await,
            TxStatus::Cancelled => self.check_cancellation().await,
            TxStatus::Idle | TxStatus::Mined | TxStatus::NotMined => {
                warn!(
                    "Nonce {} is not monitorable in status {}, stopping",
                    self.state.nonce, self.state.status
                );
                self.resolve(Err(L1TxError::Internal(format!(
                    "nonce {} is not monitorable in status {}",
                    self.state.nonce, self.state.status
                ))));
                Ok(true)
            }
        }
    }

    async fn check_pending(&mut self) -> L1TxResult<bool> {
        let now = self.ctx.clock.now();
        self.refresh_last_seen(now).await;

        if now >= self.deadline() {
            return self.on_timeout(TimeoutReason::Deadline).await;
        }
        if self.is_dropped(now) {
            warn!(
                "Nonce {} not seen by the node for {}ms, hashes {:?}",
                self.state.nonce, self.config.tx_unseen_considered_dropped_ms, self.state.tx_hashes
            );
            metrics::record_tx_dropped("pending");
            return self.on_timeout(TimeoutReason::Dropped).await;
        }

        let head = self.head().await?;
        if !self.is_stalled(head) {
            return Ok(false);
        }
        if self.state.speed_up_attempts() >= self.config.max_speed_up_attempts {
            debug!(
                "Nonce {} stalled at block {}, speed-up attempts exhausted",
                self.state.nonce, head
            );
            return Ok(false);
        }

        match self.ctx.sender.speed_up(&mut self.state, head).await {
            Ok(_) => self.checkpoint().await,
            // Keep waiting on the attempts already out; the next stall retries
            Err(e) => warn!("Speed-up of nonce {} failed: {}", self.state.nonce, e),
        }
        Ok(false)
    }

    async fn check_cancellation(&mut self) -> L1TxResult<bool> {
        let now = self.ctx.clock.now();
        let nonce = self.state.nonce;
        let cancelled_at = self.state.cancelled_at.unwrap_or(self.state.last_sent_at);
        let final_deadline =
            cancelled_at + ms(self.config.tx_cancellation_final_timeout_ms);

        if now >= final_deadline {
            warn!(
                "Cancellation of nonce {} not mined by {}, abandoning ({:?})",
                nonce, final_deadline, self.state.cancel_tx_hashes
            );
            self.finish_not_mined("cancellation_timeout").await;
            self.resolve(Err(L1TxError::Timeout {
                nonce,
                reason: TimeoutReason::CancellationDeadline,
            }));
            return Ok(true);
        }

        self.refresh_last_seen(now).await;
        if self.is_dropped(now) {
            warn!(
                "Cancellation of nonce {} dropped, hashes {:?}",
                nonce, self.state.cancel_tx_hashes
            );
            metrics::record_tx_dropped("cancellation");
            self.finish_not_mined("cancellation_dropped").await;
            self.resolve(Err(L1TxError::Timeout {
                nonce,
                reason: TimeoutReason::Dropped,
            }));
            return Ok(true);
        }

        let head = self.head().await?;
        if self.is_stalled(head)
            && self.state.cancel_speed_up_attempts() < self.config.max_speed_up_attempts
        {
            match self.ctx.sender.speed_up_cancellation(&mut self.state, head).await {
                Ok(_) => self.checkpoint().await,
                Err(e) => warn!("Speed-up of cancellation for nonce {} failed: {}", nonce, e),
            }
        }
        Ok(false)
    }

    async fn on_timeout(&mut self, reason: TimeoutReason) -> L1TxResult<bool> {
        let nonce = self.state.nonce;
        warn!(
            "Nonce {} timed out ({}) after {} speed-ups, hashes {:?}",
            nonce,
            reason,
            self.state.speed_up_attempts(),
            self.state.tx_hashes
        );

        if !self.config.cancel_tx_on_timeout {
            self.finish_not_mined(not_mined_reason(reason)).await;
            self.resolve(Err(L1TxError::Timeout { nonce, reason }));
            return Ok(true);
        }

        let head = match self.head().await {
            Ok(head) => head,
            Err(e) => {
                debug!("Using last sent block for cancellation of nonce {}: {}", nonce, e);
                self.state.last_sent_block
            }
        };
        match self.ctx.sender.cancel(&mut self.state, head).await {
            Ok(_) => {
                self.checkpoint().await;
                self.resolve(Err(L1TxError::Timeout { nonce, reason }));
                Ok(false)
            }
            Err(e) => {
                error!("Cancellation of nonce {} could not be sent: {}", nonce, e);
                self.finish_not_mined("cancellation_failed").await;
                self.resolve(Err(L1TxError::Timeout { nonce, reason }));
                Ok(true)
            }
        }
    }

    /// The account's mined nonce count moved past this nonce
    async fn on_nonce_consumed(&mut self) -> L1TxResult<()> {
        let candidates: Vec<(H256, MinedBy)> = self
            .state
            .cancel_tx_hashes
            .iter()
            .rev()
            .map(|h| (*h, MinedBy::Cancellation))
            .chain(self.state.tx_hashes.iter().rev().map(|h| (*h, MinedBy::Own)))
            .collect();

        for (hash, mined_by) in candidates {
            let receipt = retry_transient("transaction receipt", || {
                self.ctx.client.get_transaction_receipt(hash)
            })
            .await?;
            if let Some(receipt) = receipt {
                self.finish_mined(receipt, mined_by).await;
                return Ok(());
            }
        }

        let nonce = self.state.nonce;
        let foreign = match self.find_foreign_receipt().await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("Lookup of foreign transaction for nonce {} failed: {}", nonce, e);
                None
            }
        };
        let tx_hash = foreign.as_ref().map(|r| r.transaction_hash);
        warn!(
            "Nonce {} was mined by a transaction not sent here ({:?}); tracked {:?} and cancellations {:?}",
            nonce, tx_hash, self.state.tx_hashes, self.state.cancel_tx_hashes
        );

        self.state.status = TxStatus::Mined;
        self.state.receipt = foreign;
        self.checkpoint().await;
        self.ctx.nonce_manager.confirm(nonce).await;
        metrics::record_tx_mined(MinedBy::Unknown.as_str(), self.seconds_since_sent());
        self.ctx.monitoring.remove(&nonce);
        self.resolve(Err(L1TxError::UnknownMinedTx { nonce, tx_hash }));
        Ok(())
    }

    /// Scan recent blocks for the account's transaction at this nonce
    async fn find_foreign_receipt(&self) -> L1TxResult<Option<L1Receipt>> {
        let head = self.head().await?;
        let from_block = self
            .state
            .last_sent_block
            .max(head.saturating_sub(FOREIGN_TX_SCAN_DEPTH));

        for number in (from_block..=head).rev() {
            let block = retry_transient("get block", || {
                self.ctx.client.get_block(BlockTag::Number(number))
            })
            .await?;
            let found = block.and_then(|b| {
                b.transactions
                    .into_iter()
                    .find(|tx| tx.from == self.state.account && tx.nonce == self.state.nonce)
            });
            if let Some(tx) = found {
                let receipt = retry_transient("transaction receipt", || {
                    self.ctx.client.get_transaction_receipt(tx.hash)
                })
                .await?;
                return Ok(receipt);
            }
        }
        Ok(None)
    }

    async fn finish_mined(&mut self, receipt: L1Receipt, mined_by: MinedBy) {
        let nonce = self.state.nonce;
        info!(
            "Nonce {} mined in block {} by {:?} ({}, {:?})",
            nonce,
            receipt.block_number,
            receipt.transaction_hash,
            mined_by.as_str(),
            receipt.status
        );

        self.state.status = TxStatus::Mined;
        self.state.receipt = Some(receipt.clone());
        self.checkpoint().await;
        self.ctx.nonce_manager.confirm(nonce).await;
        metrics::record_tx_mined(mined_by.as_str(), self.seconds_since_sent());
        self.ctx.monitoring.remove(&nonce);
        self.resolve(Ok(receipt));
    }

    /// Abandon the nonce and free it for reuse
    async fn finish_not_mined(&mut self, reason: &str) {
        let nonce = self.state.nonce;
        warn!("Nonce {} not mined ({}), releasing it", nonce, reason);

        self.state.status = TxStatus::NotMined;
        self.checkpoint().await;
        self.ctx.nonce_manager.release(nonce).await;
        metrics::record_tx_not_mined(reason);
        self.ctx.monitoring.remove(&nonce);
    }

    fn stop_interrupted(&mut self) {
        let nonce = self.state.nonce;
        self.ctx.monitoring.remove(&nonce);
        self.resolve(Err(L1TxError::Timeout {
            nonce,
            reason: TimeoutReason::Interrupted,
        }));
    }

    /// Record whether any relevant hash is still known to the node.
    ///
    /// An RPC failure counts as seen: only a definite answer marks a
    /// transaction as gone.
    async fn refresh_last_seen(&mut self, now: DateTime<Utc>) {
        let hashes: Vec<H256> = match self.state.status {
            TxStatus::Cancelled => self.state.all_hashes().copied().collect(),
            _ => self.state.tx_hashes.iter().rev().copied().collect(),
        };

        for hash in hashes {
            let result = retry_transient("get transaction", || {
                self.ctx.client.get_transaction(hash)
            })
            .await;
            match result {
                Ok(Some(_)) => {
                    self.state.last_seen_at = Some(now);
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("Visibility check of {:?} failed: {}", hash, e);
                    self.state.last_seen_at = Some(now);
                    return;
                }
            }
        }
    }

    fn is_dropped(&self, now: DateTime<Utc>) -> bool {
        let since = match self.state.last_seen_at {
            Some(seen) => seen.max(self.state.last_sent_at),
            None => self.state.last_sent_at,
        };
        now - since >= ms(self.config.tx_unseen_considered_dropped_ms)
    }

    fn is_stalled(&self, head: u64) -> bool {
        head.saturating_sub(self.state.last_sent_block) >= self.config.stall_blocks()
    }

    fn deadline(&self) -> DateTime<Utc> {
        self.config
            .tx_timeout_at
            .unwrap_or_else(|| self.state.sent_at + ms(self.config.tx_timeout_ms))
    }

    async fn head(&self) -> L1TxResult<u64> {
        Ok(retry_transient("block number", || self.ctx.client.block_number()).await?)
    }

    fn seconds_since_sent(&self) -> f64 {
        (self.ctx.clock.now() - self.state.sent_at).num_milliseconds() as f64 / 1_000.0
    }

    async fn checkpoint(&self) {
        self.ctx.states.insert(self.state.nonce, self.state.clone());
        if let Err(e) = self.ctx.store.save_state(&self.state).await {
            error!(
                "Failed to persist state of nonce {} ({}): {}",
                self.state.nonce, self.state.status, e
            );
        }
    }

    fn resolve(&mut self, outcome: MonitorOutcome) {
        if let Some(waiter) = self.waiter.take() {
            // The caller may have stopped waiting
            let _ = waiter.send(outcome);
        }
    }
}

/// Longest interval used in deadline arithmetic, so adding it never overflows
const MAX_INTERVAL_MS: u64 = 100 * 365 * 24 * 3_600 * 1_000;

fn ms(millis: u64) -> ChronoDuration {
    ChronoDuration::milliseconds(millis.min(MAX_INTERVAL_MS) as i64)
}

fn not_mined_reason(reason: TimeoutReason) -> &'static str {
    match reason {
        TimeoutReason::Deadline => "timeout",
        TimeoutReason::Dropped => "dropped",
        TimeoutReason::CancellationDeadline => "cancellation_timeout",
        TimeoutReason::Interrupted => "interrupted",
    }
}
