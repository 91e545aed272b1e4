//! Caller-facing transaction manager
//!
//! [`L1TxManager`] ties the sender, the nonce manager, the state store and
//! the monitor tasks together for one signing account.

use super::monitor::{MonitorContext, MonitorOutcome, TxMonitor};
use super::nonce::NonceManager;
use super::sender::{SendOptions, TransactionSender};
use super::types::{TxRequest, TxState, TxStatus};
use crate::chain::{BlockOverrides, L1Client, L1Receipt, StateOverrides, TxSigner};
use crate::clock::{Clock, TokioClock};
use crate::config::L1TxConfig;
use crate::error::{L1TxError, L1TxResult, TimeoutReason};
use crate::state::TxStateStore;

use dashmap::{DashMap, DashSet};
use ethers::abi::Abi;
use ethers::types::{Address, Bytes, H256, U256};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Result of [`L1TxManager::send`]
#[derive(Debug, Clone)]
pub struct SentTx {
    pub tx_hash: H256,
    pub state: TxState,
}

/// Submits transactions for one account and drives them to resolution
pub struct L1TxManager {
    client: Arc<dyn L1Client>,
    sender: Arc<TransactionSender>,
    nonce_manager: Arc<NonceManager>,
    store: Arc<dyn TxStateStore>,
    clock: Arc<dyn Clock>,
    config: L1TxConfig,
    states: Arc<DashMap<u64, TxState>>,
    monitoring: Arc<DashSet<u64>>,
    interrupt: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl L1TxManager {
    pub fn new(
        client: Arc<dyn L1Client>,
        signer: Arc<dyn TxSigner>,
        store: Arc<dyn TxStateStore>,
        config: L1TxConfig,
    ) -> L1TxResult<Self> {
        Self::with_clock(client, signer, store, config, Arc::new(TokioClock::new()))
    }

    pub fn with_clock(
        client: Arc<dyn L1Client>,
        signer: Arc<dyn TxSigner>,
        store: Arc<dyn TxStateStore>,
        config: L1TxConfig,
        clock: Arc<dyn Clock>,
    ) -> L1TxResult<Self> {
        config.validate()?;

        let nonce_manager = Arc::new(NonceManager::new(signer.address()));
        let sender = Arc::new(TransactionSender::new(
            client.clone(),
            signer,
            nonce_manager.clone(),
            config.clone(),
            clock.clone(),
        ));
        let (interrupt, _) = watch::channel(false);

        info!(
            "Transaction manager initialized for account {:?}",
            nonce_manager.account()
        );

        Ok(Self {
            client,
            sender,
            nonce_manager,
            store,
            clock,
            config,
            states: Arc::new(DashMap::new()),
            monitoring: Arc::new(DashSet::new()),
            interrupt,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn account(&self) -> Address {
        self.nonce_manager.account()
    }

    pub fn config(&self) -> &L1TxConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn L1Client> {
        &self.client
    }

    pub fn store(&self) -> &Arc<dyn TxStateStore> {
        &self.store
    }

    /// Price, sign and broadcast `request`; the returned state is `Sent`
    pub async fn send(&self, request: TxRequest, opts: SendOptions) -> L1TxResult<SentTx> {
        let state = self.sender.send(request, opts).await?;
        let tx_hash = state
            .tx_hashes
            .first()
            .copied()
            .ok_or_else(|| L1TxError::Internal("sent state without a hash".into()))?;
        self.checkpoint(&state).await;
        Ok(SentTx { tx_hash, state })
    }

    /// Send and wait for the nonce to resolve
    pub async fn send_and_monitor(
        &self,
        request: TxRequest,
        opts: SendOptions,
    ) -> L1TxResult<L1Receipt> {
        let sent = self.send(request, opts).await?;
        self.monitor(sent.state).await
    }

    /// Drive `state` to resolution.
    ///
    /// Resolves with the receipt of whichever tracked transaction was mined.
    /// Fails with [`L1TxError::Timeout`] on deadline, drop or interrupt
    /// (a cancellation may keep running in the background) and with
    /// [`L1TxError::UnknownMinedTx`] when a foreign transaction took the nonce.
    ///
    /// The manager's own snapshot of the nonce wins over `state`, which may
    /// be stale. A state whose hashes this manager does not track for that
    /// nonce (it was abandoned and the nonce reused) is rejected with
    /// [`L1TxError::NonceConflict`].
    pub async fn monitor(&self, state: TxState) -> L1TxResult<L1Receipt> {
        let nonce = state.nonce;
        if state.account != self.account() {
            return Err(L1TxError::Internal(format!(
                "nonce {} belongs to {:?}, not {:?}",
                nonce,
                state.account,
                self.account()
            )));
        }

        let (state, adopted) = match self.tx_state(nonce) {
            Some(known) if !state.tx_hashes.iter().all(|h| known.owns_hash(h)) => {
                warn!(
                    "Refusing to monitor nonce {} with hashes {:?}, it is now held by {:?}",
                    nonce, state.tx_hashes, known.tx_hashes
                );
                return Err(L1TxError::NonceConflict { nonce });
            }
            Some(known) => (known, false),
            None => (state, true),
        };

        match state.status {
            TxStatus::Mined => {
                return match state.receipt {
                    Some(receipt) if state.owns_hash(&receipt.transaction_hash) => Ok(receipt),
                    receipt => Err(L1TxError::UnknownMinedTx {
                        nonce,
                        tx_hash: receipt.map(|r| r.transaction_hash),
                    }),
                }
            }
            TxStatus::NotMined | TxStatus::Idle => {
                return Err(L1TxError::Internal(format!(
                    "nonce {} cannot be monitored in status {}",
                    nonce, state.status
                )))
            }
            TxStatus::Sent | TxStatus::SpeedUp | TxStatus::Cancelled => {}
        }

        // A state this manager never saw must not share its nonce with a
        // transaction allocated here
        if adopted {
            self.nonce_manager.reserve(nonce).await?;
        }
        let outcome = match self.spawn_monitor(state).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if adopted {
                    self.nonce_manager.release(nonce).await;
                }
                return Err(e);
            }
        };
        outcome.await.unwrap_or(Err(L1TxError::Timeout {
            nonce,
            reason: TimeoutReason::Interrupted,
        }))
    }

    /// Pre-flight `request` from this account without broadcasting
    pub async fn simulate(
        &self,
        request: &TxRequest,
        block_overrides: Option<BlockOverrides>,
        state_overrides: Option<StateOverrides>,
        abi: Option<&Abi>,
    ) -> L1TxResult<Bytes> {
        let call = request.to_call(self.account());
        self.sender
            .estimator()
            .simulate(&call, block_overrides, state_overrides, abi)
            .await
    }

    /// Buffered gas limit `send` would use for `request`
    pub async fn estimate_gas(&self, request: &TxRequest, opts: &SendOptions) -> L1TxResult<U256> {
        let config = self.sender.tx_config(&opts.overrides);
        let call = request.to_call(self.account());
        self.sender
            .estimator()
            .estimate_gas(
                &call,
                opts.gas_limit,
                opts.ignore_block_gas_limit,
                config.gas_limit_buffer_percentage,
            )
            .await
    }

    /// Stop every monitor at its next check. Pending `monitor` calls fail
    /// with a timeout.
    pub fn interrupt(&self) {
        info!(
            "Interrupting {} active monitors",
            self.monitoring.len()
        );
        self.interrupt.send_replace(true);
    }

    /// Allow monitoring again after [`interrupt`](Self::interrupt)
    pub fn restart(&self) {
        debug!("Clearing monitor interrupt");
        self.interrupt.send_replace(false);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupt.borrow()
    }

    /// Wait until every monitor task, including background cancellation
    /// monitoring, has exited
    pub async fn wait_monitoring_stopped(&self) {
        loop {
            let handles = std::mem::take(&mut *self.tasks.lock().await);
            if handles.is_empty() {
                break;
            }
            for result in join_all(handles).await {
                if let Err(e) = result {
                    error!("Monitor task failed: {}", e);
                }
            }
        }
    }

    /// Re-attach monitors to every persisted state that is not terminal.
    ///
    /// Nothing is re-broadcast; each monitor's first check re-reads the chain
    /// to catch transactions mined while the process was down. Nonces already
    /// monitored or already resolved here are skipped, so calling this twice
    /// is harmless. Returns the nonces that were resumed.
    pub async fn load_state_and_resume_monitoring(&self) -> L1TxResult<Vec<u64>> {
        let account = self.account();
        let pending = self.store.load_pending_states(account).await?;
        let mut resumed = Vec::new();

        for state in pending {
            let nonce = state.nonce;
            if state.status == TxStatus::Idle {
                // Never broadcast, nothing on chain to wait for
                debug!("Nonce {} was never sent, not resuming", nonce);
                continue;
            }
            if self.monitoring.contains(&nonce) {
                debug!("Nonce {} is already monitored, not resuming", nonce);
                continue;
            }
            if self.states.get(&nonce).map_or(false, |s| s.is_terminal()) {
                debug!("Nonce {} already resolved, not resuming", nonce);
                continue;
            }
            if let Err(e) = self.nonce_manager.reserve(nonce).await {
                warn!("Cannot resume nonce {}: {}", nonce, e);
                continue;
            }

            let status = state.status;
            let last_hash = state.all_hashes().next().copied();
            match self.spawn_monitor(state).await {
                Ok(_) => {
                    info!(
                        "Resumed monitoring of nonce {} in status {} (latest hash {:?})",
                        nonce, status, last_hash
                    );
                    resumed.push(nonce);
                }
                Err(e) => {
                    warn!("Cannot resume nonce {}: {}", nonce, e);
                    self.nonce_manager.release(nonce).await;
                }
            }
        }

        info!(
            "Resumed {} transactions for {:?}",
            resumed.len(),
            account
        );
        Ok(resumed)
    }

    /// Latest known state of `nonce`
    pub fn tx_state(&self, nonce: u64) -> Option<TxState> {
        self.states.get(&nonce).map(|s| s.value().clone())
    }

    /// Every state this manager has seen, ordered by nonce
    pub fn states(&self) -> Vec<TxState> {
        let mut states: Vec<TxState> = self.states.iter().map(|s| s.value().clone()).collect();
        states.sort_by_key(|s| s.nonce);
        states
    }

    pub fn monitored_nonces(&self) -> Vec<u64> {
        let mut nonces: Vec<u64> = self.monitoring.iter().map(|n| *n).collect();
        nonces.sort_unstable();
        nonces
    }

    async fn spawn_monitor(
        &self,
        state: TxState,
    ) -> L1TxResult<oneshot::Receiver<MonitorOutcome>> {
        let nonce = state.nonce;
        if self.is_interrupted() {
            return Err(L1TxError::Timeout {
                nonce,
                reason: TimeoutReason::Interrupted,
            });
        }
        if !self.monitoring.insert(nonce) {
            return Err(L1TxError::AlreadyMonitored { nonce });
        }
        self.states.insert(nonce, state.clone());

        let (waiter, outcome) = oneshot::channel();
        let monitor = TxMonitor::new(self.context(), state, self.interrupt.subscribe(), waiter);
        let handle = tokio::spawn(monitor.run());

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
        Ok(outcome)
    }

    fn context(&self) -> MonitorContext {
        MonitorContext {
            client: self.client.clone(),
            sender: self.sender.clone(),
            nonce_manager: self.nonce_manager.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            states: self.states.clone(),
            monitoring: self.monitoring.clone(),
        }
    }

    async fn checkpoint(&self, state: &TxState) {
        self.states.insert(state.nonce, state.clone());
        if let Err(e) = self.store.save_state(state).await {
            error!("Failed to persist state of nonce {}: {}", state.nonce, e);
        }
    }
}
