//! Nonce management for a single sending account
//!
//! Handles:
//! - Serialized allocation so two sends never claim the same nonce
//! - Tracking which nonces are held by a live transaction
//! - Releasing a nonce whose transaction was abandoned so it can be reused

use crate::chain::{retry_transient, BlockTag, TxBroadcaster};
use crate::error::{L1TxError, L1TxResult};

use ethers::types::Address;
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct NonceState {
    /// Next nonce to hand out, once known
    next: Option<u64>,
    /// Nonces held by transactions that are not yet resolved
    live: BTreeSet<u64>,
}

/// Allocates nonces for one account
pub struct NonceManager {
    account: Address,
    state: Mutex<NonceState>,
}

impl NonceManager {
    pub fn new(account: Address) -> Self {
        Self {
            account,
            state: Mutex::new(NonceState {
                next: None,
                live: BTreeSet::new(),
            }),
        }
    }

    pub fn account(&self) -> Address {
        self.account
    }

    /// Take the next free nonce.
    ///
    /// The lock is held across the pending-count query so concurrent callers
    /// are serialized. The node's pending count wins when it is ahead of the
    /// local view (transactions sent by another process).
    pub async fn allocate<B>(&self, broadcaster: &B) -> L1TxResult<u64>
    where
        B: TxBroadcaster + ?Sized,
    {
        let mut state = self.state.lock().await;

        let pending = retry_transient("pending transaction count", || {
            broadcaster.transaction_count(self.account, BlockTag::Pending)
        })
        .await?;

        let mut nonce = match state.next {
            Some(next) if next > pending => next,
            Some(next) => {
                if next < pending {
                    warn!(
                        "Local nonce {} behind node pending count {} for {:?}",
                        next, pending, self.account
                    );
                }
                pending
            }
            None => pending,
        };
        while state.live.contains(&nonce) {
            nonce += 1;
        }

        state.live.insert(nonce);
        state.next = Some(nonce + 1);
        debug!("Allocated nonce {} for {:?}", nonce, self.account);
        Ok(nonce)
    }

    /// Claim a specific nonce, e.g. for a resumed transaction
    pub async fn reserve(&self, nonce: u64) -> L1TxResult<()> {
        let mut state = self.state.lock().await;
        if !state.live.insert(nonce) {
            return Err(L1TxError::NonceConflict { nonce });
        }
        if state.next.map_or(true, |next| next <= nonce) {
            state.next = Some(nonce + 1);
        }
        Ok(())
    }

    /// The nonce was consumed on chain
    pub async fn confirm(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.live.remove(&nonce);
    }

    /// The transaction holding `nonce` was abandoned; the nonce may be reused
    pub async fn release(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        state.live.remove(&nonce);

        // If this was the latest nonce handed out, we can rewind
        if state.next == Some(nonce + 1) {
            state.next = Some(nonce);
            debug!("Released nonce {} for {:?}", nonce, self.account);
        }
    }

    pub async fn is_live(&self, nonce: u64) -> bool {
        self.state.lock().await.live.contains(&nonce)
    }

    pub async fn live_nonces(&self) -> Vec<u64> {
        self.state.lock().await.live.iter().copied().collect()
    }
}
