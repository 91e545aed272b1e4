//! End-to-end lifecycle tests against the in-process fake chain

mod common;

use common::{account, blob_inputs, manager_for, recipient, test_config, wait_until, Harness};
use futures::future::join_all;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use l1_tx_manager::error::{NodeError, NodeErrorKind};
use l1_tx_manager::state::TxStateStore;
use l1_tx_manager::tx::{gwei, TxRequest, TxStatus};
use l1_tx_manager::{L1TxConfig, L1TxError, SendOptions, TimeoutReason, TxConfigOverrides};

const LIMIT: Duration = Duration::from_secs(30);

fn transfer() -> TxRequest {
    TxRequest::new(recipient()).value(1_000u64)
}

#[tokio::test(start_paused = true)]
async fn test_automined_transfer_resolves_mined() {
    let h = Harness::new(test_config());
    h.chain.set_automine(true);

    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    assert_eq!(sent.state.nonce, 0);
    assert_eq!(sent.state.status, TxStatus::Sent);

    let receipt = assert_ok!(h.manager.monitor(sent.state).await);
    assert!(receipt.is_success());
    assert_eq!(receipt.transaction_hash, sent.tx_hash);

    let state = h.manager.tx_state(0).unwrap();
    assert_eq!(state.status, TxStatus::Mined);
    assert_eq!(state.receipt, Some(receipt));
    assert!(h.manager.monitored_nonces().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_and_monitor_returns_receipt() {
    let h = Harness::new(test_config());
    h.chain.set_automine(true);

    let receipt = h
        .manager
        .send_and_monitor(transfer(), SendOptions::default())
        .await
        .unwrap();
    assert!(receipt.is_success());
    assert_eq!(h.chain.broadcast_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_transaction_is_sped_up_then_mined() {
    let h = Harness::new(test_config());
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();

    let manager = h.manager.clone();
    let monitor = tokio::spawn(async move { manager.monitor(sent.state).await });

    h.chain.mine_empty_blocks(2);
    wait_until("speed-up", LIMIT, || {
        h.manager
            .tx_state(0)
            .map_or(false, |s| s.status == TxStatus::SpeedUp)
    })
    .await;

    let state = h.manager.tx_state(0).unwrap();
    assert_eq!(state.tx_hashes.len(), 2);
    assert_eq!(state.tx_hashes[0], sent.tx_hash);

    let broadcasts = h.chain.broadcasts();
    assert_eq!(broadcasts.len(), 2);
    assert_eq!(broadcasts[0].nonce, broadcasts[1].nonce);
    assert!(broadcasts[1].max_fee_per_gas > broadcasts[0].max_fee_per_gas);
    assert!(broadcasts[1].max_priority_fee_per_gas > broadcasts[0].max_priority_fee_per_gas);

    h.chain.mine();
    let receipt = monitor.await.unwrap().unwrap();
    assert_eq!(receipt.transaction_hash, state.tx_hashes[1]);
    assert_eq!(h.manager.tx_state(0).unwrap().status, TxStatus::Mined);
}

#[tokio::test(start_paused = true)]
async fn test_speed_ups_stop_at_max_attempts() {
    let h = Harness::new(L1TxConfig {
        stall_time_ms: 12_000,
        max_speed_up_attempts: 2,
        ..test_config()
    });
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();

    let manager = h.manager.clone();
    let monitor = tokio::spawn(async move { manager.monitor(sent.state).await });

    for _ in 0..6 {
        h.chain.mine_empty();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let state = h.manager.tx_state(0).unwrap();
    assert_eq!(state.status, TxStatus::SpeedUp);
    assert_eq!(state.tx_hashes.len(), 3);

    let fees: Vec<_> = h
        .chain
        .broadcasts()
        .iter()
        .map(|tx| tx.max_fee_per_gas)
        .collect();
    assert_eq!(fees.len(), 3);
    assert!(fees.windows(2).all(|w| w[1] > w[0]));

    h.chain.mine();
    let receipt = monitor.await.unwrap().unwrap();
    assert_eq!(receipt.transaction_hash, state.tx_hashes[2]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_cancels_and_cancellation_is_mined() {
    let h = Harness::new(L1TxConfig {
        tx_timeout_ms: 200,
        ..test_config()
    });
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    let original = h.chain.broadcasts()[0].clone();
    h.chain.drop_pending(0);

    let err = h.manager.monitor(sent.state).await.unwrap_err();
    assert!(matches!(
        err,
        L1TxError::Timeout {
            nonce: 0,
            reason: TimeoutReason::Deadline
        }
    ));

    let state = h.manager.tx_state(0).unwrap();
    assert_eq!(state.status, TxStatus::Cancelled);
    assert_eq!(state.cancel_tx_hashes.len(), 1);

    let cancellation = h.chain.pending_tx(0).unwrap();
    assert_eq!(cancellation.hash, state.cancel_tx_hashes[0]);
    assert_eq!(cancellation.nonce, 0);
    assert_eq!(cancellation.to, Some(account()));
    assert!(cancellation.value.is_zero());
    assert!(cancellation.input.is_empty());
    assert!(cancellation.max_fee_per_gas.unwrap() > original.max_fee_per_gas);
    assert!(cancellation.max_priority_fee_per_gas.unwrap() > original.max_priority_fee_per_gas);

    // Cancellation keeps being monitored after the caller gave up
    assert_eq!(h.manager.monitored_nonces(), vec![0]);
    h.chain.mine();
    wait_until("cancellation mined", LIMIT, || {
        h.manager
            .tx_state(0)
            .map_or(false, |s| s.status == TxStatus::Mined)
    })
    .await;

    let state = h.manager.tx_state(0).unwrap();
    let receipt = state.receipt.unwrap();
    assert_eq!(receipt.transaction_hash, state.cancel_tx_hashes[0]);
    h.manager.wait_monitoring_stopped().await;
    assert!(h.manager.monitored_nonces().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_cancellation_is_sped_up() {
    let h = Harness::new(L1TxConfig {
        tx_timeout_ms: 200,
        ..test_config()
    });
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();

    let err = h.manager.monitor(sent.state).await.unwrap_err();
    assert!(err.is_timeout());

    h.chain.mine_empty_blocks(2);
    wait_until("cancellation speed-up", LIMIT, || {
        h.manager
            .tx_state(0)
            .map_or(false, |s| s.cancel_tx_hashes.len() == 2)
    })
    .await;

    let state = h.manager.tx_state(0).unwrap();
    assert_eq!(state.status, TxStatus::Cancelled);
    assert_eq!(state.tx_hashes.len(), 1);
    assert_eq!(h.chain.pending_tx(0).unwrap().hash, state.cancel_tx_hashes[1]);

    h.chain.mine();
    wait_until("cancellation mined", LIMIT, || {
        h.manager
            .tx_state(0)
            .map_or(false, |s| s.status == TxStatus::Mined)
    })
    .await;
    let receipt = h.manager.tx_state(0).unwrap().receipt.unwrap();
    assert_eq!(receipt.transaction_hash, state.cancel_tx_hashes[1]);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_gives_up_after_final_timeout() {
    let h = Harness::new(L1TxConfig {
        tx_timeout_ms: 200,
        tx_cancellation_final_timeout_ms: 2_000,
        ..test_config()
    });
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();

    let err = h.manager.monitor(sent.state).await.unwrap_err();
    assert!(err.is_timeout());

    h.manager.wait_monitoring_stopped().await;
    assert_eq!(h.manager.tx_state(0).unwrap().status, TxStatus::NotMined);
    assert!(h.manager.monitored_nonces().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_without_cancellation_frees_nonce() {
    let h = Harness::new(L1TxConfig {
        tx_timeout_ms: 200,
        cancel_tx_on_timeout: false,
        ..test_config()
    });
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    h.chain.drop_pending(0);

    let err = h.manager.monitor(sent.state).await.unwrap_err();
    assert!(matches!(
        err,
        L1TxError::Timeout {
            nonce: 0,
            reason: TimeoutReason::Deadline
        }
    ));
    assert_eq!(h.manager.tx_state(0).unwrap().status, TxStatus::NotMined);
    assert_eq!(h.chain.broadcast_count(), 1);

    let next = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    assert_eq!(next.state.nonce, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unseen_transaction_is_treated_as_dropped() {
    let h = Harness::new(L1TxConfig {
        cancel_tx_on_timeout: false,
        tx_unseen_considered_dropped_ms: 1_000,
        ..test_config()
    });
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    h.chain.drop_pending(0);

    let err = assert_err!(h.manager.monitor(sent.state).await);
    assert!(matches!(
        err,
        L1TxError::Timeout {
            nonce: 0,
            reason: TimeoutReason::Dropped
        }
    ));
    assert_eq!(h.manager.tx_state(0).unwrap().status, TxStatus::NotMined);
}

#[tokio::test(start_paused = true)]
async fn test_foreign_transaction_reports_unknown_mined() {
    let h = Harness::new(test_config());
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();

    let foreign = h.chain.replace_with_foreign(0);
    h.chain.mine();

    let err = assert_err!(h.manager.monitor(sent.state).await);
    assert!(err.is_unknown_mined());
    match err {
        L1TxError::UnknownMinedTx { nonce, tx_hash } => {
            assert_eq!(nonce, 0);
            assert_eq!(tx_hash, Some(foreign));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    let state = h.manager.tx_state(0).unwrap();
    assert_eq!(state.status, TxStatus::Mined);
    assert_eq!(state.receipt.unwrap().transaction_hash, foreign);

    // Asking again reports the same foreign transaction
    let err = assert_err!(h.manager.monitor(h.manager.tx_state(0).unwrap()).await);
    assert!(
        matches!(err, L1TxError::UnknownMinedTx { nonce: 0, tx_hash: Some(hash) } if hash == foreign)
    );

    // The nonce stays consumed
    let next = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    assert_eq!(next.state.nonce, 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_restart() {
    let h = Harness::new(test_config());
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    drop(h.manager);

    let restarted = manager_for(&h.chain, &h.store, test_config());
    let resumed = restarted.load_state_and_resume_monitoring().await.unwrap();
    assert_eq!(resumed, vec![0]);

    let state = restarted.tx_state(0).unwrap();
    assert_eq!(state.status, TxStatus::Sent);
    assert_eq!(state.tx_hashes[0], sent.tx_hash);

    // Already monitored, not resumed twice
    assert!(restarted
        .load_state_and_resume_monitoring()
        .await
        .unwrap()
        .is_empty());
    assert!(matches!(
        restarted.monitor(state).await,
        Err(L1TxError::AlreadyMonitored { nonce: 0 })
    ));

    h.chain.mine();
    wait_until("resumed tx mined", LIMIT, || {
        restarted
            .tx_state(0)
            .map_or(false, |s| s.status == TxStatus::Mined)
    })
    .await;
    restarted.wait_monitoring_stopped().await;

    assert_eq!(h.chain.broadcast_count(), 1);
    // Resolved records are not picked up again
    assert!(restarted
        .load_state_and_resume_monitoring()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resume_catches_transaction_mined_while_down() {
    let h = Harness::new(test_config());
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    drop(h.manager);
    h.chain.mine();

    let restarted = manager_for(&h.chain, &h.store, test_config());
    assert_eq!(
        restarted.load_state_and_resume_monitoring().await.unwrap(),
        vec![0]
    );
    restarted.wait_monitoring_stopped().await;

    let state = restarted.tx_state(0).unwrap();
    assert_eq!(state.status, TxStatus::Mined);
    assert_eq!(state.receipt.unwrap().transaction_hash, sent.tx_hash);
    assert_eq!(h.chain.broadcast_count(), 1);

    // A second restart finds nothing to do
    let again = manager_for(&h.chain, &h.store, test_config());
    assert!(again
        .load_state_and_resume_monitoring()
        .await
        .unwrap()
        .is_empty());
    assert!(again.monitored_nonces().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_and_restart() {
    let h = Harness::new(test_config());
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();

    let manager = h.manager.clone();
    let state = sent.state.clone();
    let monitor = tokio::spawn(async move { manager.monitor(state).await });
    wait_until("monitor started", LIMIT, || {
        h.manager.monitored_nonces() == vec![0]
    })
    .await;

    h.manager.interrupt();
    let err = monitor.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        L1TxError::Timeout {
            reason: TimeoutReason::Interrupted,
            ..
        }
    ));
    h.manager.wait_monitoring_stopped().await;
    assert!(h.manager.monitored_nonces().is_empty());
    assert_eq!(h.manager.tx_state(0).unwrap().status, TxStatus::Sent);

    // Refused while interrupted
    assert!(h.manager.monitor(sent.state.clone()).await.is_err());

    h.manager.restart();
    h.chain.mine();
    let receipt = h.manager.monitor(h.manager.tx_state(0).unwrap()).await.unwrap();
    assert_eq!(receipt.transaction_hash, sent.tx_hash);
}

#[tokio::test(start_paused = true)]
async fn test_blob_cancellation_resupplies_blobs() {
    let h = Harness::new(L1TxConfig {
        tx_timeout_ms: 200,
        ..test_config()
    });
    let request = TxRequest::new(recipient())
        .data(vec![0x01u8, 0x02])
        .blobs(blob_inputs());
    let sent = h.manager.send(request, SendOptions::default()).await.unwrap();
    let original = h.chain.broadcasts()[0].clone();
    let original_blob_fee = original.max_fee_per_blob_gas.unwrap();
    assert!(!original_blob_fee.is_zero());

    let err = h.manager.monitor(sent.state).await.unwrap_err();
    assert!(err.is_timeout());

    let cancellation = h.chain.pending_tx(0).unwrap();
    assert_eq!(cancellation.to, Some(account()));
    assert!(cancellation.input.is_empty());
    assert_eq!(
        cancellation.blob_versioned_hashes,
        blob_inputs().versioned_hashes()
    );
    assert!(cancellation.max_fee_per_blob_gas.unwrap() > original_blob_fee);

    let resent = h.chain.broadcasts().last().cloned().unwrap();
    assert_eq!(resent.sidecar, Some(blob_inputs()));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sends_get_distinct_nonces() {
    let h = Harness::new(test_config());

    let sends = (0..5).map(|_| {
        let manager = h.manager.clone();
        async move { manager.send(transfer(), SendOptions::default()).await }
    });
    let mut nonces: Vec<u64> = join_all(sends)
        .await
        .into_iter()
        .map(|r| r.unwrap().state.nonce)
        .collect();
    nonces.sort_unstable();
    assert_eq!(nonces, vec![0, 1, 2, 3, 4]);
    assert_eq!(h.chain.pool_len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_price_above_cap_fails_before_broadcast() {
    let h = Harness::new(L1TxConfig {
        max_gwei: 5,
        ..test_config()
    });

    let err = h
        .manager
        .send(transfer(), SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, L1TxError::GasPriceExceedsCap { .. }));
    assert_eq!(h.chain.broadcast_count(), 0);

    h.chain.set_base_fee(gwei(2));
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    assert_eq!(sent.state.nonce, 0);
    assert!(sent.state.gas_price.max_fee_per_gas <= gwei(5));
}

#[tokio::test(start_paused = true)]
async fn test_failed_broadcast_releases_nonce() {
    let h = Harness::new(test_config());
    h.chain.fail_next_broadcast(NodeError::new(
        NodeErrorKind::InsufficientFunds,
        "insufficient funds for gas * price + value",
    ));

    let err = h
        .manager
        .send(transfer(), SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, L1TxError::Node(ref e) if e.kind == NodeErrorKind::InsufficientFunds));
    assert!(h.manager.tx_state(0).is_none());

    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    assert_eq!(sent.state.nonce, 0);
}

#[tokio::test(start_paused = true)]
async fn test_checkpoints_reach_the_store() {
    let h = Harness::new(test_config());
    h.chain.set_automine(true);
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();

    let stored = h.store.load_state(account(), 0).await.unwrap().unwrap();
    assert_eq!(stored.status, TxStatus::Sent);
    assert_eq!(stored.tx_hashes, vec![sent.tx_hash]);

    h.manager.monitor(sent.state).await.unwrap();
    let stored = h.store.load_state(account(), 0).await.unwrap().unwrap();
    assert_eq!(stored.status, TxStatus::Mined);
    assert!(h.store.load_pending_states(account()).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stale_state_of_reused_nonce_is_rejected() {
    let h = Harness::new(L1TxConfig {
        tx_timeout_ms: 200,
        cancel_tx_on_timeout: false,
        ..test_config()
    });
    let first = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    h.chain.drop_pending(0);
    let err = assert_err!(h.manager.monitor(first.state.clone()).await);
    assert!(err.is_timeout());

    let second = h
        .manager
        .send(TxRequest::new(recipient()).value(2_000u64), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(second.state.nonce, 0);
    assert_ne!(second.tx_hash, first.tx_hash);

    let err = assert_err!(h.manager.monitor(first.state).await);
    assert!(matches!(err, L1TxError::NonceConflict { nonce: 0 }));

    // The transaction now holding the nonce is still tracked and persisted
    let state = h.manager.tx_state(0).unwrap();
    assert_eq!(state.status, TxStatus::Sent);
    assert_eq!(state.tx_hashes, vec![second.tx_hash]);
    let stored = h.store.load_state(account(), 0).await.unwrap().unwrap();
    assert_eq!(stored.status, TxStatus::Sent);
    assert_eq!(stored.tx_hashes, vec![second.tx_hash]);
    assert!(h.manager.monitored_nonces().is_empty());

    // Nonce 0 is still held, so the next send moves on
    let third = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    assert_eq!(third.state.nonce, 1);

    h.chain.mine();
    let receipt = assert_ok!(h.manager.monitor(second.state).await);
    assert_eq!(receipt.transaction_hash, second.tx_hash);
}

#[tokio::test(start_paused = true)]
async fn test_resolved_state_returns_recorded_receipt() {
    let h = Harness::new(test_config());
    h.chain.set_automine(true);
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    let receipt = assert_ok!(h.manager.monitor(sent.state.clone()).await);

    // A stale `Sent` copy resolves from the manager's snapshot
    let again = assert_ok!(h.manager.monitor(sent.state).await);
    assert_eq!(again, receipt);
    assert_eq!(h.chain.broadcast_count(), 1);
    assert!(h.manager.monitored_nonces().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_per_transaction_timeout_survives_restart() {
    let h = Harness::new(test_config());
    let opts = SendOptions {
        overrides: TxConfigOverrides {
            tx_timeout_ms: Some(200),
            cancel_tx_on_timeout: Some(false),
            ..Default::default()
        },
        ..Default::default()
    };

    let started = tokio::time::Instant::now();
    let first = h.manager.send(transfer(), opts.clone()).await.unwrap();
    h.chain.drop_pending(0);
    let err = assert_err!(h.manager.monitor(first.state).await);
    assert!(matches!(
        err,
        L1TxError::Timeout {
            nonce: 0,
            reason: TimeoutReason::Deadline
        }
    ));
    assert_eq!(h.manager.tx_state(0).unwrap().status, TxStatus::NotMined);

    let second = h
        .manager
        .send(TxRequest::new(recipient()).value(2_000u64), opts)
        .await
        .unwrap();
    assert_eq!(second.state.nonce, 0);
    drop(h.manager);

    // The restarted manager only knows the global five minute timeout
    let restarted = manager_for(&h.chain, &h.store, test_config());
    let stored = h.store.load_state(account(), 0).await.unwrap().unwrap();
    assert_eq!(stored.config_overrides.tx_timeout_ms, Some(200));

    let err = assert_err!(restarted.monitor(stored).await);
    assert!(matches!(
        err,
        L1TxError::Timeout {
            nonce: 0,
            reason: TimeoutReason::Deadline
        }
    ));
    assert_eq!(restarted.tx_state(0).unwrap().status, TxStatus::NotMined);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(h.chain.broadcast_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_absolute_deadline_times_out() {
    let h = Harness::new(L1TxConfig {
        tx_timeout_at: Some(chrono::Utc::now() + chrono::Duration::seconds(1)),
        cancel_tx_on_timeout: false,
        ..test_config()
    });
    let started = tokio::time::Instant::now();
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();

    let err = assert_err!(h.manager.monitor(sent.state).await);
    assert!(matches!(
        err,
        L1TxError::Timeout {
            nonce: 0,
            reason: TimeoutReason::Deadline
        }
    ));
    assert_eq!(h.manager.tx_state(0).unwrap().status, TxStatus::NotMined);
    // Well before the relative five minute timeout
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_never_sent_record_is_not_resumed() {
    let h = Harness::new(test_config());
    let sent = h.manager.send(transfer(), SendOptions::default()).await.unwrap();
    drop(h.manager);

    let mut idle = sent.state;
    idle.status = TxStatus::Idle;
    h.store.save_state(&idle).await.unwrap();

    let restarted = manager_for(&h.chain, &h.store, test_config());
    assert!(restarted
        .load_state_and_resume_monitoring()
        .await
        .unwrap()
        .is_empty());
    assert!(restarted.monitored_nonces().is_empty());
    assert!(restarted.tx_state(0).is_none());
}
