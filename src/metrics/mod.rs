//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transactions sent, by kind (original, speed-up, cancellation)
//! - Terminal outcomes (mined, not mined, dropped)
//! - Time to inclusion and fee levels
//! - Active monitors

use crate::error::{L1TxError, L1TxResult};
use crate::tx::GasPrice;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    pub static ref TX_SENT: CounterVec = register_counter_vec!(
        "l1_tx_sent_total",
        "Transactions broadcast, by kind",
        &["kind"]
    ).unwrap();

    pub static ref TX_MINED: CounterVec = register_counter_vec!(
        "l1_tx_mined_total",
        "Nonces resolved by inclusion, by which transaction was mined",
        &["outcome"]
    ).unwrap();

    pub static ref TX_NOT_MINED: CounterVec = register_counter_vec!(
        "l1_tx_not_mined_total",
        "Nonces abandoned without inclusion, by reason",
        &["reason"]
    ).unwrap();

    pub static ref TX_DROPPED: CounterVec = register_counter_vec!(
        "l1_tx_dropped_total",
        "Transactions no longer visible in the node's pool",
        &["phase"]
    ).unwrap();

    pub static ref TX_TIME_TO_MINE: HistogramVec = register_histogram_vec!(
        "l1_tx_time_to_mine_seconds",
        "Time from first broadcast to inclusion",
        &["outcome"],
        vec![6.0, 12.0, 24.0, 36.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    pub static ref TX_GAS_PRICE_GWEI: GaugeVec = register_gauge_vec!(
        "l1_tx_gas_price_gwei",
        "Fee fields of the latest broadcast",
        &["field"]
    ).unwrap();

    pub static ref ACTIVE_MONITORS: Gauge = register_gauge!(
        "l1_tx_active_monitors",
        "Transactions currently being monitored"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> L1TxResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| L1TxError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| L1TxError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of every registered metric
pub fn render() -> L1TxResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| L1TxError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| L1TxError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_tx_sent(kind: &str) {
    TX_SENT.with_label_values(&[kind]).inc();
}

pub fn record_gas_price(price: &GasPrice) {
    let gwei = |v: ethers::types::U256| {
        ethers::utils::format_units(v, "gwei")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(f64::NAN)
    };

    TX_GAS_PRICE_GWEI
        .with_label_values(&["max_fee_per_gas"])
        .set(gwei(price.max_fee_per_gas));
    TX_GAS_PRICE_GWEI
        .with_label_values(&["max_priority_fee_per_gas"])
        .set(gwei(price.max_priority_fee_per_gas));
    if let Some(blob_fee) = price.max_fee_per_blob_gas {
        TX_GAS_PRICE_GWEI
            .with_label_values(&["max_fee_per_blob_gas"])
            .set(gwei(blob_fee));
    }
}

/// `outcome` is one of `own`, `cancellation` or `unknown`
pub fn record_tx_mined(outcome: &str, seconds: f64) {
    TX_MINED.with_label_values(&[outcome]).inc();
    TX_TIME_TO_MINE
        .with_label_values(&[outcome])
        .observe(seconds.max(0.0));
}

pub fn record_tx_not_mined(reason: &str) {
    TX_NOT_MINED.with_label_values(&[reason]).inc();
}

pub fn record_tx_dropped(phase: &str) {
    TX_DROPPED.with_label_values(&[phase]).inc();
}

pub fn record_monitor_started() {
    ACTIVE_MONITORS.inc();
}

pub fn record_monitor_stopped() {
    ACTIVE_MONITORS.dec();
}
