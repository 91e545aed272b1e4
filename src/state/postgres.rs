//! PostgreSQL state store

use super::{TxStateStats, TxStateStore};
use crate::config::DatabaseConfig;
use crate::error::{L1TxError, L1TxResult};
use crate::tx::{TxState, TxStatus};

use async_trait::async_trait;
use ethers::types::Address;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// Transaction state store backed by PostgreSQL
pub struct PgTxStateStore {
    pool: PgPool,
}

impl PgTxStateStore {
    /// Connect using the configured pool limits
    pub async fn new(config: &DatabaseConfig) -> L1TxResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> L1TxResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS l1_tx_states (
                account VARCHAR(42) NOT NULL,
                nonce BIGINT NOT NULL,
                status VARCHAR(20) NOT NULL,
                state JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (account, nonce)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_l1_tx_states_status
            ON l1_tx_states (account, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn account_key(account: Address) -> String {
    format!("{:?}", account)
}

fn nonce_key(nonce: u64) -> L1TxResult<i64> {
    i64::try_from(nonce).map_err(|_| L1TxError::Internal(format!("nonce {} out of range", nonce)))
}

fn decode_state(row: &sqlx::postgres::PgRow) -> L1TxResult<TxState> {
    let value: serde_json::Value = row.try_get("state")?;
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl TxStateStore for PgTxStateStore {
    async fn save_state(&self, state: &TxState) -> L1TxResult<()> {
        let json = serde_json::to_value(state)?;

        sqlx::query(
            r#"
            INSERT INTO l1_tx_states (account, nonce, status, state, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (account, nonce)
            DO UPDATE SET status = $3, state = $4, updated_at = NOW()
            "#,
        )
        .bind(account_key(state.account))
        .bind(nonce_key(state.nonce)?)
        .bind(state.status.as_str())
        .bind(json)
        .execute(&self.pool)
        .await?;

        debug!("Saved state for nonce {} ({})", state.nonce, state.status);
        Ok(())
    }

    async fn load_state(&self, account: Address, nonce: u64) -> L1TxResult<Option<TxState>> {
        let row = sqlx::query("SELECT state FROM l1_tx_states WHERE account = $1 AND nonce = $2")
            .bind(account_key(account))
            .bind(nonce_key(nonce)?)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(decode_state).transpose()
    }

    async fn load_pending_states(&self, account: Address) -> L1TxResult<Vec<TxState>> {
        let rows = sqlx::query(
            r#"
            SELECT state FROM l1_tx_states
            WHERE account = $1 AND status NOT IN ($2, $3)
            ORDER BY nonce
            "#,
        )
        .bind(account_key(account))
        .bind(TxStatus::Mined.as_str())
        .bind(TxStatus::NotMined.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_state).collect()
    }

    async fn delete_state(&self, account: Address, nonce: u64) -> L1TxResult<()> {
        sqlx::query("DELETE FROM l1_tx_states WHERE account = $1 AND nonce = $2")
            .bind(account_key(account))
            .bind(nonce_key(nonce)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stats(&self, account: Address) -> L1TxResult<TxStateStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status IN ('sent', 'speed_up')) as pending,
                COUNT(*) FILTER (WHERE status = 'cancelled') as cancelled,
                COUNT(*) FILTER (WHERE status = 'mined') as mined,
                COUNT(*) FILTER (WHERE status = 'not_mined') as not_mined
            FROM l1_tx_states
            WHERE account = $1
            "#,
        )
        .bind(account_key(account))
        .fetch_one(&self.pool)
        .await?;

        Ok(TxStateStats {
            pending: row.get::<i64, _>("pending") as u64,
            cancelled: row.get::<i64, _>("cancelled") as u64,
            mined: row.get::<i64, _>("mined") as u64,
            not_mined: row.get::<i64, _>("not_mined") as u64,
        })
    }

    async fn health_check(&self) -> L1TxResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
