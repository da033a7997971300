//! Postgres-backed persistence of learned policy parameters, so a restart
//! doesn't retrain from scratch. Table creation is lazy: the first save or
//! load issues `CREATE TABLE IF NOT EXISTS`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::AppError;
use crate::subgraph_id::SubgraphId;

#[derive(Debug, Clone, PartialEq)]
pub struct SaveState {
    pub last_update: DateTime<Utc>,
    pub mean_scaled: f64,
    pub stddev: f64,
}

pub struct PriceSaveStateStore {
    pool: PgPool,
}

impl PriceSaveStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_table(&self) -> Result<(), AppError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_save_state (
                subgraph char(46) PRIMARY KEY,
                last_update timestamptz NOT NULL,
                mean double precision NOT NULL,
                stddev double precision NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert is atomic on `subgraph`: a repeated save for the same key
    /// leaves exactly one row, carrying the latest `last_update`.
    pub async fn save(&self, subgraph: &SubgraphId, mean_scaled: f64, stddev: f64) -> Result<(), AppError> {
        self.ensure_table().await?;
        sqlx::query(
            r#"
            INSERT INTO price_save_state (subgraph, last_update, mean, stddev)
            VALUES ($1, now(), $2, $3)
            ON CONFLICT (subgraph) DO UPDATE
            SET last_update = EXCLUDED.last_update,
                mean = EXCLUDED.mean,
                stddev = EXCLUDED.stddev
            "#,
        )
        .bind(subgraph.as_ipfs())
        .bind(mean_scaled)
        .bind(stddev)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns `None` if no row exists for this subgraph.
    pub async fn load(&self, subgraph: &SubgraphId) -> Result<Option<SaveState>, AppError> {
        self.ensure_table().await?;
        let row: Option<(DateTime<Utc>, f64, f64)> = sqlx::query_as(
            "SELECT last_update, mean, stddev FROM price_save_state WHERE subgraph = $1",
        )
        .bind(subgraph.as_ipfs())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(last_update, mean_scaled, stddev)| SaveState {
            last_update,
            mean_scaled,
            stddev,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_state_equality_ignores_nothing() {
        let a = SaveState {
            last_update: Utc::now(),
            mean_scaled: 0.3,
            stddev: 0.2,
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
