//! Postgres-backed reader/writer for the query-logging pipeline's three
//! tables: `query_skeletons` (immutable, produced externally),
//! `query_logs` (passively observed), and `mrq_query_logs` (actively
//! probed by MRQLoop). `query_skeletons`/`query_logs` are read-only here;
//! `mrq_query_logs` is also written.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::subgraph_id::SubgraphId;

/// Which table to aggregate "frequent query" statistics from. A group may
/// legitimately appear in both; the caller picks one depending on which
/// builder produced the model (spec.md §3, MRQ_QueryLog invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    QueryLogs,
    MrqQueryLogs,
}

impl LogSource {
    fn table(self) -> &'static str {
        match self {
            LogSource::QueryLogs => "query_logs",
            LogSource::MrqQueryLogs => "mrq_query_logs",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryAggregate {
    pub hash: Vec<u8>,
    pub query: String,
    pub count: i64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub stddev_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MrqCandidate {
    pub hash: Vec<u8>,
    pub query: String,
}

pub struct LogsStore {
    pool: PgPool,
}

impl LogsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Groups by `query_hash`, keeps groups with `count >= min_count` and
    /// at least one non-NULL `query_time_ms`, ordered by count descending.
    pub async fn frequent_queries(
        &self,
        subgraph: &SubgraphId,
        min_count: i64,
        source: LogSource,
    ) -> Result<Vec<QueryAggregate>, AppError> {
        let sql = format!(
            r#"
            SELECT s.hash, s.query,
                   count(l.id) AS count,
                   min(l.query_time_ms)::float8 AS min_ms,
                   max(l.query_time_ms)::float8 AS max_ms,
                   avg(l.query_time_ms)::float8 AS avg_ms,
                   coalesce(stddev(l.query_time_ms), 0.0)::float8 AS stddev_ms
            FROM {table} l
            JOIN query_skeletons s ON s.hash = l.query_hash
            WHERE l.subgraph = $1 AND l.query_time_ms IS NOT NULL
            GROUP BY s.hash, s.query
            HAVING count(l.id) >= $2
            ORDER BY count(l.id) DESC
            "#,
            table = source.table()
        );

        let rows: Vec<(Vec<u8>, String, i64, f64, f64, f64, f64)> = sqlx::query_as(&sql)
            .bind(subgraph.as_ipfs())
            .bind(min_count)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(hash, query, count, min_ms, max_ms, avg_ms, stddev_ms)| QueryAggregate {
                hash,
                query,
                count,
                min_ms,
                max_ms,
                avg_ms,
                stddev_ms,
            })
            .collect())
    }

    /// Candidates for MRQ active probing: groups in `query_logs` with
    /// `count >= min_count` where every `query_time_ms` is still NULL.
    pub async fn mrq_candidates(
        &self,
        subgraph: &SubgraphId,
        min_count: i64,
    ) -> Result<Vec<MrqCandidate>, AppError> {
        let rows: Vec<(Vec<u8>, String)> = sqlx::query_as(
            r#"
            SELECT s.hash, s.query
            FROM query_logs l
            JOIN query_skeletons s ON s.hash = l.query_hash
            WHERE l.subgraph = $1
            GROUP BY s.hash, s.query
            HAVING count(l.id) >= $2 AND count(l.query_time_ms) = 0
            "#,
        )
        .bind(subgraph.as_ipfs())
        .bind(min_count)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(hash, query)| MrqCandidate { hash, query })
            .collect())
    }

    /// Picks one row at random among a candidate's `query_logs` entries and
    /// returns its `query_variables` JSON (if any).
    pub async fn sample_variables(
        &self,
        subgraph: &SubgraphId,
        query_hash: &[u8],
    ) -> Result<Option<Value>, AppError> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            SELECT query_variables FROM query_logs
            WHERE subgraph = $1 AND query_hash = $2
            ORDER BY random() LIMIT 1
            "#,
        )
        .bind(subgraph.as_ipfs())
        .bind(query_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(vars,)| vars).and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn ensure_mrq_table(&self) -> Result<(), AppError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mrq_query_logs (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                subgraph char(46) NOT NULL,
                query_hash bytea NOT NULL REFERENCES query_skeletons(hash),
                timestamp timestamptz NOT NULL,
                query_time_ms int NOT NULL,
                query_variables text
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_mrq_log(
        &self,
        subgraph: &SubgraphId,
        query_hash: &[u8],
        query_time_ms: i32,
        query_variables: Option<&Value>,
    ) -> Result<Uuid, AppError> {
        self.ensure_mrq_table().await?;
        let variables_text = query_variables.map(|v| v.to_string());
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO mrq_query_logs (subgraph, query_hash, timestamp, query_time_ms, query_variables)
            VALUES ($1, $2, now(), $3, $4)
            RETURNING id
            "#,
        )
        .bind(subgraph.as_ipfs())
        .bind(query_hash)
        .bind(query_time_ms)
        .bind(variables_text)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}
