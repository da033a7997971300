//! Error taxonomy.
//!
//! Mirrors the failure model a control loop actually needs: transient
//! transport/DB errors are retried and absorbed by the caller, "logical"
//! absences (no save state, no frequent queries) are not errors at all, and
//! a small set of invariant violations are fatal and expected to unwind the
//! whole process so an external orchestrator can restart it clean.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("transport error talking to {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} responded with non-success status {status}")]
    Http { endpoint: String, status: u16 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("retries exhausted after {attempts} attempts over {elapsed_secs}s: {last}")]
    RetriesExhausted {
        attempts: u32,
        elapsed_secs: u64,
        last: String,
    },

    #[error("numeric overflow scaling action {action}")]
    NumericOverflow { action: f64 },

    #[error("experience buffer inconsistent: actions={actions} rewards={rewards} log_probs={log_probs}")]
    BufferInconsistent {
        actions: usize,
        rewards: usize,
        log_probs: usize,
    },

    #[error("unknown {kind} key `{key}` in factory configuration")]
    UnknownFactoryKey { kind: &'static str, key: String },

    #[error("missing required configuration option `{0}`")]
    MissingConfig(&'static str),

    #[error("kubernetes watch failed: {0}")]
    KubeWatch(#[from] kube::Error),

    #[error("graphql errors from {endpoint}: {messages:?}")]
    GraphQl {
        endpoint: String,
        messages: Vec<String>,
    },

    #[error("loop cancelled")]
    Cancelled,
}

impl AppError {
    /// Fatal errors unwind the owning task and, for invariant/numerical/
    /// supervisor classes, the whole process. Transport/database errors are
    /// always recoverable at the scope that catches them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::NumericOverflow { .. }
                | AppError::BufferInconsistent { .. }
                | AppError::UnknownFactoryKey { .. }
                | AppError::MissingConfig(_)
                | AppError::KubeWatch(_)
        )
    }
}

pub type AppResult<T> = Result<T, AppError>;
