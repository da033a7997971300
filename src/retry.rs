//! Exponential backoff shared by every network call in the control plane:
//! indexer-agent, indexer-service scrapes, and graph-node probing all
//! retry transient failures the same way, capped at 30s per attempt.
//!
//! Grounded in the teacher's `PolymarketScraper::execute_with_retry`
//! (`src/scrapers/polymarket_api.rs`), generalized from a fixed 3-attempt
//! loop into a caller-supplied attempt/duration budget so it can serve both
//! the general indexer-agent case and `queriesPerSecond`'s 10-attempts/
//! 10-minutes budget (spec.md §4.3, §5).

use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::AppError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF_PER_ATTEMPT: Duration = Duration::from_secs(30);

pub struct RetryBudget {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
}

impl RetryBudget {
    pub fn standard() -> Self {
        // Generous default for indexer-agent/indexer-service calls that
        // don't carry their own explicit budget.
        Self {
            max_attempts: 10,
            max_elapsed: Duration::from_secs(10 * 60),
        }
    }

    pub fn query_counts_sampling() -> Self {
        Self {
            max_attempts: 10,
            max_elapsed: Duration::from_secs(10 * 60),
        }
    }
}

/// Runs `op` until it succeeds, the attempt budget is exhausted, or the
/// elapsed-time budget is exhausted, backing off exponentially (capped at
/// 30s) between attempts. `op` returning `Ok(Err(e))` where `e` is judged
/// non-retryable by the caller (via `Err` directly) aborts immediately;
/// returning `Err` from `op` itself is always treated as retryable.
pub async fn with_backoff<T, F, Fut>(budget: &RetryBudget, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AppError>>,
{
    let start = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    let mut last_error = String::new();

    for attempt in 1..=budget.max_attempts {
        if start.elapsed() >= budget.max_elapsed {
            break;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(attempt, error = %err, "retryable operation failed, backing off");
                last_error = err.to_string();
            }
        }
        if start.elapsed() >= budget.max_elapsed {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF_PER_ATTEMPT);
    }

    Err(AppError::RetriesExhausted {
        attempts: budget.max_attempts,
        elapsed_secs: start.elapsed().as_secs(),
        last: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let budget = RetryBudget {
            max_attempts: 5,
            max_elapsed: Duration::from_secs(5),
        };
        let result = with_backoff(&budget, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::RetriesExhausted {
                        attempts: 0,
                        elapsed_secs: 0,
                        last: "transient".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let budget = RetryBudget {
            max_attempts: 3,
            max_elapsed: Duration::from_secs(5),
        };
        let result: Result<(), AppError> = with_backoff(&budget, || async {
            Err(AppError::RetriesExhausted {
                attempts: 0,
                elapsed_secs: 0,
                last: "always fails".into(),
            })
        })
        .await;
        assert!(result.is_err());
    }
}
