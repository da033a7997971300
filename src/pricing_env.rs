//! Adapts the bandit's abstract action/observation interface to the real
//! indexer: writing `GLOBAL_COST_MULTIPLIER` and reading back query
//! throughput, with the gateway settle delay as an invariant boundary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::indexer_agent_client::{IndexerAgentClient, GLOBAL_COST_MULTIPLIER};
use crate::metrics_endpoints::MetricsEndpoints;
use crate::query_counts::QueryCounts;
use crate::retry::{with_backoff, RetryBudget};
use crate::subgraph_id::SubgraphId;

/// New observations within this long after a price change are considered
/// unreliable; this is a fixed invariant boundary, not configurable.
pub const GATEWAY_SETTLE_DELAY: Duration = Duration::from_secs(60);

pub struct SubgraphPricingEnv {
    subgraph: SubgraphId,
    indexer_agent: Arc<IndexerAgentClient>,
    metrics_endpoints: Arc<dyn MetricsEndpoints>,
    query_counts: QueryCounts,
    last_change_time: Option<Instant>,
}

impl SubgraphPricingEnv {
    pub fn new(
        subgraph: SubgraphId,
        indexer_agent: Arc<IndexerAgentClient>,
        metrics_endpoints: Arc<dyn MetricsEndpoints>,
    ) -> Self {
        Self {
            subgraph,
            indexer_agent,
            metrics_endpoints,
            query_counts: QueryCounts::new(),
            last_change_time: None,
        }
    }

    /// Overwrites only `GLOBAL_COST_MULTIPLIER` in the current variables;
    /// the model document is left untouched.
    pub async fn set_cost_multiplier(&mut self, multiplier: f64) -> Result<(), AppError> {
        let mut variables = self.indexer_agent.get_cost_variables(&self.subgraph).await?;
        variables.insert(GLOBAL_COST_MULTIPLIER.to_string(), multiplier);
        self.indexer_agent
            .set_cost_model(&self.subgraph, None, Some(&variables))
            .await?;
        self.last_change_time = Some(Instant::now());
        Ok(())
    }

    /// Samples the query counter before and after `window`, suspending
    /// first until at least 60s have elapsed since the last price change.
    pub async fn queries_per_second(
        &self,
        window: Duration,
        cancellation: &CancellationToken,
    ) -> Result<f64, AppError> {
        if let Some(last_change) = self.last_change_time {
            let elapsed = last_change.elapsed();
            if elapsed < GATEWAY_SETTLE_DELAY {
                let remaining = GATEWAY_SETTLE_DELAY - elapsed;
                tokio::select! {
                    _ = sleep(remaining) => {}
                    _ = cancellation.cancelled() => return Err(AppError::Cancelled),
                }
            }
        }

        let budget = RetryBudget::query_counts_sampling();
        let c1 = with_backoff(&budget, || {
            self.query_counts.subgraph_query_count(&self.subgraph, &*self.metrics_endpoints)
        })
        .await?;
        let t1 = Instant::now();

        tokio::select! {
            _ = sleep(window) => {}
            _ = cancellation.cancelled() => return Err(AppError::Cancelled),
        }

        let c2 = with_backoff(&budget, || {
            self.query_counts.subgraph_query_count(&self.subgraph, &*self.metrics_endpoints)
        })
        .await?;
        let t2 = Instant::now();

        let elapsed = (t2 - t1).as_secs_f64();
        Ok((c2.saturating_sub(c1)) as f64 / elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_endpoints::StaticEndpoints;

    #[tokio::test]
    async fn fresh_env_has_no_settle_delay() {
        let env = SubgraphPricingEnv::new(
            SubgraphId::from_ipfs("Qmaz1R8vcv9v3gUfksqiS9JUz7K9G8S5By3JYn8kTiiP5K").unwrap(),
            Arc::new(IndexerAgentClient::new("http://localhost/unused".to_string())),
            Arc::new(StaticEndpoints::new("")),
        );
        assert!(env.last_change_time.is_none());
    }
}
