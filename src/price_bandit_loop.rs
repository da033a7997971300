//! The core per-subgraph control loop: observe throughput, adjust
//! `GLOBAL_COST_MULTIPLIER`, observe the resulting reward, learn (spec.md
//! §4.4). One instance runs per currently-allocated subgraph, cancelled
//! when [`AllocationSupervisor`](crate::allocation_supervisor) deallocates
//! it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bandit::{Bandit, BanditFactory};
use crate::error::AppError;
use crate::indexer_agent_client::IndexerAgentClient;
use crate::metrics_endpoints::MetricsEndpoints;
use crate::metrics_server::GaugeRegistry;
use crate::policy::optimizer::OptimizerFactory;
use crate::policy::ActionStrategyFactory;
use crate::pricing_env::SubgraphPricingEnv;
use crate::save_state_store::PriceSaveStateStore;
use crate::subgraph_id::SubgraphId;

const DEFAULT_INITIAL_MEAN: f64 = 5e-8;
const DEFAULT_INITIAL_STDDEV: f64 = 1e-1;
const ADAM_LEARNING_RATE: f64 = 0.01;
const BUFFER_MAX_SIZE: usize = 10;

/// A save state older than this many hours is considered stale and
/// ignored in favor of the fixed defaults (spec.md §4.4).
const SAVE_STATE_FRESHNESS_HOURS: i64 = 24;

pub struct PriceBanditLoop {
    subgraph: SubgraphId,
    env: SubgraphPricingEnv,
    save_state_store: Arc<PriceSaveStateStore>,
    bandit: Box<dyn Bandit>,
    gauges: Arc<GaugeRegistry>,
    qps_observation: Duration,
}

impl PriceBanditLoop {
    pub async fn new(
        subgraph: SubgraphId,
        indexer_agent: Arc<IndexerAgentClient>,
        metrics_endpoints: Arc<dyn MetricsEndpoints>,
        save_state_store: Arc<PriceSaveStateStore>,
        gauges: Arc<GaugeRegistry>,
        qps_observation: Duration,
    ) -> Result<Self, AppError> {
        let saved = save_state_store.load(&subgraph).await?;
        let (initial_mean, initial_stddev) = match saved {
            Some(state) if Utc::now() - state.last_update < chrono::Duration::hours(SAVE_STATE_FRESHNESS_HOURS) => {
                info!(subgraph = %subgraph, "adopting fresh save state");
                (state.mean_scaled, state.stddev)
            }
            Some(_) => {
                info!(subgraph = %subgraph, "save state is stale, starting from defaults");
                (DEFAULT_INITIAL_MEAN, DEFAULT_INITIAL_STDDEV)
            }
            None => (DEFAULT_INITIAL_MEAN, DEFAULT_INITIAL_STDDEV),
        };

        let policy = ActionStrategyFactory::create("scaled_gaussian", initial_mean, initial_stddev)?;
        let optimizer = OptimizerFactory::create("adam", ADAM_LEARNING_RATE, 2)?;
        let bandit = BanditFactory::create("rolling_ppo", policy, optimizer, BUFFER_MAX_SIZE)?;

        let env = SubgraphPricingEnv::new(subgraph.clone(), indexer_agent, metrics_endpoints);

        Ok(Self {
            subgraph,
            env,
            save_state_store,
            bandit,
            gauges,
            qps_observation,
        })
    }

    /// Runs until `cancellation` fires. A fatal error unwinds past the
    /// supervisor; a cancellation returns `Ok(())` so deallocation reads as
    /// clean shutdown, not failure.
    pub async fn run(&mut self, cancellation: &CancellationToken) -> Result<(), AppError> {
        loop {
            if cancellation.is_cancelled() {
                return Ok(());
            }

            // Persisted before the action step so a crash mid-cycle loses
            // at most one action, never the whole learned policy. Best
            // effort: a DB hiccup must not starve the loop (spec.md §4.4).
            if let Err(err) = self
                .save_state_store
                .save(&self.subgraph, self.bandit.current_mean(), self.bandit.current_stddev())
                .await
            {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(subgraph = %self.subgraph, error = %err, "failed to persist save state, retrying next cycle");
                continue;
            }
            self.gauges.set_mean(&self.subgraph, self.bandit.current_mean());
            self.gauges.set_stddev(&self.subgraph, self.bandit.current_stddev());

            let multiplier = self.bandit.get_action()?;
            self.gauges.set_price_multiplier(&self.subgraph, multiplier);

            if let Err(err) = self.env.set_cost_multiplier(multiplier).await {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(subgraph = %self.subgraph, error = %err, "failed to set cost multiplier, retrying next cycle");
                continue;
            }

            let qps = match self.env.queries_per_second(self.qps_observation, cancellation).await {
                Ok(qps) => qps,
                Err(AppError::Cancelled) => return Ok(()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(subgraph = %self.subgraph, error = %err, "failed to observe qps, retrying next cycle");
                    continue;
                }
            };

            let reward = qps * multiplier;
            self.gauges.set_reward(&self.subgraph, reward);

            self.bandit.add_reward(reward)?;
            if let Some(loss) = self.bandit.update_policy()? {
                debug!(subgraph = %self.subgraph, loss, "policy updated");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_endpoints::StaticEndpoints;
    use sqlx::postgres::PgPoolOptions;

    #[tokio::test]
    #[ignore = "requires a live Postgres instance"]
    async fn fresh_instance_starts_from_defaults_with_no_save_state() {
        let pool = PgPoolOptions::new()
            .connect("postgres://postgres@127.0.0.1/autoagora_test")
            .await
            .unwrap();
        let store = Arc::new(PriceSaveStateStore::new(pool));
        let subgraph = SubgraphId::from_ipfs("Qmaz1R8vcv9v3gUfksqiS9JUz7K9G8S5By3JYn8kTiiP5K").unwrap();
        let agent = Arc::new(IndexerAgentClient::new("http://localhost/unused".to_string()));
        let endpoints: Arc<dyn MetricsEndpoints> = Arc::new(StaticEndpoints::new(""));
        let gauges = GaugeRegistry::new();

        let bandit_loop = PriceBanditLoop::new(
            subgraph,
            agent,
            endpoints,
            store,
            gauges,
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert!((bandit_loop.bandit.current_mean() - DEFAULT_INITIAL_MEAN).abs() < 1e-12);
    }
}
