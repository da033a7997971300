//! Keeps the live set of per-subgraph loops aligned with the indexer's
//! current allocations, reconciling every 30 seconds (spec.md §4.7).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::graph_node_client::GraphNodeClient;
use crate::indexer_agent_client::IndexerAgentClient;
use crate::logs_store::{LogSource, LogsStore};
use crate::metrics_endpoints::MetricsEndpoints;
use crate::metrics_server::GaugeRegistry;
use crate::model_builder::{self, Cadence, ModelBuilderLoop};
use crate::mrq_loop::MrqLoop;
use crate::price_bandit_loop::PriceBanditLoop;
use crate::save_state_store::PriceSaveStateStore;
use crate::subgraph_id::SubgraphId;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

struct SubgraphLoops {
    cancellation: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct AllocationSupervisor {
    config: Arc<Config>,
    indexer_agent: Arc<IndexerAgentClient>,
    metrics_endpoints: Arc<dyn MetricsEndpoints>,
    graph_node: Option<Arc<GraphNodeClient>>,
    save_state_store: Arc<PriceSaveStateStore>,
    logs_store: Arc<LogsStore>,
    gauges: Arc<GaugeRegistry>,
    loops: HashMap<SubgraphId, SubgraphLoops>,
}

impl AllocationSupervisor {
    pub fn new(
        config: Arc<Config>,
        pool: PgPool,
        indexer_agent: Arc<IndexerAgentClient>,
        metrics_endpoints: Arc<dyn MetricsEndpoints>,
        gauges: Arc<GaugeRegistry>,
    ) -> Self {
        let graph_node = config
            .graph_node_query_endpoint
            .clone()
            .map(|endpoint| Arc::new(GraphNodeClient::new(endpoint)));

        Self {
            config,
            indexer_agent,
            metrics_endpoints,
            graph_node,
            save_state_store: Arc::new(PriceSaveStateStore::new(pool.clone())),
            logs_store: Arc::new(LogsStore::new(pool)),
            gauges,
            loops: HashMap::new(),
        }
    }

    /// Runs reconciliation cycles until ctrl-c, then cancels every
    /// outstanding per-subgraph loop and waits for them to wind down.
    pub async fn run(&mut self) -> Result<(), AppError> {
        loop {
            tokio::select! {
                _ = sleep(RECONCILE_INTERVAL) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested, cancelling all subgraph loops");
                    return self.shutdown().await;
                }
            }

            if let Err(err) = self.reconcile().await {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(error = %err, "reconciliation cycle failed, retrying next tick");
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), AppError> {
        for (_, loops) in self.loops.drain() {
            loops.cancellation.cancel();
            for task in loops.tasks {
                let _ = task.await;
            }
        }
        Ok(())
    }

    async fn reconcile(&mut self) -> Result<(), AppError> {
        let allocated: HashSet<SubgraphId> = self
            .indexer_agent
            .get_allocated_subgraphs()
            .await?
            .into_iter()
            .filter(|s| !self.config.is_excluded(s.as_ipfs()))
            .collect();

        let current: HashSet<SubgraphId> = self.loops.keys().cloned().collect();

        for subgraph in current.difference(&allocated) {
            info!(subgraph = %subgraph, "subgraph deallocated, cancelling its loops");
            if let Some(loops) = self.loops.remove(subgraph) {
                loops.cancellation.cancel();
                for task in loops.tasks {
                    let _ = task.await;
                }
            }
            self.gauges.remove(subgraph);
        }

        for subgraph in allocated.difference(&current) {
            if let Err(err) = self.bring_up(subgraph.clone()).await {
                warn!(subgraph = %subgraph, error = %err, "failed to bring up subgraph, will retry next cycle");
            }
        }

        Ok(())
    }

    async fn bring_up(&mut self, subgraph: SubgraphId) -> Result<(), AppError> {
        model_builder::publish_default(&self.indexer_agent, &subgraph).await?;

        let cancellation = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(self.spawn_price_bandit_loop(subgraph.clone(), cancellation.clone()).await?);

        if self.config.relative_query_costs {
            tasks.push(self.spawn_model_builder_loop(subgraph.clone(), cancellation.clone()));
        }

        if self.config.multi_root_queries {
            if let Some(task) = self.spawn_mrq_loop(subgraph.clone(), cancellation.clone()) {
                tasks.push(task);
            } else {
                warn!(subgraph = %subgraph, "multi-root-queries enabled but no graph-node endpoint configured");
            }
        }

        info!(subgraph = %subgraph, "brought up subgraph loops");
        self.loops.insert(subgraph, SubgraphLoops { cancellation, tasks });
        Ok(())
    }

    async fn spawn_price_bandit_loop(
        &self,
        subgraph: SubgraphId,
        cancellation: CancellationToken,
    ) -> Result<JoinHandle<()>, AppError> {
        let mut price_loop = PriceBanditLoop::new(
            subgraph.clone(),
            self.indexer_agent.clone(),
            self.metrics_endpoints.clone(),
            self.save_state_store.clone(),
            self.gauges.clone(),
            self.config.qps_observation_duration(),
        )
        .await?;

        Ok(tokio::spawn(async move {
            if let Err(err) = price_loop.run(&cancellation).await {
                error!(subgraph = %subgraph, error = %err, "price bandit loop exited with a fatal error");
                if err.is_fatal() {
                    std::process::exit(1);
                }
            }
        }))
    }

    fn spawn_model_builder_loop(&self, subgraph: SubgraphId, cancellation: CancellationToken) -> JoinHandle<()> {
        let mut builder = ModelBuilderLoop::new(
            subgraph.clone(),
            self.logs_store.clone(),
            self.indexer_agent.clone(),
            self.config.manual_entry_path.clone(),
            self.config.min_query_count,
            LogSource::QueryLogs,
            Cadence::Fixed(self.config.relative_query_costs_refresh_interval()),
        );

        tokio::spawn(async move {
            if let Err(err) = builder.run(&cancellation).await {
                error!(subgraph = %subgraph, error = %err, "model builder loop exited with a fatal error");
                if err.is_fatal() {
                    std::process::exit(1);
                }
            }
        })
    }

    fn spawn_mrq_loop(&self, subgraph: SubgraphId, cancellation: CancellationToken) -> Option<JoinHandle<()>> {
        let graph_node = self.graph_node.clone()?;

        let mrq_builder = ModelBuilderLoop::new(
            subgraph.clone(),
            self.logs_store.clone(),
            self.indexer_agent.clone(),
            self.config.manual_entry_path.clone(),
            self.config.min_query_count,
            LogSource::MrqQueryLogs,
            Cadence::LogNormal { mu: 0.4, sigma: 0.2 },
        );

        let mut mrq_loop = MrqLoop::new(
            subgraph.clone(),
            self.logs_store.clone(),
            graph_node,
            self.config.min_query_count,
            self.config.mrq_iterations,
            mrq_builder,
        );

        Some(tokio::spawn(async move {
            if let Err(err) = mrq_loop.run(&cancellation).await {
                error!(subgraph = %subgraph, error = %err, "mrq loop exited with a fatal error");
                if err.is_fatal() {
                    std::process::exit(1);
                }
            }
        }))
    }
}
