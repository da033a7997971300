use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use autoagora::allocation_supervisor::AllocationSupervisor;
use autoagora::config::Config;
use autoagora::indexer_agent_client::IndexerAgentClient;
use autoagora::metrics_endpoints::{K8sServiceEndpoints, MetricsEndpoints, StaticEndpoints};
use autoagora::metrics_server::{self, GaugeRegistry};
use autoagora::telemetry;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = %err, "fatal error, exiting");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env()?);
    telemetry::init(&config);

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(config.postgres_max_connections)
        .connect(&format!(
            "postgres://{user}:{password}@{host}:{port}/{database}",
            user = config.postgres_username,
            password = config.postgres_password,
            host = config.postgres_host,
            port = config.postgres_port,
            database = config.postgres_database,
        ))
        .await?;

    let indexer_agent = Arc::new(IndexerAgentClient::new(config.indexer_agent_mgmt_endpoint.clone()));

    // A single value with no comma names a Kubernetes Endpoints object to
    // watch for scrape-target discovery; a comma-separated list is a
    // fixed set of Prometheus URLs (config.rs doc comment).
    let metrics_endpoints: Arc<dyn MetricsEndpoints> = if config.indexer_service_metrics_endpoint.contains(',') {
        Arc::new(StaticEndpoints::new(&config.indexer_service_metrics_endpoint))
    } else {
        Arc::new(K8sServiceEndpoints::new(&config.indexer_service_metrics_endpoint).await?)
    };

    let gauges = GaugeRegistry::new();

    let metrics_router = metrics_server::router(gauges.clone());
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", metrics_port)).await.expect("bind metrics port");
        info!(port = metrics_port, "metrics server listening");
        axum::serve(listener, metrics_router).await.expect("metrics server crashed");
    });

    let mut supervisor = AllocationSupervisor::new(config.clone(), pool, indexer_agent, metrics_endpoints, gauges);
    supervisor.run().await?;

    Ok(())
}
