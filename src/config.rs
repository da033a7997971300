//! Process-wide configuration snapshot.
//!
//! Parsed once at startup from CLI flags / environment (clap's `env`
//! feature lets either drive the same field) and handed around as an
//! `Arc<Config>`. Never mutated after construction.

use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "autoagora")]
#[command(about = "Automatic query price setting for a graph-protocol indexer")]
pub struct Config {
    /// GraphQL endpoint of the indexer-agent management API.
    #[arg(long, env = "INDEXER_AGENT_MGMT_ENDPOINT")]
    pub indexer_agent_mgmt_endpoint: String,

    /// Comma-separated Prometheus URLs, or a single
    /// `scheme://service:port/path` for Kubernetes endpoint discovery.
    #[arg(long, env = "INDEXER_SERVICE_METRICS_ENDPOINT")]
    pub indexer_service_metrics_endpoint: String,

    /// GraphQL endpoint used for MRQ active probing.
    #[arg(long, env = "GRAPH_NODE_QUERY_ENDPOINT")]
    pub graph_node_query_endpoint: Option<String>,

    #[arg(long, env = "POSTGRES_HOST", default_value = "127.0.0.1")]
    pub postgres_host: String,
    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,
    #[arg(long, env = "POSTGRES_DATABASE", default_value = "autoagora")]
    pub postgres_database: String,
    #[arg(long, env = "POSTGRES_USERNAME", default_value = "postgres")]
    pub postgres_username: String,
    #[arg(long, env = "POSTGRES_PASSWORD", default_value = "")]
    pub postgres_password: String,
    #[arg(long, env = "POSTGRES_MAX_CONNECTIONS", default_value_t = 1)]
    pub postgres_max_connections: u32,

    /// Enable the relative-query-costs model builder loop.
    #[arg(long, env = "RELATIVE_QUERY_COSTS", default_value_t = false)]
    pub relative_query_costs: bool,

    /// Subgraphs excluded from every loop (bandit, model builder, MRQ).
    #[arg(long, env = "RELATIVE_QUERY_COSTS_EXCLUDE_SUBGRAPHS", value_delimiter = ',')]
    pub relative_query_costs_exclude_subgraphs: Vec<String>,

    #[arg(long, env = "RELATIVE_QUERY_COSTS_REFRESH_INTERVAL", default_value_t = 3600)]
    pub relative_query_costs_refresh_interval_secs: u64,

    /// Enable multi-root-query active probing.
    #[arg(long, env = "MULTI_ROOT_QUERIES", default_value_t = false)]
    pub multi_root_queries: bool,

    #[arg(long, env = "QPS_OBSERVATION_DURATION", default_value_t = 60)]
    pub qps_observation_duration_secs: u64,

    /// Directory of `<SubgraphId>.agora` manual cost-model fragments.
    #[arg(long, env = "MANUAL_ENTRY_PATH")]
    pub manual_entry_path: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    #[arg(long, env = "JSON_LOGS", default_value_t = false)]
    pub json_logs: bool,

    /// Minimum occurrences for a query group to be considered "frequent".
    #[arg(long, env = "MIN_QUERY_COUNT", default_value_t = 100)]
    pub min_query_count: i64,

    /// Number of active-probe executions per MRQ candidate per cycle.
    #[arg(long, env = "MRQ_ITERATIONS", default_value_t = 100)]
    pub mrq_iterations: u32,

    /// Port for the Prometheus metrics HTTP server.
    #[arg(long, env = "METRICS_PORT", default_value_t = 8000)]
    pub metrics_port: u16,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Ok(Config::parse())
    }

    pub fn qps_observation_duration(&self) -> Duration {
        Duration::from_secs(self.qps_observation_duration_secs)
    }

    pub fn relative_query_costs_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.relative_query_costs_refresh_interval_secs)
    }

    pub fn is_excluded(&self, subgraph: &str) -> bool {
        self.relative_query_costs_exclude_subgraphs
            .iter()
            .any(|s| s == subgraph)
    }
}
