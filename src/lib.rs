//! Automatic query-price setting for a graph-protocol indexer: a
//! per-subgraph control loop that adjusts `GLOBAL_COST_MULTIPLIER` to
//! maximize long-run revenue, plus the supporting relative-cost model
//! builder and multi-root-query active-probing loops.

pub mod allocation_supervisor;
pub mod bandit;
pub mod config;
pub mod error;
pub mod graph_node_client;
pub mod indexer_agent_client;
pub mod logs_store;
pub mod metrics_endpoints;
pub mod metrics_server;
pub mod model_builder;
pub mod mrq_loop;
pub mod policy;
pub mod price_bandit_loop;
pub mod pricing_env;
pub mod query_counts;
pub mod retry;
pub mod save_state_store;
pub mod subgraph_id;
pub mod telemetry;
