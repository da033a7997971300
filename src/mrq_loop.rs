//! Actively probes queries whose timing is unknown: picks a random
//! recorded variable binding, executes it against graph-node, and records
//! the timing so the model builder can eventually price it (spec.md §4.6).

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand_distr::LogNormal;
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::AppError;
use crate::graph_node_client::GraphNodeClient;
use crate::logs_store::{LogsStore, MrqCandidate};
use crate::model_builder::ModelBuilderLoop;
use crate::subgraph_id::SubgraphId;

/// Parameters for the inter-cycle log-normal sleep (spec.md §4.5: "the MRQ
/// variant samples its interval ... to decorrelate concurrent loops").
const CYCLE_LOGNORMAL_MU: f64 = 0.4;
const CYCLE_LOGNORMAL_SIGMA: f64 = 0.2;

pub struct MrqLoop {
    subgraph: SubgraphId,
    logs_store: Arc<LogsStore>,
    graph_node: Arc<GraphNodeClient>,
    min_count: i64,
    iterations: u32,
    model_builder: ModelBuilderLoop,
}

impl MrqLoop {
    pub fn new(
        subgraph: SubgraphId,
        logs_store: Arc<LogsStore>,
        graph_node: Arc<GraphNodeClient>,
        min_count: i64,
        iterations: u32,
        model_builder: ModelBuilderLoop,
    ) -> Self {
        Self {
            subgraph,
            logs_store,
            graph_node,
            min_count,
            iterations,
            model_builder,
        }
    }

    pub async fn run(&mut self, cancellation: &CancellationToken) -> Result<(), AppError> {
        loop {
            if cancellation.is_cancelled() {
                return Ok(());
            }

            if let Err(err) = self.probe_cycle().await {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(subgraph = %self.subgraph, error = %err, "mrq probing cycle aborted, retrying next tick");
            } else if let Err(err) = self.model_builder.build_and_publish().await {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(subgraph = %self.subgraph, error = %err, "failed to publish mrq-derived cost model");
            }

            let dist = LogNormal::new(CYCLE_LOGNORMAL_MU, CYCLE_LOGNORMAL_SIGMA)
                .expect("static log-normal params are valid");
            let wait_secs: f64 = rand::thread_rng().sample(dist);

            tokio::select! {
                _ = sleep(Duration::from_secs_f64(wait_secs)) => {}
                _ = cancellation.cancelled() => return Ok(()),
            }
        }
    }

    async fn probe_cycle(&self) -> Result<(), AppError> {
        let candidates = self.logs_store.mrq_candidates(&self.subgraph, self.min_count).await?;
        for candidate in candidates {
            for _ in 0..self.iterations {
                self.probe_once(&candidate).await;
            }
        }
        Ok(())
    }

    async fn probe_once(&self, candidate: &MrqCandidate) {
        let variables = match self.logs_store.sample_variables(&self.subgraph, &candidate.hash).await {
            Ok(variables) => variables,
            Err(err) => {
                warn!(subgraph = %self.subgraph, error = %err, "failed to sample mrq variables");
                return;
            }
        };

        let (body, positional_variables) = match reformat_with_positional_variables(&candidate.query, variables) {
            Some(pair) => pair,
            None => {
                warn!(subgraph = %self.subgraph, "failed to reformat mrq candidate query, skipping");
                return;
            }
        };

        let timing = self.graph_node.execute_timed(&body, positional_variables.clone()).await;
        match timing {
            Ok(query_time_ms) => {
                if let Err(err) = self
                    .logs_store
                    .insert_mrq_log(&self.subgraph, &candidate.hash, query_time_ms as i32, Some(&positional_variables))
                    .await
                {
                    warn!(subgraph = %self.subgraph, error = %err, "failed to insert mrq log row");
                }
            }
            Err(err) => {
                warn!(subgraph = %self.subgraph, error = %err, "mrq probe execution failed, skipping");
            }
        }
    }
}

/// Renders the query body (bound variables stripped down to graph-node's
/// positional scheme, `_0, _1, ...`) and remaps the sampled variables JSON
/// onto those same names, preserving the sampled object's key order.
fn reformat_with_positional_variables(raw: &str, variables: Option<Value>) -> Option<(String, Value)> {
    let body = crate::model_builder::reformat_query(raw)?;

    let remapped = match variables {
        Some(Value::Object(map)) => {
            let mut positional = serde_json::Map::new();
            for (i, (_name, value)) in map.into_iter().enumerate() {
                positional.insert(format!("_{i}"), value);
            }
            Value::Object(positional)
        }
        _ => Value::Object(serde_json::Map::new()),
    };

    Some((body, remapped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn positional_remap_preserves_insertion_order() {
        let variables = json!({ "first": 10, "skip": 0, "where": {"id": "abc"} });
        let (_, remapped) = reformat_with_positional_variables("{ pairs { id } }", Some(variables)).unwrap();
        let map = remapped.as_object().unwrap();
        let keys: Vec<&String> = map.keys().collect();
        assert_eq!(keys, vec!["_0", "_1", "_2"]);
        assert_eq!(map["_0"], json!(10));
        assert_eq!(map["_2"], json!({"id": "abc"}));
    }

    #[test]
    fn no_sampled_variables_remaps_to_empty_object() {
        let (_, remapped) = reformat_with_positional_variables("{ pairs { id } }", None).unwrap();
        assert_eq!(remapped, Value::Object(serde_json::Map::new()));
    }
}
