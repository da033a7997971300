//! Compiles a per-subgraph textual cost-model document from logged query
//! statistics and an optional manual fragment, and publishes it through
//! the indexer-agent on a periodic cadence (spec.md §4.5). The same
//! aggregation path, reading from `mrq_query_logs` instead, backs the
//! second instance MRQLoop drives (spec.md §4.6 step 3).

use std::sync::Arc;
use std::time::Duration;

use graphql_parser::query::{parse_query, Definition, OperationDefinition};
use rand::Rng;
use rand_distr::LogNormal;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::AppError;
use crate::indexer_agent_client::{CostVariables, IndexerAgentClient, DEFAULT_COST};
use crate::logs_store::{LogSource, LogsStore, QueryAggregate};
use crate::subgraph_id::SubgraphId;

/// How `ModelBuilderLoop` paces itself between publishes.
pub enum Cadence {
    Fixed(Duration),
    /// Sampled per cycle from `LogNormal(mu, sigma)` seconds, to
    /// decorrelate the MRQ-keyed builder from the plain one.
    LogNormal { mu: f64, sigma: f64 },
}

pub struct ModelBuilderLoop {
    subgraph: SubgraphId,
    logs_store: Arc<LogsStore>,
    indexer_agent: Arc<IndexerAgentClient>,
    manual_entry_path: Option<String>,
    min_count: i64,
    source: LogSource,
    cadence: Cadence,
}

impl ModelBuilderLoop {
    pub fn new(
        subgraph: SubgraphId,
        logs_store: Arc<LogsStore>,
        indexer_agent: Arc<IndexerAgentClient>,
        manual_entry_path: Option<String>,
        min_count: i64,
        source: LogSource,
        cadence: Cadence,
    ) -> Self {
        Self {
            subgraph,
            logs_store,
            indexer_agent,
            manual_entry_path,
            min_count,
            source,
            cadence,
        }
    }

    pub async fn run(&mut self, cancellation: &CancellationToken) -> Result<(), AppError> {
        loop {
            if cancellation.is_cancelled() {
                return Ok(());
            }

            if let Err(err) = self.build_and_publish().await {
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(subgraph = %self.subgraph, error = %err, "failed to build cost model, retrying next cycle");
            }

            let wait = match &self.cadence {
                Cadence::Fixed(d) => *d,
                Cadence::LogNormal { mu, sigma } => {
                    let dist = LogNormal::new(*mu, *sigma).expect("static log-normal params are valid");
                    let secs: f64 = rand::thread_rng().sample(dist);
                    Duration::from_secs_f64(secs)
                }
            };

            tokio::select! {
                _ = sleep(wait) => {}
                _ = cancellation.cancelled() => return Ok(()),
            }
        }
    }

    pub(crate) async fn build_and_publish(&self) -> Result<(), AppError> {
        let aggregates = self.logs_store.frequent_queries(&self.subgraph, self.min_count, self.source).await?;
        let manual_fragment = self.read_manual_fragment();
        let document = render_document(&manual_fragment, &aggregates);
        self.indexer_agent.set_cost_model(&self.subgraph, Some(&document), None).await?;
        info!(subgraph = %self.subgraph, queries = aggregates.len(), "published cost model");
        Ok(())
    }

    fn read_manual_fragment(&self) -> Option<String> {
        let dir = self.manual_entry_path.as_ref()?;
        let path = format!("{dir}/{}.agora", self.subgraph.as_ipfs());
        match std::fs::read_to_string(&path) {
            Ok(contents) if !contents.trim().is_empty() => Some(contents),
            _ => None,
        }
    }
}

/// Seeds a fresh allocation with the default cost variables and model
/// before any loop has run (spec.md §4.7 step 2a).
pub async fn publish_default(indexer_agent: &IndexerAgentClient, subgraph: &SubgraphId) -> Result<(), AppError> {
    let mut variables = CostVariables::new();
    variables.insert(DEFAULT_COST.to_string(), 50.0);
    let model = format!("default => ${DEFAULT_COST} * $GLOBAL_COST_MULTIPLIER;\n");
    indexer_agent.set_cost_model(subgraph, Some(&model), Some(&variables)).await
}

fn render_document(manual_fragment: &Option<String>, aggregates: &[QueryAggregate]) -> String {
    let mut doc = format!("# Generated by AutoAgora {}\n", env!("CARGO_PKG_VERSION"));
    if let Some(fragment) = manual_fragment {
        doc.push_str(fragment);
        if !fragment.ends_with('\n') {
            doc.push('\n');
        }
    }

    for aggregate in aggregates {
        let Some(body) = reformat_query(&aggregate.query) else {
            warn!(hash = %hex::encode(&aggregate.hash), "dropping query that failed to parse");
            continue;
        };
        doc.push_str(&format!(
            "# count:        {}\n# min time:     {}\n# max time:     {}\n# avg time:     {}\n# stddev time:  {}\n",
            aggregate.count, aggregate.min_ms, aggregate.max_ms, aggregate.avg_ms, aggregate.stddev_ms
        ));
        doc.push_str(&format!("{body} => {} * $GLOBAL_COST_MULTIPLIER;\n", aggregate.avg_ms));
    }

    doc.push_str("default => $DEFAULT_COST * $GLOBAL_COST_MULTIPLIER;\n");
    doc
}

/// Reprints the parsed root selection set as `query { ... }`, dropping any
/// variable definitions and the operation name (spec.md §4.5).
pub(crate) fn reformat_query(raw: &str) -> Option<String> {
    let document = parse_query::<String>(raw).ok()?;
    for definition in document.definitions {
        let selection_set = match definition {
            Definition::Operation(OperationDefinition::SelectionSet(selection_set)) => selection_set,
            Definition::Operation(OperationDefinition::Query(query)) => query.selection_set,
            Definition::Operation(OperationDefinition::Mutation(mutation)) => mutation.selection_set,
            Definition::Operation(OperationDefinition::Subscription(subscription)) => subscription.selection_set,
            Definition::Fragment(_) => continue,
        };
        return Some(format!("query {selection_set}"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reformat_drops_variable_definitions() {
        let raw = "query($a: Int!) { pairs(first: $a) { id } }";
        let reformatted = reformat_query(raw).unwrap();
        assert!(!reformatted.contains('$'));
        assert!(reformatted.starts_with("query {"));
        assert!(reformatted.contains("pairs"));
    }

    #[test]
    fn reformat_returns_none_on_parse_failure() {
        assert!(reformat_query("not even close to graphql {{{").is_none());
    }

    #[test]
    fn render_document_orders_by_count_descending_and_appends_default() {
        let aggregates = vec![
            QueryAggregate {
                hash: vec![1],
                query: "{ pairs { id } }".to_string(),
                count: 2,
                min_ms: 1.0,
                max_ms: 3.0,
                avg_ms: 2.0,
                stddev_ms: 1.0,
            },
            QueryAggregate {
                hash: vec![2],
                query: "{ tokens { id } }".to_string(),
                count: 1,
                min_ms: 5.0,
                max_ms: 5.0,
                avg_ms: 5.0,
                stddev_ms: 0.0,
            },
        ];
        let doc = render_document(&None, &aggregates);
        let pairs_pos = doc.find("pairs").unwrap();
        let tokens_pos = doc.find("tokens").unwrap();
        assert!(pairs_pos < tokens_pos);
        assert!(doc.trim_end().ends_with("default => $DEFAULT_COST * $GLOBAL_COST_MULTIPLIER;"));
        assert!(doc.starts_with("# Generated by AutoAgora"));
    }

    #[test]
    fn manual_fragment_is_included_verbatim_before_frequent_queries() {
        let fragment = Some("# hand-tuned entries\ncustom => 1.0;\n".to_string());
        let doc = render_document(&fragment, &[]);
        let fragment_pos = doc.find("custom =>").unwrap();
        let default_pos = doc.find("default =>").unwrap();
        assert!(fragment_pos < default_pos);
    }
}
