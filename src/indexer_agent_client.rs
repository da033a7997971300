//! GraphQL client for the indexer-agent management API: reads allocated
//! subgraphs and cost variables, writes cost models/variables.

use std::collections::BTreeMap;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::retry::{with_backoff, RetryBudget};
use crate::subgraph_id::SubgraphId;

/// `GLOBAL_COST_MULTIPLIER` must always be present whenever a pricing loop
/// is active; `DEFAULT_COST` seeds at 50 on first allocation.
pub const GLOBAL_COST_MULTIPLIER: &str = "GLOBAL_COST_MULTIPLIER";
pub const DEFAULT_COST: &str = "DEFAULT_COST";

pub type CostVariables = BTreeMap<String, f64>;

pub struct IndexerAgentClient {
    client: Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct AllocationsData {
    #[serde(rename = "indexerAllocations")]
    indexer_allocations: Vec<AllocationEntry>,
}

#[derive(Debug, Deserialize)]
struct AllocationEntry {
    #[serde(rename = "subgraphDeployment")]
    subgraph_deployment: String,
}

#[derive(Debug, Deserialize)]
struct CostModelData {
    #[serde(rename = "costModel")]
    cost_model: Option<CostModelEntry>,
}

#[derive(Debug, Deserialize)]
struct CostModelEntry {
    model: Option<String>,
    variables: Option<Value>,
}

impl IndexerAgentClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("failed to build http client"),
            endpoint,
        }
    }

    async fn execute<T: for<'de> Deserialize<'de>>(&self, query: &str, variables: Value) -> Result<T, AppError> {
        let body = json!({ "query": query, "variables": variables });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|source| AppError::Transport {
                endpoint: self.endpoint.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(AppError::Http {
                endpoint: self.endpoint.clone(),
                status: response.status().as_u16(),
            });
        }

        let parsed: GraphQlResponse<T> = response.json().await.map_err(|source| AppError::Transport {
            endpoint: self.endpoint.clone(),
            source,
        })?;

        if !parsed.errors.is_empty() {
            return Err(AppError::GraphQl {
                endpoint: self.endpoint.clone(),
                messages: parsed.errors.into_iter().map(|e| e.message).collect(),
            });
        }

        parsed.data.ok_or_else(|| AppError::GraphQl {
            endpoint: self.endpoint.clone(),
            messages: vec!["response contained neither data nor errors".to_string()],
        })
    }

    pub async fn get_allocated_subgraphs(&self) -> Result<Vec<SubgraphId>, AppError> {
        with_backoff(&RetryBudget::standard(), || async {
            let data: AllocationsData = self
                .execute(
                    "query { indexerAllocations { subgraphDeployment } }",
                    Value::Null,
                )
                .await?;
            data.indexer_allocations
                .into_iter()
                .map(|entry| {
                    SubgraphId::from_hex(&entry.subgraph_deployment).or_else(|_| {
                        SubgraphId::from_ipfs(&entry.subgraph_deployment)
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| AppError::GraphQl {
                    endpoint: self.endpoint.clone(),
                    messages: vec!["malformed subgraphDeployment id".to_string()],
                })
        })
        .await
    }

    pub async fn get_cost_variables(&self, subgraph: &SubgraphId) -> Result<CostVariables, AppError> {
        with_backoff(&RetryBudget::standard(), || async {
            let data: CostModelData = self
                .execute(
                    r#"query($deployment: String!) { costModel(deployment: $deployment) { model variables } }"#,
                    json!({ "deployment": subgraph.to_hex() }),
                )
                .await?;

            let variables = data
                .cost_model
                .and_then(|m| m.variables)
                .map(parse_variables)
                .unwrap_or_default();
            Ok(variables)
        })
        .await
    }

    /// Sends only the variables or only the model if the other is `None`,
    /// so the untouched side is preserved on the agent (spec.md §6).
    pub async fn set_cost_model(
        &self,
        subgraph: &SubgraphId,
        model: Option<&str>,
        variables: Option<&CostVariables>,
    ) -> Result<(), AppError> {
        let mut cost_model = serde_json::Map::new();
        cost_model.insert("deployment".to_string(), json!(subgraph.to_hex()));
        if let Some(model) = model {
            cost_model.insert("model".to_string(), json!(model));
        }
        if let Some(variables) = variables {
            cost_model.insert("variables".to_string(), json!(render_variables(variables)));
        }

        with_backoff(&RetryBudget::standard(), || async {
            let _: serde_json::Map<String, Value> = self
                .execute(
                    r#"mutation($costModel: CostModelInput!) { setCostModel(costModel: $costModel) { deployment } }"#,
                    json!({ "costModel": cost_model }),
                )
                .await?;
            Ok(())
        })
        .await
    }
}

fn parse_variables(value: Value) -> CostVariables {
    match value {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_f64().map(|f| (k, f)))
            .collect(),
        Value::String(s) => serde_json::from_str::<CostVariables>(&s).unwrap_or_default(),
        _ => CostVariables::new(),
    }
}

/// Serializes every value with 18 fractional digits, per spec.md §3.
fn render_variables(variables: &CostVariables) -> Value {
    let map: serde_json::Map<String, Value> = variables
        .iter()
        .map(|(k, v)| (k.clone(), json!(format!("{:.18}", v))))
        .collect();
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_variables_uses_18_fractional_digits() {
        let mut vars = CostVariables::new();
        vars.insert(GLOBAL_COST_MULTIPLIER.to_string(), 0.000_05);
        let rendered = render_variables(&vars);
        let s = rendered[GLOBAL_COST_MULTIPLIER].as_str().unwrap();
        assert_eq!(s, "0.000050000000000000");
        assert_eq!(s.split('.').nth(1).unwrap().len(), 18);
    }

    #[test]
    fn parse_variables_from_object() {
        let value = json!({ "DEFAULT_COST": 50.0, "GLOBAL_COST_MULTIPLIER": 1e-6 });
        let vars = parse_variables(value);
        assert_eq!(vars.get(DEFAULT_COST), Some(&50.0));
    }
}
