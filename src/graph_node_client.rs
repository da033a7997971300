//! GraphQL client used by MRQLoop to actively execute probing queries
//! against graph-node.

use reqwest::Client;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::error::AppError;

pub struct GraphNodeClient {
    client: Client,
    endpoint: String,
}

impl GraphNodeClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("failed to build http client"),
            endpoint,
        }
    }

    /// Executes `query` with `variables` against graph-node and returns the
    /// wall-clock latency in milliseconds, measured with a monotonic clock
    /// (spec.md §4.6). The response body itself is discarded once parsed:
    /// only success/failure and timing matter to MRQ probing.
    pub async fn execute_timed(&self, query: &str, variables: Value) -> Result<u64, AppError> {
        let body = serde_json::json!({ "query": query, "variables": variables });
        let start = Instant::now();
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

        let parsed: Value = response.json().await.map_err(|source| AppError::Transport {
            endpoint: self.endpoint.clone(),
            source,
        })?;
        let elapsed = start.elapsed();

        if let Some(errors) = parsed.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                return Err(AppError::GraphQl {
                    endpoint: self.endpoint.clone(),
                    messages: errors
                        .iter()
                        .filter_map(|e| e.get("message").and_then(|m| m.as_str()).map(str::to_string))
                        .collect(),
                });
            }
        }

        Ok(elapsed.as_millis() as u64)
    }
}
