//! Scrapes `indexer-service`'s Prometheus endpoint(s) and sums the
//! monotonically-increasing successful-query counter for one subgraph.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tracing::warn;

use crate::error::AppError;
use crate::metrics_endpoints::MetricsEndpoints;
use crate::subgraph_id::SubgraphId;

static COUNTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"indexer_service_queries_ok\{deployment="([^"]+)"\}\s+(\d+)"#)
        .expect("static regex is valid")
});

pub struct QueryCounts {
    client: Client,
}

impl Default for QueryCounts {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCounts {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build http client"),
        }
    }

    /// Sum of `indexer_service_queries_ok{deployment="<subgraph>"}` across
    /// every endpoint currently returned by `endpoints`. A subgraph with no
    /// matching series anywhere has simply had no queries yet: that's `0`,
    /// not an error.
    pub async fn subgraph_query_count(
        &self,
        subgraph: &SubgraphId,
        endpoints: &dyn MetricsEndpoints,
    ) -> Result<u64, AppError> {
        let urls = endpoints.call().await?;
        let mut total = 0u64;
        for url in urls {
            let body = match self.client.get(&url).send().await {
                Ok(resp) => resp.text().await.map_err(|source| AppError::Transport {
                    endpoint: url.clone(),
                    source,
                })?,
                Err(source) => {
                    warn!(endpoint = %url, error = %source, "failed to scrape metrics endpoint");
                    return Err(AppError::Transport { endpoint: url, source });
                }
            };
            total += count_for_subgraph(&body, subgraph);
        }
        Ok(total)
    }
}

fn count_for_subgraph(body: &str, subgraph: &SubgraphId) -> u64 {
    COUNTER_RE
        .captures_iter(body)
        .filter(|caps| &caps[1] == subgraph.as_ipfs())
        .filter_map(|caps| caps[2].parse::<u64>().ok())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixed(Vec<String>);

    #[async_trait]
    impl MetricsEndpoints for Fixed {
        async fn call(&self) -> Result<Vec<String>, AppError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn sums_single_match() {
        let subgraph = SubgraphId::from_ipfs("Qmadj8x9km1YEyKmRnJ6EkC2zpJZFCfTyTZpuqC3j6e1QH").unwrap();
        let body = r#"indexer_service_queries_ok{deployment="Qmadj8x9km1YEyKmRnJ6EkC2zpJZFCfTyTZpuqC3j6e1QH"} 938"#;
        assert_eq!(count_for_subgraph(body, &subgraph), 938);
    }

    #[test]
    fn no_match_is_zero_not_error() {
        let subgraph = SubgraphId::from_ipfs("Qmadj8x9km1YEyKmRnJ6EkC2zpJZFCfTyTZpuqC3j6e1QH").unwrap();
        assert_eq!(count_for_subgraph("# no series here\n", &subgraph), 0);
    }

    #[tokio::test]
    async fn sums_across_multiple_endpoints() {
        // mirrors spec.md §8 scenario 2: two endpoints reporting 938 and
        // 1669 for the same subgraph sum to 2607.
        let subgraph = SubgraphId::from_ipfs("Qmadj8x9km1YEyKmRnJ6EkC2zpJZFCfTyTZpuqC3j6e1QH").unwrap();
        let deployment = subgraph.as_ipfs().to_string();

        let server_a = MockServer::start().await;
        let server_b = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"indexer_service_queries_ok{{deployment="{deployment}"}} 938"#
            )))
            .mount(&server_a)
            .await;
        Mock::given(method("GET"))
            .and(path("/metrics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"indexer_service_queries_ok{{deployment="{deployment}"}} 1669"#
            )))
            .mount(&server_b)
            .await;

        let endpoints = Fixed(vec![
            format!("{}/metrics", server_a.uri()),
            format!("{}/metrics", server_b.uri()),
        ]);
        let counts = QueryCounts::new();
        let total = counts.subgraph_query_count(&subgraph, &endpoints).await.unwrap();
        assert_eq!(total, 2607);
    }
}
