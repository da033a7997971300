//! Resolves the current set of Prometheus scrape URLs for
//! `indexer-service`: either a static, operator-supplied list, or a set
//! discovered by watching a Kubernetes `Endpoints` object.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::{
    api::Api,
    runtime::{watcher, WatchStreamExt},
    Client,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::error;
use url::Url;

use crate::error::AppError;

#[async_trait]
pub trait MetricsEndpoints: Send + Sync {
    async fn call(&self) -> Result<Vec<String>, AppError>;
}

/// Fixed, comma-separated list of scrape URLs.
pub struct StaticEndpoints {
    urls: Vec<String>,
}

impl StaticEndpoints {
    pub fn new(csv: &str) -> Self {
        Self {
            urls: csv.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
        }
    }
}

#[async_trait]
impl MetricsEndpoints for StaticEndpoints {
    async fn call(&self) -> Result<Vec<String>, AppError> {
        Ok(self.urls.clone())
    }
}

/// Discovers indexer-service pod IPs by watching the Kubernetes
/// `Endpoints` object named after the service in the pod's own namespace,
/// substituting each backing pod IP into the configured URL template.
pub struct K8sServiceEndpoints {
    template: Url,
    addresses: Arc<RwLock<Vec<String>>>,
    _watch_task: JoinHandle<()>,
}

impl K8sServiceEndpoints {
    /// `template` is a `scheme://service:port/path` URL; `service` names
    /// the Kubernetes Service/Endpoints object to watch.
    pub async fn new(template_url: &str) -> Result<Self, AppError> {
        let template = Url::parse(template_url)
            .map_err(|_| AppError::MissingConfig("indexer-service-metrics-endpoint"))?;
        let service = template
            .host_str()
            .ok_or(AppError::MissingConfig("indexer-service-metrics-endpoint"))?
            .to_string();

        let namespace = current_namespace();
        let client = Client::try_default().await?;
        let api: Api<Endpoints> = Api::namespaced(client, &namespace);

        let addresses = Arc::new(RwLock::new(Vec::new()));
        let task_addresses = addresses.clone();
        let task_service = service.clone();

        let watch_task = tokio::spawn(async move {
            let cfg = watcher::Config::default().fields(&format!("metadata.name={}", task_service));
            let mut stream = Box::pin(watcher(api, cfg).default_backoff());
            loop {
                match stream.next().await {
                    Some(Ok(watcher::Event::Apply(endpoints) | watcher::Event::InitApply(endpoints))) => {
                        let ips = extract_pod_ips(&endpoints);
                        *task_addresses.write() = ips;
                    }
                    Some(Ok(watcher::Event::Delete(_))) => {
                        task_addresses.write().clear();
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        // `watcher()` already retries transparently on a 410
                        // Gone (its own resourceVersion expired) by
                        // re-listing; `.default_backoff()` absorbs the
                        // reconnect delay. Anything that still surfaces here
                        // is an unexpected failure and is treated as fatal,
                        // per the "Fatal/Supervisor" class.
                        error!(error = %e, "fatal kubernetes watch error");
                        std::process::exit(1);
                    }
                    None => break,
                }
            }
        });

        Ok(Self {
            template,
            addresses,
            _watch_task: watch_task,
        })
    }
}

#[async_trait]
impl MetricsEndpoints for K8sServiceEndpoints {
    async fn call(&self) -> Result<Vec<String>, AppError> {
        let ips = self.addresses.read().clone();
        Ok(ips
            .into_iter()
            .map(|ip| {
                let mut url = self.template.clone();
                let _ = url.set_host(Some(&ip));
                url.to_string()
            })
            .collect())
    }
}

fn extract_pod_ips(endpoints: &Endpoints) -> Vec<String> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .map(|addr| addr.ip.clone())
        .collect()
}

fn current_namespace() -> String {
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .unwrap_or_else(|_| "default".to_string())
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_endpoints_splits_csv() {
        let endpoints = StaticEndpoints::new("http://a:9090/metrics, http://b:9090/metrics");
        assert_eq!(
            endpoints.call().await.unwrap(),
            vec!["http://a:9090/metrics", "http://b:9090/metrics"]
        );
    }

    #[tokio::test]
    async fn static_endpoints_ignores_blank_entries() {
        let endpoints = StaticEndpoints::new("http://a:9090/metrics,,");
        assert_eq!(endpoints.call().await.unwrap(), vec!["http://a:9090/metrics"]);
    }
}
