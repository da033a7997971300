//! Prometheus exposition for the bandit's learned parameters and observed
//! reward, one gauge per subgraph. Hand-rolled text rendering rather than
//! the `prometheus` crate, grounded in the teacher's
//! `route_quality::metrics::LatencyHistogram::to_prometheus`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use tower_http::trace::TraceLayer;

use crate::subgraph_id::SubgraphId;

#[derive(Default)]
struct Gauges {
    mean: HashMap<SubgraphId, f64>,
    stddev: HashMap<SubgraphId, f64>,
    price_multiplier: HashMap<SubgraphId, f64>,
    reward: HashMap<SubgraphId, f64>,
}

/// Shared across every per-subgraph loop; each loop writes its own
/// subgraph's entries, the HTTP handler reads the whole set.
#[derive(Default)]
pub struct GaugeRegistry {
    gauges: RwLock<Gauges>,
}

impl GaugeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_mean(&self, subgraph: &SubgraphId, value: f64) {
        self.gauges.write().mean.insert(subgraph.clone(), value);
    }

    pub fn set_stddev(&self, subgraph: &SubgraphId, value: f64) {
        self.gauges.write().stddev.insert(subgraph.clone(), value);
    }

    pub fn set_price_multiplier(&self, subgraph: &SubgraphId, value: f64) {
        self.gauges.write().price_multiplier.insert(subgraph.clone(), value);
    }

    pub fn set_reward(&self, subgraph: &SubgraphId, value: f64) {
        self.gauges.write().reward.insert(subgraph.clone(), value);
    }

    /// Removes a deallocated subgraph's entries from every gauge so it
    /// doesn't linger in scrapes after its loops are cancelled.
    pub fn remove(&self, subgraph: &SubgraphId) {
        let mut gauges = self.gauges.write();
        gauges.mean.remove(subgraph);
        gauges.stddev.remove(subgraph);
        gauges.price_multiplier.remove(subgraph);
        gauges.reward.remove(subgraph);
    }

    fn render(&self) -> String {
        let gauges = self.gauges.read();
        let mut out = String::new();
        render_gauge(&mut out, "bandit_mean", "current (clamped) policy mean", &gauges.mean);
        render_gauge(&mut out, "bandit_stddev", "current policy stddev", &gauges.stddev);
        render_gauge(
            &mut out,
            "bandit_price_multiplier",
            "last GLOBAL_COST_MULTIPLIER set by the bandit",
            &gauges.price_multiplier,
        );
        render_gauge(&mut out, "bandit_reward", "last observed reward", &gauges.reward);
        out
    }
}

fn render_gauge(out: &mut String, name: &str, help: &str, values: &HashMap<SubgraphId, f64>) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n"));
    for (subgraph, value) in values {
        out.push_str(&format!("{name}{{subgraph=\"{}\"}} {}\n", subgraph.as_ipfs(), value));
    }
}

async fn metrics_handler(State(registry): State<Arc<GaugeRegistry>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        registry.render(),
    )
}

async fn health_handler() -> impl IntoResponse {
    "ok"
}

pub fn router(registry: Arc<GaugeRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_help_and_type_lines_per_metric() {
        let registry = GaugeRegistry::new();
        let subgraph = SubgraphId::from_ipfs("Qmaz1R8vcv9v3gUfksqiS9JUz7K9G8S5By3JYn8kTiiP5K").unwrap();
        registry.set_mean(&subgraph, 5e-8);
        registry.set_reward(&subgraph, 12.5);
        let rendered = registry.render();
        assert!(rendered.contains("# TYPE bandit_mean gauge"));
        assert!(rendered.contains("bandit_mean{subgraph=\"Qmaz1R8vcv9v3gUfksqiS9JUz7K9G8S5By3JYn8kTiiP5K\"} 0.00000005"));
        assert!(rendered.contains("bandit_reward"));
    }

    #[test]
    fn remove_drops_every_gauge_for_a_subgraph() {
        let registry = GaugeRegistry::new();
        let subgraph = SubgraphId::from_ipfs("Qmaz1R8vcv9v3gUfksqiS9JUz7K9G8S5By3JYn8kTiiP5K").unwrap();
        registry.set_mean(&subgraph, 1.0);
        registry.set_stddev(&subgraph, 1.0);
        registry.remove(&subgraph);
        assert!(!registry.render().contains("bandit_mean{"));
    }
}
