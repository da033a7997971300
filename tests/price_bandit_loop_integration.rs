//! End-to-end exercise of one full `PriceBanditLoop` cycle: price, observe,
//! learn, persist, against a mocked indexer-agent and metrics endpoint.
//! Mirrors the teacher's `backtest_run_integration.rs` convention of one
//! top-level integration test layered over the per-module inline tests.

use std::sync::Arc;
use std::time::Duration;

use autoagora::indexer_agent_client::IndexerAgentClient;
use autoagora::metrics_endpoints::{MetricsEndpoints, StaticEndpoints};
use autoagora::metrics_server::{router, GaugeRegistry};
use autoagora::price_bandit_loop::PriceBanditLoop;
use autoagora::save_state_store::PriceSaveStateStore;
use autoagora::subgraph_id::SubgraphId;

use axum::body::Body;
use axum::http::Request;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

const COST_VARIABLES_QUERY: &str =
    "query($deployment: String!) { costModel(deployment: $deployment) { model variables } }";
const SET_COST_MODEL_MUTATION: &str =
    "mutation($costModel: CostModelInput!) { setCostModel(costModel: $costModel) { deployment } }";

#[tokio::test]
#[ignore = "requires a live Postgres instance"]
async fn full_cycle_prices_observes_learns_and_persists() {
    tokio::time::pause();

    let pool = PgPoolOptions::new()
        .connect("postgres://postgres@127.0.0.1/autoagora_test")
        .await
        .unwrap();

    let subgraph = SubgraphId::from_ipfs("Qmaz1R8vcv9v3gUfksqiS9JUz7K9G8S5By3JYn8kTiiP5K").unwrap();

    let agent_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({ "query": COST_VARIABLES_QUERY })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "costModel": { "model": null, "variables": {} } }
        })))
        .mount(&agent_server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({ "query": SET_COST_MODEL_MUTATION })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "setCostModel": { "deployment": subgraph.to_hex() } }
        })))
        .mount(&agent_server)
        .await;

    let metrics_server = MockServer::start().await;
    let deployment = subgraph.as_ipfs().to_string();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            r#"indexer_service_queries_ok{{deployment="{deployment}"}} 100"#
        )))
        .mount(&metrics_server)
        .await;

    let indexer_agent = Arc::new(IndexerAgentClient::new(agent_server.uri()));
    let endpoints: Arc<dyn MetricsEndpoints> =
        Arc::new(StaticEndpoints::new(&format!("{}/metrics", metrics_server.uri())));
    let save_state_store = Arc::new(PriceSaveStateStore::new(pool));
    let gauges = GaugeRegistry::new();

    let mut bandit_loop = PriceBanditLoop::new(
        subgraph.clone(),
        indexer_agent,
        endpoints,
        save_state_store.clone(),
        gauges.clone(),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let cancellation = CancellationToken::new();
    let cancel_handle = cancellation.clone();
    let handle = tokio::spawn(async move { bandit_loop.run(&cancellation).await });

    // Drive the paused clock through the 60s gateway settle delay plus the
    // 5s observation window without real wall-clock time passing, then
    // cancel so the loop winds down after exactly one cycle.
    tokio::time::advance(Duration::from_secs(65)).await;
    cancel_handle.cancel();
    let result = handle.await.unwrap();
    assert!(result.is_ok(), "run() must return cleanly on cancellation: {result:?}");

    let saved = save_state_store.load(&subgraph).await.unwrap();
    assert!(saved.is_some(), "the loop must persist its policy state at least once per cycle");

    let metrics_app = router(gauges.clone());
    let response = metrics_app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let rendered = String::from_utf8(body.to_vec()).unwrap();
    assert!(rendered.contains("bandit_mean"));
    assert!(rendered.contains("bandit_price_multiplier"));
}
