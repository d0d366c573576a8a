#![cfg(feature = "health-server")]

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use collection_engine::infrastructure::health_server;
use collection_engine::infrastructure::mocks::{MockAdapter, MockClock};
use collection_engine::{Adapter, CollectionEngine, EngineConfig, RawSample, SampleKind};

async fn serve(engine: &CollectionEngine<Adapter>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    health_server::spawn(listener, engine.health_probe(), engine.shutdown_token());
    format!("http://{addr}")
}

fn engine_with(adapter: MockAdapter) -> CollectionEngine<Adapter> {
    let mut config = EngineConfig::default();
    config.circuit_breaker.failure_threshold = 1;
    config.export.retry.max_attempts = 1;
    CollectionEngine::builder(config)
        .with_clock(Arc::new(MockClock::default()))
        .with_target("primary", Adapter::Mock(adapter), Duration::from_secs(1))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_ready_follows_lifecycle() {
    let engine = engine_with(MockAdapter::new());
    let base = serve(&engine).await;
    let client = reqwest::Client::new();

    let before = client.get(format!("{base}/ready")).send().await.unwrap();
    assert_eq!(before.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    engine.start();
    let during = client.get(format!("{base}/ready")).send().await.unwrap();
    assert_eq!(during.status(), reqwest::StatusCode::OK);
    assert_eq!(during.text().await.unwrap(), "ready");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_health_reports_targets_and_classes() {
    let adapter = MockAdapter::failing("collector down");
    let engine = engine_with(adapter);
    let base = serve(&engine).await;

    let sample = RawSample::builder(SampleKind::SlowQuery, "orders")
        .query_text("select * from t where id = 1")
        .duration_ms(8.0)
        .build()
        .unwrap();
    engine.run_cycle(&[sample]).await;

    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();

    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["cycles"], 1);
    assert_eq!(body["targets"][0]["name"], "primary");
    assert_eq!(body["targets"][0]["state"], "open");
    assert_eq!(body["metrics"]["samples_received"], 1);
    assert_eq!(body["last_export"]["targets"][0]["status"], "failed");

    let classes = body["classes"].as_array().unwrap();
    assert!(classes
        .iter()
        .any(|c| c["class"] == "query_fingerprint" && c["tracked"] == 1));
}

#[tokio::test]
async fn test_metrics_exposition() {
    let engine = engine_with(MockAdapter::new());
    let base = serve(&engine).await;
    engine.start();

    let sample = RawSample::builder(SampleKind::SlowQuery, "orders")
        .query_text("select * from t where id = 1")
        .duration_ms(8.0)
        .build()
        .unwrap();
    engine.run_cycle(&[sample]).await;

    let response = reqwest::get(format!("{base}/metrics")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let content_type = response.headers()[reqwest::header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = response.text().await.unwrap();
    assert!(body.contains("\ncollection_engine_up 1\n"));
    assert!(body.contains("\ncollection_engine_cycles_total 1\n"));
    assert!(body.contains("\ncollection_engine_samples_received_total 1\n"));
    assert!(body.contains("# TYPE collection_engine_exports_delivered_total counter"));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_stops_on_shutdown() {
    let engine = engine_with(MockAdapter::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = health_server::spawn(listener, engine.health_probe(), engine.shutdown_token());

    engine.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(reqwest::get(format!("http://{addr}/health")).await.is_err());
}
