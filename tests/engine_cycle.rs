use std::sync::Arc;
use std::time::Duration;

use collection_engine::infrastructure::mocks::{
    MockAdapter, MockClock, MockSampleSource, MockSessionSource,
};
use collection_engine::{
    ActiveSession, Adapter, AttributeValue, CircuitState, ClassLimits, CollectionEngine,
    DimensionClass, EngineConfig, HealthStatus, RawSample, SampleKind, SourceError,
    TargetStatus, OTHER,
};

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.collection.interval = Duration::from_millis(10);
    config.export.interval = Duration::from_millis(40);
    config.export.shutdown_grace = Duration::from_millis(100);
    config.export.retry.base_delay = Duration::from_millis(1);
    config.ash.interval = Duration::from_millis(10);
    config
}

fn slow_query(text: &str, ms: f64) -> RawSample {
    RawSample::builder(SampleKind::SlowQuery, "orders")
        .query_text(text)
        .duration_ms(ms)
        .dimension(DimensionClass::User, "app")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_sources_flow_to_targets() {
    let adapter = MockAdapter::new();
    let source = MockSampleSource::new("slow-queries");
    source.push_ok(vec![
        slow_query("SELECT * FROM items WHERE id = 17", 12.0),
        slow_query("select * from items where id = 99", 30.0),
    ]);

    let engine = CollectionEngine::builder(fast_config())
        .with_source(Arc::new(source.clone()))
        .with_target("mock", Adapter::Mock(adapter.clone()), Duration::from_secs(1))
        .start()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.shutdown().await.unwrap();

    let metrics: Vec<_> = adapter
        .batches()
        .iter()
        .flat_map(|b| b.metrics().to_vec())
        .collect();
    assert_eq!(metrics.len(), 2);
    for metric in &metrics {
        assert_eq!(metric.name, "db.query.duration");
        assert_eq!(
            metric.attributes.get("db.query.text"),
            Some(&AttributeValue::from("select * from items where id = ?"))
        );
        assert_eq!(
            metric.attributes.get("db.user"),
            Some(&AttributeValue::from("app"))
        );
        assert!(metric.attributes.contains_key("query.fingerprint"));
    }
    assert!(source.calls() >= 2);
}

#[tokio::test]
async fn test_raw_literals_never_exported() {
    let adapter = MockAdapter::new();
    let engine = CollectionEngine::builder(fast_config())
        .with_target("mock", Adapter::Mock(adapter.clone()), Duration::from_secs(1))
        .build()
        .unwrap();

    engine
        .run_cycle(&[
            slow_query("UPDATE users SET token = 's3cr3t-token' WHERE email = 'a@b.c'", 5.0),
            slow_query("select * from cards where pan = 4111111111111111", 5.0),
        ])
        .await;

    for batch in adapter.batches() {
        for metric in batch.metrics() {
            for value in metric.attributes.values() {
                let value = value.to_string();
                for secret in ["s3cr3t-token", "a@b.c", "4111111111111111"] {
                    assert!(!value.contains(secret), "{secret} leaked in {value}");
                }
            }
        }
    }
}

#[tokio::test]
async fn test_fingerprint_overflow_reports_other() {
    let mut config = fast_config();
    config.cardinality = config
        .cardinality
        .with_class(DimensionClass::QueryFingerprint, ClassLimits::new(1));
    let adapter = MockAdapter::new();
    let engine = CollectionEngine::builder(config)
        .with_target("mock", Adapter::Mock(adapter.clone()), Duration::from_secs(1))
        .build()
        .unwrap();

    engine
        .run_cycle(&[
            slow_query("select * from a", 100.0),
            slow_query("select * from b", 1.0),
        ])
        .await;

    let batch = &adapter.batches()[0];
    let overflowed = &batch.metrics()[1];
    assert_eq!(
        overflowed.attributes.get("query.fingerprint"),
        Some(&AttributeValue::from(OTHER))
    );
    assert!(!overflowed.attributes.contains_key("db.query.text"));
    assert_eq!(engine.metrics().cardinality_overflows(), 1);
}

#[tokio::test]
async fn test_source_errors_skip_one_tick() {
    let adapter = MockAdapter::new();
    let source = MockSampleSource::new("flaky");
    source.push_err(SourceError::Unavailable("connection refused".to_string()));
    source.push_ok(vec![slow_query("select 1", 1.0)]);

    let engine = CollectionEngine::builder(fast_config())
        .with_source(Arc::new(source.clone()))
        .with_target("mock", Adapter::Mock(adapter.clone()), Duration::from_secs(1))
        .start()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    engine.shutdown().await.unwrap();

    assert_eq!(engine.metrics().snapshot().source_errors, 1);
    let exported: usize = adapter.batches().iter().map(|b| b.len()).sum();
    assert_eq!(exported, 1);
}

#[tokio::test]
async fn test_shutdown_flushes_pending_metrics() {
    let mut config = fast_config();
    config.export.interval = Duration::from_secs(3600);
    let adapter = MockAdapter::new();
    let engine = CollectionEngine::builder(config)
        .with_target("mock", Adapter::Mock(adapter.clone()), Duration::from_secs(1))
        .start()
        .await
        .unwrap();

    engine.ingest(&[slow_query("select 1", 1.0), slow_query("select 2", 1.0)]);
    assert_eq!(adapter.calls(), 0);

    engine.shutdown().await.unwrap();
    assert_eq!(adapter.calls(), 1);
    assert_eq!(adapter.batches()[0].len(), 2);

    let last = engine.health().last_export.unwrap();
    assert_eq!(last.target("mock").unwrap().status, TargetStatus::Delivered);
}

#[tokio::test]
async fn test_shutdown_flushes_buffered_ash_snapshots() {
    let mut config = fast_config();
    config.export.interval = Duration::from_secs(3600);
    let sessions = MockSessionSource::new();
    sessions.push_ok(vec![ActiveSession {
        database: "orders".into(),
        user: "app".into(),
        state: "active".into(),
        ..ActiveSession::default()
    }]);
    let adapter = MockAdapter::new();

    let engine = CollectionEngine::builder(config)
        .with_session_source(Arc::new(sessions))
        .with_target("mock", Adapter::Mock(adapter.clone()), Duration::from_secs(1))
        .start()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(adapter.calls(), 0);

    engine.shutdown().await.unwrap();
    let ash = adapter
        .batches()
        .iter()
        .flat_map(|b| b.metrics().to_vec())
        .filter(|m| m.name == "db.ash.active_sessions")
        .count();
    assert_eq!(ash, 1);
}

#[tokio::test]
async fn test_shutdown_is_bounded_by_grace() {
    let adapter = MockAdapter::new();
    adapter.set_fallback(collection_engine::infrastructure::mocks::MockResponse::Hang);
    let mut config = fast_config();
    config.export.interval = Duration::from_secs(3600);
    let engine = CollectionEngine::builder(config)
        .with_target("hang", Adapter::Mock(adapter.clone()), Duration::from_secs(600))
        .start()
        .await
        .unwrap();

    engine.ingest(&[slow_query("select 1", 1.0)]);
    let started = std::time::Instant::now();
    let result = engine.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(result.is_ok());

    let last = engine.health().last_export.unwrap();
    assert_eq!(last.targets[0].status, TargetStatus::Abandoned);
}

#[tokio::test]
async fn test_active_session_history_is_exported() {
    let sessions = MockSessionSource::new();
    sessions.push_ok(vec![
        ActiveSession {
            database: "orders".into(),
            user: "app".into(),
            state: "active".into(),
            wait_event_type: Some("Lock".into()),
            wait_event: Some("relation".into()),
            backend_type: "client backend".into(),
            query_text: None,
        },
        ActiveSession {
            database: "orders".into(),
            user: "app".into(),
            state: "idle".into(),
            ..ActiveSession::default()
        },
    ]);
    let adapter = MockAdapter::new();

    let engine = CollectionEngine::builder(fast_config())
        .with_session_source(Arc::new(sessions))
        .with_target("mock", Adapter::Mock(adapter.clone()), Duration::from_secs(1))
        .start()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    engine.shutdown().await.unwrap();

    let ash: Vec<_> = adapter
        .batches()
        .iter()
        .flat_map(|b| b.metrics().to_vec())
        .filter(|m| m.name == "db.ash.active_sessions")
        .collect();
    assert_eq!(ash.len(), 1);
    assert_eq!(ash[0].value, 1.0);
    assert_eq!(
        ash[0].attributes.get("db.wait_event"),
        Some(&AttributeValue::from("relation"))
    );
    assert!(engine.health().ash.is_some());
}

#[tokio::test]
async fn test_health_reflects_open_circuits() {
    let mut config = fast_config();
    config.circuit_breaker.failure_threshold = 1;
    config.export.retry.max_attempts = 1;
    let broken = MockAdapter::failing("down");
    let healthy = MockAdapter::new();

    let engine = CollectionEngine::builder(config)
        .with_clock(Arc::new(MockClock::default()))
        .with_target("broken", Adapter::Mock(broken), Duration::from_secs(1))
        .with_target("healthy", Adapter::Mock(healthy), Duration::from_secs(1))
        .build()
        .unwrap();

    assert_eq!(engine.health().status, HealthStatus::Healthy);
    assert!(!engine.health().ready);

    engine.run_cycle(&[slow_query("select 1", 1.0)]).await;

    let health = engine.health();
    assert_eq!(health.status, HealthStatus::Degraded);
    let broken = health.targets.iter().find(|t| t.name == "broken").unwrap();
    assert_eq!(broken.state, CircuitState::Open);
    assert_eq!(broken.adapter, "mock");
    assert_eq!(health.cycles, 1);
    assert!(health
        .classes
        .iter()
        .any(|c| c.class == DimensionClass::QueryFingerprint && c.tracked == 1));
}
