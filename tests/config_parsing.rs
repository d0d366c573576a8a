use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use collection_engine::application::ports::ExportAdapter;
use collection_engine::{
    AdapterConfig, BuildError, CollectionEngine, ConfigError, DimensionClass, EngineConfig,
    MaintenanceMode, Operator, RawSample, RuleAction, SampleKind, TargetStatus,
};

fn temp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("{name}-{}-{nanos}.jsonl", std::process::id()))
}

#[test]
fn test_empty_document_uses_defaults() {
    let config = EngineConfig::from_toml_str("").unwrap();
    assert_eq!(config, EngineConfig::default());
    assert_eq!(config.collection.interval, Duration::from_secs(10));
    assert_eq!(config.export.interval, Duration::from_secs(60));
    assert_eq!(config.sampler.default_rate, 1.0);
    assert_eq!(config.circuit_breaker.failure_threshold, 5);
    assert_eq!(config.ash.capacity, 600);
    assert!(config.export.targets.is_empty());
    assert!(config.health.listen.is_none());
}

#[test]
fn test_production_document() {
    let config = EngineConfig::from_toml_str(
        r#"
        [collection]
        interval = "5s"
        queue_capacity = 2000

        [cardinality.default]
        max_tracked = 200

        [cardinality.classes.query_fingerprint]
        max_tracked = 1000

        [cardinality.classes.user]
        max_tracked = 20
        allowlist = ["postgres"]

        [cardinality.classes.application_name]
        max_tracked = 10

        [maintenance]
        interval = "1h"
        mode = "reset"

        [sampler]
        hard_threshold = "500ms"
        default_rate = 0.1
        seed = 99

        [[sampler.rules]]
        name = "ignore-pings"
        action = "drop"
        conditions = [{ attribute = "query.text", operator = "eq", value = "select ?" }]

        [[sampler.rules]]
        name = "slow-billing"
        action = { probability = 0.5 }
        conditions = [
            { attribute = "database", operator = "eq", value = "billing" },
            { attribute = "duration_ms", operator = "gt", value = "100" },
        ]

        [export]
        interval = "30s"
        shutdown_grace = "3s"

        [export.retry]
        max_attempts = 4
        base_delay = "200ms"
        max_delay = "5s"

        [[export.targets]]
        name = "collector"
        kind = "otlp"
        endpoint = "http://otel-collector:4318"
        timeout = "5s"
        headers = { "x-tenant" = "db-team" }

        [[export.targets]]
        name = "stdout"
        kind = "json_lines"

        [ash]
        interval = "1s"
        capacity = 300
        "#,
    )
    .unwrap();

    assert_eq!(config.collection.queue_capacity, 2000);
    assert_eq!(config.cardinality.default.max_tracked, 200);
    assert_eq!(
        config
            .cardinality
            .limits_for(&DimensionClass::Custom("application_name".to_string()))
            .max_tracked,
        10
    );
    assert_eq!(
        config.cardinality.limits_for(&DimensionClass::Table).max_tracked,
        200
    );
    assert_eq!(config.maintenance.mode, MaintenanceMode::Reset);
    assert_eq!(config.sampler.hard_threshold, Duration::from_millis(500));
    assert_eq!(config.sampler.seed, Some(99));
    assert_eq!(config.sampler.rules[0].action, RuleAction::Drop);
    assert_eq!(config.sampler.rules[1].conditions[1].operator, Operator::Gt);
    assert_eq!(config.export.retry.max_attempts, 4);
    assert_eq!(config.export.shutdown_grace, Duration::from_secs(3));
    assert_eq!(config.export.targets[0].timeout, Duration::from_secs(5));
    assert_eq!(
        config.export.targets[1].adapter,
        AdapterConfig::JsonLines { path: None }
    );
    assert_eq!(config.ash.capacity, 300);

    let engine = CollectionEngine::builder(config).build().unwrap();
    let kinds: Vec<(&str, &str)> = engine
        .exporter()
        .targets()
        .iter()
        .map(|t| (t.name(), t.adapter().kind()))
        .collect();
    assert_eq!(kinds, vec![("collector", "otlp"), ("stdout", "json_lines")]);
    assert_eq!(engine.schedule().queue_capacity, 2000);
}

fn rejected(document: &str) -> ConfigError {
    EngineConfig::from_toml_str(document).unwrap_err()
}

#[test]
fn test_validation_errors_are_fatal() {
    assert!(matches!(
        rejected("[sampler]\ndefault_rate = 1.5\n"),
        ConfigError::InvalidRate { .. }
    ));
    assert!(matches!(
        rejected("[[sampler.rules]]\nname = \"r\"\naction = { probability = -0.5 }\n"),
        ConfigError::InvalidRule { .. }
    ));
    assert!(matches!(
        rejected("[cardinality.classes.table]\nmax_tracked = 0\n"),
        ConfigError::ZeroMaxTracked { .. }
    ));
    assert!(matches!(
        rejected("[cardinality.classes.\"db.query.text\"]\nmax_tracked = 10\n"),
        ConfigError::ReservedDimension(ref class) if class == "db.query.text"
    ));
    assert!(matches!(
        rejected("[circuit_breaker]\nfailure_threshold = 0\n"),
        ConfigError::ZeroCount { .. }
    ));
    assert!(matches!(
        rejected("[circuit_breaker]\nbackoff_multiplier = 0.5\n"),
        ConfigError::OutOfRange { .. }
    ));
    assert!(matches!(
        rejected("[collection]\ninterval = \"0s\"\n"),
        ConfigError::ZeroDuration { .. }
    ));
    assert!(matches!(
        rejected("[ash]\ncapacity = 0\n"),
        ConfigError::ZeroCount { .. }
    ));
    assert!(matches!(
        rejected("[health]\nlisten = \"not-an-address\"\n"),
        ConfigError::InvalidAddress(_)
    ));
    assert!(matches!(
        rejected("[[export.targets]]\nname = \"x\"\nkind = \"otlp\"\nendpoint = \"ftp://host\"\n"),
        ConfigError::InvalidTarget { .. }
    ));
    assert!(matches!(
        rejected("[[export.targets]]\nname = \"x\"\nkind = \"carrier_pigeon\"\n"),
        ConfigError::Parse(_)
    ));
}

#[test]
fn test_builder_rejects_invalid_config() {
    let mut config = EngineConfig::default();
    config.export.interval = Duration::ZERO;
    let err = CollectionEngine::builder(config).build().unwrap_err();
    assert!(matches!(
        err,
        BuildError::Config(ConfigError::ZeroDuration { .. })
    ));
}

#[tokio::test]
async fn test_json_lines_target_appends_to_file() {
    let path = temp_path("engine-config");
    let document = format!(
        r#"
        [[export.targets]]
        name = "archive"
        kind = "json_lines"
        path = "{}"
        "#,
        path.display().to_string().replace('\\', "\\\\")
    );
    let config = EngineConfig::from_toml_str(&document).unwrap();
    let engine = CollectionEngine::builder(config).build().unwrap();

    let sample = RawSample::builder(SampleKind::SlowQuery, "orders")
        .query_text("select * from items where id = 5")
        .duration_ms(42.0)
        .build()
        .unwrap();
    let report = engine.run_cycle(&[sample.clone()]).await;
    assert_eq!(
        report.target("archive").unwrap().status,
        TargetStatus::Delivered
    );
    engine.run_cycle(&[sample]).await;

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["name"], "db.query.duration");
    assert_eq!(lines[0]["value"], 42.0);
    assert_eq!(
        lines[0]["attributes"]["db.query.text"],
        "select * from items where id = ?"
    );
    assert_eq!(lines[0]["resource"]["service.name"], "collection-engine");

    let _ = std::fs::remove_file(&path);
}

#[cfg(feature = "health-server")]
#[tokio::test]
async fn test_health_listen_conflict_is_reported() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = blocker.local_addr().unwrap();

    let mut config = EngineConfig::default();
    config.health.listen = Some(addr.to_string());
    let err = CollectionEngine::builder(config).start().await.unwrap_err();
    assert!(matches!(err, BuildError::Bind { addr: a, .. } if a == addr));
}
