//! OTLP/HTTP metrics exporter.
//!
//! Batches are converted to an `ExportMetricsServiceRequest`, encoded as
//! protobuf, optionally gzip-compressed and POSTed to `<endpoint>/v1/metrics`.
//! Metrics sharing a resource are grouped under one `ResourceMetrics`, and
//! metrics sharing name, kind and unit become data points of one `Metric`.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::metrics::v1::{
    metric::Data, number_data_point, AggregationTemporality, Gauge, Metric, NumberDataPoint,
    ResourceMetrics, ScopeMetrics, Sum,
};
use opentelemetry_proto::tonic::resource::v1::Resource as ProtoResource;
use prost::Message;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Url;

use super::Compression;
use crate::application::ports::{ExportAdapter, ExportOutcome};
use crate::domain::metric::{AttributeValue, Attributes, ExportBatch, MetricKind, Resource, UnifiedMetric};
use crate::error::ExportError;

const METRICS_PATH: &str = "/v1/metrics";
const PROTOBUF: &str = "application/x-protobuf";
const MAX_ERROR_BODY: usize = 512;

/// Resolve the metrics URL for a collector endpoint.
pub(crate) fn metrics_url(endpoint: &str) -> Result<Url, String> {
    let mut url =
        Url::parse(endpoint).map_err(|e| format!("invalid endpoint `{endpoint}`: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme `{}`", url.scheme()));
    }
    if !url.path().ends_with(METRICS_PATH) {
        let path = format!("{}{METRICS_PATH}", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    Ok(url)
}

/// Delivers batches to an OpenTelemetry collector over HTTP.
#[derive(Debug)]
pub struct OtlpAdapter {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    compression: Compression,
}

impl OtlpAdapter {
    /// # Errors
    /// Returns a description of the problem if the endpoint or a header is
    /// invalid.
    pub fn new(
        endpoint: &str,
        headers: &BTreeMap<String, String>,
        compression: Compression,
    ) -> Result<Self, String> {
        let url = metrics_url(endpoint)?;
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| format!("invalid header name `{name}`: {e}"))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| format!("invalid value for header `{name}`: {e}"))?;
            header_map.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| format!("failed to build http client: {e}"))?;

        Ok(Self {
            client,
            url,
            headers: header_map,
            compression,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn body(&self, request: &ExportMetricsServiceRequest) -> Result<Vec<u8>, ExportError> {
        let encoded = request.encode_to_vec();
        match self.compression {
            Compression::None => Ok(encoded),
            Compression::Gzip => gzip(&encoded),
        }
    }
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, ExportError> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .map_err(|e| ExportError::Encode(format!("gzip: {e}")))
}

#[async_trait]
impl ExportAdapter for OtlpAdapter {
    fn kind(&self) -> &'static str {
        "otlp"
    }

    async fn export(&self, batch: &ExportBatch) -> Result<ExportOutcome, ExportError> {
        let total = batch.len() as u64;
        let body = self.body(&encode_request(batch))?;

        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, PROTOBUF);
        if self.compression == Compression::Gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(ExportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        let partial = match ExportMetricsServiceResponse::decode(bytes.as_ref()) {
            Ok(decoded) => decoded.partial_success,
            Err(error) => {
                tracing::debug!(%error, "undecodable OTLP response body, assuming full success");
                None
            }
        };

        Ok(match partial {
            Some(partial) if partial.rejected_data_points > 0 => {
                let rejected = (partial.rejected_data_points as u64).min(total);
                ExportOutcome {
                    delivered_count: total - rejected,
                    failed_count: rejected,
                    error_detail: Some(partial.error_message).filter(|m| !m.is_empty()),
                }
            }
            _ => ExportOutcome::delivered(total),
        })
    }
}

/// Convert a batch into an OTLP metrics request.
pub fn encode_request(batch: &ExportBatch) -> ExportMetricsServiceRequest {
    let mut groups: Vec<(Arc<Resource>, Vec<&UnifiedMetric>)> = Vec::new();
    for metric in batch.metrics() {
        let existing = groups.iter().position(|(resource, _)| {
            Arc::ptr_eq(resource, &metric.resource) || **resource == *metric.resource
        });
        match existing {
            Some(i) => groups[i].1.push(metric),
            None => groups.push((Arc::clone(&metric.resource), vec![metric])),
        }
    }

    let resource_metrics = groups
        .into_iter()
        .map(|(resource, metrics)| ResourceMetrics {
            resource: Some(ProtoResource {
                attributes: key_values(resource.attributes()),
                ..Default::default()
            }),
            scope_metrics: vec![ScopeMetrics {
                scope: Some(InstrumentationScope {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    ..Default::default()
                }),
                metrics: group_metrics(&metrics),
                ..Default::default()
            }],
            ..Default::default()
        })
        .collect();

    ExportMetricsServiceRequest { resource_metrics }
}

fn group_metrics(metrics: &[&UnifiedMetric]) -> Vec<Metric> {
    let mut index: AHashMap<(&str, MetricKind, &str), usize> = AHashMap::new();
    let mut grouped: Vec<(&UnifiedMetric, Vec<NumberDataPoint>)> = Vec::new();

    for metric in metrics {
        let point = NumberDataPoint {
            attributes: key_values(&metric.attributes),
            time_unix_nano: metric.timestamp_unix_nanos(),
            value: Some(number_data_point::Value::AsDouble(metric.value)),
            ..Default::default()
        };
        let key = (metric.name.as_str(), metric.kind, metric.unit.as_str());
        match index.get(&key) {
            Some(&i) => grouped[i].1.push(point),
            None => {
                index.insert(key, grouped.len());
                grouped.push((metric, vec![point]));
            }
        }
    }

    grouped
        .into_iter()
        .map(|(first, data_points)| {
            let data = match first.kind {
                MetricKind::Gauge => Data::Gauge(Gauge { data_points }),
                MetricKind::Counter => Data::Sum(Sum {
                    data_points,
                    aggregation_temporality: AggregationTemporality::Delta as i32,
                    is_monotonic: true,
                }),
            };
            Metric {
                name: first.name.clone(),
                unit: first.unit.clone(),
                data: Some(data),
                ..Default::default()
            }
        })
        .collect()
}

fn key_values(attributes: &Attributes) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: Some(AnyValue {
                value: Some(match value {
                    AttributeValue::String(s) => any_value::Value::StringValue(s.clone()),
                    AttributeValue::Int(i) => any_value::Value::IntValue(*i),
                    AttributeValue::Float(f) => any_value::Value::DoubleValue(*f),
                    AttributeValue::Bool(b) => any_value::Value::BoolValue(*b),
                }),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::{Duration, UNIX_EPOCH};

    fn batch() -> ExportBatch {
        let db = Arc::new(Resource::new([("service.name", "db")]));
        let other = Arc::new(Resource::new([("service.name", "other")]));
        let at = UNIX_EPOCH + Duration::from_secs(10);
        ExportBatch::new(
            3,
            vec![
                UnifiedMetric::gauge("db.query.duration", "ms", 1.0, at, Arc::clone(&db))
                    .with_attribute("db.name", "a"),
                UnifiedMetric::gauge("db.query.duration", "ms", 2.0, at, Arc::clone(&db))
                    .with_attribute("db.name", "b"),
                UnifiedMetric::counter("db.query.calls", "{call}", 5.0, at, Arc::clone(&db))
                    .with_attribute("rows", 7i64),
                UnifiedMetric::gauge("db.ash.active_sessions", "{session}", 4.0, at, other),
            ],
        )
    }

    fn data_points(metric: &Metric) -> &[NumberDataPoint] {
        match metric.data.as_ref().unwrap() {
            Data::Gauge(g) => &g.data_points,
            Data::Sum(s) => &s.data_points,
            other => panic!("unexpected data {other:?}"),
        }
    }

    #[test]
    fn test_metrics_url() {
        assert_eq!(
            metrics_url("http://localhost:4318").unwrap().as_str(),
            "http://localhost:4318/v1/metrics"
        );
        assert_eq!(
            metrics_url("https://otel.example.com/prefix/").unwrap().as_str(),
            "https://otel.example.com/prefix/v1/metrics"
        );
        assert_eq!(
            metrics_url("http://c:4318/v1/metrics").unwrap().as_str(),
            "http://c:4318/v1/metrics"
        );
        assert!(metrics_url("ftp://c").is_err());
        assert!(metrics_url("nope").is_err());
    }

    #[test]
    fn test_request_groups_by_resource_and_metric() {
        let request = encode_request(&batch());
        assert_eq!(request.resource_metrics.len(), 2);

        let db = &request.resource_metrics[0];
        let resource = db.resource.as_ref().unwrap();
        assert_eq!(resource.attributes[0].key, "service.name");

        let metrics = &db.scope_metrics[0].metrics;
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, "db.query.duration");
        assert_eq!(data_points(&metrics[0]).len(), 2);
        assert_eq!(data_points(&metrics[0])[0].time_unix_nano, 10_000_000_000);

        match metrics[1].data.as_ref().unwrap() {
            Data::Sum(sum) => {
                assert!(sum.is_monotonic);
                assert_eq!(
                    sum.aggregation_temporality,
                    AggregationTemporality::Delta as i32
                );
                let attr = &sum.data_points[0].attributes[0];
                assert_eq!(
                    attr.value.as_ref().unwrap().value,
                    Some(any_value::Value::IntValue(7))
                );
            }
            other => panic!("expected sum, got {other:?}"),
        }
    }

    #[test]
    fn test_gzip_body_decodes() {
        let adapter =
            OtlpAdapter::new("http://localhost:4318", &BTreeMap::new(), Compression::Gzip).unwrap();
        let request = encode_request(&batch());
        let body = adapter.body(&request).unwrap();

        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(body.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        let roundtrip = ExportMetricsServiceRequest::decode(decoded.as_slice()).unwrap();
        assert_eq!(roundtrip, request);
    }

    #[test]
    fn test_invalid_header_rejected() {
        let headers = BTreeMap::from([("bad header".to_string(), "x".to_string())]);
        assert!(OtlpAdapter::new("http://localhost:4318", &headers, Compression::Gzip).is_err());
    }

    #[cfg(feature = "health-server")]
    mod http {
        use super::*;
        use axum::body::Bytes;
        use axum::http::{HeaderMap as AxumHeaders, StatusCode};
        use axum::routing::post;
        use axum::Router;
        use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsPartialSuccess;

        async fn serve(router: Router) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });
            format!("http://{addr}")
        }

        #[tokio::test]
        async fn test_partial_success_maps_to_failed_count() {
            let router = Router::new().route(
                "/v1/metrics",
                post(|headers: AxumHeaders, body: Bytes| async move {
                    assert_eq!(headers.get("content-encoding").unwrap(), "gzip");
                    assert_eq!(headers.get("x-api-key").unwrap(), "k");
                    assert!(!body.is_empty());
                    let response = ExportMetricsServiceResponse {
                        partial_success: Some(ExportMetricsPartialSuccess {
                            rejected_data_points: 1,
                            error_message: "stale".to_string(),
                        }),
                    };
                    (StatusCode::OK, response.encode_to_vec())
                }),
            );
            let endpoint = serve(router).await;
            let headers = BTreeMap::from([("x-api-key".to_string(), "k".to_string())]);
            let adapter = OtlpAdapter::new(&endpoint, &headers, Compression::Gzip).unwrap();

            let outcome = adapter.export(&batch()).await.unwrap();
            assert_eq!(outcome.delivered_count, 3);
            assert_eq!(outcome.failed_count, 1);
            assert_eq!(outcome.error_detail.as_deref(), Some("stale"));
        }

        #[tokio::test]
        async fn test_server_error_is_rejected() {
            let router = Router::new().route(
                "/v1/metrics",
                post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
            );
            let endpoint = serve(router).await;
            let adapter = OtlpAdapter::new(&endpoint, &BTreeMap::new(), Compression::None).unwrap();

            let err = adapter.export(&batch()).await.unwrap_err();
            assert!(
                matches!(err, ExportError::Rejected { status: 503, ref body } if body == "overloaded")
            );
            assert!(err.is_retryable());
        }

        #[tokio::test]
        async fn test_bad_request_is_permanent() {
            let router = Router::new().route(
                "/v1/metrics",
                post(|| async { (StatusCode::BAD_REQUEST, "malformed") }),
            );
            let endpoint = serve(router).await;
            let adapter = OtlpAdapter::new(&endpoint, &BTreeMap::new(), Compression::None).unwrap();

            let err = adapter.export(&batch()).await.unwrap_err();
            assert!(matches!(err, ExportError::Rejected { status: 400, .. }));
            assert!(!err.is_retryable());
        }

        #[tokio::test]
        async fn test_unreachable_is_transport_error() {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);

            let adapter =
                OtlpAdapter::new(&format!("http://{addr}"), &BTreeMap::new(), Compression::Gzip)
                    .unwrap();
            let err = adapter.export(&batch()).await.unwrap_err();
            assert_eq!(err.kind(), "transport");
        }
    }
}
