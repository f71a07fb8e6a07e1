//! Distributed-tracing platform operations
//!
//! Rebuilds traces from raw span payloads, builds trace search bodies, and normalizes the
//! latency and error metric snapshots.

use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::domain::utils::{count_or_zero, number_or_zero, object_or_empty, opt_str, str_or};
use crate::errors::AppError;
use crate::upstream::{encode_segment, Upstream};

pub const DEFAULT_TRACE_LIMIT: u32 = 100;
pub const DEFAULT_TRACE_OFFSET: u32 = 0;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
    Unset,
}

impl SpanStatus {
    fn parse(value: Option<&Value>) -> Self {
        match value
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("ok") => Self::Ok,
            Some("error") => Self::Error,
            _ => Self::Unset,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpanLog {
    pub timestamp: f64,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    pub service_name: String,
    pub start_time: f64,
    pub duration: f64,
    pub tags: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<SpanLog>>,
    pub status: SpanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Span {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// A trace with its derived timing. An empty trace has `start_time = +inf` and
/// `duration = -inf`; JSON renders both as `null`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub trace_id: String,
    pub spans: Vec<Span>,
    pub services: Vec<String>,
    pub start_time: f64,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl Trace {
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Sparse trace search filter. `None` means "not provided"; `Some(false)` for `error` is
/// still sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceFilter {
    pub service: Option<String>,
    pub operation: Option<String>,
    pub tags: Option<HashMap<String, String>>,
    pub min_duration: Option<u64>,
    pub max_duration: Option<u64>,
    pub error: Option<bool>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Latency,
    Errors,
}

impl MetricKind {
    fn path_segment(self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::Errors => "errors",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatencyMetrics {
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMetrics {
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub error_count: u64,
    pub total_count: u64,
    pub error_rate: f64,
    pub error_types: Map<String, Value>,
}

pub fn normalize_span(raw: &Value) -> Span {
    let logs = raw.get("logs").and_then(Value::as_array).map(|logs| {
        logs.iter()
            .map(|log| SpanLog {
                timestamp: number_or_zero(log.get("timestamp")),
                fields: object_or_empty(log.get("fields")),
            })
            .collect()
    });

    Span {
        trace_id: str_or(raw.get("traceId"), ""),
        span_id: str_or(raw.get("spanId"), ""),
        parent_span_id: opt_str(raw.get("parentSpanId")).filter(|id| !id.is_empty()),
        operation_name: str_or(raw.get("operationName"), ""),
        service_name: str_or(raw.get("serviceName"), ""),
        start_time: number_or_zero(raw.get("startTime")),
        duration: number_or_zero(raw.get("duration")),
        tags: object_or_empty(raw.get("tags")),
        logs,
        status: SpanStatus::parse(raw.get("status")),
        error_message: opt_str(raw.get("errorMessage")),
    }
}

/// Services in first-seen span order, without duplicates.
pub fn span_services(spans: &[Span]) -> Vec<String> {
    let mut services: Vec<String> = Vec::new();
    for span in spans {
        if !services.contains(&span.service_name) {
            services.push(span.service_name.clone());
        }
    }
    services
}

pub fn assemble_trace(raw: &Value) -> Trace {
    let spans: Vec<Span> = raw
        .get("spans")
        .and_then(Value::as_array)
        .map(|spans| spans.iter().map(normalize_span).collect())
        .unwrap_or_default();

    let start_time = spans
        .iter()
        .map(|span| span.start_time)
        .fold(f64::INFINITY, f64::min);
    let end_time = spans
        .iter()
        .map(Span::end_time)
        .fold(f64::NEG_INFINITY, f64::max);

    let trace_id = opt_str(raw.get("traceId"))
        .or_else(|| spans.first().map(|span| span.trace_id.clone()))
        .unwrap_or_default();

    Trace {
        trace_id,
        services: span_services(&spans),
        start_time,
        duration: end_time - start_time,
        operation_name: spans.first().map(|span| span.operation_name.clone()),
        spans,
    }
}

pub fn build_trace_criteria(filter: &TraceFilter) -> Value {
    let mut body = Map::new();
    if let Some(service) = &filter.service {
        body.insert("service".to_string(), json!(service));
    }
    if let Some(operation) = &filter.operation {
        body.insert("operation".to_string(), json!(operation));
    }
    if let Some(tags) = &filter.tags {
        body.insert("tags".to_string(), json!(tags));
    }
    if let Some(min_duration) = filter.min_duration {
        body.insert("minDuration".to_string(), json!(min_duration));
    }
    if let Some(max_duration) = filter.max_duration {
        body.insert("maxDuration".to_string(), json!(max_duration));
    }
    if let Some(error) = filter.error {
        body.insert("error".to_string(), json!(error));
    }
    if let Some(start_time) = filter.start_time {
        body.insert("startTime".to_string(), json!(start_time));
    }
    if let Some(end_time) = filter.end_time {
        body.insert("endTime".to_string(), json!(end_time));
    }
    body.insert(
        "limit".to_string(),
        json!(filter.limit.unwrap_or(DEFAULT_TRACE_LIMIT)),
    );
    body.insert(
        "offset".to_string(),
        json!(filter.offset.unwrap_or(DEFAULT_TRACE_OFFSET)),
    );
    Value::Object(body)
}

/// Service and operation names are encoded as single segments; operation names routinely
/// contain `/` and spaces (`GET /api/cart`).
pub fn metrics_path(service: &str, operation: Option<&str>, kind: MetricKind) -> String {
    let service = encode_segment(service);
    match operation {
        Some(operation) => format!(
            "/v2/apm/services/{service}/operations/{}/metrics/{}",
            encode_segment(operation),
            kind.path_segment()
        ),
        None => format!("/v2/apm/services/{service}/metrics/{}", kind.path_segment()),
    }
}

pub fn normalize_latency(payload: &Value, service: &str, operation: Option<&str>) -> LatencyMetrics {
    LatencyMetrics {
        service: service.to_string(),
        operation: operation.map(str::to_string),
        p50: number_or_zero(payload.get("p50")),
        p90: number_or_zero(payload.get("p90")),
        p95: number_or_zero(payload.get("p95")),
        p99: number_or_zero(payload.get("p99")),
        mean: number_or_zero(payload.get("mean").or_else(|| payload.get("avg"))),
        min: number_or_zero(payload.get("min")),
        max: number_or_zero(payload.get("max")),
        count: count_or_zero(payload.get("count")),
    }
}

pub fn normalize_errors(payload: &Value, service: &str, operation: Option<&str>) -> ErrorMetrics {
    ErrorMetrics {
        service: service.to_string(),
        operation: operation.map(str::to_string),
        error_count: count_or_zero(payload.get("errorCount")),
        total_count: count_or_zero(payload.get("totalCount")),
        error_rate: number_or_zero(payload.get("errorRate")),
        error_types: object_or_empty(payload.get("errorTypes")),
    }
}

/// Accepts either a bare array or an object wrapping the array under `key`. Items may be
/// plain names or objects carrying `name`.
fn name_list(payload: &Value, key: &str) -> Vec<String> {
    let items = payload
        .as_array()
        .or_else(|| payload.get(key).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(name) => Some(name.clone()),
            other => opt_str(other.get("name")),
        })
        .collect()
}

pub struct ApmService {
    upstream: Arc<dyn Upstream>,
}

impl ApmService {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }

    pub async fn list_services(&self, cancel: &CancellationToken) -> Result<Vec<String>, AppError> {
        let payload = self.upstream.get_json("/v2/apm/services", &[], cancel).await?;
        Ok(name_list(&payload, "services"))
    }

    pub async fn get_service_operations(
        &self,
        service: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, AppError> {
        let payload = self
            .upstream
            .get_json(
                &format!("/v2/apm/services/{}/operations", encode_segment(service)),
                &[],
                cancel,
            )
            .await?;
        Ok(name_list(&payload, "operations"))
    }

    pub async fn search_traces(
        &self,
        filter: &TraceFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Trace>, AppError> {
        let criteria = build_trace_criteria(filter);
        let payload = self
            .upstream
            .post_json("/v2/apm/traces/search", &criteria, cancel)
            .await?;

        let traces = payload
            .as_array()
            .or_else(|| payload.get("traces").and_then(Value::as_array))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        Ok(traces.iter().map(assemble_trace).collect())
    }

    pub async fn get_trace_details(
        &self,
        trace_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Trace, AppError> {
        let payload = self
            .upstream
            .get_json(
                &format!("/v2/apm/traces/{}", encode_segment(trace_id)),
                &[],
                cancel,
            )
            .await?;
        let mut trace = assemble_trace(&payload);
        if trace.trace_id.is_empty() {
            trace.trace_id = trace_id.to_string();
        }
        Ok(trace)
    }

    pub async fn get_latency_metrics(
        &self,
        service: &str,
        operation: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<LatencyMetrics, AppError> {
        let payload = self
            .upstream
            .get_json(&metrics_path(service, operation, MetricKind::Latency), &[], cancel)
            .await?;
        Ok(normalize_latency(&payload, service, operation))
    }

    pub async fn get_error_metrics(
        &self,
        service: &str,
        operation: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ErrorMetrics, AppError> {
        let payload = self
            .upstream
            .get_json(&metrics_path(service, operation, MetricKind::Errors), &[], cancel)
            .await?;
        Ok(normalize_errors(&payload, service, operation))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::testing::MockUpstream;

    fn raw_span(service: &str, start: u64, duration: u64) -> Value {
        json!({
            "traceId": "t-1",
            "spanId": format!("{service}-{start}"),
            "operationName": format!("{service}.handle"),
            "serviceName": service,
            "startTime": start,
            "duration": duration
        })
    }

    #[test]
    fn aggregates_services_and_timing() {
        let trace = assemble_trace(&json!({
            "traceId": "t-1",
            "spans": [raw_span("frontend", 1_000_000, 150), raw_span("checkout", 1_000_010, 50)]
        }));

        assert_eq!(trace.services, vec!["frontend", "checkout"]);
        assert_eq!(trace.start_time, 1_000_000.0);
        assert_eq!(trace.duration, 150.0);
        assert_eq!(trace.operation_name.as_deref(), Some("frontend.handle"));
    }

    #[test]
    fn duration_spans_latest_end_time() {
        let trace = assemble_trace(&json!({
            "spans": [raw_span("frontend", 1_000_000, 10), raw_span("checkout", 1_000_010, 50)]
        }));

        assert_eq!(trace.duration, 60.0);
        assert_eq!(trace.trace_id, "t-1");
    }

    #[test]
    fn deduplicates_services_in_first_seen_order() {
        let trace = assemble_trace(&json!({
            "spans": [
                raw_span("b", 1, 1),
                raw_span("a", 2, 1),
                raw_span("b", 3, 1)
            ]
        }));
        assert_eq!(trace.services, vec!["b", "a"]);
    }

    #[test]
    fn empty_trace_has_non_finite_timing() {
        let trace = assemble_trace(&json!({"traceId": "empty", "spans": []}));

        assert!(trace.is_empty());
        assert!(trace.start_time.is_infinite() && trace.start_time > 0.0);
        assert!(trace.duration.is_infinite() && trace.duration < 0.0);
        assert!(trace.operation_name.is_none());
        let rendered = serde_json::to_value(&trace).expect("trace serializes");
        assert!(rendered["startTime"].is_null());
    }

    #[test]
    fn span_defaults_apply() {
        let span = normalize_span(&json!({
            "spanId": "s",
            "logs": [{"fields": {"event": "retry"}}, {"timestamp": 5}]
        }));

        assert_eq!(span.start_time, 0.0);
        assert_eq!(span.duration, 0.0);
        assert!(span.tags.is_empty());
        assert_eq!(span.status, SpanStatus::Unset);
        assert!(span.error_message.is_none());
        let logs = span.logs.expect("logs present");
        assert_eq!(logs[0].timestamp, 0.0);
        assert_eq!(logs[0].fields["event"], "retry");
        assert!(logs[1].fields.is_empty());
    }

    #[test]
    fn tolerates_dangling_parent_and_cycles() {
        let trace = assemble_trace(&json!({
            "spans": [
                {"spanId": "a", "parentSpanId": "b", "serviceName": "x", "status": "ERROR"},
                {"spanId": "b", "parentSpanId": "a", "serviceName": "x"},
                {"spanId": "c", "parentSpanId": "missing", "serviceName": "y", "status": "ok"}
            ]
        }));

        assert_eq!(trace.spans.len(), 3);
        assert_eq!(trace.spans[0].status, SpanStatus::Error);
        assert_eq!(trace.spans[2].status, SpanStatus::Ok);
        assert_eq!(trace.spans[2].parent_span_id.as_deref(), Some("missing"));
    }

    #[test]
    fn criteria_include_only_provided_fields() {
        let body = build_trace_criteria(&TraceFilter {
            service: Some("checkout".to_string()),
            error: Some(false),
            ..TraceFilter::default()
        });

        assert_eq!(
            body,
            json!({"service": "checkout", "error": false, "limit": 100, "offset": 0})
        );
    }

    #[test]
    fn criteria_carry_full_filter() {
        let body = build_trace_criteria(&TraceFilter {
            service: Some("checkout".to_string()),
            operation: Some("POST /pay".to_string()),
            tags: Some(HashMap::from([("env".to_string(), "prod".to_string())])),
            min_duration: Some(1_000),
            max_duration: Some(9_000),
            error: Some(true),
            start_time: Some(1),
            end_time: Some(2),
            limit: Some(5),
            offset: Some(10),
        });

        assert_eq!(body["tags"]["env"], "prod");
        assert_eq!(body["minDuration"], 1_000);
        assert_eq!(body["maxDuration"], 9_000);
        assert_eq!(body["startTime"], 1);
        assert_eq!(body["endTime"], 2);
        assert_eq!(body["limit"], 5);
        assert_eq!(body["offset"], 10);
    }

    #[test]
    fn metrics_path_depends_on_operation() {
        assert_eq!(
            metrics_path("checkout", None, MetricKind::Latency),
            "/v2/apm/services/checkout/metrics/latency"
        );
        assert_eq!(
            metrics_path("checkout", Some("pay"), MetricKind::Errors),
            "/v2/apm/services/checkout/operations/pay/metrics/errors"
        );
        assert_eq!(
            metrics_path("checkout", Some("GET /api/cart"), MetricKind::Latency),
            "/v2/apm/services/checkout/operations/GET%20%2Fapi%2Fcart/metrics/latency"
        );
    }

    #[test]
    fn metrics_default_to_zero() {
        let latency = normalize_latency(&json!({"p99": "120.5", "p50": null}), "svc", None);
        assert_eq!(latency.p99, 120.5);
        assert_eq!(latency.p50, 0.0);
        assert_eq!(latency.count, 0);

        let errors = normalize_errors(&json!({"errorCount": 3}), "svc", Some("op"));
        assert_eq!(errors.error_count, 3);
        assert_eq!(errors.total_count, 0);
        assert!(errors.error_types.is_empty());
        assert_eq!(errors.operation.as_deref(), Some("op"));
    }

    #[test]
    fn name_lists_accept_wrapped_and_bare_shapes() {
        assert_eq!(
            name_list(&json!({"services": ["a", {"name": "b"}]}), "services"),
            vec!["a", "b"]
        );
        assert_eq!(name_list(&json!(["x"]), "services"), vec!["x"]);
        assert!(name_list(&json!({}), "services").is_empty());
    }

    #[tokio::test]
    async fn search_traces_posts_criteria_and_assembles() {
        let mock = Arc::new(MockUpstream::default().with_json(
            "/v2/apm/traces/search",
            json!({"traces": [{"traceId": "t-1", "spans": [raw_span("frontend", 10, 5)]}]}),
        ));
        let service = ApmService::new(mock.clone());

        let traces = service
            .search_traces(&TraceFilter::default(), &CancellationToken::new())
            .await
            .expect("search succeeds");

        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].duration, 5.0);
        let calls = mock.calls();
        assert_eq!(calls[0].1[0].1, json!({"limit": 100, "offset": 0}).to_string());
    }

    #[tokio::test]
    async fn operation_scoped_metrics_use_operation_path() {
        let mock = Arc::new(MockUpstream::default().with_json(
            "/v2/apm/services/checkout/operations/pay/metrics/errors",
            json!({"errorCount": "2", "totalCount": "10", "errorRate": 0.2, "errorTypes": {"500": 2}}),
        ));
        let service = ApmService::new(mock);

        let metrics = service
            .get_error_metrics("checkout", Some("pay"), &CancellationToken::new())
            .await
            .expect("metrics succeed");

        assert_eq!(metrics.error_count, 2);
        assert_eq!(metrics.total_count, 10);
        assert_eq!(metrics.error_types["500"], 2);
    }

    #[tokio::test]
    async fn trace_details_keep_requested_id_when_payload_lacks_one() {
        let mock = Arc::new(MockUpstream::default().with_json(
            "/v2/apm/traces/t-9",
            json!({"spans": [{"spanId": "s1", "operationName": "GET /", "serviceName": "web"}]}),
        ));
        let service = ApmService::new(mock);

        let trace = service
            .get_trace_details("t-9", &CancellationToken::new())
            .await
            .expect("trace details");

        assert_eq!(trace.trace_id, "t-9");
        assert_eq!(trace.services, vec!["web"]);
        assert_eq!(trace.operation_name.as_deref(), Some("GET /"));
    }
}
