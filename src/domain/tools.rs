//! Interactive tools exposed via Model Context Protocol
//!
//! Each tool maps its argument bag onto one log-search or tracing operation and returns the
//! normalized result as a JSON text document. Failures inside a tool are reported as tool
//! results with `isError` set, never as protocol errors.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use rust_mcp_sdk::{
    macros,
    schema::{CallToolRequestParams, CallToolResult, ContentBlock, TextContent, Tool},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::{
    splunk::SearchRequest,
    traces::{ApmService, TraceFilter},
    utils::{
        normalize_max_results, require_non_empty, time_or_default, DEFAULT_EARLIEST_TIME,
        DEFAULT_LATEST_TIME,
    },
};
use crate::mcp::rpc::{json_rpc_error, json_rpc_error_with_data, json_rpc_result};
use crate::{errors::AppError, AppState};

pub const SPLUNK_TOOL_NAMES: [&str; 12] = [
    "search_splunk",
    "list_indexes",
    "get_index_info",
    "list_saved_searches",
    "current_user",
    "list_users",
    "list_kvstore_collections",
    "health_check",
    "get_indexes_and_sourcetypes",
    "ping",
    "health",
    "list_tools",
];

pub const TRACING_TOOL_NAMES: [&str; 6] = [
    "list_services",
    "get_service_operations",
    "search_traces",
    "get_trace_details",
    "get_latency_metrics",
    "get_error_metrics",
];

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub search_query: Option<String>,
    pub earliest_time: Option<String>,
    pub latest_time: Option<String>,
    pub max_results: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IndexParams {
    pub index_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceParams {
    pub service_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TraceParams {
    pub trace_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsParams {
    pub service: Option<String>,
    pub operation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TraceSearchParams {
    pub service: Option<String>,
    pub operation: Option<String>,
    pub tags: Option<Vec<String>>,
    pub min_duration: Option<u64>,
    pub max_duration: Option<u64>,
    pub error: Option<bool>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[macros::mcp_tool(
    name = "search_splunk",
    description = "Run a Splunk search and return the result rows. Queries not starting with '|' or 'search' get 'search ' prepended."
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct SearchSplunkTool {
    pub search_query: String,
    pub earliest_time: Option<String>,
    pub latest_time: Option<String>,
    pub max_results: Option<u32>,
}

#[macros::mcp_tool(name = "list_indexes", description = "List the Splunk indexes visible to the configured user")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ListIndexesTool {}

#[macros::mcp_tool(
    name = "get_index_info",
    description = "Get event count, size and time bounds for one Splunk index"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetIndexInfoTool {
    pub index_name: String,
}

#[macros::mcp_tool(name = "list_saved_searches", description = "List saved searches with their query text")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ListSavedSearchesTool {}

#[macros::mcp_tool(name = "current_user", description = "Describe the authenticated Splunk user")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct CurrentUserTool {}

#[macros::mcp_tool(name = "list_users", description = "List Splunk users with roles and capabilities")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ListUsersTool {}

#[macros::mcp_tool(
    name = "list_kvstore_collections",
    description = "List KV store collections with their fields and record counts"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ListKvstoreCollectionsTool {}

#[macros::mcp_tool(
    name = "health_check",
    description = "Check the Splunk connection and list installed apps"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct HealthCheckTool {}

#[macros::mcp_tool(name = "health", description = "Alias of health_check")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct HealthTool {}

#[macros::mcp_tool(
    name = "get_indexes_and_sourcetypes",
    description = "List indexes and the sourcetypes seen in each over the last 24 hours"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetIndexesAndSourcetypesTool {}

#[macros::mcp_tool(name = "ping", description = "Liveness probe listing the available tools")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct PingTool {}

#[macros::mcp_tool(name = "list_tools", description = "List the names of all available tools")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ListToolsTool {}

#[macros::mcp_tool(name = "list_services", description = "List services reporting traces")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ListServicesTool {}

#[macros::mcp_tool(
    name = "get_service_operations",
    description = "List the operations recorded for one service"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetServiceOperationsTool {
    pub service_name: String,
}

#[macros::mcp_tool(
    name = "search_traces",
    description = "Search traces. Durations and times are in microseconds; tags are key=value strings."
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct SearchTracesTool {
    pub service: Option<String>,
    pub operation: Option<String>,
    pub tags: Option<Vec<String>>,
    pub min_duration: Option<u64>,
    pub max_duration: Option<u64>,
    pub error: Option<bool>,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[macros::mcp_tool(name = "get_trace_details", description = "Get one trace with all of its spans")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetTraceDetailsTool {
    pub trace_id: String,
}

#[macros::mcp_tool(
    name = "get_latency_metrics",
    description = "Latency percentiles for a service, or for one of its operations"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetLatencyMetricsTool {
    pub service: String,
    pub operation: Option<String>,
}

#[macros::mcp_tool(
    name = "get_error_metrics",
    description = "Error counts and rate for a service, or for one of its operations"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetErrorMetricsTool {
    pub service: String,
    pub operation: Option<String>,
}

pub fn build_tools_list(tracing_enabled: bool) -> Vec<Tool> {
    let mut tools = vec![
        SearchSplunkTool::tool(),
        ListIndexesTool::tool(),
        GetIndexInfoTool::tool(),
        ListSavedSearchesTool::tool(),
        CurrentUserTool::tool(),
        ListUsersTool::tool(),
        ListKvstoreCollectionsTool::tool(),
        HealthCheckTool::tool(),
        GetIndexesAndSourcetypesTool::tool(),
        PingTool::tool(),
        HealthTool::tool(),
        ListToolsTool::tool(),
    ];

    if tracing_enabled {
        tools.extend([
            ListServicesTool::tool(),
            GetServiceOperationsTool::tool(),
            SearchTracesTool::tool(),
            GetTraceDetailsTool::tool(),
            GetLatencyMetricsTool::tool(),
            GetErrorMetricsTool::tool(),
        ]);
    }

    tools
}

pub fn tool_names(tracing_enabled: bool) -> Vec<&'static str> {
    let mut names = SPLUNK_TOOL_NAMES.to_vec();
    if tracing_enabled {
        names.extend(TRACING_TOOL_NAMES);
    }
    names
}

pub fn ping_payload(tracing_enabled: bool) -> Value {
    json!({
        "status": "ok",
        "server": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "protocol": "mcp",
        "capabilities": tool_names(tracing_enabled),
    })
}

pub fn parse_tags(tags: Option<Vec<String>>) -> Result<Option<HashMap<String, String>>, AppError> {
    let Some(tags) = tags else {
        return Ok(None);
    };

    tags.into_iter()
        .map(|tag| {
            tag.split_once('=')
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| {
                    AppError::bad_request("invalid_tags", "tags must be key=value strings")
                })
        })
        .collect::<Result<_, _>>()
        .map(Some)
}

pub fn build_trace_filter(params: TraceSearchParams) -> Result<TraceFilter, AppError> {
    if let (Some(min), Some(max)) = (params.min_duration, params.max_duration) {
        if min > max {
            return Err(AppError::bad_request(
                "invalid_duration_range",
                "min_duration must not exceed max_duration",
            ));
        }
    }

    Ok(TraceFilter {
        service: params.service.filter(|value| !value.trim().is_empty()),
        operation: params.operation.filter(|value| !value.trim().is_empty()),
        tags: parse_tags(params.tags)?,
        min_duration: params.min_duration,
        max_duration: params.max_duration,
        error: params.error,
        start_time: params.start_time,
        end_time: params.end_time,
        limit: params.limit,
        offset: params.offset,
    })
}

pub fn tool_success(value: &Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(text, None, None))],
        is_error: None,
        meta: None,
        structured_content: value.as_object().cloned(),
    }
}

pub fn tool_failure(err: &AppError) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(
            format!("Error: {err}"),
            None,
            None,
        ))],
        is_error: Some(true),
        meta: None,
        structured_content: Some(Map::from_iter([
            ("error".to_string(), json!(err.to_string())),
            ("code".to_string(), json!(err.code())),
        ])),
    }
}

pub async fn handle_tools_call(
    state: &AppState,
    id: Option<Value>,
    params: Option<Value>,
) -> Value {
    let Some(raw_params) = params else {
        return json_rpc_error(id, -32602, "Invalid params");
    };

    let tool_call: CallToolRequestParams = match serde_json::from_value(raw_params) {
        Ok(value) => value,
        Err(_) => return json_rpc_error(id, -32602, "Invalid params"),
    };

    if !tool_names(state.tracing_enabled()).contains(&tool_call.name.as_str()) {
        return json_rpc_error_with_data(
            id,
            -32601,
            "Method not found",
            Some(json!({
                "code": "tool_not_found",
                "message": "unknown tool name",
                "details": {
                    "name": tool_call.name,
                },
            })),
        );
    }

    let arguments = Value::Object(tool_call.arguments.unwrap_or_default());
    let cancel = state.shutdown.child_token();
    let result = match dispatch_tool(state, &tool_call.name, arguments, &cancel).await {
        Ok(value) => tool_success(&value),
        Err(err) => {
            warn!(tool = %tool_call.name, code = err.code(), error = %err, "tool call failed");
            tool_failure(&err)
        }
    };

    json_rpc_result(
        id,
        serde_json::to_value(result).expect("tool result serialization"),
    )
}

pub async fn dispatch_tool(
    state: &AppState,
    name: &str,
    arguments: Value,
    cancel: &CancellationToken,
) -> Result<Value, AppError> {
    let splunk = &state.splunk;

    match name {
        "search_splunk" => {
            let params: SearchParams = parse_arguments(arguments)?;
            let request = SearchRequest {
                query: params.search_query.unwrap_or_default(),
                earliest_time: time_or_default(params.earliest_time, DEFAULT_EARLIEST_TIME),
                latest_time: time_or_default(params.latest_time, DEFAULT_LATEST_TIME),
                max_results: normalize_max_results(params.max_results)?,
            };
            to_json(&splunk.search(&request, cancel).await?)
        }
        "list_indexes" => Ok(json!({ "indexes": splunk.list_indexes(cancel).await? })),
        "get_index_info" => {
            let params: IndexParams = parse_arguments(arguments)?;
            let index_name = require_non_empty(params.index_name.as_deref(), "index_name")?;
            to_json(&splunk.get_index_info(&index_name, cancel).await?)
        }
        "list_saved_searches" => to_json(&splunk.list_saved_searches(cancel).await?),
        "current_user" => to_json(&splunk.current_user(cancel).await?),
        "list_users" => to_json(&splunk.list_users(cancel).await?),
        "list_kvstore_collections" => to_json(&splunk.list_kvstore_collections(cancel).await?),
        "health_check" | "health" => to_json(&splunk.health_check(cancel).await?),
        "get_indexes_and_sourcetypes" => to_json(&splunk.indexes_and_sourcetypes(cancel).await?),
        "ping" => Ok(ping_payload(state.tracing_enabled())),
        "list_tools" => Ok(json!({ "tools": tool_names(state.tracing_enabled()) })),
        "list_services" => Ok(json!({ "services": apm(state)?.list_services(cancel).await? })),
        "get_service_operations" => {
            let params: ServiceParams = parse_arguments(arguments)?;
            let service = require_non_empty(params.service_name.as_deref(), "service_name")?;
            let operations = apm(state)?.get_service_operations(&service, cancel).await?;
            Ok(json!({ "service": service, "operations": operations }))
        }
        "search_traces" => {
            let params: TraceSearchParams = parse_arguments(arguments)?;
            let filter = build_trace_filter(params)?;
            to_json(&apm(state)?.search_traces(&filter, cancel).await?)
        }
        "get_trace_details" => {
            let params: TraceParams = parse_arguments(arguments)?;
            let trace_id = require_non_empty(params.trace_id.as_deref(), "trace_id")?;
            to_json(&apm(state)?.get_trace_details(&trace_id, cancel).await?)
        }
        "get_latency_metrics" => {
            let params: MetricsParams = parse_arguments(arguments)?;
            let service = require_non_empty(params.service.as_deref(), "service")?;
            let operation = params.operation.filter(|value| !value.trim().is_empty());
            to_json(
                &apm(state)?
                    .get_latency_metrics(&service, operation.as_deref(), cancel)
                    .await?,
            )
        }
        "get_error_metrics" => {
            let params: MetricsParams = parse_arguments(arguments)?;
            let service = require_non_empty(params.service.as_deref(), "service")?;
            let operation = params.operation.filter(|value| !value.trim().is_empty());
            to_json(
                &apm(state)?
                    .get_error_metrics(&service, operation.as_deref(), cancel)
                    .await?,
            )
        }
        other => Err(AppError::bad_request(
            "tool_not_found",
            format!("unknown tool '{other}'"),
        )),
    }
}

fn apm(state: &AppState) -> Result<&ApmService, AppError> {
    state.apm.as_deref().ok_or_else(|| {
        AppError::bad_request(
            "tracing_not_configured",
            "tracing tools require SPLUNK_APM_ACCESS_TOKEN",
        )
    })
}

fn parse_arguments<T: DeserializeOwned>(arguments: Value) -> Result<T, AppError> {
    serde_json::from_value(arguments)
        .map_err(|err| AppError::bad_request("invalid_arguments", format!("invalid arguments: {err}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|err| AppError::internal(format!("failed to serialize tool result: {err}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::testing::{state_with, MockUpstream};

    #[test]
    fn tool_list_hides_tracing_tools_without_token() {
        let names: Vec<String> = build_tools_list(false)
            .into_iter()
            .map(|tool| tool.name)
            .collect();
        assert!(names.contains(&"search_splunk".to_string()));
        assert!(!names.contains(&"search_traces".to_string()));
        assert_eq!(names.len(), SPLUNK_TOOL_NAMES.len());
    }

    #[test]
    fn tool_list_names_match_registered_names() {
        let names: Vec<String> = build_tools_list(true)
            .into_iter()
            .map(|tool| tool.name)
            .collect();
        assert_eq!(names, tool_names(true));
    }

    #[test]
    fn ping_capabilities_follow_tracing_configuration() {
        let without = ping_payload(false);
        let capabilities = without["capabilities"].as_array().expect("array");
        assert!(!capabilities.contains(&json!("get_trace_details")));
        assert!(capabilities.contains(&json!("search_splunk")));

        let with = ping_payload(true);
        let capabilities = with["capabilities"].as_array().expect("array");
        for name in TRACING_TOOL_NAMES {
            assert!(capabilities.contains(&json!(name)));
        }
        assert_eq!(with["status"], "ok");
    }

    #[test]
    fn parses_key_value_tags() {
        let tags = parse_tags(Some(vec!["env=prod".to_string(), "region = eu".to_string()]))
            .expect("valid tags")
            .expect("tags present");
        assert_eq!(tags["env"], "prod");
        assert_eq!(tags["region"], "eu");
    }

    #[test]
    fn rejects_tag_without_separator() {
        let error = parse_tags(Some(vec!["prod".to_string()])).expect_err("invalid tag");
        assert_eq!(error.code(), "invalid_tags");
    }

    #[test]
    fn trace_filter_keeps_explicit_false_error() {
        let filter = build_trace_filter(TraceSearchParams {
            error: Some(false),
            ..TraceSearchParams::default()
        })
        .expect("valid filter");
        assert_eq!(filter.error, Some(false));
        assert!(filter.service.is_none());
    }

    #[test]
    fn rejects_inverted_duration_range() {
        let error = build_trace_filter(TraceSearchParams {
            min_duration: Some(10),
            max_duration: Some(5),
            ..TraceSearchParams::default()
        })
        .expect_err("inverted range");
        assert!(error.to_string().contains("bad request"));
    }

    #[test]
    fn failure_result_sets_error_flag() {
        let result = tool_failure(&AppError::not_found(
            "index_not_found",
            "Index 'nonexistent' not found",
        ));
        assert_eq!(result.is_error, Some(true));
        let structured = result.structured_content.expect("structured content");
        assert_eq!(structured["code"], "index_not_found");
    }

    #[tokio::test]
    async fn search_tool_applies_time_and_count_defaults() {
        let mock = Arc::new(
            MockUpstream::default()
                .with_text("/services/search/jobs", "<response><sid>42.1</sid></response>")
                .with_json(
                    "/services/search/jobs/42.1/results",
                    json!({"results": [{"count": "7"}]}),
                ),
        );
        let state = state_with(mock.clone(), None);

        let value = dispatch_tool(
            &state,
            "search_splunk",
            json!({"search_query": "index=main | stats count"}),
            &CancellationToken::new(),
        )
        .await
        .expect("search result");
        assert_eq!(value, json!([{"count": "7"}]));

        let calls = mock.calls();
        let (_, form) = &calls[0];
        assert!(form.contains(&("search".to_string(), "search index=main | stats count".to_string())));
        assert!(form.contains(&("earliest_time".to_string(), "-24h".to_string())));
        assert!(form.contains(&("latest_time".to_string(), "now".to_string())));
        let (_, query) = &calls[1];
        assert!(query.contains(&("count".to_string(), "100".to_string())));
    }

    #[tokio::test]
    async fn search_tool_rejects_blank_query_without_upstream_call() {
        let mock = Arc::new(MockUpstream::default());
        let state = state_with(mock.clone(), None);

        let error = dispatch_tool(
            &state,
            "search_splunk",
            json!({"search_query": "   "}),
            &CancellationToken::new(),
        )
        .await
        .expect_err("blank query");
        assert!(matches!(error, AppError::BadRequest { .. }));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn tracing_tool_without_apm_reports_configuration_error() {
        let state = state_with(Arc::new(MockUpstream::default()), None);

        let error = dispatch_tool(
            &state,
            "get_trace_details",
            json!({"trace_id": "abc"}),
            &CancellationToken::new(),
        )
        .await
        .expect_err("tracing disabled");
        assert_eq!(error.code(), "tracing_not_configured");
    }

    #[tokio::test]
    async fn tools_call_wraps_failures_as_tool_errors() {
        let mock = Arc::new(MockUpstream::default().failing("/services/data/indexes"));
        let state = state_with(mock, None);

        let response = handle_tools_call(
            &state,
            Some(json!(11)),
            Some(json!({"name": "list_indexes", "arguments": {}})),
        )
        .await;

        assert_eq!(response["id"], 11);
        assert_eq!(response["result"]["isError"], true);
        assert_eq!(response["result"]["structuredContent"]["code"], "upstream_error");
    }

    #[tokio::test]
    async fn list_tools_tool_reports_enabled_tools() {
        let state = state_with(
            Arc::new(MockUpstream::default()),
            Some(Arc::new(MockUpstream::default())),
        );

        let value = dispatch_tool(&state, "list_tools", json!({}), &CancellationToken::new())
            .await
            .expect("tool names");
        let names = value["tools"].as_array().expect("names");
        assert_eq!(names.len(), SPLUNK_TOOL_NAMES.len() + TRACING_TOOL_NAMES.len());
    }
}
