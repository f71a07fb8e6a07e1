//! Log-search platform operations
//!
//! Turns management-API envelopes and search-job responses into the fixed records the
//! tools return.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::utils::{
    count_or_zero, entries, normalize_search_query, opt_str, str_or, string_counter, string_list,
    DEFAULT_EARLIEST_TIME, DEFAULT_LATEST_TIME, MAX_RESULTS_LIMIT,
};
use crate::errors::AppError;
use crate::upstream::{encode_segment, Upstream};

pub const SOURCETYPE_QUERY: &str = "| tstats count WHERE index=* BY index, sourcetype";

const FIELD_PREFIX: &str = "field.";
const ACCELERATED_FIELD_PREFIX: &str = "accelerated_field.";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IndexRecord {
    pub name: String,
    pub total_event_count: String,
    pub current_size: String,
    pub max_size: String,
    pub min_time: String,
    pub max_time: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub real_name: String,
    pub email: String,
    pub roles: Vec<String>,
    pub capabilities: Vec<String>,
    pub default_app: String,
    #[serde(rename = "type")]
    pub user_type: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SavedSearch {
    pub name: String,
    pub description: String,
    pub search: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppRecord {
    pub name: String,
    pub label: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KvStoreCollection {
    pub name: String,
    pub app: String,
    pub fields: Vec<String>,
    pub accelerated_fields: Vec<String>,
    pub record_count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SourcetypeCount {
    pub sourcetype: String,
    pub count: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub username: Option<String>,
    pub ssl_verify: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub connection: ConnectionSummary,
    pub server: Value,
    pub apps_count: usize,
    pub installed_apps: Vec<AppRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourcetypeInventory {
    pub indexes: Vec<String>,
    pub sourcetypes: HashMap<String, Vec<SourcetypeCount>>,
    pub metadata: Value,
}

/// Search parameters after validation and defaulting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub earliest_time: String,
    pub latest_time: String,
    pub max_results: u32,
}

fn sid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<sid>\s*([^<]+?)\s*</sid>").expect("valid sid pattern"))
}

pub fn extract_sid(xml: &str) -> Result<String, AppError> {
    sid_pattern()
        .captures(xml)
        .and_then(|captures| captures.get(1))
        .map(|sid| sid.as_str().to_string())
        .ok_or_else(|| {
            AppError::extraction("missing_sid", "could not find a search job sid in the response")
        })
}

pub fn normalize_index(entry: &Value) -> IndexRecord {
    let content = entry.get("content");
    let field = |key: &str| content.and_then(|content| content.get(key));

    IndexRecord {
        name: str_or(entry.get("name"), ""),
        total_event_count: string_counter(field("totalEventCount")),
        current_size: string_counter(field("currentDBSizeMB")),
        max_size: string_counter(field("maxTotalDataSizeMB")),
        min_time: string_counter(field("minTime")),
        max_time: string_counter(field("maxTime")),
    }
}

pub fn normalize_user(entry: &Value) -> UserRecord {
    let content = entry.get("content");
    let field = |key: &str| content.and_then(|content| content.get(key));

    UserRecord {
        username: str_or(entry.get("name"), ""),
        real_name: str_or(field("realname"), ""),
        email: str_or(field("email"), ""),
        roles: string_list(field("roles")),
        capabilities: string_list(field("capabilities")),
        default_app: str_or(field("defaultApp"), "search"),
        user_type: str_or(field("type"), "user"),
    }
}

pub fn normalize_saved_search(entry: &Value) -> SavedSearch {
    let content = entry.get("content");
    SavedSearch {
        name: str_or(entry.get("name"), ""),
        description: str_or(content.and_then(|c| c.get("description")), ""),
        search: str_or(content.and_then(|c| c.get("search")), ""),
    }
}

pub fn normalize_app(entry: &Value) -> AppRecord {
    let content = entry.get("content");
    let name = str_or(entry.get("name"), "");
    AppRecord {
        label: opt_str(content.and_then(|c| c.get("label"))).unwrap_or_else(|| name.clone()),
        version: str_or(content.and_then(|c| c.get("version")), ""),
        name,
    }
}

/// Splits `field.*` and `accelerated_field.*` content keys into the two field sets.
pub fn classify_kv_fields(content: Option<&Map<String, Value>>) -> (Vec<String>, Vec<String>) {
    let mut fields = Vec::new();
    let mut accelerated = Vec::new();

    for key in content.into_iter().flat_map(Map::keys) {
        if let Some(name) = key.strip_prefix(FIELD_PREFIX) {
            fields.push(name.to_string());
        } else if let Some(name) = key.strip_prefix(ACCELERATED_FIELD_PREFIX) {
            accelerated.push(name.to_string());
        }
    }

    (fields, accelerated)
}

pub fn normalize_kv_collection(entry: &Value, stats: &HashMap<String, u64>) -> KvStoreCollection {
    let name = str_or(entry.get("name"), "");
    let app = opt_str(entry.get("acl").and_then(|acl| acl.get("app")))
        .or_else(|| opt_str(entry.get("content").and_then(|c| c.get("eai:appName"))))
        .unwrap_or_default();
    let (fields, accelerated_fields) =
        classify_kv_fields(entry.get("content").and_then(Value::as_object));
    let record_count = stats.get(&format!("{app}.{name}")).copied().unwrap_or(0);

    KvStoreCollection {
        name,
        app,
        fields,
        accelerated_fields,
        record_count,
    }
}

/// Reads `entry[0].content.data`, whose items are JSON documents carrying `ns` and `count`.
/// Items may be inline objects or JSON-encoded strings; unreadable items are skipped.
pub fn parse_collection_stats(payload: &Value) -> HashMap<String, u64> {
    let data = entries(payload)
        .first()
        .and_then(|entry| entry.get("content"))
        .and_then(|content| content.get("data"));

    let items: Vec<Value> = match data {
        Some(Value::Array(items)) => items.clone(),
        Some(other @ (Value::Object(_) | Value::String(_))) => vec![other.clone()],
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(text) => serde_json::from_str::<Value>(&text).ok(),
            other => Some(other),
        })
        .filter_map(|document| {
            let namespace = document.get("ns")?.as_str()?.to_string();
            let count = document.get("count")?;
            Some((namespace, count_or_zero(Some(count))))
        })
        .collect()
}

/// Groups `index`/`sourcetype`/`count` rows by index, keeping row order within each index.
pub fn group_sourcetypes(rows: &[Value]) -> HashMap<String, Vec<SourcetypeCount>> {
    let mut grouped: HashMap<String, Vec<SourcetypeCount>> = HashMap::new();
    for row in rows {
        let Some(index) = row.get("index").and_then(Value::as_str) else {
            continue;
        };
        grouped
            .entry(index.to_string())
            .or_default()
            .push(SourcetypeCount {
                sourcetype: str_or(row.get("sourcetype"), ""),
                count: string_counter(row.get("count")),
            });
    }
    grouped
}

pub fn json_query() -> Vec<(&'static str, String)> {
    vec![("output_mode", "json".to_string())]
}

pub fn json_list_query() -> Vec<(&'static str, String)> {
    vec![
        ("output_mode", "json".to_string()),
        ("count", "0".to_string()),
    ]
}

pub struct SplunkService {
    upstream: Arc<dyn Upstream>,
    connection: ConnectionSummary,
}

impl SplunkService {
    pub fn new(upstream: Arc<dyn Upstream>, connection: ConnectionSummary) -> Self {
        Self {
            upstream,
            connection,
        }
    }

    pub fn connection(&self) -> &ConnectionSummary {
        &self.connection
    }

    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, AppError> {
        let query = normalize_search_query(&request.query)?;
        debug!(query = %query, "submitting blocking search job");

        let form = [
            ("search", query),
            ("earliest_time", request.earliest_time.clone()),
            ("latest_time", request.latest_time.clone()),
            ("exec_mode", "blocking".to_string()),
        ];
        let body = self
            .upstream
            .post_form("/services/search/jobs", &form, cancel)
            .await?;
        let sid = extract_sid(&body)?;

        let query = [
            ("output_mode", "json".to_string()),
            ("count", request.max_results.to_string()),
        ];
        let payload = self
            .upstream
            .get_json(
                &format!("/services/search/jobs/{}/results", encode_segment(&sid)),
                &query,
                cancel,
            )
            .await?;

        Ok(payload
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn list_indexes(&self, cancel: &CancellationToken) -> Result<Vec<String>, AppError> {
        let payload = self
            .upstream
            .get_json("/services/data/indexes", &json_list_query(), cancel)
            .await?;

        Ok(entries(&payload)
            .iter()
            .filter_map(|entry| opt_str(entry.get("name")))
            .collect())
    }

    pub async fn get_index_info(
        &self,
        index_name: &str,
        cancel: &CancellationToken,
    ) -> Result<IndexRecord, AppError> {
        let payload = self
            .upstream
            .get_json(
                &format!("/services/data/indexes/{}", encode_segment(index_name)),
                &json_query(),
                cancel,
            )
            .await?;

        entries(&payload)
            .first()
            .map(normalize_index)
            .ok_or_else(|| {
                AppError::not_found("index_not_found", format!("Index '{index_name}' not found"))
            })
    }

    pub async fn list_saved_searches(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<SavedSearch>, AppError> {
        let payload = self
            .upstream
            .get_json("/services/saved/searches", &json_list_query(), cancel)
            .await?;

        Ok(entries(&payload).iter().map(normalize_saved_search).collect())
    }

    pub async fn list_users(&self, cancel: &CancellationToken) -> Result<Vec<UserRecord>, AppError> {
        let payload = self
            .upstream
            .get_json("/services/authentication/users", &json_list_query(), cancel)
            .await?;

        Ok(entries(&payload).iter().map(normalize_user).collect())
    }

    /// Resolves the authenticated user. The context lookup is best-effort and falls back to
    /// the configured username.
    pub async fn current_user(&self, cancel: &CancellationToken) -> Result<UserRecord, AppError> {
        let context_username = match self
            .upstream
            .get_json("/services/authentication/current-context", &json_query(), cancel)
            .await
        {
            Ok(payload) => entries(&payload).first().and_then(|entry| {
                opt_str(entry.get("content").and_then(|c| c.get("username")))
                    .filter(|name| !name.is_empty())
            }),
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(err) => {
                warn!(error = %err, "current-context lookup failed, using configured username");
                None
            }
        };

        let username = context_username
            .or_else(|| self.connection.username.clone())
            .ok_or_else(|| {
                AppError::not_found(
                    "user_not_found",
                    "could not determine the current user from the server or configuration",
                )
            })?;

        let payload = self
            .upstream
            .get_json(
                &format!("/services/authentication/users/{}", encode_segment(&username)),
                &json_query(),
                cancel,
            )
            .await?;

        entries(&payload)
            .first()
            .map(normalize_user)
            .ok_or_else(|| {
                AppError::not_found("user_not_found", format!("User '{username}' not found"))
            })
    }

    pub async fn list_apps(&self, cancel: &CancellationToken) -> Result<Vec<AppRecord>, AppError> {
        let payload = self
            .upstream
            .get_json("/services/apps/local", &json_list_query(), cancel)
            .await?;

        Ok(entries(&payload).iter().map(normalize_app).collect())
    }

    pub async fn list_kvstore_collections(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<KvStoreCollection>, AppError> {
        let payload = self
            .upstream
            .get_json(
                "/servicesNS/-/-/storage/collections/config",
                &json_list_query(),
                cancel,
            )
            .await?;

        let stats = match self
            .upstream
            .get_json(
                "/services/server/introspection/kvstore/collectionstats",
                &json_query(),
                cancel,
            )
            .await
        {
            Ok(stats) => parse_collection_stats(&stats),
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(err) => {
                warn!(error = %err, "kvstore collection stats unavailable, record counts default to 0");
                HashMap::new()
            }
        };

        Ok(entries(&payload)
            .iter()
            .map(|entry| normalize_kv_collection(entry, &stats))
            .collect())
    }

    pub async fn health_check(&self, cancel: &CancellationToken) -> Result<HealthReport, AppError> {
        let info = self
            .upstream
            .get_json("/services/server/info", &json_query(), cancel)
            .await?;
        let content = entries(&info)
            .first()
            .and_then(|entry| entry.get("content"));
        let server = json!({
            "version": str_or(content.and_then(|c| c.get("version")), "unknown"),
            "server_name": str_or(content.and_then(|c| c.get("serverName")), "unknown"),
        });

        let installed_apps = self.list_apps(cancel).await?;

        Ok(HealthReport {
            status: "healthy",
            connection: self.connection.clone(),
            server,
            apps_count: installed_apps.len(),
            installed_apps,
        })
    }

    pub async fn indexes_and_sourcetypes(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SourcetypeInventory, AppError> {
        let indexes = self.list_indexes(cancel).await?;
        let rows = self
            .search(
                &SearchRequest {
                    query: SOURCETYPE_QUERY.to_string(),
                    earliest_time: DEFAULT_EARLIEST_TIME.to_string(),
                    latest_time: DEFAULT_LATEST_TIME.to_string(),
                    max_results: MAX_RESULTS_LIMIT,
                },
                cancel,
            )
            .await?;

        let sourcetypes = group_sourcetypes(&rows);
        let total_sourcetypes: usize = sourcetypes.values().map(Vec::len).sum();
        let metadata = json!({
            "total_indexes": indexes.len(),
            "total_sourcetypes": total_sourcetypes,
            "search_time_range": "-24h to now",
        });

        Ok(SourcetypeInventory {
            indexes,
            sourcetypes,
            metadata,
        })
    }
}
