//! Decode-with-default helpers shared by every normalizer
//!
//! Upstream payloads are partially specified: fields go missing, numbers arrive as
//! strings, and set-valued attributes arrive as a scalar, an array, or not at all. All
//! defaulting happens here so endpoints cannot drift apart.

use serde_json::{Map, Value};

use crate::errors::AppError;

pub const DEFAULT_EARLIEST_TIME: &str = "-24h";
pub const DEFAULT_LATEST_TIME: &str = "now";
pub const DEFAULT_MAX_RESULTS: u32 = 100;
pub const MAX_RESULTS_LIMIT: u32 = 10_000;

/// The three shapes a set-valued upstream attribute can take.
#[derive(Debug, Clone, PartialEq)]
pub enum StringList<'a> {
    Many(&'a [Value]),
    One(&'a Value),
    Absent,
}

impl<'a> StringList<'a> {
    pub fn classify(value: Option<&'a Value>) -> Self {
        match value {
            Some(Value::Array(items)) => Self::Many(items),
            None | Some(Value::Null) => Self::Absent,
            Some(scalar) => Self::One(scalar),
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::Many(items) => items.iter().filter_map(scalar_text).collect(),
            Self::One(item) => scalar_text(item).into_iter().collect(),
            Self::Absent => Vec::new(),
        }
    }
}

pub fn string_list(value: Option<&Value>) -> Vec<String> {
    StringList::classify(value).into_vec()
}

pub fn str_or(value: Option<&Value>, default: &str) -> String {
    value
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

pub fn opt_str(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

/// Reads a number that may be encoded as a JSON number or a numeric string.
pub fn number_or_zero(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|parsed| parsed.is_finite())
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

pub fn count_or_zero(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|n| *n >= 0.0).map(|n| n as u64))
            .unwrap_or(0),
        Some(Value::String(text)) => text.trim().parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}

/// Counters the log-search platform emits as text. The text is kept verbatim; JSON numbers
/// keep their literal rendering.
pub fn string_counter(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => "0".to_string(),
    }
}

pub fn object_or_empty(value: Option<&Value>) -> Map<String, Value> {
    value
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Entries of a `{ entry: [...] }` envelope; a missing or malformed envelope is empty.
pub fn entries(payload: &Value) -> &[Value] {
    payload
        .get("entry")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn require_non_empty(value: Option<&str>, field: &'static str) -> Result<String, AppError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request("missing_argument", format!("{field} is required")))
}

/// Prefixes `search ` unless the query already starts with a generator pipe or an explicit
/// search command.
pub fn normalize_search_query(query: &str) -> Result<String, AppError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(AppError::bad_request(
            "missing_argument",
            "search_query is required",
        ));
    }

    let has_command = trimmed.starts_with('|') || starts_with_search_command(trimmed);
    if has_command {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("search {trimmed}"))
    }
}

/// True when the first word is `search` (any case), e.g. `search index=main` but not
/// `search_id=7`.
fn starts_with_search_command(query: &str) -> bool {
    query
        .split_whitespace()
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("search"))
}

pub fn normalize_max_results(limit: Option<u32>) -> Result<u32, AppError> {
    let limit = limit.unwrap_or(DEFAULT_MAX_RESULTS);
    if limit == 0 || limit > MAX_RESULTS_LIMIT {
        return Err(AppError::bad_request(
            "invalid_limit",
            "max_results must be between 1 and 10000",
        ));
    }

    Ok(limit)
}

pub fn time_or_default(value: Option<String>, default: &str) -> String {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
