//! Shared fixtures for unit tests: an in-memory upstream and state builders.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    splunk::{ConnectionSummary, SplunkService},
    traces::ApmService,
};
use crate::errors::AppError;
use crate::upstream::{QueryParams, Upstream};
use crate::AppState;

pub const TEST_API_TOKEN: &str = "token-1234567890ab";

type RecordedCall = (String, Vec<(String, String)>);

/// Canned responses keyed by path; unknown paths fail like an unreachable server.
#[derive(Default)]
pub struct MockUpstream {
    json: HashMap<String, Value>,
    text: HashMap<String, String>,
    failing: Vec<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockUpstream {
    pub fn with_json(mut self, path: &str, body: Value) -> Self {
        self.json.insert(path.to_string(), body);
        self
    }

    pub fn with_text(mut self, path: &str, body: &str) -> Self {
        self.text.insert(path.to_string(), body.to_string());
        self
    }

    pub fn failing(mut self, path: &str) -> Self {
        self.failing.push(path.to_string());
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, path: &str, params: Vec<(String, String)>) -> Result<(), AppError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((path.to_string(), params));
        if self.failing.iter().any(|failing| failing == path) {
            return Err(AppError::upstream(Some(500), format!("{path} unavailable")));
        }
        Ok(())
    }
}

fn owned(params: QueryParams<'_>) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn get_json(
        &self,
        path: &str,
        query: QueryParams<'_>,
        _cancel: &CancellationToken,
    ) -> Result<Value, AppError> {
        self.record(path, owned(query))?;
        self.json
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::upstream(Some(404), format!("no mock for {path}")))
    }

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
        _cancel: &CancellationToken,
    ) -> Result<Value, AppError> {
        self.record(path, vec![("body".to_string(), body.to_string())])?;
        self.json
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::upstream(Some(404), format!("no mock for {path}")))
    }

    async fn post_form(
        &self,
        path: &str,
        form: QueryParams<'_>,
        _cancel: &CancellationToken,
    ) -> Result<String, AppError> {
        self.record(path, owned(form))?;
        self.text
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::upstream(Some(404), format!("no mock for {path}")))
    }
}

pub fn connection() -> ConnectionSummary {
    ConnectionSummary {
        host: "splunk.example".to_string(),
        port: 8089,
        scheme: "https".to_string(),
        username: Some("admin".to_string()),
        ssl_verify: true,
    }
}

pub fn state_with(splunk: Arc<MockUpstream>, apm: Option<Arc<MockUpstream>>) -> AppState {
    AppState::new(
        Some(TEST_API_TOKEN.to_string()),
        Arc::new(SplunkService::new(splunk, connection())),
        apm.map(|apm| Arc::new(ApmService::new(apm))),
    )
}
