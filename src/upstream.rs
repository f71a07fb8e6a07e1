//! Authenticated HTTP access to the upstream platforms
//!
//! One `HttpUpstream` is created per upstream system. Each instance holds a fixed base URL
//! and auth scheme and is otherwise stateless. Every call is bounded by a deadline and
//! aborts early when the caller's cancellation token fires.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::AppError;

pub type QueryParams<'a> = &'a [(&'a str, String)];

/// Bytes escaped inside a single path segment. Slash, query and fragment delimiters must
/// not leak out of a user-supplied name.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'\\')
    .add(b'^')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'#')
    .add(b'+')
    .add(b';')
    .add(b'[')
    .add(b']');

/// Percent-encodes a value for interpolation as one path segment.
pub fn encode_segment(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn get_json(
        &self,
        path: &str,
        query: QueryParams<'_>,
        cancel: &CancellationToken,
    ) -> Result<Value, AppError>;

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, AppError>;

    /// Posts a form body and returns the raw response text.
    async fn post_form(
        &self,
        path: &str,
        form: QueryParams<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, AppError>;
}

#[derive(Debug, Clone)]
pub enum UpstreamAuth {
    Bearer(String),
    Basic { username: String, password: String },
    Header { name: &'static str, value: String },
    None,
}

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    name: &'static str,
    client: Client,
    base_url: String,
    auth: UpstreamAuth,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(
        name: &'static str,
        base_url: impl Into<String>,
        auth: UpstreamAuth,
        timeout: Duration,
        verify_tls: bool,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|err| AppError::internal(format!("failed to build http client: {err}")))?;

        Ok(Self {
            name,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            UpstreamAuth::Bearer(token) => builder.bearer_auth(token),
            UpstreamAuth::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            UpstreamAuth::Header { name, value } => builder.header(*name, value),
            UpstreamAuth::None => builder,
        }
    }

    async fn send(
        &self,
        method: &'static str,
        path: &str,
        builder: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response, AppError> {
        debug!(upstream = self.name, method, path, "upstream request");
        let response = self
            .bounded(builder.timeout(self.timeout).send(), cancel)
            .await?
            .map_err(|err| {
                if err.is_timeout() {
                    AppError::Timeout(self.timeout)
                } else {
                    AppError::from(err)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = self
            .bounded(response.text(), cancel)
            .await?
            .unwrap_or_default();
        Err(AppError::upstream(
            Some(status.as_u16()),
            format!(
                "{} request to {path} failed with HTTP {}: {}",
                self.name,
                status.as_u16(),
                body.trim()
            ),
        ))
    }

    /// Races `future` against the deadline and the cancellation token.
    async fn bounded<F, T>(&self, future: F, cancel: &CancellationToken) -> Result<T, AppError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, future) => {
                outcome.map_err(|_| AppError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn get_json(
        &self,
        path: &str,
        query: QueryParams<'_>,
        cancel: &CancellationToken,
    ) -> Result<Value, AppError> {
        let builder = self.authorize(self.client.get(self.url(path)).query(query));
        let response = self.send("GET", path, builder, cancel).await?;
        self.bounded(response.json::<Value>(), cancel)
            .await?
            .map_err(AppError::from)
    }

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, AppError> {
        let builder = self.authorize(self.client.post(self.url(path)).json(body));
        let response = self.send("POST", path, builder, cancel).await?;
        self.bounded(response.json::<Value>(), cancel)
            .await?
            .map_err(AppError::from)
    }

    async fn post_form(
        &self,
        path: &str,
        form: QueryParams<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, AppError> {
        let builder = self.authorize(self.client.post(self.url(path)).form(form));
        let response = self.send("POST", path, builder, cancel).await?;
        self.bounded(response.text(), cancel)
            .await?
            .map_err(AppError::from)
    }
}
