use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;

pub mod auth;
pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;

use config::{Config, SplunkCredentials};
use domain::{
    splunk::{ConnectionSummary, SplunkService},
    traces::ApmService,
};
use errors::AppError;
use upstream::{HttpUpstream, UpstreamAuth};

#[derive(Clone)]
pub struct AppState {
    pub api_token: Option<Arc<str>>,
    pub splunk: Arc<SplunkService>,
    pub apm: Option<Arc<ApmService>>,
    /// Cancelled once on shutdown; every tool call runs under a child of this token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        api_token: Option<String>,
        splunk: Arc<SplunkService>,
        apm: Option<Arc<ApmService>>,
    ) -> Self {
        Self {
            api_token: api_token.map(Arc::<str>::from),
            splunk,
            apm,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn tracing_enabled(&self) -> bool {
        self.apm.is_some()
    }

    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let splunk_config = &config.splunk;
        let auth = match &splunk_config.credentials {
            SplunkCredentials::Token(token) => UpstreamAuth::Bearer(token.clone()),
            SplunkCredentials::Basic { username, password } => UpstreamAuth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            SplunkCredentials::Anonymous => UpstreamAuth::None,
        };
        let splunk_upstream = HttpUpstream::new(
            "splunk",
            splunk_config.base_url(),
            auth,
            config.upstream_timeout,
            splunk_config.verify_ssl,
        )?;
        let connection = ConnectionSummary {
            host: splunk_config.host.clone(),
            port: splunk_config.port,
            scheme: splunk_config.scheme.clone(),
            username: splunk_config.username.clone(),
            ssl_verify: splunk_config.verify_ssl,
        };

        let apm = config
            .apm
            .as_ref()
            .map(|apm| {
                HttpUpstream::new(
                    "apm",
                    apm.base_url.clone(),
                    UpstreamAuth::Header {
                        name: "X-SF-Token",
                        value: apm.access_token.clone(),
                    },
                    config.upstream_timeout,
                    true,
                )
                .map(|upstream| Arc::new(ApmService::new(Arc::new(upstream))))
            })
            .transpose()?;

        Ok(Self::new(
            config.api_token.clone(),
            Arc::new(SplunkService::new(Arc::new(splunk_upstream), connection)),
            apm,
        ))
    }
}

pub fn build_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/mcp", post(http::handlers::mcp_endpoint))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer_token,
        ));

    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .merge(protected)
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}
