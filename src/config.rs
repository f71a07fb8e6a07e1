use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

pub const DEFAULT_SPLUNK_PORT: u16 = 8089;
pub const DEFAULT_APM_REALM: &str = "us0";
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplunkCredentials {
    Token(String),
    Basic { username: String, password: String },
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct SplunkConfig {
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub username: Option<String>,
    pub credentials: SplunkCredentials,
    pub verify_ssl: bool,
}

#[derive(Debug, Clone)]
pub struct ApmConfig {
    pub access_token: String,
    pub realm: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub splunk: SplunkConfig,
    pub apm: Option<ApmConfig>,
    pub upstream_timeout: Duration,
    pub transport: Transport,
    pub api_token: Option<String>,
    pub bind_addr: String,
    pub bind_port: u16,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SPLUNK_PORT must be a valid u16")]
    InvalidSplunkPort,
    #[error("SPLUNK_SCHEME must be one of: http, https")]
    InvalidScheme,
    #[error("VERIFY_SSL must be a boolean")]
    InvalidVerifySsl,
    #[error("UPSTREAM_TIMEOUT_SECS must be a positive integer")]
    InvalidTimeout,
    #[error("MCP_TRANSPORT must be one of: stdio, http")]
    InvalidTransport,
    #[error("MCP_API_TOKEN is required and must not be empty when MCP_TRANSPORT=http")]
    MissingApiToken,
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl SplunkConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = non_empty_var("SPLUNK_HOST").unwrap_or_else(|| "localhost".to_string());
        let port = non_empty_var("SPLUNK_PORT")
            .map(|value| {
                value
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidSplunkPort)
            })
            .transpose()?
            .unwrap_or(DEFAULT_SPLUNK_PORT);
        let scheme = match non_empty_var("SPLUNK_SCHEME")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("https") => "https".to_string(),
            Some("http") => "http".to_string(),
            _ => return Err(ConfigError::InvalidScheme),
        };
        let verify_ssl = non_empty_var("VERIFY_SSL")
            .map(|value| parse_bool(&value).ok_or(ConfigError::InvalidVerifySsl))
            .transpose()?
            .unwrap_or(true);

        let username = non_empty_var("SPLUNK_USERNAME");
        let credentials = match (
            non_empty_var("SPLUNK_TOKEN"),
            username.clone(),
            non_empty_var("SPLUNK_PASSWORD"),
        ) {
            (Some(token), _, _) => SplunkCredentials::Token(token),
            (None, Some(username), Some(password)) => {
                SplunkCredentials::Basic { username, password }
            }
            _ => SplunkCredentials::Anonymous,
        };

        let apm = non_empty_var("SPLUNK_APM_ACCESS_TOKEN")
            .or_else(|| non_empty_var("SIGNALFX_ACCESS_TOKEN"))
            .map(|access_token| {
                let realm =
                    non_empty_var("SPLUNK_APM_REALM").unwrap_or_else(|| DEFAULT_APM_REALM.to_string());
                let base_url = non_empty_var("SPLUNK_APM_BASE_URL")
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| format!("https://api.{realm}.signalfx.com"));
                ApmConfig {
                    access_token,
                    realm,
                    base_url,
                }
            });

        let upstream_timeout = non_empty_var("UPSTREAM_TIMEOUT_SECS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or(ConfigError::InvalidTimeout)
            })
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS));

        let transport = match non_empty_var("MCP_TRANSPORT")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("stdio") => Transport::Stdio,
            Some("http") => Transport::Http,
            _ => return Err(ConfigError::InvalidTransport),
        };

        let api_token = non_empty_var("MCP_API_TOKEN");
        if transport == Transport::Http && api_token.is_none() {
            return Err(ConfigError::MissingApiToken);
        }

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let bind_port = env::var("BIND_PORT")
            .ok()
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let config = Self {
            splunk: SplunkConfig {
                host,
                port,
                scheme,
                username,
                credentials,
                verify_ssl,
            },
            apm,
            upstream_timeout,
            transport,
            api_token,
            bind_addr,
            bind_port,
        };

        if config.transport == Transport::Http {
            let _ = config.bind_socket()?;
        }
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
