//! Proxy configuration types and utilities.
//!
//! Defines backend descriptors, transports, authentication settings and the
//! aggregator options, plus loading and validation from YAML or JSON files.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{McpError, McpResult};

static SERVER_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").unwrap());

pub const MIN_HEALTH_CHECK_INTERVAL: u64 = 5;
pub const MAX_HEALTH_CHECK_INTERVAL: u64 = 600;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Backend servers to aggregate
    #[serde(default)]
    pub servers: Vec<BackendDescriptor>,

    /// Routing and health behaviour of the aggregate
    #[serde(default)]
    pub aggregator: AggregatorOptions,
}

/// Behaviour switches for the aggregation engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregatorOptions {
    /// Prefix item names with `<server>:` when more than one backend is connected
    #[serde(default = "default_true")]
    pub use_namespace_prefix: bool,

    /// Allow a request to target a single backend by name
    #[serde(default = "default_true")]
    pub allow_server_filter: bool,

    /// Re-establish connections that failed a health check
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Seconds between background health checks (5-600)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            use_namespace_prefix: true,
            allow_server_filter: true,
            auto_reconnect: true,
            health_check_interval: default_health_check_interval(),
        }
    }
}

impl AggregatorOptions {
    /// Interval clamped to the supported range.
    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(
            self.health_check_interval
                .clamp(MIN_HEALTH_CHECK_INTERVAL, MAX_HEALTH_CHECK_INTERVAL),
        )
    }
}

/// One configured backend server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendDescriptor {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(flatten)]
    pub transport: BackendTransport,

    /// Unset is treated the same as `true`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Upper bound for any single call to this backend
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl BackendDescriptor {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: None,
            transport: BackendTransport::Stdio {
                command: command.into(),
                args: Vec::new(),
                env: HashMap::new(),
                cwd: None,
            },
            enabled: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled != Some(false)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    /// Check the parameters needed to open a connection.
    pub fn validate(&self) -> McpResult<()> {
        if !SERVER_NAME_RE.is_match(&self.name) {
            return Err(McpError::Config(format!(
                "invalid server name '{}': must start with a letter and contain only letters, digits, '_' or '-'",
                self.name
            )));
        }

        match &self.transport {
            BackendTransport::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::Config(format!(
                        "server '{}' has an empty command",
                        self.name
                    )));
                }
            }
            BackendTransport::Sse { url, .. } | BackendTransport::Streamable { url, .. } => {
                let parsed = url::Url::parse(url).map_err(|e| {
                    McpError::Config(format!("server '{}' has invalid URL '{}': {}", self.name, url, e))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(McpError::Config(format!(
                        "server '{}' URL must use http or https, got '{}'",
                        self.name,
                        parsed.scheme()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum BackendTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Entries override the inherited process environment
        #[serde(default, alias = "envs", alias = "environment")]
        env: HashMap<String, String>,
        #[serde(default, alias = "working_directory", skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default)]
        auth: AuthConfig,
    },
    Streamable {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default)]
        auth: AuthConfig,
    },
}

impl BackendTransport {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendTransport::Stdio { .. } => "stdio",
            BackendTransport::Sse { .. } => "sse",
            BackendTransport::Streamable { .. } => "streamable",
        }
    }
}

impl fmt::Debug for BackendTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTransport::Stdio {
                command,
                args,
                env,
                cwd,
            } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("env", &format!("{} vars", env.len()))
                .field("cwd", cwd)
                .finish(),
            BackendTransport::Sse { url, headers, auth } => f
                .debug_struct("Sse")
                .field("url", url)
                .field("headers", &format!("{} headers", headers.len()))
                .field("auth", auth)
                .finish(),
            BackendTransport::Streamable { url, headers, auth } => f
                .debug_struct("Streamable")
                .field("url", url)
                .field("headers", &format!("{} headers", headers.len()))
                .field("auth", auth)
                .finish(),
        }
    }
}

/// Credentials used to reach a remote backend.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer {
        #[serde(default)]
        token: String,
    },
    Basic {
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
    },
    #[serde(rename = "oauth2_client_credentials", alias = "oauth2")]
    OAuth2ClientCredentials {
        #[serde(default)]
        token_url: String,
        #[serde(default)]
        client_id: String,
        #[serde(default)]
        client_secret: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scopes: Vec<String>,
    },
    ApiKey {
        name: String,
        value: String,
        #[serde(default)]
        location: ApiKeyLocation,
    },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::None => f.write_str("None"),
            AuthConfig::Bearer { .. } => f.debug_struct("Bearer").field("token", &"****").finish(),
            AuthConfig::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"****")
                .finish(),
            AuthConfig::OAuth2ClientCredentials {
                token_url,
                client_id,
                scopes,
                ..
            } => f
                .debug_struct("OAuth2ClientCredentials")
                .field("token_url", token_url)
                .field("client_id", client_id)
                .field("client_secret", &"****")
                .field("scopes", scopes)
                .finish(),
            AuthConfig::ApiKey { name, location, .. } => f
                .debug_struct("ApiKey")
                .field("name", name)
                .field("value", &"****")
                .field("location", location)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
}

fn default_true() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_health_check_interval() -> u64 {
    30
}

impl ProxyConfig {
    /// Load configuration from a YAML or JSON file (chosen by extension).
    pub async fn from_file(path: impl AsRef<Path>) -> McpResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            McpError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json(&content)?
        } else {
            Self::from_yaml(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> McpResult<Self> {
        serde_yaml::from_str(content).map_err(|e| McpError::Config(format!("invalid YAML: {}", e)))
    }

    pub fn from_json(content: &str) -> McpResult<Self> {
        serde_json::from_str(content).map_err(|e| McpError::Config(format!("invalid JSON: {}", e)))
    }

    pub fn validate(&self) -> McpResult<()> {
        if self.servers.is_empty() {
            return Err(McpError::Config("no servers configured".to_string()));
        }

        let interval = self.aggregator.health_check_interval;
        if !(MIN_HEALTH_CHECK_INTERVAL..=MAX_HEALTH_CHECK_INTERVAL).contains(&interval) {
            return Err(McpError::Config(format!(
                "health_check_interval must be between {} and {} seconds, got {}",
                MIN_HEALTH_CHECK_INTERVAL, MAX_HEALTH_CHECK_INTERVAL, interval
            )));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.name.to_ascii_lowercase()) {
                return Err(McpError::Config(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }
        Ok(())
    }
}
