//! Outbound credentials for remote backends.
//!
//! Each backend transport carries an [`AuthConfig`]; [`create_auth_provider`]
//! turns it into an [`AuthProvider`] that yields the header or query parameter
//! to attach when connecting. The OAuth2 client-credentials provider caches its
//! access token and refreshes it under a lock so that concurrent callers share a
//! single token request.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::config::{ApiKeyLocation, AuthConfig};
use crate::error::{McpError, McpResult};

/// Seconds subtracted from `expires_in`, and the freshness window checked on read.
const TOKEN_EXPIRY_BUFFER_SECS: i64 = 60;
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;
const MAX_EXPIRES_IN_SECS: i64 = 365 * 24 * 3600;

/// A credential ready to be attached to an outbound request.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Header { name: String, value: String },
    Query { name: String, value: String },
}

impl Credential {
    pub fn authorization(value: String) -> Self {
        Credential::Header {
            name: "Authorization".to_string(),
            value,
        }
    }

    /// Token of an `Authorization: Bearer` credential.
    pub fn bearer_token(&self) -> Option<&str> {
        match self {
            Credential::Header { name, value } if name.eq_ignore_ascii_case("authorization") => {
                value.strip_prefix("Bearer ")
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Header { name, .. } => f
                .debug_struct("Header")
                .field("name", name)
                .field("value", &"****")
                .finish(),
            Credential::Query { name, .. } => f
                .debug_struct("Query")
                .field("name", name)
                .field("value", &"****")
                .finish(),
        }
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Short name of the scheme, used in logs.
    fn scheme(&self) -> &'static str;

    /// Whether the credential can change during a session. Rotating
    /// credentials are resolved again for every outbound request.
    fn rotates(&self) -> bool {
        false
    }

    /// Current credential, or `None` when nothing should be attached.
    async fn credential(&self) -> McpResult<Option<Credential>>;
}

/// Build the provider for a transport's auth settings.
pub fn create_auth_provider(
    config: &AuthConfig,
    http: reqwest::Client,
) -> McpResult<Arc<dyn AuthProvider>> {
    let provider: Arc<dyn AuthProvider> = match config {
        AuthConfig::None => Arc::new(NoAuth),
        AuthConfig::Bearer { token } => Arc::new(BearerAuth::new(token.clone())),
        AuthConfig::Basic { username, password } => {
            Arc::new(BasicAuth::new(username.clone(), password.clone()))
        }
        AuthConfig::ApiKey {
            name,
            value,
            location,
        } => Arc::new(ApiKeyAuth {
            name: name.clone(),
            value: value.clone(),
            location: *location,
        }),
        AuthConfig::OAuth2ClientCredentials {
            token_url,
            client_id,
            client_secret,
            scopes,
        } => Arc::new(OAuth2ClientCredentials::new(
            http,
            token_url.clone(),
            client_id.clone(),
            client_secret.clone(),
            scopes.clone(),
        )?),
    };
    Ok(provider)
}

pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    fn scheme(&self) -> &'static str {
        "none"
    }

    async fn credential(&self) -> McpResult<Option<Credential>> {
        Ok(None)
    }
}

pub struct BearerAuth {
    token: String,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for BearerAuth {
    fn scheme(&self) -> &'static str {
        "bearer"
    }

    async fn credential(&self) -> McpResult<Option<Credential>> {
        if self.token.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(Credential::authorization(format!(
            "Bearer {}",
            self.token
        ))))
    }
}

pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for BasicAuth {
    fn scheme(&self) -> &'static str {
        "basic"
    }

    async fn credential(&self) -> McpResult<Option<Credential>> {
        if self.username.is_empty() || self.password.is_empty() {
            return Ok(None);
        }
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        Ok(Some(Credential::authorization(format!("Basic {}", encoded))))
    }
}

pub struct ApiKeyAuth {
    name: String,
    value: String,
    location: ApiKeyLocation,
}

#[async_trait]
impl AuthProvider for ApiKeyAuth {
    fn scheme(&self) -> &'static str {
        "api_key"
    }

    async fn credential(&self) -> McpResult<Option<Credential>> {
        if self.name.is_empty() || self.value.is_empty() {
            return Ok(None);
        }
        let (name, value) = (self.name.clone(), self.value.clone());
        Ok(Some(match self.location {
            ApiKeyLocation::Header => Credential::Header { name, value },
            ApiKeyLocation::Query => Credential::Query { name, value },
        }))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// OAuth2 client-credentials grant with a cached access token.
pub struct OAuth2ClientCredentials {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    token: RwLock<Option<CachedToken>>,
    refresh_lock: Mutex<()>,
}

impl OAuth2ClientCredentials {
    pub fn new(
        http: reqwest::Client,
        token_url: String,
        client_id: String,
        client_secret: String,
        scopes: Vec<String>,
    ) -> McpResult<Self> {
        let missing: Vec<&str> = [
            ("token_url", token_url.as_str()),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect();
        if !missing.is_empty() {
            return Err(McpError::Config(format!(
                "OAuth2 client credentials missing: {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            http,
            token_url,
            client_id,
            client_secret,
            scopes,
            token: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        })
    }

    /// `Authorization` header value, refreshing the token when it is absent or
    /// about to expire.
    pub async fn get_header(&self) -> McpResult<String> {
        let token = match self.fresh_token() {
            Some(token) => token,
            None => self.refresh().await?,
        };
        Ok(format!("Bearer {}", token))
    }

    /// Fetch a new token unless another caller already did while we waited.
    pub async fn refresh(&self) -> McpResult<String> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(token) = self.fresh_token() {
            debug!("OAuth2 token refreshed by a concurrent caller");
            return Ok(token);
        }

        let cached = self.request_token().await?;
        let access_token = cached.access_token.clone();
        *self.token.write() = Some(cached);
        Ok(access_token)
    }

    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.token.read().as_ref().map(|t| t.expires_at)
    }

    fn fresh_token(&self) -> Option<String> {
        let guard = self.token.read();
        let cached = guard.as_ref()?;
        let threshold = Utc::now() + TimeDelta::seconds(TOKEN_EXPIRY_BUFFER_SECS);
        (cached.expires_at > threshold).then(|| cached.access_token.clone())
    }

    async fn request_token(&self) -> McpResult<CachedToken> {
        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
        ];
        if !self.scopes.is_empty() {
            form.push(("scope", self.scopes.join(" ")));
        }

        info!(token_url = %self.token_url, "Requesting OAuth2 access token");

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| McpError::TokenFetch(format!("request to token endpoint: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                token_url = %self.token_url,
                status = %status,
                "OAuth2 token endpoint rejected request"
            );
            return Err(McpError::TokenFetch(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| McpError::TokenFetch(format!("invalid token response: {}", e)))?;

        let access_token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                McpError::TokenFetch("token response has no access_token".to_string())
            })?;
        let expires_in = parsed
            .expires_in
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
            .clamp(0, MAX_EXPIRES_IN_SECS);

        Ok(CachedToken {
            access_token,
            expires_at: Utc::now() + TimeDelta::seconds(expires_in - TOKEN_EXPIRY_BUFFER_SECS),
        })
    }
}

#[async_trait]
impl AuthProvider for OAuth2ClientCredentials {
    fn scheme(&self) -> &'static str {
        "oauth2_client_credentials"
    }

    fn rotates(&self) -> bool {
        true
    }

    async fn credential(&self) -> McpResult<Option<Credential>> {
        self.get_header().await.map(|v| Some(Credential::authorization(v)))
    }
}
