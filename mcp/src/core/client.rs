//! Backend connections over stdio, SSE and streamable HTTP.
//!
//! [`BackendClient`] is the surface the aggregator needs from one backend;
//! [`TransportConnector`] opens an rmcp client session for a descriptor and
//! wraps it in [`RmcpBackendClient`].

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, ClientInfo, GetPromptRequestParam, GetPromptResult,
        Implementation, JsonObject, Prompt, ReadResourceRequestParam, ReadResourceResult,
        Resource, ServerCapabilities, Tool,
    },
    service::{Peer, RunningService},
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    auth::{create_auth_provider, AuthProvider, Credential},
    config::{AuthConfig, BackendDescriptor, BackendTransport},
    transport::AuthorizedHttpClient,
};
use crate::error::{McpError, McpResult};

type McpClient = RunningService<RoleClient, ClientInfo>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Operations the aggregator issues against a single backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Name and version reported by the backend during the handshake.
    fn server_info(&self) -> Implementation;

    fn capabilities(&self) -> ServerCapabilities;

    async fn list_tools(&self) -> McpResult<Vec<Tool>>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<CallToolResult>;

    async fn list_prompts(&self) -> McpResult<Vec<Prompt>>;

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<GetPromptResult>;

    async fn list_resources(&self) -> McpResult<Vec<Resource>>;

    async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult>;

    /// Shut the session down. Calling it twice is a no-op.
    async fn close(&self) -> McpResult<()>;
}

/// Opens a connection for one backend descriptor.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
        client_info: &ClientInfo,
    ) -> McpResult<Arc<dyn BackendClient>>;
}

/// [`BackendClient`] backed by a live rmcp client session.
pub struct RmcpBackendClient {
    name: String,
    peer: Peer<RoleClient>,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    service: Mutex<Option<McpClient>>,
}

impl RmcpBackendClient {
    pub fn new(name: impl Into<String>, service: McpClient) -> Self {
        let peer = service.peer().clone();
        let (server_info, capabilities) = service
            .peer_info()
            .map(|info| (info.server_info.clone(), info.capabilities.clone()))
            .unwrap_or_default();

        Self {
            name: name.into(),
            peer,
            server_info,
            capabilities,
            service: Mutex::new(Some(service)),
        }
    }

    fn transport_error(&self, action: &str, e: impl std::fmt::Display) -> McpError {
        McpError::Transport(format!("{} on '{}': {}", action, self.name, e))
    }
}

#[async_trait]
impl BackendClient for RmcpBackendClient {
    fn server_info(&self) -> Implementation {
        self.server_info.clone()
    }

    fn capabilities(&self) -> ServerCapabilities {
        self.capabilities.clone()
    }

    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        self.peer
            .list_all_tools()
            .await
            .map_err(|e| self.transport_error("list tools", e))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<CallToolResult> {
        let request = CallToolRequestParam {
            name: name.to_string().into(),
            arguments,
        };
        self.peer
            .call_tool(request)
            .await
            .map_err(|e| self.transport_error("call tool", e))
    }

    async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        self.peer
            .list_all_prompts()
            .await
            .map_err(|e| self.transport_error("list prompts", e))
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<GetPromptResult> {
        let request = GetPromptRequestParam {
            name: name.to_string(),
            arguments,
        };
        self.peer
            .get_prompt(request)
            .await
            .map_err(|e| self.transport_error("get prompt", e))
    }

    async fn list_resources(&self) -> McpResult<Vec<Resource>> {
        self.peer
            .list_all_resources()
            .await
            .map_err(|e| self.transport_error("list resources", e))
    }

    async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        let request = ReadResourceRequestParam {
            uri: uri.to_string(),
        };
        self.peer
            .read_resource(request)
            .await
            .map_err(|e| self.transport_error("read resource", e))
    }

    async fn close(&self) -> McpResult<()> {
        let Some(service) = self.service.lock().await.take() else {
            return Ok(());
        };
        service
            .cancel()
            .await
            .map(|reason| debug!("Closed '{}': {:?}", self.name, reason))
            .map_err(|e| self.transport_error("close", e))
    }
}

/// Connects descriptors using the rmcp transports.
///
/// Auth providers are kept per backend so a cached OAuth2 token survives
/// reconnects. A provider is rebuilt when the backend's auth settings change.
pub struct TransportConnector {
    http: reqwest::Client,
    auth_providers: DashMap<String, (AuthConfig, Arc<dyn AuthProvider>)>,
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl TransportConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            auth_providers: DashMap::new(),
        }
    }

    fn auth_provider(&self, server: &str, auth: &AuthConfig) -> McpResult<Arc<dyn AuthProvider>> {
        if let Some(entry) = self.auth_providers.get(server) {
            let (config, provider) = entry.value();
            if config == auth {
                return Ok(Arc::clone(provider));
            }
            debug!(server = %server, "Auth settings changed, rebuilding provider");
        }
        let provider = create_auth_provider(auth, self.http.clone())?;
        self.auth_providers
            .insert(server.to_string(), (auth.clone(), Arc::clone(&provider)));
        Ok(provider)
    }

    /// Resolve the endpoint URL and an HTTP client carrying the static headers.
    /// Static credentials are attached once; rotating ones are resolved by the
    /// returned client on every request.
    async fn remote_client(
        &self,
        server: &str,
        url: &str,
        headers: &HashMap<String, String>,
        auth: &AuthConfig,
    ) -> McpResult<(String, AuthorizedHttpClient)> {
        let mut endpoint = url::Url::parse(url)
            .map_err(|e| McpError::Config(format!("invalid URL '{}': {}", url, e)))?;

        let mut header_map = reqwest::header::HeaderMap::new();
        for (name, value) in headers {
            insert_header(&mut header_map, name, value)?;
        }

        let provider = self.auth_provider(server, auth)?;
        // Fetched up front for rotating providers too, so a bad token endpoint
        // fails the connect with its own error.
        let credential = provider.credential().await?;
        if !provider.rotates() {
            match credential {
                Some(Credential::Header { name, value }) => {
                    insert_header(&mut header_map, &name, &value)?;
                }
                Some(Credential::Query { name, value }) => {
                    endpoint.query_pairs_mut().append_pair(&name, &value);
                }
                None => {}
            }
        }
        debug!(
            server = %server,
            scheme = provider.scheme(),
            rotating = provider.rotates(),
            headers = header_map.len(),
            "Prepared remote transport"
        );

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .default_headers(header_map)
            .build()
            .map_err(|e| McpError::Transport(format!("build HTTP client: {}", e)))?;
        let per_request = provider.rotates().then_some(provider);

        Ok((endpoint.to_string(), AuthorizedHttpClient::new(http, per_request)))
    }

    async fn connect_impl(
        &self,
        descriptor: &BackendDescriptor,
        client_info: &ClientInfo,
    ) -> McpResult<McpClient> {
        info!(
            "Connecting to MCP server '{}' via {:?}",
            descriptor.name, descriptor.transport
        );

        match &descriptor.transport {
            BackendTransport::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let environment = merged_environment(env);
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .env_clear()
                            .envs(environment.iter())
                            .stderr(std::process::Stdio::inherit());
                        if let Some(dir) = cwd {
                            cmd.current_dir(dir);
                        }
                    }),
                )
                .map_err(|e| {
                    McpError::ConnectionFailed(format!("start process '{}': {}", command, e))
                })?;

                let client = client_info.clone().serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize stdio client: {}", e))
                })?;

                info!("Connected to stdio server '{}'", descriptor.name);
                Ok(client)
            }

            BackendTransport::Sse { url, headers, auth } => {
                let (endpoint, http) = self
                    .remote_client(&descriptor.name, url, headers, auth)
                    .await?;

                let cfg = SseClientConfig {
                    sse_endpoint: endpoint.into(),
                    ..Default::default()
                };
                let transport = SseClientTransport::start_with_client(http, cfg)
                    .await
                    .map_err(|e| {
                        McpError::ConnectionFailed(format!("create SSE transport: {}", e))
                    })?;

                let client = client_info.clone().serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize SSE client: {}", e))
                })?;

                info!("Connected to SSE server '{}' at {}", descriptor.name, url);
                Ok(client)
            }

            BackendTransport::Streamable { url, headers, auth } => {
                let (endpoint, http) = self
                    .remote_client(&descriptor.name, url, headers, auth)
                    .await?;

                let transport = StreamableHttpClientTransport::with_client(
                    http,
                    StreamableHttpClientTransportConfig::with_uri(endpoint),
                );

                let client = client_info.clone().serve(transport).await.map_err(|e| {
                    McpError::ConnectionFailed(format!("initialize streamable client: {}", e))
                })?;

                info!(
                    "Connected to streamable HTTP server '{}' at {}",
                    descriptor.name, url
                );
                Ok(client)
            }
        }
    }
}

#[async_trait]
impl BackendConnector for TransportConnector {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
        client_info: &ClientInfo,
    ) -> McpResult<Arc<dyn BackendClient>> {
        descriptor.validate()?;

        let timeout = descriptor.timeout();
        let service = tokio::time::timeout(timeout, self.connect_impl(descriptor, client_info))
            .await
            .map_err(|_| {
                warn!(
                    "Timed out after {:?} connecting to '{}'",
                    timeout, descriptor.name
                );
                McpError::ConnectionFailed(format!(
                    "timed out after {}s connecting to '{}'",
                    timeout.as_secs(),
                    descriptor.name
                ))
            })??;

        Ok(Arc::new(RmcpBackendClient::new(&descriptor.name, service)))
    }
}

/// Inherited process environment with `overrides` applied on top.
pub fn merged_environment(overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut environment: HashMap<String, String> = std::env::vars().collect();
    environment.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    environment
}

fn insert_header(
    map: &mut reqwest::header::HeaderMap,
    name: &str,
    value: &str,
) -> McpResult<()> {
    let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| McpError::Config(format!("invalid header name '{}': {}", name, e)))?;
    let value = reqwest::header::HeaderValue::from_str(value)
        .map_err(|e| McpError::Config(format!("invalid value for header '{}': {}", name, e)))?;
    map.insert(name, value);
    Ok(())
}
