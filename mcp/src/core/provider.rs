//! Lazily created, cached backend connections.
//!
//! [`ServerProvider`] turns a [`BackendDescriptor`] into a live
//! [`BackendConnection`] through a [`BackendConnector`] and keeps it keyed by
//! server name so repeated builds reuse the same session.

use std::{
    collections::HashSet,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use rmcp::model::{
    CallToolResult, ClientInfo, GetPromptResult, Implementation, JsonObject, Prompt,
    ReadResourceResult, Resource, ServerCapabilities, Tool,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    client::{BackendClient, BackendConnector},
    config::BackendDescriptor,
    reconnect::ReconnectionManager,
};
use crate::error::{McpError, McpResult};

/// Identity of a configured backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerMetadata {
    pub id: String,
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// A connected backend plus the state the health checker maintains for it.
pub struct BackendConnection {
    name: String,
    client: Arc<dyn BackendClient>,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    timeout: Duration,
    connected: AtomicBool,
    last_heartbeat: RwLock<DateTime<Utc>>,
}

impl BackendConnection {
    pub fn new(name: impl Into<String>, client: Arc<dyn BackendClient>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            server_info: client.server_info(),
            capabilities: client.capabilities(),
            client,
            timeout,
            connected: AtomicBool::new(true),
            last_heartbeat: RwLock::new(Utc::now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.read()
    }

    pub fn mark_healthy(&self, at: DateTime<Utc>) {
        self.connected.store(true, Ordering::Release);
        *self.last_heartbeat.write() = at;
    }

    pub fn mark_unhealthy(&self) {
        self.connected.store(false, Ordering::Release);
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = McpResult<T>>,
    ) -> McpResult<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| McpError::Timeout {
                operation: format!("{} on '{}'", operation, self.name),
                seconds: self.timeout.as_secs(),
            })?
    }

    pub async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        self.bounded("list tools", self.client.list_tools()).await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<CallToolResult> {
        self.bounded("call tool", self.client.call_tool(name, arguments))
            .await
    }

    pub async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        self.bounded("list prompts", self.client.list_prompts())
            .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> McpResult<GetPromptResult> {
        self.bounded("get prompt", self.client.get_prompt(name, arguments))
            .await
    }

    pub async fn list_resources(&self) -> McpResult<Vec<Resource>> {
        self.bounded("list resources", self.client.list_resources())
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        self.bounded("read resource", self.client.read_resource(uri))
            .await
    }

    /// Close the session, logging instead of failing.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        if let Err(e) = self.client.close().await {
            warn!("Error disconnecting from server '{}': {}", self.name, e);
        }
    }
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("name", &self.name)
            .field("server", &self.server_info.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Creates backend connections on demand and caches them by server name.
pub struct ServerProvider {
    connector: Arc<dyn BackendConnector>,
    connections: DashMap<String, Arc<BackendConnection>>,
    reconnect: ReconnectionManager,
    auto_reconnect: bool,
    disposed: AtomicBool,
}

impl ServerProvider {
    pub fn new(connector: Arc<dyn BackendConnector>, auto_reconnect: bool) -> Self {
        Self {
            connector,
            connections: DashMap::new(),
            reconnect: ReconnectionManager::default(),
            auto_reconnect,
            disposed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_reconnection_manager(mut self, reconnect: ReconnectionManager) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn metadata(descriptor: &BackendDescriptor) -> ServerMetadata {
        ServerMetadata {
            id: descriptor.name.clone(),
            name: descriptor
                .title
                .clone()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| descriptor.name.clone()),
            title: descriptor.title.clone(),
            description: descriptor.description.clone(),
        }
    }

    /// Identity announced to a backend during the handshake.
    pub fn client_info(descriptor: &BackendDescriptor) -> ClientInfo {
        let mut client_info = ClientInfo::default();
        client_info.client_info.name = "mcp-proxy".to_string();
        client_info.client_info.version = env!("CARGO_PKG_VERSION").to_string();
        client_info.client_info.title = descriptor.title.clone();
        client_info
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendConnection>> {
        self.connections
            .get(&cache_key(name))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Return the cached connection for `descriptor`, opening one if needed.
    ///
    /// A cached connection that the health checker marked disconnected is
    /// closed and, when auto-reconnect is on, re-established with backoff.
    pub async fn get_or_create(
        &self,
        descriptor: &BackendDescriptor,
    ) -> McpResult<Arc<BackendConnection>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(McpError::Disposed);
        }
        descriptor.validate()?;

        let key = cache_key(&descriptor.name);
        let stale = match self.get(&descriptor.name) {
            Some(existing) if existing.is_connected() => return Ok(existing),
            Some(existing) => Some(existing),
            None => None,
        };

        let connection = match stale {
            Some(existing) => {
                self.connections.remove(&key);
                existing.close().await;
                if !self.auto_reconnect {
                    return Err(McpError::ConnectionFailed(format!(
                        "server '{}' is disconnected and auto-reconnect is disabled",
                        descriptor.name
                    )));
                }
                info!("Reconnecting to server '{}'", descriptor.name);
                self.reconnect
                    .reconnect(&descriptor.name, move || self.open(descriptor))
                    .await?
            }
            None => self.open(descriptor).await?,
        };

        self.connections.insert(key, Arc::clone(&connection));
        Ok(connection)
    }

    async fn open(&self, descriptor: &BackendDescriptor) -> McpResult<Arc<BackendConnection>> {
        let client_info = Self::client_info(descriptor);
        let client = self.connector.connect(descriptor, &client_info).await?;
        Ok(Arc::new(BackendConnection::new(
            &descriptor.name,
            client,
            descriptor.timeout(),
        )))
    }

    /// Drop and close every cached connection whose name is not in `active`.
    pub async fn retain(&self, active: &HashSet<String>) {
        let keep: HashSet<String> = active.iter().map(|n| cache_key(n)).collect();
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| !keep.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let removed: Vec<Arc<BackendConnection>> = stale
            .iter()
            .filter_map(|key| self.connections.remove(key).map(|(_, conn)| conn))
            .collect();
        if removed.is_empty() {
            return;
        }

        info!("Closing {} connection(s) no longer discovered", removed.len());
        join_all(removed.iter().map(|conn| conn.close())).await;
    }

    /// Close every connection. Further `get_or_create` calls fail with
    /// [`McpError::Disposed`].
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let keys: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        let connections: Vec<Arc<BackendConnection>> = keys
            .iter()
            .filter_map(|key| self.connections.remove(key).map(|(_, conn)| conn))
            .collect();

        debug!("Disposing {} backend connection(s)", connections.len());
        join_all(connections.iter().map(|conn| conn.close())).await;
    }
}

fn cache_key(name: &str) -> String {
    name.to_ascii_lowercase()
}
