//! Aggregation engine.
//!
//! [`McpAggregator`] discovers backends, connects them through the
//! [`ServerProvider`], and builds a routing table from every backend's tools,
//! prompts and resources. Requests are routed to one backend by namespace
//! prefix, or fanned out to all of them and merged.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized -> Initializing -> Ready <-> Refreshing
//!                                    \-> Disposed
//! ```
//!
//! Initialization is lazy and double-checked: the first request takes the
//! build lock and builds, concurrent requests wait on the lock and then reuse
//! the result. A refresh rebuilds under the same lock while readers keep
//! using the previous snapshot until the new one is published.

use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use rmcp::model::{
    CallToolResult, Content, GetPromptResult, Implementation, JsonObject, Prompt,
    PromptsCapability, ReadResourceResult, Resource, ResourcesCapability, ServerCapabilities,
    Tool, ToolsCapability,
};
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    client::{BackendConnector, TransportConnector},
    config::{AggregatorOptions, ProxyConfig},
    discovery::{ConfigDiscovery, DiscoveryStrategy},
    health::{HealthChecker, HealthReport},
    provider::{BackendConnection, ServerProvider},
    reconnect::ReconnectionManager,
    routing::{prefixed_name, prefixed_uri, ItemKind, Resolver, Route, RoutingTable},
};
use crate::error::{McpError, McpResult};

/// Point-in-time summary of the aggregate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStatus {
    pub is_initialized: bool,
    pub last_initialized_at: Option<DateTime<Utc>>,
    pub total_servers: usize,
    pub total_tools: usize,
    pub total_prompts: usize,
    pub total_resources: usize,
    pub server_names: Vec<String>,
    pub refresh_count: u64,
}

/// Per-backend status as seen by the aggregate.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusInfo {
    pub name: String,
    pub is_connected: bool,
    pub server_name: String,
    pub server_version: String,
    pub last_heartbeat: DateTime<Utc>,
    pub capabilities: ServerCapabilities,
}

/// Connections and routes published by one completed build.
#[derive(Debug)]
struct Snapshot {
    connections: Vec<Arc<BackendConnection>>,
    names: Vec<String>,
    routing: RoutingTable,
    initialized_at: DateTime<Utc>,
}

impl Snapshot {
    fn connection(&self, name: &str) -> Option<&Arc<BackendConnection>> {
        self.connections
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(name))
    }

    fn resolve(&self, kind: ItemKind, name: &str, use_namespace_prefix: bool) -> McpResult<Route> {
        Resolver::new(&self.names, &self.routing, use_namespace_prefix).resolve(kind, name)
    }
}

#[derive(Debug, Clone)]
enum EngineState {
    Uninitialized,
    Initializing,
    Ready(Arc<Snapshot>),
    Refreshing(Arc<Snapshot>),
    Disposed,
}

impl EngineState {
    fn is_building(&self) -> bool {
        matches!(self, EngineState::Initializing | EngineState::Refreshing(_))
    }
}

/// Inventory gathered from one connection during a build.
struct Inventory {
    tools: Vec<Tool>,
    prompts: Vec<Prompt>,
    resources: Vec<Resource>,
}

pub struct McpAggregator {
    discovery: Arc<dyn DiscoveryStrategy>,
    provider: ServerProvider,
    options: AggregatorOptions,
    health: HealthChecker,
    state: RwLock<EngineState>,
    build_lock: Mutex<()>,
    refresh_count: AtomicU64,
}

impl McpAggregator {
    pub fn new(
        discovery: Arc<dyn DiscoveryStrategy>,
        connector: Arc<dyn BackendConnector>,
        options: AggregatorOptions,
    ) -> Self {
        Self {
            discovery,
            provider: ServerProvider::new(connector, options.auto_reconnect),
            options,
            health: HealthChecker::new(),
            state: RwLock::new(EngineState::Uninitialized),
            build_lock: Mutex::new(()),
            refresh_count: AtomicU64::new(0),
        }
    }

    /// Aggregate the servers of `config` over their configured transports.
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            Arc::new(ConfigDiscovery::from_config(config)),
            Arc::new(TransportConnector::default()),
            config.aggregator.clone(),
        )
    }

    #[must_use]
    pub fn with_reconnection_manager(mut self, reconnect: ReconnectionManager) -> Self {
        self.provider = self.provider.with_reconnection_manager(reconnect);
        self
    }

    pub fn options(&self) -> &AggregatorOptions {
        &self.options
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Build the aggregate if it is not built yet.
    pub async fn initialize(&self, cancel: &CancellationToken) -> McpResult<()> {
        self.ensure_ready(cancel).await.map(|_| ())
    }

    /// Rebuild connections and routes from a fresh discovery pass.
    pub async fn refresh(&self, cancel: &CancellationToken) -> McpResult<()> {
        let _guard = self.acquire_build_lock(cancel).await?;
        if matches!(*self.state.read(), EngineState::Disposed) {
            return Err(McpError::Disposed);
        }

        let snapshot = self.build(cancel).await?;
        let count = self.refresh_count.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            servers = snapshot.connections.len(),
            tools = snapshot.routing.tools.len(),
            refresh = count,
            "Refreshed MCP aggregate"
        );
        Ok(())
    }

    /// Close every backend. Later calls fail with [`McpError::Disposed`].
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, EngineState::Disposed) {
                return;
            }
            *state = EngineState::Disposed;
        }
        info!("Shutting down MCP aggregate");
        self.provider.dispose().await;
    }

    pub fn is_disposed(&self) -> bool {
        matches!(*self.state.read(), EngineState::Disposed)
    }

    fn published_snapshot(&self) -> McpResult<Option<Arc<Snapshot>>> {
        match &*self.state.read() {
            EngineState::Ready(s) | EngineState::Refreshing(s) => Ok(Some(Arc::clone(s))),
            EngineState::Disposed => Err(McpError::Disposed),
            EngineState::Uninitialized | EngineState::Initializing => Ok(None),
        }
    }

    async fn acquire_build_lock(
        &self,
        cancel: &CancellationToken,
    ) -> McpResult<tokio::sync::MutexGuard<'_, ()>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(McpError::Cancelled),
            guard = self.build_lock.lock() => Ok(guard),
        }
    }

    async fn ensure_ready(&self, cancel: &CancellationToken) -> McpResult<Arc<Snapshot>> {
        if let Some(snapshot) = self.published_snapshot()? {
            return Ok(snapshot);
        }

        let _guard = self.acquire_build_lock(cancel).await?;
        if let Some(snapshot) = self.published_snapshot()? {
            return Ok(snapshot);
        }
        self.build(cancel).await
    }

    /// Replace the state unless the engine was disposed meanwhile.
    fn transition(&self, next: EngineState) {
        let mut state = self.state.write();
        if !matches!(*state, EngineState::Disposed) {
            *state = next;
        }
    }

    /// Run one build cycle. Callers must hold the build lock.
    async fn build(&self, cancel: &CancellationToken) -> McpResult<Arc<Snapshot>> {
        let previous = self.state.read().clone();
        self.transition(match &previous {
            EngineState::Ready(s) | EngineState::Refreshing(s) => {
                EngineState::Refreshing(Arc::clone(s))
            }
            _ => EngineState::Initializing,
        });

        // Restore the previous state if this future is dropped mid-build.
        let rollback = scopeguard::guard(previous, |previous| {
            let mut state = self.state.write();
            if state.is_building() {
                *state = previous;
            }
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(McpError::Cancelled),
            result = self.build_snapshot(cancel) => result,
        };

        match result {
            Ok(snapshot) => {
                scopeguard::ScopeGuard::into_inner(rollback);
                self.transition(EngineState::Ready(Arc::clone(&snapshot)));
                Ok(snapshot)
            }
            Err(e @ (McpError::Cancelled | McpError::Disposed)) => Err(e),
            Err(e) => {
                scopeguard::ScopeGuard::into_inner(rollback);
                error!("Failed to build MCP aggregate: {}", e);
                self.transition(EngineState::Uninitialized);
                Err(e)
            }
        }
    }

    async fn build_snapshot(&self, cancel: &CancellationToken) -> McpResult<Arc<Snapshot>> {
        let descriptors = self.discovery.discover(cancel).await.map_err(|e| match e {
            McpError::Cancelled | McpError::Disposed => e,
            other => McpError::AggregateUnavailable(format!("discovery failed: {}", other)),
        })?;
        info!("Discovered {} enabled MCP server(s)", descriptors.len());

        let attempts = join_all(
            descriptors
                .iter()
                .map(|descriptor| self.provider.get_or_create(descriptor)),
        )
        .await;

        let mut connections = Vec::with_capacity(descriptors.len());
        for (descriptor, attempt) in descriptors.iter().zip(attempts) {
            match attempt {
                Ok(conn) => connections.push(conn),
                Err(e) if e.is_backend_fault() => warn!(
                    server = %descriptor.name,
                    error = %e,
                    "Skipping MCP server that failed to connect"
                ),
                Err(e) => return Err(e),
            }
        }

        let discovered: HashSet<String> = descriptors.iter().map(|d| d.name.clone()).collect();
        self.provider.retain(&discovered).await;

        if connections.is_empty() {
            return Err(McpError::AggregateUnavailable(format!(
                "none of {} configured server(s) could be connected",
                descriptors.len()
            )));
        }

        let inventories = join_all(connections.iter().map(|conn| Self::load_inventory(conn))).await;

        let mut routing = RoutingTable::default();
        for (conn, inventory) in connections.iter().zip(&inventories) {
            let server = conn.name();
            let tools = inventory.tools.iter().map(|t| t.name.as_ref());
            Self::register(&mut routing, ItemKind::Tool, server, tools);
            let prompts = inventory.prompts.iter().map(|p| p.name.as_str());
            Self::register(&mut routing, ItemKind::Prompt, server, prompts);
            let resources = inventory.resources.iter().map(|r| r.raw.uri.as_str());
            Self::register(&mut routing, ItemKind::Resource, server, resources);
        }

        let snapshot = Snapshot {
            names: connections.iter().map(|c| c.name().to_string()).collect(),
            connections,
            routing,
            initialized_at: Utc::now(),
        };
        info!(
            servers = snapshot.connections.len(),
            tools = snapshot.routing.tools.len(),
            prompts = snapshot.routing.prompts.len(),
            resources = snapshot.routing.resources.len(),
            "MCP aggregate ready"
        );
        Ok(Arc::new(snapshot))
    }

    fn register<'a>(
        routing: &mut RoutingTable,
        kind: ItemKind,
        server: &str,
        items: impl Iterator<Item = &'a str>,
    ) {
        let routes = routing.routes_mut(kind);
        for item in items {
            if let Some(previous) = routes.register(server, item) {
                warn!(
                    "{:?} '{}' exists on '{}' and '{}'; routing unprefixed calls to '{}'",
                    kind, item, previous, server, server
                );
            }
        }
    }

    async fn load_inventory(conn: &BackendConnection) -> Inventory {
        let (tools, prompts, resources) =
            tokio::join!(conn.list_tools(), conn.list_prompts(), conn.list_resources());

        let tools = tools.unwrap_or_else(|e| {
            warn!("Failed to list tools from '{}': {}", conn.name(), e);
            Vec::new()
        });
        let prompts = prompts.unwrap_or_else(|e| {
            debug!("No prompts or failed to list on '{}': {}", conn.name(), e);
            Vec::new()
        });
        let resources = resources.unwrap_or_else(|e| {
            debug!("No resources or failed to list on '{}': {}", conn.name(), e);
            Vec::new()
        });
        info!(
            "Discovered {} tools, {} prompts, {} resources from '{}'",
            tools.len(),
            prompts.len(),
            resources.len(),
            conn.name()
        );

        Inventory {
            tools,
            prompts,
            resources,
        }
    }

    // ========================================================================
    // Request handling
    // ========================================================================

    fn server_filter<'a>(&self, filter: Option<&'a str>) -> Option<&'a str> {
        filter
            .map(str::trim)
            .filter(|f| self.options.allow_server_filter && !f.is_empty())
    }

    fn prefix_results(&self, snapshot: &Snapshot) -> bool {
        self.options.use_namespace_prefix && snapshot.connections.len() > 1
    }

    async fn cancellable<T>(
        cancel: &CancellationToken,
        fut: impl Future<Output = T>,
    ) -> McpResult<T> {
        tokio::select! {
            _ = cancel.cancelled() => Err(McpError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Query the filtered backend, or every backend concurrently. Failures
    /// become empty results. Output keeps backend order.
    async fn collect<T, F, Fut>(
        &self,
        snapshot: &Snapshot,
        filter: Option<&str>,
        cancel: &CancellationToken,
        what: &str,
        query: F,
    ) -> McpResult<Vec<(String, Vec<T>)>>
    where
        F: Fn(Arc<BackendConnection>) -> Fut,
        Fut: Future<Output = McpResult<Vec<T>>>,
    {
        let targets: Vec<Arc<BackendConnection>> = match filter {
            Some(name) => match snapshot.connection(name) {
                Some(conn) => vec![Arc::clone(conn)],
                None => {
                    debug!("Server filter '{}' matches no connected server", name);
                    return Ok(Vec::new());
                }
            },
            None => snapshot.connections.clone(),
        };

        let queries = targets.into_iter().map(|conn| {
            let name = conn.name().to_string();
            let fut = query(conn);
            async move { (name, fut.await) }
        });
        let results = Self::cancellable(cancel, join_all(queries)).await?;

        Ok(results
            .into_iter()
            .map(|(name, result)| {
                let items = result.unwrap_or_else(|e| {
                    warn!(server = %name, error = %e, "Failed to list {}", what);
                    Vec::new()
                });
                (name, items)
            })
            .collect())
    }

    pub async fn list_tools(
        &self,
        server_filter: Option<&str>,
        cancel: &CancellationToken,
    ) -> McpResult<Vec<Tool>> {
        let snapshot = self.ensure_ready(cancel).await?;
        let filter = self.server_filter(server_filter);
        let prefix = filter.is_none() && self.prefix_results(&snapshot);

        let per_server = self
            .collect(&snapshot, filter, cancel, "tools", |conn| async move {
                conn.list_tools().await
            })
            .await?;

        Ok(per_server
            .into_iter()
            .flat_map(|(server, tools)| {
                tools.into_iter().map(move |mut tool| {
                    if prefix {
                        tool.name = Cow::Owned(prefixed_name(&server, &tool.name));
                    }
                    tool
                })
            })
            .collect())
    }

    pub async fn list_prompts(
        &self,
        server_filter: Option<&str>,
        cancel: &CancellationToken,
    ) -> McpResult<Vec<Prompt>> {
        let snapshot = self.ensure_ready(cancel).await?;
        let filter = self.server_filter(server_filter);
        let prefix = filter.is_none() && self.prefix_results(&snapshot);

        let per_server = self
            .collect(&snapshot, filter, cancel, "prompts", |conn| async move {
                conn.list_prompts().await
            })
            .await?;

        Ok(per_server
            .into_iter()
            .flat_map(|(server, prompts)| {
                prompts.into_iter().map(move |mut prompt| {
                    if prefix {
                        prompt.name = prefixed_name(&server, &prompt.name);
                    }
                    prompt
                })
            })
            .collect())
    }

    pub async fn list_resources(
        &self,
        server_filter: Option<&str>,
        cancel: &CancellationToken,
    ) -> McpResult<Vec<Resource>> {
        let snapshot = self.ensure_ready(cancel).await?;
        let filter = self.server_filter(server_filter);
        let prefix = filter.is_none() && self.prefix_results(&snapshot);

        let per_server = self
            .collect(&snapshot, filter, cancel, "resources", |conn| async move {
                conn.list_resources().await
            })
            .await?;

        Ok(per_server
            .into_iter()
            .flat_map(|(server, resources)| {
                resources.into_iter().map(move |mut resource| {
                    if prefix {
                        resource.raw.uri = prefixed_uri(&server, &resource.raw.uri);
                    }
                    resource
                })
            })
            .collect())
    }

    fn target(
        &self,
        snapshot: &Snapshot,
        kind: ItemKind,
        name: &str,
    ) -> McpResult<(Arc<BackendConnection>, String)> {
        let route = snapshot.resolve(kind, name, self.options.use_namespace_prefix)?;
        let conn = snapshot
            .connection(&route.server)
            .cloned()
            .ok_or_else(|| McpError::ServerNotFound(route.server.clone()))?;
        debug!(
            "Routing {:?} '{}' to '{}' as '{}'",
            kind, name, route.server, route.item
        );
        Ok((conn, route.item))
    }

    /// Call a tool by bare or prefixed name. An unknown tool is reported as an
    /// error result rather than an error.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        cancel: &CancellationToken,
    ) -> McpResult<CallToolResult> {
        let snapshot = self.ensure_ready(cancel).await?;
        let (conn, tool) = match self.target(&snapshot, ItemKind::Tool, name) {
            Ok(target) => target,
            Err(e) if e.is_not_found() => {
                warn!("Tool call could not be routed: {}", e);
                return Ok(CallToolResult::error(vec![Content::text(e.to_string())]));
            }
            Err(e) => return Err(e),
        };
        Self::cancellable(cancel, conn.call_tool(&tool, arguments)).await?
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        cancel: &CancellationToken,
    ) -> McpResult<GetPromptResult> {
        let snapshot = self.ensure_ready(cancel).await?;
        let (conn, prompt) = self.target(&snapshot, ItemKind::Prompt, name)?;
        Self::cancellable(cancel, conn.get_prompt(&prompt, arguments)).await?
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        cancel: &CancellationToken,
    ) -> McpResult<ReadResourceResult> {
        let snapshot = self.ensure_ready(cancel).await?;
        let (conn, resource) = self.target(&snapshot, ItemKind::Resource, uri)?;
        Self::cancellable(cancel, conn.read_resource(&resource)).await?
    }

    pub async fn subscribe_resource(&self, uri: &str) -> McpResult<()> {
        Err(McpError::NotSupported(format!(
            "resource subscriptions are not supported (uri: {})",
            uri
        )))
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> McpResult<()> {
        Err(McpError::NotSupported(format!(
            "resource subscriptions are not supported (uri: {})",
            uri
        )))
    }

    // ========================================================================
    // Status and health
    // ========================================================================

    pub fn status(&self) -> ServiceStatus {
        let refresh_count = self.refresh_count.load(Ordering::Acquire);
        match self.published_snapshot() {
            Ok(Some(snapshot)) => ServiceStatus {
                is_initialized: true,
                last_initialized_at: Some(snapshot.initialized_at),
                total_servers: snapshot.connections.len(),
                total_tools: snapshot.routing.tools.len(),
                total_prompts: snapshot.routing.prompts.len(),
                total_resources: snapshot.routing.resources.len(),
                server_names: snapshot.names.clone(),
                refresh_count,
            },
            _ => ServiceStatus {
                refresh_count,
                ..Default::default()
            },
        }
    }

    pub fn server_statuses(&self) -> Vec<ServerStatusInfo> {
        let Ok(Some(snapshot)) = self.published_snapshot() else {
            return Vec::new();
        };
        snapshot
            .connections
            .iter()
            .map(|conn| {
                let Implementation { name, version, .. } = conn.server_info().clone();
                ServerStatusInfo {
                    name: conn.name().to_string(),
                    is_connected: conn.is_connected(),
                    server_name: name,
                    server_version: version,
                    last_heartbeat: conn.last_heartbeat(),
                    capabilities: conn.capabilities().clone(),
                }
            })
            .collect()
    }

    /// Union of backend capabilities. Before the first build every family is
    /// advertised so clients still ask.
    pub fn aggregated_capabilities(&self) -> ServerCapabilities {
        let Ok(Some(snapshot)) = self.published_snapshot() else {
            return ServerCapabilities {
                tools: Some(ToolsCapability::default()),
                prompts: Some(PromptsCapability::default()),
                resources: Some(ResourcesCapability::default()),
                ..Default::default()
            };
        };
        let any = |f: fn(&ServerCapabilities) -> bool| {
            snapshot.connections.iter().any(|c| f(c.capabilities()))
        };
        ServerCapabilities {
            tools: any(|c| c.tools.is_some()).then(ToolsCapability::default),
            prompts: any(|c| c.prompts.is_some()).then(PromptsCapability::default),
            resources: any(|c| c.resources.is_some()).then(ResourcesCapability::default),
            ..Default::default()
        }
    }

    /// Probe every connected backend.
    pub async fn validate(&self, cancel: &CancellationToken) -> McpResult<HealthReport> {
        let snapshot = match self.ensure_ready(cancel).await {
            Ok(snapshot) => snapshot,
            Err(McpError::AggregateUnavailable(reason)) => {
                warn!("Health check found no usable servers: {}", reason);
                return Ok(HealthReport::from_servers(Default::default()));
            }
            Err(e) => return Err(e),
        };
        self.health.check(&snapshot.connections, cancel).await
    }

    /// Run [`validate`](Self::validate) periodically. With auto-reconnect on, an
    /// unhealthy result triggers a refresh that re-opens dropped backends.
    pub fn spawn_health_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let period = this.options.health_check_period();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if this.is_disposed() {
                    break;
                }

                let report = match this.validate(&cancel).await {
                    Ok(report) => report,
                    Err(McpError::Cancelled | McpError::Disposed) => break,
                    Err(e) => {
                        warn!("Background health check failed: {}", e);
                        continue;
                    }
                };
                if report.is_healthy {
                    continue;
                }

                let unhealthy: Vec<&str> =
                    report.unhealthy().map(|s| s.server_name.as_str()).collect();
                warn!(
                    "Unhealthy MCP servers: {:?} ({} healthy)",
                    unhealthy, report.healthy_servers
                );
                if this.options.auto_reconnect {
                    if let Err(e) = this.refresh(&cancel).await {
                        warn!("Refresh after failed health check did not succeed: {}", e);
                    }
                }
            }
            debug!("Health monitor stopped");
        })
    }

    /// Routing table as `(name, owner)` pairs per kind, for diagnostics.
    pub fn routes(&self) -> HashMap<&'static str, Vec<(String, String)>> {
        let Ok(Some(snapshot)) = self.published_snapshot() else {
            return HashMap::new();
        };
        [
            ("tools", ItemKind::Tool),
            ("prompts", ItemKind::Prompt),
            ("resources", ItemKind::Resource),
        ]
        .into_iter()
        .map(|(label, kind)| {
            let mut entries: Vec<(String, String)> = snapshot
                .routing
                .routes(kind)
                .iter()
                .map(|(item, server)| (item.to_string(), server.to_string()))
                .collect();
            entries.sort();
            (label, entries)
        })
        .collect()
    }
}
