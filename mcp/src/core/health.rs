//! Connectivity probes for backend connections.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::provider::BackendConnection;
use crate::error::{McpError, McpResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerHealth {
    pub server_name: String,
    pub is_connected: bool,
    pub error_message: Option<String>,
    pub last_check_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// At least one server, and none unhealthy
    pub is_healthy: bool,
    pub healthy_servers: usize,
    pub unhealthy_servers: usize,
    pub checked_at: DateTime<Utc>,
    pub servers: BTreeMap<String, ServerHealth>,
}

impl HealthReport {
    pub fn from_servers(servers: BTreeMap<String, ServerHealth>) -> Self {
        let healthy_servers = servers.values().filter(|s| s.is_connected).count();
        let unhealthy_servers = servers.len() - healthy_servers;
        Self {
            is_healthy: unhealthy_servers == 0 && healthy_servers > 0,
            healthy_servers,
            unhealthy_servers,
            checked_at: Utc::now(),
            servers,
        }
    }

    pub fn unhealthy(&self) -> impl Iterator<Item = &ServerHealth> {
        self.servers.values().filter(|s| !s.is_connected)
    }
}

/// Lists tools on every connection as a liveness probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct HealthChecker;

impl HealthChecker {
    pub fn new() -> Self {
        Self
    }

    /// Probe all connections concurrently. A failing probe marks that
    /// connection disconnected; it never aborts the report.
    pub async fn check(
        &self,
        connections: &[Arc<BackendConnection>],
        cancel: &CancellationToken,
    ) -> McpResult<HealthReport> {
        let probes = join_all(connections.iter().map(|conn| Self::probe(conn)));
        let results = tokio::select! {
            _ = cancel.cancelled() => return Err(McpError::Cancelled),
            results = probes => results,
        };

        let servers = results
            .into_iter()
            .map(|health| (health.server_name.clone(), health))
            .collect();
        let report = HealthReport::from_servers(servers);
        debug!(
            healthy = report.healthy_servers,
            unhealthy = report.unhealthy_servers,
            "Health check complete"
        );
        Ok(report)
    }

    async fn probe(conn: &BackendConnection) -> ServerHealth {
        let result = conn.list_tools().await;
        let now = Utc::now();
        match result {
            Ok(_) => {
                conn.mark_healthy(now);
                ServerHealth {
                    server_name: conn.name().to_string(),
                    is_connected: true,
                    error_message: None,
                    last_check_time: now,
                }
            }
            Err(e) => {
                warn!(server = %conn.name(), error = %e, "Health probe failed");
                conn.mark_unhealthy();
                ServerHealth {
                    server_name: conn.name().to_string(),
                    is_connected: false,
                    error_message: Some(e.to_string()),
                    last_check_time: now,
                }
            }
        }
    }
}
