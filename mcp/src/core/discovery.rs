//! Sources of backend descriptors.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::config::{BackendDescriptor, ProxyConfig};
use crate::error::{McpError, McpResult};

/// Produces the set of enabled backends to aggregate.
#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    /// Enabled descriptors, in configuration order. Entries with
    /// `enabled: false` are left out; unset counts as enabled.
    async fn discover(&self, cancel: &CancellationToken) -> McpResult<Vec<BackendDescriptor>>;

    /// Whether this source can push updates instead of being polled.
    fn supports_change_notification(&self) -> bool {
        false
    }
}

fn enabled_only(servers: impl IntoIterator<Item = BackendDescriptor>) -> Vec<BackendDescriptor> {
    servers
        .into_iter()
        .filter(|server| {
            if !server.is_enabled() {
                debug!("Skipping disabled server '{}'", server.name);
            }
            server.is_enabled()
        })
        .collect()
}

/// Serves the servers of an in-memory configuration.
pub struct ConfigDiscovery {
    servers: Vec<BackendDescriptor>,
}

impl ConfigDiscovery {
    pub fn new(servers: Vec<BackendDescriptor>) -> Self {
        Self { servers }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.servers.clone())
    }
}

#[async_trait]
impl DiscoveryStrategy for ConfigDiscovery {
    async fn discover(&self, cancel: &CancellationToken) -> McpResult<Vec<BackendDescriptor>> {
        if cancel.is_cancelled() {
            return Err(McpError::Cancelled);
        }
        Ok(enabled_only(self.servers.iter().cloned()))
    }
}

/// Re-reads a configuration file on every call, so a refresh picks up edits.
pub struct FileDiscovery {
    path: PathBuf,
}

impl FileDiscovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DiscoveryStrategy for FileDiscovery {
    async fn discover(&self, cancel: &CancellationToken) -> McpResult<Vec<BackendDescriptor>> {
        let config = tokio::select! {
            _ = cancel.cancelled() => return Err(McpError::Cancelled),
            config = ProxyConfig::from_file(&self.path) => config?,
        };
        Ok(enabled_only(config.servers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_enabled(name: &str, enabled: Option<bool>) -> BackendDescriptor {
        let mut server = BackendDescriptor::stdio(name, "true");
        server.enabled = enabled;
        server
    }

    #[tokio::test]
    async fn test_config_discovery_filters_disabled() {
        let discovery = ConfigDiscovery::new(vec![
            with_enabled("explicit", Some(true)),
            with_enabled("off", Some(false)),
            with_enabled("unset", None),
        ]);

        let names: Vec<String> = discovery
            .discover(&CancellationToken::new())
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["explicit", "unset"]);
        assert!(!discovery.supports_change_notification());
    }

    #[tokio::test]
    async fn test_config_discovery_honours_cancellation() {
        let discovery = ConfigDiscovery::new(vec![with_enabled("fs", None)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            discovery.discover(&cancel).await,
            Err(McpError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_file_discovery_rereads_file() {
        let path = std::env::temp_dir().join(format!(
            "mcp-proxy-discovery-{}.yaml",
            std::process::id()
        ));
        tokio::fs::write(
            &path,
            "servers:\n  - name: fs\n    protocol: stdio\n    command: \"true\"\n",
        )
        .await
        .unwrap();

        let discovery = FileDiscovery::new(&path);
        let first = discovery.discover(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::fs::write(
            &path,
            concat!(
                "servers:\n",
                "  - name: fs\n    protocol: stdio\n    command: \"true\"\n",
                "  - name: git\n    protocol: stdio\n    command: \"true\"\n",
                "  - name: off\n    protocol: stdio\n    command: \"true\"\n    enabled: false\n",
            ),
        )
        .await
        .unwrap();
        let second = discovery.discover(&CancellationToken::new()).await.unwrap();
        let names: Vec<&str> = second.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["fs", "git"]);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_file_discovery_missing_file() {
        let discovery = FileDiscovery::new("/nonexistent/mcp-proxy.yaml");
        assert!(matches!(
            discovery.discover(&CancellationToken::new()).await,
            Err(McpError::Config(_))
        ));
    }
}
