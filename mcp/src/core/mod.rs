//! Core aggregation infrastructure.

pub mod aggregator;
pub mod auth;
pub mod client;
pub mod config;
pub mod discovery;
pub mod health;
pub mod provider;
pub mod reconnect;
pub mod routing;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use aggregator::{McpAggregator, ServerStatusInfo, ServiceStatus};
pub use auth::{create_auth_provider, AuthProvider, Credential, OAuth2ClientCredentials};
pub use client::{BackendClient, BackendConnector, RmcpBackendClient, TransportConnector};
pub use config::{
    AggregatorOptions, ApiKeyLocation, AuthConfig, BackendDescriptor, BackendTransport,
    ProxyConfig,
};
pub use discovery::{ConfigDiscovery, DiscoveryStrategy, FileDiscovery};
pub use health::{HealthChecker, HealthReport, ServerHealth};
pub use provider::{BackendConnection, ServerMetadata, ServerProvider};
pub use reconnect::ReconnectionManager;
pub use routing::{ItemKind, Resolver, Route, RoutingTable, PREFIX_SEPARATOR};
pub use transport::AuthorizedHttpClient;
