//! Model Context Protocol (MCP) aggregation proxy.
//!
//! Presents many backend MCP servers as a single server.
//!
//! ## Modules
//!
//! - [`core`]: discovery, connections, routing and health checking
//! - [`handler`]: RMCP `ServerHandler` exposing the aggregate
//! - [`error`]: error taxonomy shared by all layers

pub mod core;
pub mod error;
pub mod handler;

pub use core::{
    AggregatorOptions, AuthConfig, BackendDescriptor, BackendTransport, ConfigDiscovery,
    DiscoveryStrategy, FileDiscovery, HealthReport, McpAggregator, ProxyConfig,
    ServerStatusInfo, ServiceStatus, TransportConnector,
};
pub use error::{McpError, McpResult};
pub use handler::AggregatorHandler;
