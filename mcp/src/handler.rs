//! Serves an [`McpAggregator`] as an MCP server.
//!
//! Implements RMCP's `ServerHandler` so any RMCP transport (stdio, streamable
//! HTTP) can expose the aggregate to downstream clients. List requests may
//! carry a `serverFilter` entry in `_meta` to query a single backend.

use std::sync::Arc;

use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, ErrorCode, GetPromptRequestParam, GetPromptResult,
        Implementation, ListPromptsResult, ListResourcesResult, ListToolsResult, Meta,
        PaginatedRequestParam, ReadResourceRequestParam, ReadResourceResult, ServerInfo,
        SubscribeRequestParam, UnsubscribeRequestParam,
    },
    service::RequestContext,
    ErrorData, RoleServer, ServerHandler,
};
use tracing::debug;

use crate::{core::McpAggregator, error::McpError};

/// `_meta` key naming the backend a list request is restricted to.
pub const SERVER_FILTER_META_KEY: &str = "serverFilter";

#[derive(Clone)]
pub struct AggregatorHandler {
    aggregator: Arc<McpAggregator>,
    server_info: Implementation,
}

impl AggregatorHandler {
    pub fn new(aggregator: Arc<McpAggregator>) -> Self {
        Self {
            aggregator,
            server_info: Implementation {
                name: "mcp-proxy".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
        }
    }

    #[must_use]
    pub fn with_server_info(mut self, server_info: Implementation) -> Self {
        self.server_info = server_info;
        self
    }

    pub fn aggregator(&self) -> &Arc<McpAggregator> {
        &self.aggregator
    }
}

fn server_filter(meta: &Meta) -> Option<&str> {
    meta.get(SERVER_FILTER_META_KEY)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|f| !f.is_empty())
}

/// Map an aggregate error onto a JSON-RPC error.
pub fn to_error_data(err: McpError) -> ErrorData {
    let message = err.to_string();
    match err {
        McpError::AmbiguousName { .. } | McpError::ServerNotFound(_) => {
            ErrorData::invalid_params(message, None)
        }
        McpError::ToolNotFound(_) | McpError::PromptNotFound(_) | McpError::ResourceNotFound(_) => {
            ErrorData::resource_not_found(message, None)
        }
        McpError::NotSupported(_) => ErrorData::new(ErrorCode::METHOD_NOT_FOUND, message, None),
        _ => ErrorData::internal_error(message, None),
    }
}

impl ServerHandler for AggregatorHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: self.aggregator.aggregated_capabilities(),
            server_info: self.server_info.clone(),
            instructions: Some(
                "Aggregates several MCP servers. Names are prefixed with '<server>:' \
                 when more than one server is connected."
                    .to_string(),
            ),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        let tools = self
            .aggregator
            .list_tools(server_filter(&context.meta), &context.ct)
            .await
            .map_err(to_error_data)?;
        debug!("Listing {} aggregated tools", tools.len());
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        self.aggregator
            .call_tool(&request.name, request.arguments, &context.ct)
            .await
            .map_err(to_error_data)
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, ErrorData> {
        let prompts = self
            .aggregator
            .list_prompts(server_filter(&context.meta), &context.ct)
            .await
            .map_err(to_error_data)?;
        Ok(ListPromptsResult::with_all_items(prompts))
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, ErrorData> {
        self.aggregator
            .get_prompt(&request.name, request.arguments, &context.ct)
            .await
            .map_err(to_error_data)
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, ErrorData> {
        let resources = self
            .aggregator
            .list_resources(server_filter(&context.meta), &context.ct)
            .await
            .map_err(to_error_data)?;
        Ok(ListResourcesResult::with_all_items(resources))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, ErrorData> {
        self.aggregator
            .read_resource(&request.uri, &context.ct)
            .await
            .map_err(to_error_data)
    }

    async fn subscribe(
        &self,
        request: SubscribeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), ErrorData> {
        self.aggregator
            .subscribe_resource(&request.uri)
            .await
            .map_err(to_error_data)
    }

    async fn unsubscribe(
        &self,
        request: UnsubscribeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), ErrorData> {
        self.aggregator
            .unsubscribe_resource(&request.uri)
            .await
            .map_err(to_error_data)
    }
}

#[cfg(test)]
mod tests {
    use rmcp::{
        model::{CallToolRequestParam, ClientInfo, ReadResourceRequestParam},
        service::ServiceError,
        ServiceExt,
    };
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::core::{
        config::{AggregatorOptions, BackendDescriptor},
        discovery::ConfigDiscovery,
        testing::{text_of, FakeBackend, FakeConnector},
    };

    fn handler() -> AggregatorHandler {
        let connector = FakeConnector::new()
            .with_backend(
                FakeBackend::new("serverA")
                    .with_tools(&["echo", "alpha"])
                    .with_resources(&["file:///a.txt"]),
            )
            .with_backend(FakeBackend::new("serverB").with_tools(&["echo"]));
        let discovery = ConfigDiscovery::new(vec![
            BackendDescriptor::stdio("serverA", "true"),
            BackendDescriptor::stdio("serverB", "true"),
        ]);
        let aggregator = McpAggregator::new(
            Arc::new(discovery),
            Arc::new(connector),
            AggregatorOptions::default(),
        );
        AggregatorHandler::new(Arc::new(aggregator))
    }

    #[test]
    fn test_server_filter_from_meta() {
        let mut meta = Meta::new();
        assert_eq!(server_filter(&meta), None);

        meta.insert(SERVER_FILTER_META_KEY.to_string(), json!(" serverA "));
        assert_eq!(server_filter(&meta), Some("serverA"));

        meta.insert(SERVER_FILTER_META_KEY.to_string(), json!(""));
        assert_eq!(server_filter(&meta), None);

        meta.insert(SERVER_FILTER_META_KEY.to_string(), json!(42));
        assert_eq!(server_filter(&meta), None);
    }

    #[test]
    fn test_error_mapping() {
        let ambiguous = McpError::AmbiguousName {
            name: "echo".into(),
            servers: vec!["a".into(), "b".into()],
        };
        assert_eq!(to_error_data(ambiguous).code, ErrorCode::INVALID_PARAMS);
        assert_eq!(
            to_error_data(McpError::ServerNotFound("x".into())).code,
            ErrorCode::INVALID_PARAMS
        );
        assert_eq!(
            to_error_data(McpError::PromptNotFound("p".into())).code,
            ErrorCode::RESOURCE_NOT_FOUND
        );
        assert_eq!(
            to_error_data(McpError::NotSupported("subscribe".into())).code,
            ErrorCode::METHOD_NOT_FOUND
        );
        assert_eq!(
            to_error_data(McpError::Transport("eof".into())).code,
            ErrorCode::INTERNAL_ERROR
        );
    }

    #[tokio::test]
    async fn test_get_info_advertises_capabilities() {
        let handler = handler();
        let info = handler.get_info();
        assert_eq!(info.server_info.name, "mcp-proxy");
        assert!(info.capabilities.tools.is_some());

        handler
            .aggregator()
            .initialize(&CancellationToken::new())
            .await
            .unwrap();
        let info = handler.get_info();
        assert!(info.capabilities.tools.is_some());
        assert!(info.capabilities.resources.is_some());
        assert!(info.capabilities.prompts.is_none());
    }

    #[tokio::test]
    async fn test_serves_aggregate_over_rmcp() {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let handler = handler();
        let aggregator = Arc::clone(handler.aggregator());
        let server = tokio::spawn(async move {
            let running = handler.serve(server_io).await?;
            running.waiting().await?;
            anyhow::Ok(())
        });

        let client = ClientInfo::default().serve(client_io).await.unwrap();

        let names: Vec<String> = client
            .list_all_tools()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name.to_string())
            .collect();
        assert_eq!(
            names,
            vec!["serverA:echo", "serverA:alpha", "serverB:echo"]
        );

        let result = client
            .call_tool(CallToolRequestParam {
                name: "serverB:echo".into(),
                arguments: None,
            })
            .await
            .unwrap();
        assert_eq!(text_of(&result), "serverB:echo");

        let err = client
            .call_tool(CallToolRequestParam {
                name: "echo".into(),
                arguments: None,
            })
            .await
            .unwrap_err();
        match err {
            ServiceError::McpError(data) => assert_eq!(data.code, ErrorCode::INVALID_PARAMS),
            other => panic!("unexpected error: {:?}", other),
        }

        let read = client
            .read_resource(ReadResourceRequestParam {
                uri: "serverA:file:///a.txt".into(),
            })
            .await
            .unwrap();
        assert_eq!(read.contents.len(), 1);

        client.cancel().await.unwrap();
        let _ = server.await;
        aggregator.shutdown().await;
    }
}
