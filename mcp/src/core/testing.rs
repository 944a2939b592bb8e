//! In-memory backends for exercising the provider and aggregator.

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rmcp::model::{
    Annotated, CallToolResult, ClientInfo, Content, GetPromptResult, Implementation, JsonObject,
    Prompt, PromptsCapability, RawResource, ReadResourceResult, Resource, ResourceContents,
    ResourcesCapability, ServerCapabilities, Tool, ToolsCapability,
};
use serde_json::Map;

use super::{
    client::{BackendClient, BackendConnector},
    config::BackendDescriptor,
};
use crate::error::{McpError, McpResult};

pub fn tool(name: &str) -> Tool {
    Tool {
        name: Cow::Owned(name.to_string()),
        title: None,
        description: Some(Cow::Owned(format!("Test tool: {}", name))),
        input_schema: Arc::new(Map::new()),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

pub fn prompt(name: &str) -> Prompt {
    Prompt {
        name: name.to_string(),
        title: None,
        description: Some(format!("Test prompt: {}", name)),
        arguments: None,
        icons: None,
    }
}

pub fn resource(uri: &str) -> Resource {
    Annotated::new(
        RawResource {
            uri: uri.to_string(),
            name: uri.to_string(),
            title: None,
            description: None,
            mime_type: Some("text/plain".to_string()),
            size: None,
            icons: None,
        },
        None,
    )
}

/// First text block of a tool result.
pub fn text_of(result: &CallToolResult) -> String {
    result
        .content
        .first()
        .and_then(|c| c.as_text())
        .map(|t| t.text.clone())
        .unwrap_or_default()
}

struct FakeState {
    name: String,
    tools: RwLock<Vec<Tool>>,
    prompts: RwLock<Vec<Prompt>>,
    resources: RwLock<Vec<Resource>>,
    failing: AtomicBool,
    fail_close: bool,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

/// Scripted backend. Clones share state, so a test can keep a handle after
/// passing one to a [`FakeConnector`].
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<FakeState>,
}

impl FakeBackend {
    pub fn new(name: &str) -> Self {
        Self {
            state: Arc::new(FakeState {
                name: name.to_string(),
                tools: RwLock::new(Vec::new()),
                prompts: RwLock::new(Vec::new()),
                resources: RwLock::new(Vec::new()),
                failing: AtomicBool::new(false),
                fail_close: false,
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
            }),
        }
    }

    fn rebuild(self, f: impl FnOnce(&mut FakeState)) -> Self {
        let mut state = Arc::try_unwrap(self.state).unwrap_or_else(|_| {
            panic!("configure FakeBackend before sharing it");
        });
        f(&mut state);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn with_tools(self, names: &[&str]) -> Self {
        *self.state.tools.write() = names.iter().map(|n| tool(n)).collect();
        self
    }

    pub fn with_prompts(self, names: &[&str]) -> Self {
        *self.state.prompts.write() = names.iter().map(|n| prompt(n)).collect();
        self
    }

    pub fn with_resources(self, uris: &[&str]) -> Self {
        *self.state.resources.write() = uris.iter().map(|u| resource(u)).collect();
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.rebuild(|s| s.delay = delay)
    }

    pub fn failing_close(self) -> Self {
        self.rebuild(|s| s.fail_close = true)
    }

    /// Make every list/call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    async fn gate(&self, action: &str) -> McpResult<()> {
        if !self.state.delay.is_zero() {
            tokio::time::sleep(self.state.delay).await;
        }
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(McpError::Transport(format!(
                "{} on '{}': connection closed",
                action, self.state.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    fn server_info(&self) -> Implementation {
        Implementation {
            name: format!("{}-server", self.state.name),
            version: "1.0.0".to_string(),
            ..Default::default()
        }
    }

    fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(ToolsCapability::default()),
            prompts: (!self.state.prompts.read().is_empty()).then(PromptsCapability::default),
            resources: (!self.state.resources.read().is_empty())
                .then(ResourcesCapability::default),
            ..Default::default()
        }
    }

    async fn list_tools(&self) -> McpResult<Vec<Tool>> {
        self.gate("list tools").await?;
        Ok(self.state.tools.read().clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        _arguments: Option<JsonObject>,
    ) -> McpResult<CallToolResult> {
        self.gate("call tool").await?;
        self.state.calls.lock().push(format!("tool:{}", name));
        if !self.state.tools.read().iter().any(|t| t.name == name) {
            return Err(McpError::Transport(format!("unknown tool '{}'", name)));
        }
        Ok(CallToolResult::success(vec![Content::text(format!(
            "{}:{}",
            self.state.name, name
        ))]))
    }

    async fn list_prompts(&self) -> McpResult<Vec<Prompt>> {
        self.gate("list prompts").await?;
        Ok(self.state.prompts.read().clone())
    }

    async fn get_prompt(
        &self,
        name: &str,
        _arguments: Option<JsonObject>,
    ) -> McpResult<GetPromptResult> {
        self.gate("get prompt").await?;
        self.state.calls.lock().push(format!("prompt:{}", name));
        Ok(GetPromptResult {
            description: Some(format!("{}:{}", self.state.name, name)),
            messages: Vec::new(),
        })
    }

    async fn list_resources(&self) -> McpResult<Vec<Resource>> {
        self.gate("list resources").await?;
        Ok(self.state.resources.read().clone())
    }

    async fn read_resource(&self, uri: &str) -> McpResult<ReadResourceResult> {
        self.gate("read resource").await?;
        self.state.calls.lock().push(format!("resource:{}", uri));
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(self.state.name.clone(), uri)],
        })
    }

    async fn close(&self) -> McpResult<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_close {
            return Err(McpError::Transport("close failed".to_string()));
        }
        Ok(())
    }
}

/// Hands out [`FakeBackend`]s by descriptor name; unknown names fail to connect
/// the way a process that exits immediately would.
#[derive(Default)]
pub struct FakeConnector {
    backends: HashMap<String, FakeBackend>,
    connects: DashMap<String, usize>,
    client_names: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: FakeBackend) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    pub fn connect_count(&self, name: &str) -> usize {
        self.connects.get(name).map(|c| *c).unwrap_or(0)
    }

    pub fn client_names(&self) -> Vec<String> {
        self.client_names.lock().clone()
    }
}

#[async_trait]
impl BackendConnector for FakeConnector {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
        client_info: &ClientInfo,
    ) -> McpResult<Arc<dyn BackendClient>> {
        *self.connects.entry(descriptor.name.clone()).or_insert(0) += 1;
        self.client_names
            .lock()
            .push(client_info.client_info.name.clone());

        match self.backends.get(&descriptor.name) {
            Some(backend) => Ok(Arc::new(backend.clone())),
            None => Err(McpError::ConnectionFailed(format!(
                "initialize stdio client: process for '{}' exited",
                descriptor.name
            ))),
        }
    }
}
