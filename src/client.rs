//! MCP Client - talks to one backend server through a shared process handle

use crate::logging;
use crate::process::{ProcessHandle, ProcessManager};
use crate::protocol::{
    ClientInfo, DEFAULT_PROTOCOL_VERSION, GetPromptParams, GetPromptResult, InitializeResult,
    McpServerConfig, PromptDef, PromptsListResult, ReadResourceParams, ReadResourceResult,
    ResourceDef, ResourcesListResult, ServerInfo, ToolCallParams, ToolCallResult, ToolDef,
    ToolsListResult,
};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;

/// How long the client waits on a backend. The handshake always has a
/// deadline; other requests only when one is configured.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub handshake: Duration,
    pub request: Option<Duration>,
}

impl Deadlines {
    pub fn handshake_only(handshake: Duration) -> Self {
        Self {
            handshake,
            request: None,
        }
    }
}

/// Client for a single backend server.
///
/// Several clients may share one process. The `initialize` handshake runs
/// once per process and its result is reused by every later client.
pub struct McpClient {
    name: String,
    handle: ProcessHandle,
    request_timeout: Option<Duration>,
    init: InitializeResult,
}

impl McpClient {
    /// Obtain (or share) the backend process and complete the handshake
    pub async fn connect(
        processes: &ProcessManager,
        name: &str,
        config: &McpServerConfig,
        deadlines: Deadlines,
    ) -> Result<Self> {
        let handle = processes
            .get_or_create(name, &config.command, &config.args, &config.env)
            .await?;
        Self::attach(name, handle, deadlines).await
    }

    /// Wrap an existing handle. The handle is released if the handshake fails.
    pub async fn attach(name: &str, handle: ProcessHandle, deadlines: Deadlines) -> Result<Self> {
        match initialize(&handle, deadlines.handshake).await {
            Ok(init) => {
                logging::info(&format!(
                    "Backend '{}' ready (pid {}, server {})",
                    name,
                    handle.pid(),
                    init.server_info
                        .as_ref()
                        .map(|s| format!("{} {}", s.name, s.version))
                        .unwrap_or_else(|| "unknown".to_string())
                ));
                Ok(Self {
                    name: name.to_string(),
                    handle,
                    request_timeout: deadlines.request,
                    init,
                })
            }
            Err(e) => {
                handle.dispose().await;
                Err(e.context(format!("Handshake with backend '{}' failed", name)))
            }
        }
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<T> {
        let value = self.handle.request(method, params, self.request_timeout).await?;
        serde_json::from_value(value)
            .with_context(|| format!("Malformed '{}' result from backend '{}'", method, self.name))
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDef>> {
        let result: ToolsListResult = self.request("tools/list", None).await?;
        Ok(result.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments,
        };
        self.request("tools/call", Some(serde_json::to_value(params)?))
            .await
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDef>> {
        let result: ResourcesListResult = self.request("resources/list", None).await?;
        Ok(result.resources)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        self.request("resources/read", Some(serde_json::to_value(params)?))
            .await
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptDef>> {
        let result: PromptsListResult = self.request("prompts/list", None).await?;
        Ok(result.prompts)
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<GetPromptResult> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.request("prompts/get", Some(serde_json::to_value(params)?))
            .await
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.init.server_info.as_ref()
    }

    /// Whether the backend advertised `capability` (`tools`, `resources`, ...)
    pub fn supports(&self, capability: &str) -> bool {
        self.init.capabilities.get(capability).is_some()
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub async fn is_alive(&self) -> bool {
        self.handle.is_alive().await
    }

    /// Release this client's reference to the process
    pub async fn shutdown(&self) {
        self.handle.dispose().await;
    }
}

async fn initialize(handle: &ProcessHandle, timeout: Duration) -> Result<InitializeResult> {
    let channel = handle.channel();
    let init = channel
        .handshake()
        .get_or_try_init(|| async {
            let params = json!({
                "protocolVersion": DEFAULT_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": ClientInfo {
                    name: "mcphub".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            });
            let value = channel.request("initialize", Some(params), Some(timeout)).await?;
            let init: InitializeResult =
                serde_json::from_value(value).context("Malformed initialize result")?;
            channel.notify("notifications/initialized", None).await?;
            Ok::<_, anyhow::Error>(init)
        })
        .await?;
    Ok(init.clone())
}
