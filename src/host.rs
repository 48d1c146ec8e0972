//! Tool host - the application-facing entry point for backend tools.
//!
//! Owns the connected backends of one hub instance, the shared process pool
//! and the name bridge. Everything a UI or chat layer needs goes through
//! here: tool listings, status snapshots, function definitions and calls.

use crate::bridge::{FunctionDefinition, FunctionNameBridge, ToolWithServer, split_protocol_id};
use crate::client::{Deadlines, McpClient};
use crate::config::{BackendConfig, Config};
use crate::logging;
use crate::process::{ProcessManager, ProcessStats};
use crate::protocol::{
    GetPromptResult, McpServerConfig, PromptDef, ReadResourceResult, ResourceDef, ToolCallResult,
    ToolDef,
};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

struct Backend {
    client: Arc<McpClient>,
    tools: Vec<ToolDef>,
    resources: Vec<ResourceDef>,
    prompts: Vec<PromptDef>,
}

enum BackendState {
    Connected(Backend),
    Disconnected,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// Status snapshot of one backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub status: ConnectionStatus,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A resource or prompt together with the backend that provides it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Owned<T> {
    pub server_name: String,
    #[serde(flatten)]
    pub item: T,
}

pub struct ToolHost {
    processes: ProcessManager,
    bridge: Arc<FunctionNameBridge>,
    backends: RwLock<BTreeMap<String, BackendState>>,
    deadlines: Deadlines,
}

impl ToolHost {
    pub fn new(
        processes: ProcessManager,
        bridge: Arc<FunctionNameBridge>,
        deadlines: Deadlines,
    ) -> Self {
        Self {
            processes,
            bridge,
            backends: RwLock::new(BTreeMap::new()),
            deadlines,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            ProcessManager::new(),
            Arc::new(FunctionNameBridge::new()),
            config.backend.deadlines(),
        )
    }

    pub fn bridge(&self) -> &Arc<FunctionNameBridge> {
        &self.bridge
    }

    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    /// Connect one backend, replacing any previous connection of that name
    pub async fn connect(&self, name: &str, config: &McpServerConfig) -> Result<()> {
        self.release(name).await;

        match self.open(name, config).await {
            Ok(backend) => {
                logging::info(&format!(
                    "Connected backend '{}' ({} tools, {} resources, {} prompts)",
                    name,
                    backend.tools.len(),
                    backend.resources.len(),
                    backend.prompts.len()
                ));
                self.backends
                    .write()
                    .await
                    .insert(name.to_string(), BackendState::Connected(backend));
                Ok(())
            }
            Err(e) => {
                let message = format!("{:#}", e);
                logging::error(&format!("Failed to connect backend '{}': {}", name, message));
                self.backends
                    .write()
                    .await
                    .insert(name.to_string(), BackendState::Failed(message));
                Err(e)
            }
        }
    }

    async fn open(&self, name: &str, config: &McpServerConfig) -> Result<Backend> {
        let client = McpClient::connect(&self.processes, name, config, self.deadlines)
            .await
            .with_context(|| format!("Failed to connect to MCP server '{}'", name))?;

        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                client.shutdown().await;
                return Err(e.context(format!("Failed to list tools of '{}'", name)));
            }
        };

        // Optional capabilities only count when advertised and answered
        let resources = if client.supports("resources") {
            client.list_resources().await.unwrap_or_else(|e| {
                logging::warn(&format!("Backend '{}' resources/list failed: {:#}", name, e));
                Vec::new()
            })
        } else {
            Vec::new()
        };
        let prompts = if client.supports("prompts") {
            client.list_prompts().await.unwrap_or_else(|e| {
                logging::warn(&format!("Backend '{}' prompts/list failed: {:#}", name, e));
                Vec::new()
            })
        } else {
            Vec::new()
        };

        Ok(Backend {
            client: Arc::new(client),
            tools,
            resources,
            prompts,
        })
    }

    /// Connect every configured backend concurrently.
    /// Returns the number of successes and `(name, error)` for each failure.
    pub async fn connect_all(&self, config: &BackendConfig) -> (usize, Vec<(String, String)>) {
        let attempts = config.servers.iter().map(|(name, server)| async move {
            let result = self.connect(name, server).await;
            (name.clone(), result)
        });

        let mut successes = 0;
        let mut failures = Vec::new();
        for (name, result) in futures::future::join_all(attempts).await {
            match result {
                Ok(()) => successes += 1,
                Err(e) => failures.push((name, format!("{:#}", e))),
            }
        }
        (successes, failures)
    }

    /// Take a connected backend out of service, leaving a `Disconnected` marker
    async fn release(&self, name: &str) -> bool {
        let previous = {
            let mut backends = self.backends.write().await;
            if matches!(backends.get(name), Some(BackendState::Connected(_))) {
                backends.insert(name.to_string(), BackendState::Disconnected)
            } else {
                None
            }
        };
        match previous {
            Some(BackendState::Connected(backend)) => {
                backend.client.shutdown().await;
                true
            }
            _ => false,
        }
    }

    /// Disconnect one backend. Returns false if it was not connected.
    pub async fn disconnect(&self, name: &str) -> bool {
        let released = self.release(name).await;
        if released {
            logging::info(&format!("Disconnected backend '{}'", name));
        }
        released
    }

    /// Disconnect every backend and forget the bridge's name registry
    pub async fn disconnect_all(&self) {
        let connected: Vec<Backend> = {
            let mut backends = self.backends.write().await;
            let names: Vec<String> = backends
                .iter()
                .filter(|(_, state)| matches!(state, BackendState::Connected(_)))
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| match backends.insert(name, BackendState::Disconnected) {
                    Some(BackendState::Connected(backend)) => Some(backend),
                    _ => None,
                })
                .collect()
        };

        for backend in &connected {
            backend.client.shutdown().await;
        }
        self.bridge.clear_registry();
    }

    /// Disconnect everything and kill any process still in the pool
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        self.processes.shutdown_all().await;
    }

    pub async fn is_connected(&self, name: &str) -> bool {
        matches!(
            self.backends.read().await.get(name),
            Some(BackendState::Connected(_))
        )
    }

    /// Flattened tool listing across connected backends, by server name
    pub async fn all_tools(&self) -> Vec<ToolWithServer> {
        let backends = self.backends.read().await;
        let mut tools = Vec::new();
        for (name, state) in backends.iter() {
            if let BackendState::Connected(backend) = state {
                tools.extend(backend.tools.iter().map(|tool| ToolWithServer {
                    tool: tool.clone(),
                    server_name: name.clone(),
                }));
            }
        }
        tools
    }

    pub async fn all_resources(&self) -> Vec<Owned<ResourceDef>> {
        let backends = self.backends.read().await;
        let mut resources = Vec::new();
        for (name, state) in backends.iter() {
            if let BackendState::Connected(backend) = state {
                resources.extend(backend.resources.iter().map(|item| Owned {
                    server_name: name.clone(),
                    item: item.clone(),
                }));
            }
        }
        resources
    }

    pub async fn all_prompts(&self) -> Vec<Owned<PromptDef>> {
        let backends = self.backends.read().await;
        let mut prompts = Vec::new();
        for (name, state) in backends.iter() {
            if let BackendState::Connected(backend) = state {
                prompts.extend(backend.prompts.iter().map(|item| Owned {
                    server_name: name.clone(),
                    item: item.clone(),
                }));
            }
        }
        prompts
    }

    /// One status entry per backend this host has seen
    pub async fn server_status(&self) -> Vec<ServerStatus> {
        let snapshot: Vec<(ServerStatus, Option<Arc<McpClient>>)> = {
            let backends = self.backends.read().await;
            backends
                .iter()
                .map(|(name, state)| match state {
                    BackendState::Connected(backend) => (
                        ServerStatus {
                            name: name.clone(),
                            status: ConnectionStatus::Connected,
                            tool_count: backend.tools.len(),
                            resource_count: backend.resources.len(),
                            prompt_count: backend.prompts.len(),
                            error: None,
                        },
                        Some(Arc::clone(&backend.client)),
                    ),
                    BackendState::Disconnected => (
                        ServerStatus {
                            name: name.clone(),
                            status: ConnectionStatus::Disconnected,
                            tool_count: 0,
                            resource_count: 0,
                            prompt_count: 0,
                            error: None,
                        },
                        None,
                    ),
                    BackendState::Failed(message) => (
                        ServerStatus {
                            name: name.clone(),
                            status: ConnectionStatus::Error,
                            tool_count: 0,
                            resource_count: 0,
                            prompt_count: 0,
                            error: Some(message.clone()),
                        },
                        None,
                    ),
                })
                .collect()
        };

        let mut statuses = Vec::with_capacity(snapshot.len());
        for (mut status, client) in snapshot {
            if let Some(client) = client {
                if !client.is_alive().await {
                    status.status = ConnectionStatus::Disconnected;
                }
            }
            statuses.push(status);
        }
        statuses
    }

    /// Function-calling definitions for every connected tool. Also refreshes
    /// the bridge registry so the generated names resolve back exactly.
    pub async fn function_definitions(&self) -> Vec<FunctionDefinition> {
        let tools = self.all_tools().await;
        self.bridge.convert_tools_to_functions(&tools)
    }

    /// Invoke `tool` on `server`. The call is tracked as pending until it
    /// returns, whatever the outcome.
    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> Result<ToolCallResult> {
        let call_id = self.bridge.new_call_id();
        self.bridge.register(
            &call_id,
            &format!("{}:{}", server, tool),
            server,
            arguments.clone(),
        );

        let result = self.dispatch(server, tool, arguments).await;
        self.bridge.complete(&call_id);

        if let Err(e) = &result {
            logging::warn(&format!("Tool call {}:{} failed: {:#}", server, tool, e));
        }
        result
    }

    /// Client of a connected backend. The registry lock is released before
    /// the caller talks to the backend.
    async fn client(&self, server: &str) -> Result<Arc<McpClient>> {
        match self.backends.read().await.get(server) {
            Some(BackendState::Connected(backend)) => Ok(Arc::clone(&backend.client)),
            _ => anyhow::bail!("MCP server '{}' not connected", server),
        }
    }

    async fn dispatch(&self, server: &str, tool: &str, arguments: Value) -> Result<ToolCallResult> {
        self.client(server).await?.call_tool(tool, arguments).await
    }

    /// Invoke a tool by its function-calling name
    pub async fn call_function(&self, api_name: &str, arguments: Value) -> Result<ToolCallResult> {
        let protocol_id = self.bridge.from_api_name(api_name);
        let (server, tool) = split_protocol_id(&protocol_id)
            .with_context(|| format!("'{}' does not name a backend tool", api_name))?;
        self.call_tool(server, tool, arguments).await
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<ReadResourceResult> {
        self.client(server).await?.read_resource(uri).await
    }

    pub async fn get_prompt(
        &self,
        server: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<GetPromptResult> {
        self.client(server).await?.get_prompt(name, arguments).await
    }

    /// Periodically drop stale pending calls and evict exited processes
    pub fn spawn_sweeper(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let bridge = Arc::clone(&self.bridge);
        let processes = self.processes.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                bridge.sweep(max_age);
                processes.prune_dead().await;
            }
        })
    }

    pub async fn process_stats(&self) -> ProcessStats {
        self.processes.stats().await
    }
}
