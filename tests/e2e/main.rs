//! End-to-end tests for mcphub
//!
//! The protocol server runs over an in-memory duplex stream, so these tests
//! exercise framing, dispatch and sessions exactly as a stdio agent would.
//! Backend tests (unix only) spawn a scripted MCP server through `sh`.

#[cfg(unix)]
mod fake_backend;

use async_trait::async_trait;
use mcphub::config::ServerConfig;
use mcphub::protocol::{ErrorCode, HandlerResult, RpcError, ToolCallResult, ToolDef};
use mcphub::server::{Capabilities, ProtocolServer, RequestContext};
use mcphub::transport::LineTransport;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

/// Client end of one connection to a server under test
struct Wire {
    writer: WriteHalf<DuplexStream>,
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Wire {
    fn open(server: &ProtocolServer) -> Self {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        let server = server.clone();
        let task = tokio::spawn(async move {
            server
                .serve(LineTransport::new(BufReader::new(server_read), server_write))
                .await
        });
        let (client_read, client_write) = tokio::io::split(client);
        Self {
            writer: client_write,
            lines: BufReader::new(client_read).lines(),
            task,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(10), self.lines.next_line())
            .await
            .expect("response timed out")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn request(&mut self, id: i64, method: &str, params: Value) -> Value {
        self.send_raw(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}).to_string())
            .await;
        let response = self.recv().await;
        assert_eq!(response["id"], json!(id));
        response
    }

    async fn initialize(&mut self, client_info: Value) -> Value {
        let response = self
            .request(
                0,
                "initialize",
                json!({"protocolVersion": "2024-11-05", "clientInfo": client_info, "capabilities": {}}),
            )
            .await;
        self.send_raw(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        response["result"].clone()
    }

    async fn close(mut self) -> anyhow::Result<()> {
        self.writer.shutdown().await.unwrap();
        self.task.await.unwrap()
    }
}

/// Per-session note taking, enough to observe session isolation
struct Notebook;

#[async_trait]
impl Capabilities for Notebook {
    async fn list_tools(&self, _ctx: &RequestContext) -> HandlerResult<Vec<ToolDef>> {
        Ok(vec![
            ToolDef {
                name: "note".to_string(),
                description: Some("Store a note".to_string()),
                input_schema: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            },
            ToolDef {
                name: "notes".to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
            },
        ])
    }

    async fn call_tool(
        &self,
        ctx: &RequestContext,
        name: &str,
        arguments: Value,
    ) -> HandlerResult<ToolCallResult> {
        let session = ctx.require_session()?;
        let mut notes = session.get_state("notes").await.unwrap_or_else(|| json!([]));
        match name {
            "note" => {
                let text = arguments["text"]
                    .as_str()
                    .ok_or_else(|| RpcError::invalid_params("text is required"))?;
                if let Some(list) = notes.as_array_mut() {
                    list.push(json!(text));
                }
                session.set_state("notes", notes).await;
                Ok(ToolCallResult::text("saved"))
            }
            "notes" => Ok(ToolCallResult::text(notes.to_string())),
            other => Err(RpcError::new(
                ErrorCode::Server(-32004),
                format!("No such tool: {}", other),
            )),
        }
    }
}

fn notebook_server() -> ProtocolServer {
    ProtocolServer::new(&ServerConfig::default(), Arc::new(Notebook))
}

#[tokio::test]
async fn test_malformed_line_yields_one_parse_error() {
    let server = notebook_server();
    let mut wire = Wire::open(&server);

    wire.send_raw("{this is not json").await;
    wire.send_raw(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await;
    wire.send_raw(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#).await;

    let error = wire.recv().await;
    assert_eq!(error["error"]["code"], -32700);
    assert_eq!(error["id"], Value::Null);

    let first = wire.recv().await;
    assert_eq!(first["id"], 1);
    assert_eq!(first["result"], json!({}));

    let second = wire.recv().await;
    assert_eq!(second["id"], 2);

    wire.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_message_keeps_connection_alive() {
    let server = notebook_server();
    let mut wire = Wire::open(&server);

    wire.send_raw(r#"{"jsonrpc":"2.0"}"#).await;
    let error = wire.recv().await;
    assert_eq!(error["error"]["code"], -32600);

    wire.send_raw("").await;
    let response = wire.request(3, "ping", json!({})).await;
    assert!(response.get("error").is_none());

    wire.close().await.unwrap();
}

#[tokio::test]
async fn test_same_agent_gets_same_session_across_connections() {
    let server = notebook_server();

    let mut first = Wire::open(&server);
    let result = first.initialize(json!({"name": "Claude Desktop", "version": "1.0"})).await;
    assert_eq!(result["sessionId"], "agent_claude_desktop");
    assert_eq!(result["agentName"], "Claude Desktop");
    assert_eq!(result["serverInfo"]["name"], "mcphub");
    assert!(result["capabilities"]["tools"].is_object());

    let saved = first
        .request(1, "tools/call", json!({"name": "note", "arguments": {"text": "remember me"}}))
        .await;
    assert_eq!(saved["result"]["content"][0]["text"], "saved");
    first.close().await.unwrap();

    let mut second = Wire::open(&server);
    let result = second.initialize(json!({"name": "Claude Desktop"})).await;
    assert_eq!(result["sessionId"], "agent_claude_desktop");
    let listed = second
        .request(1, "tools/call", json!({"name": "notes", "arguments": {}}))
        .await;
    assert_eq!(listed["result"]["content"][0]["text"], r#"["remember me"]"#);

    let mut other = Wire::open(&server);
    let result = other.initialize(json!({"agentName": "planner"})).await;
    assert_eq!(result["sessionId"], "agent_planner");
    let listed = other
        .request(1, "tools/call", json!({"name": "notes", "arguments": {}}))
        .await;
    assert_eq!(listed["result"]["content"][0]["text"], "[]");

    assert_eq!(server.sessions().await.len(), 2);
    second.close().await.unwrap();
    other.close().await.unwrap();
}

#[tokio::test]
async fn test_handshake_and_dispatch_errors() {
    let server = notebook_server();
    let mut wire = Wire::open(&server);

    let early = wire
        .request(1, "tools/call", json!({"name": "notes", "arguments": {}}))
        .await;
    assert_eq!(early["error"]["code"], -32600);

    let mismatch = wire
        .request(2, "initialize", json!({"protocolVersion": "1999-01-01", "clientInfo": {"name": "old"}}))
        .await;
    assert_eq!(mismatch["error"]["code"], -32602);

    wire.initialize(json!({"name": "worker"})).await;

    let missing = wire
        .request(3, "tools/call", json!({"name": "note", "arguments": {}}))
        .await;
    assert_eq!(missing["error"]["code"], -32602);

    let domain = wire
        .request(4, "tools/call", json!({"name": "shred", "arguments": {}}))
        .await;
    assert_eq!(domain["error"]["code"], -32004);

    let unknown = wire.request(5, "kanban/board", json!({})).await;
    assert_eq!(unknown["error"]["code"], -32601);

    let tools = wire.request(6, "tools/list", json!({})).await;
    assert_eq!(tools["result"]["tools"].as_array().unwrap().len(), 2);

    let resources = wire.request(7, "resources/list", json!({})).await;
    assert_eq!(resources["result"]["resources"], json!([]));

    wire.close().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_ends_every_connection() {
    let server = notebook_server();
    let mut a = Wire::open(&server);
    let mut b = Wire::open(&server);
    a.initialize(json!({"name": "a"})).await;
    b.initialize(json!({"name": "b"})).await;
    assert_eq!(server.sessions().await.len(), 2);

    let handle = server.shutdown_handle();
    handle.shutdown().await;
    handle.shutdown().await;

    assert!(a.task.await.unwrap().is_ok());
    assert!(b.task.await.unwrap().is_ok());
    assert!(a.lines.next_line().await.unwrap().is_none());
    assert!(server.sessions().await.is_empty());
    assert!(server.is_shut_down());
}

#[cfg(unix)]
mod backends {
    use super::fake_backend::FakeBackend;
    use super::*;
    use mcphub::bridge::FunctionNameBridge;
    use mcphub::client::Deadlines;
    use mcphub::config::BackendConfig;
    use mcphub::gateway::GatewayCapabilities;
    use mcphub::host::{ConnectionStatus, ToolHost};
    use mcphub::process::ProcessManager;

    fn host(processes: &ProcessManager) -> ToolHost {
        ToolHost::new(
            processes.clone(),
            Arc::new(FunctionNameBridge::new()),
            Deadlines::handshake_only(Duration::from_secs(10)),
        )
    }

    #[tokio::test]
    async fn test_hosts_share_identical_backends() {
        let backend = FakeBackend::new();
        let processes = ProcessManager::new();
        let alice = host(&processes);
        let bob = host(&processes);

        alice.connect("memory", &backend.config("mem")).await.unwrap();
        bob.connect("memory-b", &backend.config("mem")).await.unwrap();

        let stats = processes.stats().await;
        assert_eq!(stats.total_processes, 1);
        assert_eq!(stats.processes[0].refcount, 2);
        assert_eq!(stats.processes[0].referencing_names, vec!["memory", "memory-b"]);

        bob.connect("other", &backend.config("other")).await.unwrap();
        assert_eq!(processes.stats().await.total_processes, 2);

        alice.disconnect_all().await;
        bob.disconnect_all().await;
        assert_eq!(processes.stats().await.total_processes, 0);
    }

    #[tokio::test]
    async fn test_slow_backend_does_not_stall_others() {
        let backend = FakeBackend::new();
        let host = Arc::new(host(&ProcessManager::new()));
        host.connect("slow", &backend.config("slow")).await.unwrap();
        host.connect("fast", &backend.config("fast")).await.unwrap();

        let slow_call = {
            let host = Arc::clone(&host);
            tokio::spawn(async move { host.call_tool("slow", "slow", json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A connect queues for the registry write lock while the slow call runs
        let late_connect = {
            let host = Arc::clone(&host);
            let config = backend.config("other");
            tokio::spawn(async move { host.connect("other", &config).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        let fast = host.call_tool("fast", "read_graph", json!({})).await.unwrap();
        assert_eq!(fast.to_text(), "fast:ok");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(host.bridge().pending_count() >= 1);

        assert!(late_connect.await.unwrap().is_ok());
        let slow = slow_call.await.unwrap().unwrap();
        assert_eq!(slow.to_text(), "slow:slow");
        assert_eq!(host.bridge().pending_count(), 0);
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_function_calls_resolve_through_bridge() {
        let backend = FakeBackend::new();
        let host = host(&ProcessManager::new());
        host.connect("task_list", &backend.config("tasks")).await.unwrap();

        let functions = host.function_definitions().await;
        let names: Vec<&str> = functions.iter().map(|f| f.function.name.as_str()).collect();
        assert_eq!(names, vec!["task_list_read_graph", "task_list_fail", "task_list_crash"]);
        assert_eq!(functions[1].function.description, "MCP tool: fail");

        // A first-underscore guess would have produced "task:list_read_graph"
        let result = host
            .call_function("task_list_read_graph", json!({}))
            .await
            .unwrap();
        assert_eq!(result.to_text(), "tasks:ok");
        assert!(!result.is_error);

        let failed = host.call_function("task_list_fail", json!({})).await.unwrap();
        assert!(failed.is_error);
        assert_eq!(host.bridge().pending_count(), 0);

        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_tracks_backend_lifecycle() {
        let backend = FakeBackend::new();
        let host = host(&ProcessManager::new());
        let mut config = BackendConfig::default();
        config.servers.insert("memory".to_string(), backend.config("mem"));
        config.servers.insert(
            "broken".to_string(),
            mcphub::protocol::McpServerConfig {
                command: "/nonexistent/backend".to_string(),
                args: Vec::new(),
                env: Default::default(),
            },
        );

        let (connected, failures) = host.connect_all(&config).await;
        assert_eq!(connected, 1);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "broken");

        let status = host.server_status().await;
        assert_eq!(status[0].name, "broken");
        assert_eq!(status[0].status, ConnectionStatus::Error);
        assert_eq!(status[1].name, "memory");
        assert_eq!(status[1].status, ConnectionStatus::Connected);
        assert_eq!(status[1].tool_count, 3);
        assert_eq!(status[1].resource_count, 1);
        assert_eq!(status[1].prompt_count, 0);

        // The crashing call fails on its own; other backends are untouched
        assert!(host.call_tool("memory", "crash", json!({})).await.is_err());
        let mut status = host.server_status().await;
        for _ in 0..100 {
            if status[1].status == ConnectionStatus::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = host.server_status().await;
        }
        assert_eq!(status[1].status, ConnectionStatus::Disconnected);

        assert!(host.disconnect("memory").await);
        assert_eq!(host.all_tools().await.len(), 0);
        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_gateway_serves_backend_tools() {
        let backend = FakeBackend::new();
        let host = Arc::new(host(&ProcessManager::new()));
        host.connect("memory", &backend.config("gw")).await.unwrap();

        let server = ProtocolServer::new(
            &ServerConfig::default(),
            Arc::new(GatewayCapabilities::new(Arc::clone(&host))),
        );
        let mut wire = Wire::open(&server);
        wire.initialize(json!({"name": "agent-one"})).await;

        let tools = wire.request(1, "tools/list", json!({})).await;
        assert_eq!(tools["result"]["tools"][0]["name"], "memory:read_graph");

        let called = wire
            .request(2, "tools/call", json!({"name": "memory:read_graph", "arguments": {}}))
            .await;
        assert_eq!(called["result"]["content"][0]["text"], "gw:ok");

        let failed = wire
            .request(3, "tools/call", json!({"name": "memory:fail", "arguments": {}}))
            .await;
        assert_eq!(failed["result"]["isError"], true);

        let unknown = wire
            .request(4, "tools/call", json!({"name": "ghost:read_graph", "arguments": {}}))
            .await;
        assert_eq!(unknown["error"]["code"], -32602);

        let resource = wire
            .request(5, "resources/read", json!({"uri": "memo://graph"}))
            .await;
        assert_eq!(resource["result"]["contents"][0]["text"], "nodes: 0");

        wire.close().await.unwrap();
        host.shutdown().await;
    }
}
