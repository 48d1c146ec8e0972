//! MCP protocol server
//!
//! Terminates JSON-RPC over a [`MessageStream`], resolves a [`Session`] per
//! agent on `initialize` and dispatches capability methods to a
//! [`Capabilities`] implementation.
//!
//! One connection handles one message at a time, in arrival order. A
//! server value is cheap to clone and may serve many connections at once;
//! they share the session store.

mod capability;
mod session;

pub use capability::{Capabilities, RequestContext};
pub use session::{
    Session, SessionInfo, SessionStore, extract_agent_name, sanitize_agent_name, session_id_for,
};

use crate::config::ServerConfig;
use crate::logging;
use crate::protocol::{
    CancelledParams, GetPromptParams, HandlerResult, InitializeParams, InitializeResult, Message,
    Notification, PromptsListResult, ReadResourceParams, Request, ResourcesListResult, Response,
    RpcError, ServerInfo, ToolCallParams, ToolsListResult, parse_params,
};
use crate::transport::{self, Frame, MessageStream};
use anyhow::Result;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Value, json};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Initialized,
    Closed,
}

/// Per-connection state: where the handshake stands and which session it
/// bound to
#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    session: Option<Arc<Session>>,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Created,
            session: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    fn context(&self, request_id: Option<crate::protocol::RequestId>) -> RequestContext {
        RequestContext::new(self.session.clone(), request_id)
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// Triggers server shutdown from anywhere (signal handlers, tests)
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
    sessions: Arc<SessionStore>,
}

impl ShutdownHandle {
    /// Stop every connection loop and drop all sessions. Idempotent.
    pub async fn shutdown(&self) {
        if self.tx.send_replace(true) {
            return;
        }
        logging::info("Protocol server shutting down");
        self.sessions.clear().await;
    }

    pub fn is_shut_down(&self) -> bool {
        *self.tx.borrow()
    }
}

/// JSON-RPC dispatcher and session manager
#[derive(Clone)]
pub struct ProtocolServer {
    info: ServerInfo,
    protocol_version: String,
    capabilities: Arc<dyn Capabilities>,
    sessions: Arc<SessionStore>,
    shutdown: ShutdownHandle,
}

impl ProtocolServer {
    pub fn new(config: &ServerConfig, capabilities: Arc<dyn Capabilities>) -> Self {
        let sessions = Arc::new(SessionStore::new());
        let (tx, _) = watch::channel(false);
        Self {
            info: ServerInfo {
                name: config.name.clone(),
                version: config.version.clone(),
            },
            protocol_version: config.protocol_version.clone(),
            capabilities,
            shutdown: ShutdownHandle {
                tx: Arc::new(tx),
                sessions: Arc::clone(&sessions),
            },
            sessions,
        }
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list().await
    }

    pub async fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).await
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub async fn shutdown(&self) {
        self.shutdown.shutdown().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_shut_down()
    }

    /// Serve over this process's stdin/stdout
    pub async fn serve_stdio(&self) -> Result<()> {
        self.serve(transport::stdio()).await
    }

    /// Run one connection until end of input or shutdown. Bad messages
    /// never end the loop; only transport I/O failures do.
    pub async fn serve<T: MessageStream>(&self, mut transport: T) -> Result<()> {
        logging::set_server(&self.info.name);
        let mut shutdown_rx = self.shutdown.tx.subscribe();
        let mut conn = Connection::new();

        let outcome = loop {
            if *shutdown_rx.borrow() {
                break Ok(());
            }

            let frame = tokio::select! {
                biased;
                _ = shutdown_rx.wait_for(|stop| *stop) => break Ok(()),
                frame = transport.recv() => frame,
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(anyhow::Error::new(e).context("Failed to read from transport")),
            };

            if let Some(response) = self.handle_frame(&mut conn, frame).await {
                let message = Message::Response(response);
                if let Err(e) = transport.send(&message).await {
                    break Err(anyhow::Error::new(e).context("Failed to write to transport"));
                }
            }
        };

        conn.state = ConnectionState::Closed;
        if let Err(e) = transport.close().await {
            logging::warn(&format!("Failed to close transport: {}", e));
        }
        if let Err(ref e) = outcome {
            logging::error(&format!("Connection ended: {:#}", e));
        }
        logging::clear_context();
        outcome
    }

    /// Handle one inbound frame, returning the response to send, if any
    pub async fn handle_frame(&self, conn: &mut Connection, frame: Frame) -> Option<Response> {
        match frame {
            Ok(message) => self.handle_message(conn, message).await,
            Err(invalid) => {
                logging::warn(&format!("Rejected inbound line: {}", invalid.error.message));
                Some(Response::err(invalid.id, &invalid.error))
            }
        }
    }

    pub async fn handle_message(&self, conn: &mut Connection, message: Message) -> Option<Response> {
        match message {
            Message::Request(request) => Some(self.handle_request(conn, request).await),
            Message::Notification(notification) => {
                self.handle_notification(conn, notification).await;
                None
            }
            Message::Response(response) => {
                logging::debug(&format!(
                    "Ignoring response from client (id {:?})",
                    response.id
                ));
                None
            }
        }
    }

    async fn handle_request(&self, conn: &mut Connection, request: Request) -> Response {
        let id = request.id.clone();
        let method = request.method.clone();
        logging::rpc("<-", &method, &format!("id={}", id));

        let outcome = AssertUnwindSafe(self.dispatch(conn, request))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(RpcError::internal(format!(
                    "Handler panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        match outcome {
            Ok(result) => {
                logging::rpc("->", &method, &result.to_string());
                Response::ok(id, result)
            }
            Err(e) => {
                logging::warn(&format!("{} (id {}) failed: {}", method, id, e));
                Response::err(Some(id), &e)
            }
        }
    }

    async fn dispatch(&self, conn: &mut Connection, request: Request) -> HandlerResult<Value> {
        let ctx = conn.context(Some(request.id.clone()));
        let caps = &self.capabilities;

        match request.method.as_str() {
            "initialize" => self.initialize(conn, request.params).await,
            "ping" => Ok(json!({})),
            "tools/list" => {
                let tools = caps.list_tools(&ctx).await?;
                to_result(&ToolsListResult { tools })
            }
            "tools/call" => {
                let params: ToolCallParams = parse_params(request.params)?;
                to_result(&caps.call_tool(&ctx, &params.name, params.arguments).await?)
            }
            "resources/list" => {
                let resources = caps.list_resources(&ctx).await?;
                to_result(&ResourcesListResult { resources })
            }
            "resources/read" => {
                let params: ReadResourceParams = parse_params(request.params)?;
                to_result(&caps.read_resource(&ctx, &params.uri).await?)
            }
            "prompts/list" => {
                let prompts = caps.list_prompts(&ctx).await?;
                to_result(&PromptsListResult { prompts })
            }
            "prompts/get" => {
                let params: GetPromptParams = parse_params(request.params)?;
                to_result(&caps.get_prompt(&ctx, &params.name, params.arguments).await?)
            }
            other => caps.handle_custom_method(&ctx, other, request.params).await,
        }
    }

    async fn initialize(&self, conn: &mut Connection, params: Option<Value>) -> HandlerResult<Value> {
        let params: InitializeParams = parse_params(params)?;
        if params.protocol_version != self.protocol_version {
            return Err(RpcError::invalid_params(format!(
                "Unsupported protocol version: {}",
                params.protocol_version
            ))
            .with_data(json!({
                "supported": [self.protocol_version],
                "requested": params.protocol_version,
            })));
        }

        let (session, created) = self
            .sessions
            .resolve(&params.client_info, &params.capabilities)
            .await;
        if self.is_shut_down() {
            // Shutdown may have cleared the store before this resolve
            self.sessions.clear().await;
            return Err(RpcError::internal("Server is shutting down"));
        }
        conn.session = Some(Arc::clone(&session));
        conn.state = ConnectionState::Initialized;

        logging::set_session(session.id());
        if created {
            logging::info(&format!(
                "Created session {} for agent '{}'",
                session.id(),
                session.agent_name()
            ));
        } else {
            logging::info(&format!("Resumed session {}", session.id()));
        }

        to_result(&InitializeResult {
            protocol_version: self.protocol_version.clone(),
            server_info: Some(self.info.clone()),
            capabilities: self.capabilities.server_capabilities(),
            session_id: Some(session.id().to_string()),
            agent_name: Some(session.agent_name().to_string()),
        })
    }

    async fn handle_notification(&self, conn: &mut Connection, notification: Notification) {
        logging::rpc("<-", &notification.method, "notification");
        let ctx = conn.context(None);
        let caps = &self.capabilities;

        let handled = AssertUnwindSafe(async {
            match notification.method.as_str() {
                "initialized" | "notifications/initialized" => {
                    logging::debug("Client reported initialized");
                }
                "notifications/cancelled" => {
                    match parse_params::<CancelledParams>(notification.params) {
                        Ok(params) => {
                            caps.on_cancelled(&ctx, &params.request_id, params.reason.as_deref())
                                .await
                        }
                        Err(e) => logging::warn(&format!("Bad cancellation notice: {}", e)),
                    }
                }
                other => {
                    caps.handle_custom_notification(&ctx, other, notification.params)
                        .await
                }
            }
        })
        .catch_unwind()
        .await;

        if let Err(panic) = handled {
            logging::error(&format!(
                "Notification handler panicked: {}",
                panic_message(panic.as_ref())
            ));
        }
    }
}

fn to_result<T: Serialize>(value: &T) -> HandlerResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| RpcError::internal(format!("Failed to encode result: {}", e)))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
