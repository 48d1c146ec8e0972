//! Capability interface implemented by concrete tool servers

use super::session::Session;
use crate::logging;
use crate::protocol::{
    GetPromptResult, HandlerResult, PromptDef, ReadResourceResult, RequestId, ResourceDef,
    RpcError, ToolCallResult, ToolDef,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// What a handler knows about the request it is serving
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    session: Option<Arc<Session>>,
    request_id: Option<RequestId>,
}

impl RequestContext {
    pub fn new(session: Option<Arc<Session>>, request_id: Option<RequestId>) -> Self {
        Self {
            session,
            request_id,
        }
    }

    /// The session resolved by `initialize`, if the connection has one
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// The session, or InvalidRequest for connections that skipped the
    /// handshake
    pub fn require_session(&self) -> HandlerResult<&Arc<Session>> {
        self.session
            .as_ref()
            .ok_or_else(|| RpcError::invalid_request("Session not initialized"))
    }

    /// Id of the request being served (`None` for notifications)
    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }
}

/// The surface a protocol server dispatches to.
///
/// Only tool listing and calling are required; everything else has a
/// default that behaves like a server without that capability.
#[async_trait]
pub trait Capabilities: Send + Sync {
    /// `capabilities` object advertised in the initialize result
    fn server_capabilities(&self) -> Value {
        json!({
            "tools": {"listChanged": false},
            "resources": {"subscribe": false, "listChanged": false},
            "prompts": {"listChanged": false}
        })
    }

    async fn list_tools(&self, ctx: &RequestContext) -> HandlerResult<Vec<ToolDef>>;

    async fn call_tool(
        &self,
        ctx: &RequestContext,
        name: &str,
        arguments: Value,
    ) -> HandlerResult<ToolCallResult>;

    async fn list_resources(&self, _ctx: &RequestContext) -> HandlerResult<Vec<ResourceDef>> {
        Ok(Vec::new())
    }

    async fn read_resource(
        &self,
        _ctx: &RequestContext,
        uri: &str,
    ) -> HandlerResult<ReadResourceResult> {
        Err(RpcError::invalid_params(format!("Unknown resource: {}", uri)))
    }

    async fn list_prompts(&self, _ctx: &RequestContext) -> HandlerResult<Vec<PromptDef>> {
        Ok(Vec::new())
    }

    async fn get_prompt(
        &self,
        _ctx: &RequestContext,
        name: &str,
        _arguments: Option<Value>,
    ) -> HandlerResult<GetPromptResult> {
        Err(RpcError::invalid_params(format!("Unknown prompt: {}", name)))
    }

    /// Fallback for request methods the dispatcher does not know
    async fn handle_custom_method(
        &self,
        _ctx: &RequestContext,
        method: &str,
        _params: Option<Value>,
    ) -> HandlerResult<Value> {
        Err(RpcError::method_not_found(method))
    }

    /// Fallback for notifications the dispatcher does not know
    async fn handle_custom_notification(
        &self,
        _ctx: &RequestContext,
        method: &str,
        _params: Option<Value>,
    ) {
        logging::debug(&format!("Ignoring notification: {}", method));
    }

    /// Called for `notifications/cancelled`. Nothing in flight is aborted
    /// unless an implementation does so here.
    async fn on_cancelled(&self, _ctx: &RequestContext, request_id: &RequestId, reason: Option<&str>) {
        logging::info(&format!(
            "Client cancelled request {}{}",
            request_id,
            reason.map(|r| format!(": {}", r)).unwrap_or_default()
        ));
    }
}
