//! Gateway capability: re-exposes every connected backend through one
//! protocol server. Tools and prompts are addressed as `<server>:<name>`;
//! resources keep their own URIs.

use crate::bridge::split_protocol_id;
use crate::host::ToolHost;
use crate::logging;
use crate::protocol::{
    GetPromptResult, HandlerResult, PromptDef, ReadResourceResult, ResourceDef, RpcError,
    ToolCallResult, ToolDef,
};
use crate::server::{Capabilities, RequestContext};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

pub struct GatewayCapabilities {
    host: Arc<ToolHost>,
}

impl GatewayCapabilities {
    pub fn new(host: Arc<ToolHost>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Arc<ToolHost> {
        &self.host
    }

    async fn resolve<'a>(&self, qualified: &'a str, kind: &str) -> HandlerResult<(&'a str, &'a str)> {
        let (server, name) = split_protocol_id(qualified).ok_or_else(|| {
            RpcError::invalid_params(format!("{} name must be <server>:<name>, got '{}'", kind, qualified))
        })?;
        if !self.host.is_connected(server).await {
            return Err(RpcError::invalid_params(format!("Unknown server: {}", server)));
        }
        Ok((server, name))
    }
}

#[async_trait]
impl Capabilities for GatewayCapabilities {
    fn server_capabilities(&self) -> Value {
        json!({
            "tools": {"listChanged": false},
            "resources": {"subscribe": false, "listChanged": false},
            "prompts": {"listChanged": false}
        })
    }

    async fn list_tools(&self, _ctx: &RequestContext) -> HandlerResult<Vec<ToolDef>> {
        Ok(self
            .host
            .all_tools()
            .await
            .into_iter()
            .map(|entry| ToolDef {
                name: entry.protocol_id(),
                description: entry.tool.description,
                input_schema: entry.tool.input_schema,
            })
            .collect())
    }

    async fn call_tool(
        &self,
        ctx: &RequestContext,
        name: &str,
        arguments: Value,
    ) -> HandlerResult<ToolCallResult> {
        let session = ctx.require_session()?;
        let (server, tool) = self.resolve(name, "Tool").await?;
        logging::info(&format!("{} -> {}:{}", session.agent_name(), server, tool));

        // Backend tool failures (isError) pass through as results
        self.host
            .call_tool(server, tool, arguments)
            .await
            .map_err(RpcError::from)
    }

    async fn list_resources(&self, _ctx: &RequestContext) -> HandlerResult<Vec<ResourceDef>> {
        Ok(self
            .host
            .all_resources()
            .await
            .into_iter()
            .map(|owned| owned.item)
            .collect())
    }

    async fn read_resource(&self, _ctx: &RequestContext, uri: &str) -> HandlerResult<ReadResourceResult> {
        let owner = self
            .host
            .all_resources()
            .await
            .into_iter()
            .find(|owned| owned.item.uri == uri)
            .map(|owned| owned.server_name)
            .ok_or_else(|| RpcError::invalid_params(format!("Unknown resource: {}", uri)))?;

        self.host
            .read_resource(&owner, uri)
            .await
            .map_err(RpcError::from)
    }

    async fn list_prompts(&self, _ctx: &RequestContext) -> HandlerResult<Vec<PromptDef>> {
        Ok(self
            .host
            .all_prompts()
            .await
            .into_iter()
            .map(|owned| PromptDef {
                name: format!("{}:{}", owned.server_name, owned.item.name),
                ..owned.item
            })
            .collect())
    }

    async fn get_prompt(
        &self,
        _ctx: &RequestContext,
        name: &str,
        arguments: Option<Value>,
    ) -> HandlerResult<GetPromptResult> {
        let (server, prompt) = self.resolve(name, "Prompt").await?;
        self.host
            .get_prompt(server, prompt, arguments)
            .await
            .map_err(RpcError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::FunctionNameBridge;
    use crate::client::Deadlines;
    use crate::process::ProcessManager;
    use crate::protocol::ErrorCode;
    use crate::server::SessionStore;
    use std::time::Duration;

    fn gateway() -> GatewayCapabilities {
        GatewayCapabilities::new(Arc::new(ToolHost::new(
            ProcessManager::new(),
            Arc::new(FunctionNameBridge::new()),
            Deadlines::handshake_only(Duration::from_secs(5)),
        )))
    }

    async fn ctx() -> RequestContext {
        let store = SessionStore::new();
        let (session, _) = store.resolve(&json!({"name": "tester"}), &json!({})).await;
        RequestContext::new(Some(session), None)
    }

    #[tokio::test]
    async fn test_empty_host_lists_nothing() {
        let gw = gateway();
        let ctx = ctx().await;
        assert!(gw.list_tools(&ctx).await.unwrap().is_empty());
        assert!(gw.list_resources(&ctx).await.unwrap().is_empty());
        assert!(gw.list_prompts(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_call_rejections() {
        let gw = gateway();
        let ctx = ctx().await;

        let err = gw.call_tool(&ctx, "no_separator", Value::Null).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);

        let err = gw.call_tool(&ctx, "ghost:tool", Value::Null).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
        assert!(err.message.contains("Unknown server: ghost"));

        let err = gw
            .call_tool(&RequestContext::default(), "ghost:tool", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);

        let err = gw.read_resource(&ctx, "file:///nope").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);

        let err = gw.get_prompt(&ctx, "ghost:greet", None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
    }
}
