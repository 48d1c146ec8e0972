//! Per-agent sessions
//!
//! A session is keyed by the agent's sanitized name, so an agent that
//! reconnects (new process, new transport) lands back in the same session.
//! Sessions live as long as the server; only shutdown clears them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const UNKNOWN_AGENT: &str = "unknown_agent";

/// `clientInfo` keys consulted, in order, for the agent's identity
const IDENTITY_KEYS: &[&str] = &["name", "agentName", "clientName", "identifier"];

/// Pick the agent name out of a `clientInfo` object.
pub fn extract_agent_name(client_info: &Value) -> String {
    IDENTITY_KEYS
        .iter()
        .filter_map(|key| client_info.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|name| !name.is_empty())
        .unwrap_or(UNKNOWN_AGENT)
        .to_string()
}

/// Reduce a name to `[a-z0-9_-]`, replacing anything else with `_`.
pub fn sanitize_agent_name(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        UNKNOWN_AGENT.to_string()
    } else {
        sanitized
    }
}

pub fn session_id_for(sanitized_name: &str) -> String {
    format!("agent_{}", sanitized_name)
}

/// Isolated per-agent context
#[derive(Debug)]
pub struct Session {
    id: String,
    agent_name: String,
    client_info: Value,
    client_capabilities: Value,
    created_at: DateTime<Utc>,
    state: RwLock<HashMap<String, Value>>,
}

impl Session {
    fn new(id: String, agent_name: String, client_info: Value, client_capabilities: Value) -> Self {
        Self {
            id,
            agent_name,
            client_info,
            client_capabilities,
            created_at: Utc::now(),
            state: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn client_info(&self) -> &Value {
        &self.client_info
    }

    pub fn client_capabilities(&self) -> &Value {
        &self.client_capabilities
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn get_state(&self, key: &str) -> Option<Value> {
        self.state.read().await.get(key).cloned()
    }

    /// Store a value, returning the previous one
    pub async fn set_state(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.state.write().await.insert(key.into(), value)
    }

    pub async fn remove_state(&self, key: &str) -> Option<Value> {
        self.state.write().await.remove(key)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            agent_name: self.agent_name.clone(),
            created_at: self.created_at,
        }
    }
}

/// Serializable session summary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub agent_name: String,
    pub created_at: DateTime<Utc>,
}

/// All sessions known to one server
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the session for this client identity, creating it on first
    /// contact. Returns the session and whether it was newly created.
    pub async fn resolve(&self, client_info: &Value, capabilities: &Value) -> (Arc<Session>, bool) {
        let agent_name = extract_agent_name(client_info);
        let id = session_id_for(&sanitize_agent_name(&agent_name));

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&id) {
            return (Arc::clone(existing), false);
        }

        let session = Arc::new(Session::new(
            id.clone(),
            agent_name,
            client_info.clone(),
            capabilities.clone(),
        ));
        sessions.insert(id, Arc::clone(&session));
        (session, true)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Summaries sorted by session id
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.sessions.write().await.clear();
    }
}
