//! Name bridge between MCP tool ids and function-calling APIs
//!
//! MCP identifies a tool as `server:tool`, but function-calling APIs only
//! accept `[A-Za-z0-9_-]` names. The forward direction just swaps the first
//! `:` for `_`. The reverse is ambiguous once names contain underscores, so
//! every name produced by [`FunctionNameBridge::convert_tools_to_functions`]
//! is recorded and looked up before any syntactic guess is made.

use crate::id;
use crate::logging;
use crate::protocol::ToolDef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A tool together with the backend that provides it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolWithServer {
    pub tool: ToolDef,
    #[serde(rename = "serverName")]
    pub server_name: String,
}

impl ToolWithServer {
    pub fn protocol_id(&self) -> String {
        format!("{}:{}", self.server_name, self.tool.name)
    }
}

/// One entry of a function-calling `tools` array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// An outgoing tool call that has not reported completion yet
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingToolCall {
    pub call_id: String,
    pub protocol_tool_id: String,
    pub server_name: String,
    pub arguments: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    registered_at: Instant,
}

impl PendingToolCall {
    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

/// `server:tool` -> `server_tool`. Only the first `:` is replaced; an id
/// without one is returned unchanged.
pub fn to_api_name(protocol_id: &str) -> String {
    match protocol_id.split_once(':') {
        Some((server, tool)) => format!("{}_{}", server, tool),
        None => protocol_id.to_string(),
    }
}

/// Split `server:tool` on the first `:`
pub fn split_protocol_id(protocol_id: &str) -> Option<(&str, &str)> {
    protocol_id.split_once(':')
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bidirectional name registry plus the pending-call table.
///
/// Each table sits behind its own lock; no method holds both.
#[derive(Default)]
pub struct FunctionNameBridge {
    names: Mutex<HashMap<String, String>>,
    pending: Mutex<HashMap<String, PendingToolCall>>,
}

impl FunctionNameBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_api_name(&self, protocol_id: &str) -> String {
        to_api_name(protocol_id)
    }

    /// Recover the protocol id for an API name.
    ///
    /// Registered names resolve exactly. Anything else is split at the
    /// first `_`, which is wrong whenever the server name itself contains
    /// an underscore; names without any `_` come back unchanged.
    pub fn from_api_name(&self, api_name: &str) -> String {
        if let Some(protocol_id) = lock(&self.names).get(api_name) {
            return protocol_id.clone();
        }
        match api_name.split_once('_') {
            Some((server, tool)) => {
                logging::debug(&format!(
                    "No registered mapping for '{}', guessing '{}:{}'",
                    api_name, server, tool
                ));
                format!("{}:{}", server, tool)
            }
            None => api_name.to_string(),
        }
    }

    /// Whether `api_name` resolves through the registry rather than a guess
    #[cfg(test)]
    pub(crate) fn is_registered(&self, api_name: &str) -> bool {
        lock(&self.names).contains_key(api_name)
    }

    /// Build function definitions for every tool and record the reverse
    /// mapping of each generated name.
    ///
    /// A bad entry is skipped or repaired on its own; the rest still convert.
    pub fn convert_tools_to_functions(&self, tools: &[ToolWithServer]) -> Vec<FunctionDefinition> {
        let mut functions = Vec::with_capacity(tools.len());
        let mut emitted: HashSet<String> = HashSet::new();
        let mut names = lock(&self.names);

        for entry in tools {
            let tool = &entry.tool;
            if tool.name.is_empty() || entry.server_name.is_empty() {
                logging::warn(&format!(
                    "Skipping tool with empty name from server '{}'",
                    entry.server_name
                ));
                continue;
            }
            if entry.server_name.contains(':') {
                logging::warn(&format!(
                    "Skipping tool '{}': server name '{}' contains ':'",
                    tool.name, entry.server_name
                ));
                continue;
            }

            let protocol_id = entry.protocol_id();
            let api_name = to_api_name(&protocol_id);
            if !emitted.insert(api_name.clone()) {
                logging::warn(&format!(
                    "Function name '{}' is produced by more than one tool, keeping the first",
                    api_name
                ));
                continue;
            }

            if let Some(previous) = names.insert(api_name.clone(), protocol_id.clone()) {
                if previous != protocol_id {
                    logging::warn(&format!(
                        "Function name '{}' now maps to '{}' (was '{}')",
                        api_name, protocol_id, previous
                    ));
                }
            }

            let parameters = if tool.input_schema.is_object() {
                tool.input_schema.clone()
            } else {
                if !tool.input_schema.is_null() {
                    logging::warn(&format!(
                        "Tool '{}' has a non-object input schema, using an empty one",
                        protocol_id
                    ));
                }
                json!({"type": "object", "properties": {}})
            };

            functions.push(FunctionDefinition {
                kind: "function".to_string(),
                function: FunctionSpec {
                    name: api_name,
                    description: tool
                        .description
                        .clone()
                        .filter(|d| !d.trim().is_empty())
                        .unwrap_or_else(|| format!("MCP tool: {}", tool.name)),
                    parameters,
                },
            });
        }

        functions
    }

    /// Forget every registered name mapping
    pub fn clear_registry(&self) {
        lock(&self.names).clear();
    }

    #[cfg(test)]
    pub(crate) fn registered_count(&self) -> usize {
        lock(&self.names).len()
    }

    pub fn new_call_id(&self) -> String {
        id::new_id("call")
    }

    /// Record a dispatched call. `tool_name` may be either an API name or a
    /// protocol id; it is stored as the protocol id.
    pub fn register(&self, call_id: &str, tool_name: &str, server_name: &str, arguments: Value) {
        let protocol_tool_id = if tool_name.contains(':') {
            tool_name.to_string()
        } else {
            self.from_api_name(tool_name)
        };

        let call = PendingToolCall {
            call_id: call_id.to_string(),
            protocol_tool_id,
            server_name: server_name.to_string(),
            arguments,
            timestamp: Utc::now(),
            registered_at: Instant::now(),
        };
        lock(&self.pending).insert(call_id.to_string(), call);
    }

    pub fn get(&self, call_id: &str) -> Option<PendingToolCall> {
        lock(&self.pending).get(call_id).cloned()
    }

    /// Remove a finished call. Unknown ids are ignored.
    pub fn complete(&self, call_id: &str) -> Option<PendingToolCall> {
        lock(&self.pending).remove(call_id)
    }

    /// Drop every record at least `max_age` old, finished or not.
    /// Returns how many were removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut pending = lock(&self.pending);
        let before = pending.len();
        pending.retain(|_, call| call.age() < max_age);
        let removed = before - pending.len();
        if removed > 0 {
            logging::info(&format!("Swept {} stale pending tool call(s)", removed));
        }
        removed
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}
