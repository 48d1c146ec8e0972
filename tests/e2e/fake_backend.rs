//! Fake MCP backend for e2e tests
//!
//! A POSIX sh script that speaks just enough MCP over stdio. It relies on
//! requests being serialised with `jsonrpc`, `id`, `method` as the leading
//! keys, which is how the hub writes them.
//!
//! `slow` is callable but left out of `tools/list` and answers after 3s.

use mcphub::protocol::McpServerConfig;
use std::collections::HashMap;
use std::io::Write;

const SCRIPT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  [ -z "$id" ] && continue
  method=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":[0-9]*,"method":"\([^"]*\)".*/\1/p')
  case "$method" in
    initialize)
      result='{"protocolVersion":"2024-11-05","serverInfo":{"name":"fake","version":"1.0"},"capabilities":{"tools":{},"resources":{}}}' ;;
    tools/list)
      result='{"tools":[{"name":"read_graph","description":"Read the knowledge graph","inputSchema":{"type":"object","properties":{}}},{"name":"fail"},{"name":"crash"}]}' ;;
    tools/call)
      case "$line" in
        *'"name":"crash"'*) exit 1 ;;
        *'"name":"slow"'*) sleep 3; result='{"content":[{"type":"text","text":"'"${FAKE_LABEL:-fake}"':slow"}]}' ;;
        *'"name":"fail"'*) result='{"content":[{"type":"text","text":"tool failed"}],"isError":true}' ;;
        *) result='{"content":[{"type":"text","text":"'"${FAKE_LABEL:-fake}"':ok"}]}' ;;
      esac ;;
    resources/list)
      result='{"resources":[{"uri":"memo://graph","name":"graph"}]}' ;;
    resources/read)
      result='{"contents":[{"uri":"memo://graph","text":"nodes: 0"}]}' ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id"
      continue ;;
  esac
  printf '{"jsonrpc":"2.0","id":%s,"result":%s}\n' "$id" "$result"
done
"#;

pub struct FakeBackend {
    script: tempfile::NamedTempFile,
}

impl FakeBackend {
    pub fn new() -> Self {
        let mut script = tempfile::NamedTempFile::new().expect("create script");
        script.write_all(SCRIPT.as_bytes()).expect("write script");
        script.flush().expect("flush script");
        Self { script }
    }

    /// Launch configuration; `label` is echoed back by successful tool calls
    pub fn config(&self, label: &str) -> McpServerConfig {
        let mut env = HashMap::new();
        env.insert("FAKE_LABEL".to_string(), label.to_string());
        McpServerConfig {
            command: "sh".to_string(),
            args: vec![self.script.path().display().to_string()],
            env,
        }
    }
}
