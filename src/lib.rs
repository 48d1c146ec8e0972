//! mcphub: MCP protocol server framework, shared backend process pool and
//! function-name bridge for tool-calling agents.

pub mod bridge;
pub mod client;
pub mod config;
pub mod gateway;
pub mod host;
pub mod id;
pub mod logging;
pub mod platform;
pub mod process;
pub mod protocol;
pub mod server;
pub mod transport;

pub use bridge::FunctionNameBridge;
pub use host::ToolHost;
pub use process::{ProcessHandle, ProcessManager};
pub use server::{Capabilities, ProtocolServer, RequestContext};
