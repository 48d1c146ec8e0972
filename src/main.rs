use anyhow::Result;
use clap::{Parser, Subcommand};
use mcphub::config::{BackendConfig, Config};
use mcphub::gateway::GatewayCapabilities;
use mcphub::{ProtocolServer, ToolHost, logging};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "mcphub")]
#[command(version = env!("MCPHUB_VERSION"))]
#[command(about = "Share MCP backend servers between agents behind one protocol server")]
struct Args {
    /// Backend definitions (default: .mcphub/mcp.json, then ~/.mcphub/mcp.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging of protocol traffic
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve every configured backend's tools over stdio (default)
    Serve,

    /// Print function-calling definitions for all backend tools
    Functions,

    /// Print backend status and shared process stats
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    logging::cleanup_old_logs();

    let args = Args::parse();
    if args.trace {
        logging::set_trace(true);
    }
    logging::info(&format!("mcphub {} starting", env!("MCPHUB_VERSION")));

    let result = run(args).await;
    if let Err(e) = &result {
        logging::error(&format!("{:?}", e));
    }
    result
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load();
    let backends = load_backends(args.config.as_deref())?;

    let host = Arc::new(ToolHost::from_config(&config));
    let (connected, failures) = host.connect_all(&backends).await;
    logging::info(&format!(
        "{} of {} backend(s) connected",
        connected,
        backends.servers.len()
    ));
    for (name, error) in &failures {
        eprintln!("mcphub: backend '{}' unavailable: {}", name, error);
    }

    let outcome = match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, Arc::clone(&host)).await,
        Command::Functions => {
            let functions = host.function_definitions().await;
            println!("{}", serde_json::to_string_pretty(&functions)?);
            Ok(())
        }
        Command::Status => {
            let report = serde_json::json!({
                "servers": host.server_status().await,
                "processes": host.process_stats().await,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    };

    host.shutdown().await;
    outcome
}

fn load_backends(path: Option<&Path>) -> Result<BackendConfig> {
    match path {
        Some(path) => BackendConfig::load_from_file(path),
        None => Ok(BackendConfig::load()),
    }
}

async fn serve(config: &Config, host: Arc<ToolHost>) -> Result<()> {
    let sweeper = host.spawn_sweeper(
        config.bridge.sweep_interval(),
        config.bridge.pending_call_max_age(),
    );

    let server = ProtocolServer::new(&config.server, Arc::new(GatewayCapabilities::new(host)));
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logging::info("Interrupted, shutting down");
            shutdown.shutdown().await;
        }
    });

    let result = server.serve_stdio().await;
    sweeper.abort();
    result
}
