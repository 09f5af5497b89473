//! ai-action-streamer CLI: run the action server or send it an observation.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ai_action_streamer::client::ActionClient;
use ai_action_streamer::config::{Config, HostingMode};
use ai_action_streamer::handler::ActionHandler;
use ai_action_streamer::server::{Lifecycle, Supervisor, spawn_actor};
use ai_action_streamer::sink::{FileSink, LogSink, TracingSink};
use ai_action_streamer::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;

#[derive(Parser)]
#[command(name = "ai-action-streamer", about = "Task observation → action server", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the action server until interrupted
    Serve(ServeArgs),
    /// Send one task observation and print the action
    Send {
        /// Server address (host:port)
        #[arg(long, default_value = "localhost:50052")]
        addr: String,
        /// Observation field as key=value (repeatable)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Bind host
    #[arg(long)]
    host: Option<IpAddr>,
    /// Bind port (0 picks a free port)
    #[arg(long)]
    port: Option<u16>,
    /// Shutdown grace window in milliseconds
    #[arg(long)]
    grace_ms: Option<u64>,
    /// Append handler log lines to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Hosting strategy
    #[arg(long, value_enum)]
    hosting: Option<HostingMode>,
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => cmd_serve(args).await,
        Command::Send { addr, fields } => cmd_send(&addr, fields).await,
    }
}

async fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(grace_ms) = args.grace_ms {
        config.grace_ms = grace_ms;
    }
    if let Some(log_file) = args.log_file {
        config.log_file = Some(log_file);
    }
    if let Some(hosting) = args.hosting {
        config.hosting = hosting;
    }

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "ai-action-streamer".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let sink: Arc<dyn LogSink> = match &config.log_file {
        Some(path) => Arc::new(FileSink::create(path)?),
        None => Arc::new(TracingSink),
    };
    let supervisor = Supervisor::new(config.server_config(), ActionHandler::new(sink));
    let grace = config.grace();

    match config.hosting {
        HostingMode::InProcess => serve(&supervisor, grace).await,
        HostingMode::Actor => {
            let actor = spawn_actor("AiActionStreamerService", supervisor);
            serve(&actor, grace).await
        }
    }
}

async fn serve<L: Lifecycle>(lifecycle: &L, grace: Duration) -> anyhow::Result<()> {
    lifecycle.start().await?;
    info!(port = ?lifecycle.port().await, "action server ready");

    lifecycle.run_until(shutdown_signal(), grace).await?;
    info!("action server shut down");
    Ok(())
}

async fn cmd_send(addr: &str, fields: Vec<(String, String)>) -> anyhow::Result<()> {
    let fields: Map<String, Value> = fields
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();

    let mut client = ActionClient::connect(addr).await?;
    let action = client.send_fields(&fields).await?;

    println!("{}", serde_json::to_string_pretty(&action)?);
    if !action.success {
        anyhow::bail!("server reported failure: {}", action.message);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}
