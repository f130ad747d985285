use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use multiagents_core::MultiagentsConfig;
use multiagents_sessions::{SessionStore, SettingsStore};

mod app;
mod runner;
mod wire;
mod ws;

use runner::{RunnerConfig, SessionRunner};

/// Multi-agent group chat server.
#[derive(Parser, Debug)]
#[command(name = "multiagents", version, about = "Multi-agent group chat")]
struct Cli {
    /// Comma-separated default agents.
    #[arg(short, long, default_value = "claude,codex,kimi")]
    agents: String,

    /// Idle timeout per agent in seconds.
    #[arg(short, long, default_value_t = 1800.0)]
    timeout: f64,

    /// Timeout for parsing agent output in seconds.
    #[arg(long, default_value_t = 1200.0)]
    parse_timeout: f64,

    /// WebSocket send timeout in seconds.
    #[arg(long, default_value_t = 120.0)]
    send_timeout: f64,

    /// Hard timeout per agent in seconds (0 = disabled).
    #[arg(long, default_value_t = 0.0)]
    hard_timeout: f64,

    /// Bind host.
    #[arg(long)]
    host: Option<String>,

    /// Bind port.
    #[arg(long)]
    port: Option<u16>,

    /// Config file path (default: ~/.multiagents/multiagents.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "multiagents=info,tower_http=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = MultiagentsConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({e}), using defaults");
        MultiagentsConfig::default()
    });

    let db_path = Path::new(&config.database.path).to_path_buf();
    let store = Arc::new(SessionStore::open(&db_path)?);
    let settings = Arc::new(SettingsStore::open(&db_path)?);

    let runner_config = RunnerConfig {
        timeout: Duration::from_secs_f64(cli.timeout),
        send_timeout: Duration::from_secs_f64(cli.send_timeout),
        parse_timeout: Duration::from_secs_f64(cli.parse_timeout),
        hard_timeout: (cli.hard_timeout > 0.0).then(|| Duration::from_secs_f64(cli.hard_timeout)),
        warmup_ttl: Duration::from_secs_f64(config.pools.warmup_ttl),
        ack_ttl: Duration::from_secs_f64(config.pools.ack_ttl),
    };
    let runner = SessionRunner::new(store, settings, runner_config);

    let default_agents: Vec<String> = cli
        .agents
        .split(',')
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();
    let state = Arc::new(app::AppState::new(runner, default_agents));
    let router = app::build_router(state);

    let host = cli.host.unwrap_or(config.server.host);
    let port = cli.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!(
        %addr,
        timeout = cli.timeout,
        parse_timeout = cli.parse_timeout,
        send_timeout = cli.send_timeout,
        hard_timeout = cli.hard_timeout,
        "starting multiagents"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
