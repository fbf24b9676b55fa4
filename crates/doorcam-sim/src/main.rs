use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use doorcam_proto::config::Config;
use doorcam_sim::{start_server, SimOptions, SimState};
use tokio::net::TcpListener;
use tracing::info;

/// Emulates the door unit's camera board for local runs.
#[derive(Parser, Debug)]
#[command(name = "doorcam-sim", version)]
struct Args {
    /// Config file to read `[sim]` defaults from.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides `[sim] bind_address`).
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides `[sim] port`).
    #[arg(long)]
    port: Option<u16>,

    /// Refuse every start/stop command.
    #[arg(long)]
    reject: bool,

    /// Delay before answering each command, in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let config_path = args.config.unwrap_or_else(Config::config_path);
    let config = Config::load_from(&config_path)?;
    let bind = args.bind.unwrap_or(config.sim.bind_address);
    let port = args.port.unwrap_or(config.sim.port);

    let state = SimState::new(SimOptions {
        reject_commands: args.reject,
        command_delay: Duration::from_millis(args.delay_ms),
        fps: config.sim.fps,
    });

    let addr = format!("{}:{}", bind, port);
    let listener = TcpListener::bind(&addr).await?;
    let server = start_server(listener, state);

    tokio::select! {
        _ = server => {}
        _ = tokio::signal::ctrl_c() => info!("sim: interrupted"),
    }
    Ok(())
}
