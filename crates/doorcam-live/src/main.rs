use std::path::PathBuf;

use clap::Parser;
use doorcam_live::command::{CommandQueue, HttpCommandClient};
use doorcam_live::logging;
use doorcam_live::mpv::MpvFactory;
use doorcam_live::panel::{Panel, PanelView};
use doorcam_live::session::{SessionCore, SessionHandle, SessionOptions};
use doorcam_proto::config::Config;
use doorcam_proto::protocol::SessionSnapshot;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Headless door-camera panel: type `tap`, `open`, `close`, `status` or `quit`.
#[derive(Parser, Debug)]
#[command(name = "doorcam", version)]
struct Args {
    /// Config file to use instead of the default location.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Door unit host, overriding `[device] host`.
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let data_dir = doorcam_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("doorcam.log");

    let (log_tx, log_rx) = broadcast::channel::<String>(100);
    logging::init(&log_path, log_tx)?;
    info!("Log file: {:?}", log_path);

    let config_path = args.config.unwrap_or_else(Config::config_path);
    let mut config = Config::load_from(&config_path)?;
    info!("Config loaded from: {:?}", config_path);
    if let Some(host) = args.host {
        config.device.host = host;
    }
    info!("Door unit at {}", config.device.base_url());

    let commands = CommandQueue::spawn(HttpCommandClient::new(&config.device)?);
    let factory = MpvFactory::new(&config.decoder);
    let options = SessionOptions::from_config(&config)?;
    let (session, core_task) = SessionCore::spawn(commands, factory, options);

    let cancel = CancellationToken::new();
    let printer = tokio::spawn(print_updates(
        session.subscribe(),
        log_rx,
        cancel.clone(),
    ));

    println!("{}", PanelView::from_snapshot(&session.snapshot()).render(0));
    run_input(&session).await?;

    info!("Shutting down");
    if session.shutdown().await.is_err() {
        warn!("session already stopped");
    }
    if let Err(e) = core_task.await {
        warn!("session task ended abnormally: {}", e);
    }
    cancel.cancel();
    let _ = printer.await;
    Ok(())
}

/// Reads commands until `quit`, end of input or ctrl-c.
async fn run_input(session: &SessionHandle) -> anyhow::Result<()> {
    let mut panel = Panel::new();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
        };
        let Some(line) = line else {
            debug!("stdin closed");
            return Ok(());
        };

        let intent = match line.trim() {
            "" => continue,
            "tap" => panel.tap(),
            "open" => panel.open(),
            "close" => panel.close(),
            "status" => {
                println!("{}", PanelView::from_snapshot(&session.snapshot()).render(0));
                continue;
            }
            "quit" | "exit" => return Ok(()),
            other => {
                println!("unknown command {:?} (tap | open | close | status | quit)", other);
                continue;
            }
        };
        session.send_intent(intent).await?;
    }
}

async fn print_updates(
    mut updates: broadcast::Receiver<SessionSnapshot>,
    mut logs: broadcast::Receiver<String>,
    cancel: CancellationToken,
) {
    let mut tick = 0usize;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            update = updates.recv() => match update {
                Ok(snapshot) => {
                    tick += 1;
                    println!("{}", PanelView::from_snapshot(&snapshot).render(tick));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("panel: skipped {} snapshot(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Ok(line) = logs.recv() => println!("{}", line),
        }
    }
}
