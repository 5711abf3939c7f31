use anyhow::{Context, Result};
use clap::Parser;
use dlbridge::bridge::ResultSink;
use dlbridge::config::Config;
use dlbridge::plugin::DownloaderPlugin;
use dlbridge::transfer::{
    HttpTransferService, MemoryTransferService, TransferService, TransferStatus,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(short, long)]
    config: Option<String>,

    /// Directory downloaded files are written under
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Complete every download immediately without touching the network
    #[arg(long)]
    dry_run: bool,
}

/// One line of input: `{"id": 1, "action": "download", "args": [{...}]}`
#[derive(Debug, Deserialize)]
struct Command {
    id: Value,
    action: String,
    #[serde(default)]
    args: Value,
}

fn get_config_path(args: &Args) -> Option<String> {
    if let Some(path) = &args.config {
        return Some(path.clone());
    }

    if let Ok(path) = std::env::var("CONFIG_FILE") {
        return Some(path);
    }

    if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
        let config_path = format!("{}/dlbridge/config.toml", xdg_config_home);
        if std::path::Path::new(&config_path).exists() {
            return Some(config_path);
        }
    }

    if let Some(home) = dirs::home_dir() {
        let config_path = format!("{}/.config/dlbridge/config.toml", home.display());
        if std::path::Path::new(&config_path).exists() {
            return Some(config_path);
        }
    }

    None
}

fn print_result(id: &Value, outcome: Option<Result<String, dlbridge::bridge::DownloadError>>) {
    let line = match outcome {
        Some(Ok(location)) => json!({"id": id, "status": "ok", "payload": location}),
        Some(Err(e)) => json!({"id": id, "status": "error", "payload": e.payload(), "error": e}),
        None => json!({"id": id, "status": "abandoned"}),
    };
    println!("{line}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match get_config_path(&args) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => Config::default(),
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if config.get_logging_format() == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("Starting dlbridge...");

    let service: Arc<dyn TransferService> = if args.dry_run {
        info!("Dry run, transfers complete without network access");
        Arc::new(MemoryTransferService::with_auto_complete(
            TransferStatus::Successful,
        ))
    } else {
        let root = args.root.clone().unwrap_or_else(|| config.host.resolve_root());
        info!("Writing downloads under {}", root.display());
        Arc::new(
            HttpTransferService::new(root, config.host.event_capacity)
                .context("Failed to create HTTP transfer service")?,
        )
    };

    let plugin = DownloaderPlugin::initialize(service, config.bridge.clone())
        .context("Failed to initialize downloader plugin")?;

    let mut outstanding = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let command: Command = match serde_json::from_str(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Skipping malformed command: {}", e);
                continue;
            }
        };

        let (sink, pending) = ResultSink::channel();
        plugin.execute(&command.action, &command.args, sink).await;
        let id = command.id;
        outstanding.spawn(async move {
            print_result(&id, pending.wait().await);
        });
    }

    info!("Input closed, waiting for {} downloads", outstanding.len());
    while outstanding.join_next().await.is_some() {}

    plugin.shutdown().await;
    Ok(())
}
