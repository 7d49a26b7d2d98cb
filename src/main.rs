mod server;
mod settings;
mod signals;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use spaces_engine::{FileStorage, MemoryStorage, MirrorHost, SpaceStorage, spawn};
use spaces_shared::{diagnostics, transport};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::server::SpacesServer;
use crate::settings::LoadedConfig;

#[derive(Parser, Debug)]
#[command(name = "spaces", version, about = "Space state synchronization daemon")]
struct Cli {
    /// Config file (defaults to ~/.spaces/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    profile: Option<String>,
    #[arg(long, global = true)]
    socket: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    /// Keep state in memory only; nothing survives a restart
    #[arg(long, default_value_t = false)]
    in_memory: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Serve,
    /// Send one JSON line to a running daemon and print the reply
    Send { line: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut loaded = LoadedConfig::load(cli.config.as_deref())?;
    if let Some(profile) = cli.profile {
        loaded.settings.profile = profile;
    }
    if cli.socket.is_some() {
        loaded.settings.socket_path = cli.socket;
    }
    loaded.settings.debug |= cli.debug;
    diagnostics::init(loaded.settings.debug);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => runtime.block_on(serve(loaded, cli.in_memory)),
        Command::Send { line } => {
            runtime.block_on(send(&loaded.settings.socket_path(), &line))
        }
    }
}

async fn serve(loaded: LoadedConfig, in_memory: bool) -> anyhow::Result<()> {
    let LoadedConfig { settings, engine } = loaded;
    let storage: Arc<dyn SpaceStorage> = if in_memory {
        info!("spaces_storage_in_memory");
        Arc::new(MemoryStorage::new())
    } else {
        Arc::new(FileStorage::new(settings.storage_root(), settings.profile.clone()))
    };
    let host = Arc::new(MirrorHost::new());
    let (handle, engine_task) =
        spawn(engine, storage, host.clone()).context("failed to start spaces engine")?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server = SpacesServer::new(settings.socket_path(), handle.clone(), host);
    let mut server_task = tokio::spawn(async move { server.run(shutdown_rx).await });

    info!(profile = %settings.profile, "spaces_daemon_ready");
    let server_exit = tokio::select! {
        signal = signals::shutdown_signal() => {
            if let Err(e) = signal {
                warn!(error = %e, "spaces_signal_handlers_unavailable");
            }
            None
        }
        finished = &mut server_task => Some(finished),
    };

    if let Err(e) = handle.suspend().await {
        warn!(error = %e, "spaces_final_flush_failed");
    }
    let _ = shutdown_tx.send(());
    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "spaces_shutdown_failed");
    }
    if let Err(e) = engine_task.await {
        warn!(error = %e, "spaces_engine_task_failed");
    }

    let server_exit = match server_exit {
        Some(finished) => finished,
        None => server_task.await,
    };
    match server_exit {
        Ok(result) => result.context("socket server failed")?,
        Err(e) => warn!(error = %e, "spaces_server_task_failed"),
    }
    info!("spaces_daemon_stopped");
    Ok(())
}

async fn send(socket: &Path, line: &str) -> anyhow::Result<()> {
    let stream = transport::connect(socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))?;
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(line.trim().as_bytes()).await?;
    write_half.write_all(b"\n").await?;

    // Subscriptions and host attachments keep the connection open.
    let streaming = line.contains("\"subscribe\"") || line.contains("\"attachHost\"");
    let mut lines = BufReader::new(read_half).lines();
    while let Some(reply) = lines.next_line().await? {
        println!("{reply}");
        if !streaming {
            break;
        }
    }
    Ok(())
}
