//! # ShoalKV Server
//!
//! Run with: `cargo run -p gateway -- --data-dir ./data --listen 0.0.0.0:8080`
//!
//! Engine settings come from `SHOALKV_*` environment variables (see the
//! `config` crate); the flags below override them.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use engine::{Engine, EngineConfig};
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gateway::{create_router, AppState};

#[derive(Debug, Parser)]
#[command(name = "shoalkv", version, about = "ShoalKV key-value server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "SHOALKV_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Data directory. Overrides SHOALKV_DATA_DIR.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Memtable flush threshold in KiB. Overrides SHOALKV_MEMTABLE_KB.
    #[arg(long)]
    memtable_kb: Option<usize>,

    /// fsync every WAL append. Overrides SHOALKV_WAL_SYNC.
    #[arg(long)]
    wal_sync: Option<bool>,

    /// Segments before compaction, 0 disables it. Overrides
    /// SHOALKV_COMPACTION_TRIGGER.
    #[arg(long)]
    compaction_trigger: Option<usize>,
}

impl Args {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::from_env().context("reading SHOALKV_* environment")?;
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(kb) = self.memtable_kb {
            config.memtable_size_limit = kb.saturating_mul(1024);
        }
        if let Some(sync) = self.wal_sync {
            config.wal_sync = sync;
        }
        if let Some(trigger) = self.compaction_trigger {
            config.compaction_trigger = trigger;
        }
        config.validate().context("invalid engine configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.engine_config()?;
    info!(listen = %args.listen, data_dir = %config.data_dir.display(), "starting ShoalKV");

    let state = Arc::new(AppState::new().context("registering metrics")?);
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;

    // Serve immediately; requests answer 503 until recovery completes.
    let (failed_tx, failed_rx) = oneshot::channel::<anyhow::Error>();
    let open_state = Arc::clone(&state);
    tokio::spawn(async move {
        match tokio::task::spawn_blocking(move || Engine::open(config)).await {
            Ok(Ok(engine)) => {
                open_state.install(engine);
            }
            Ok(Err(e)) => {
                let _ = failed_tx.send(anyhow::Error::new(e).context("opening engine"));
            }
            Err(e) => {
                let _ = failed_tx.send(anyhow::Error::new(e).context("engine open task failed"));
            }
        }
    });

    let server = axum::serve(listener, create_router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .into_future();
    tokio::select! {
        result = server => result.context("server error")?,
        Ok(e) = failed_rx => {
            error!(error = %e, "engine failed to start");
            return Err(e);
        }
    }

    if let Some(engine) = state.engine().cloned() {
        tokio::task::spawn_blocking(move || engine.shutdown())
            .await
            .context("engine shutdown task failed")?
            .context("shutting down engine")?;
    }
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
