use std::{fs, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trail_observe::logger_init;
use trail_positions::{Positions, migrate_legacy_file};

mod agent;
mod config;
mod tailer;
mod target;

use agent::Agent;
use config::AgentConfig;
use tailer::LogLine;

const DEFAULT_CONFIG: &str = "agent.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1) Config
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let cfg = AgentConfig::load(&config_path)?;

    // 2) Logger
    logger_init(&cfg.logger)?;
    info!(config = %config_path.display(), targets = cfg.targets.len(), "logger initialized");

    // 3) Positions
    let store = cfg.positions.store.clone();
    if let Some(dir) = store.positions_file.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating positions directory {}", dir.display()))?;
    }
    if let Some(legacy) = &cfg.positions.legacy_positions_file {
        migrate_legacy_file(legacy, &store.positions_file)
            .with_context(|| format!("migrating legacy positions file {}", legacy.display()))?;
    }
    let positions = Arc::new(Positions::open(store).context("opening positions file")?);

    // 4) Line consumer
    let (tx, mut rx) = mpsc::channel::<LogLine>(1024);
    let consumer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            debug!(target: "trail::lines", path = %line.path, labels = %line.labels, line = %line.line, "log line");
        }
    });

    // 5) Agent
    let agent = Agent::new(&cfg, positions, tx)?;
    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(cancel).await })
    };
    info!("agent is running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    cancel.cancel();

    if let Err(e) = run.await {
        warn!(error = %e, "agent task failed");
    }
    if let Err(e) = consumer.await {
        warn!(error = %e, "line consumer failed");
    }
    Ok(())
}
