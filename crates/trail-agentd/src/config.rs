use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, ensure};
use serde::Deserialize;
use trail_observe::LoggerConfig;
use trail_positions::PositionsConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub logger: LoggerConfig,
    pub positions: PositionsSection,
    /// How often targets are re-discovered and handed to the scheduler.
    pub refresh_interval_ms: u64,
    /// How often each tailer checks its file for new data.
    pub poll_interval_ms: u64,
    /// Add a `host` label carrying this machine's hostname to every target.
    pub host_label: bool,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PositionsSection {
    #[serde(flatten)]
    pub store: PositionsConfig,
    /// Positions file of an older agent, converted on startup if the
    /// current file does not exist yet.
    pub legacy_positions_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub path: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            logger: LoggerConfig::default(),
            positions: PositionsSection::default(),
            refresh_interval_ms: 5_000,
            poll_interval_ms: 1_000,
            host_label: false,
            targets: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Read the YAML config at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let cfg: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.refresh_interval_ms > 0, "refresh_interval_ms must be positive");
        ensure!(self.poll_interval_ms > 0, "poll_interval_ms must be positive");
        for target in &self.targets {
            ensure!(!target.path.is_empty(), "target path must not be empty");
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
