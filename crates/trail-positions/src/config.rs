use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PositionsConfig {
    /// How often the table is flushed to disk.
    #[serde(rename = "sync_period_ms", deserialize_with = "duration_ms")]
    pub sync_period: Duration,
    pub positions_file: PathBuf,
    /// Start from an empty table when the file cannot be parsed.
    pub ignore_invalid_yaml: bool,
    /// Load the file once and never write it back.
    pub read_only: bool,
}

impl PositionsConfig {
    pub fn new(positions_file: impl Into<PathBuf>) -> Self {
        Self {
            positions_file: positions_file.into(),
            ..Self::default()
        }
    }

    pub fn with_sync_period(mut self, period: Duration) -> Self {
        self.sync_period = period;
        self
    }

    pub fn with_ignore_invalid_yaml(mut self, ignore: bool) -> Self {
        self.ignore_invalid_yaml = ignore;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_secs(10),
            positions_file: PathBuf::from("/var/log/positions.yaml"),
            ignore_invalid_yaml: false,
            read_only: false,
        }
    }
}

fn duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
