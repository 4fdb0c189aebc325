use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trail_positions::{Checkpoints, Positions};
use trail_runner::{Scheduler, SchedulerError, TaskSet, WorkerState};

use crate::{
    config::{AgentConfig, TargetConfig},
    tailer::{FileTailer, LogLine},
    target::FileTarget,
};

/// State of one scheduled target, as reported by [`Agent::debug_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub path: String,
    pub labels: String,
    pub is_running: bool,
    pub read_offset: String,
}

/// Periodically discovers configured files and keeps one tailer per file.
pub struct Agent {
    scheduler: Scheduler<FileTarget, FileTailer>,
    positions: Arc<Positions>,
    targets: Vec<TargetConfig>,
    host: Option<String>,
    refresh: Duration,
    applied: Mutex<Vec<FileTarget>>,
}

impl Agent {
    pub fn new(
        cfg: &AgentConfig,
        positions: Arc<Positions>,
        sink: mpsc::Sender<LogLine>,
    ) -> anyhow::Result<Self> {
        let host = if cfg.host_label {
            let name = hostname::get().context("reading hostname")?;
            Some(name.to_string_lossy().into_owned())
        } else {
            None
        };

        let checkpoints: Arc<dyn Checkpoints> = positions.clone();
        let poll = cfg.poll_interval();
        let scheduler = Scheduler::new(move |target: &FileTarget| {
            FileTailer::new(target.clone(), Arc::clone(&checkpoints), sink.clone(), poll)
        });

        Ok(Self {
            scheduler,
            positions,
            targets: cfg.targets.clone(),
            host,
            refresh: cfg.refresh_interval(),
            applied: Mutex::new(Vec::new()),
        })
    }

    /// Configured targets whose file currently exists.
    pub fn discover(&self) -> Vec<FileTarget> {
        self.targets
            .iter()
            .filter(|t| Path::new(&t.path).is_file())
            .map(|t| {
                let mut labels: BTreeMap<String, String> = t.labels.clone();
                if let Some(host) = &self.host {
                    labels.insert("host".to_string(), host.clone());
                }
                FileTarget::new(t.path.clone(), &labels)
            })
            .collect()
    }

    /// Run one discovery cycle.
    ///
    /// After a successful reconcile, checkpoints of targets that disappeared
    /// since the previous cycle are dropped; their tailers have exited.
    pub async fn refresh(&self) -> Result<(), SchedulerError> {
        let targets = self.discover();
        debug!(targets = targets.len(), "reconciling targets");

        self.scheduler
            .reconcile_timeout(targets.clone(), self.refresh)
            .await?;

        let current: TaskSet<FileTarget> = targets.iter().cloned().collect();
        let previous = std::mem::replace(
            &mut *self.applied.lock().unwrap_or_else(PoisonError::into_inner),
            targets,
        );
        for gone in previous.iter().filter(|t| !current.contains(t)) {
            info!(path = %gone.path, labels = %gone.labels, "target vanished, dropping its position");
            if let Err(e) = self.positions.remove(&gone.path, &gone.labels) {
                warn!(path = %gone.path, error = %e, "failed to drop position");
            }
        }
        Ok(())
    }

    /// Refresh until `cancel` fires, then stop every tailer and flush positions.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "target refresh failed");
            }
            for t in self.debug_info() {
                debug!(path = %t.path, labels = %t.labels, running = t.is_running, offset = %t.read_offset, "target");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.refresh) => {}
            }
        }

        info!("stopping tailers");
        self.scheduler.shutdown().await;
        self.positions.stop().await;
    }

    pub fn debug_info(&self) -> Vec<TargetInfo> {
        let mut info: Vec<TargetInfo> = self
            .scheduler
            .worker_states()
            .into_iter()
            .map(|(target, state)| TargetInfo {
                read_offset: self.positions.get_string(&target.path, &target.labels),
                is_running: state == WorkerState::Running,
                path: target.path,
                labels: target.labels,
            })
            .collect();
        info.sort_by(|a, b| (&a.path, &a.labels).cmp(&(&b.path, &b.labels)));
        info
    }
}
