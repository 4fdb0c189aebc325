use std::{
    io::{self, SeekFrom},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader},
    sync::mpsc,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trail_positions::{Checkpoints, PositionsError};
use trail_runner::Worker;

use crate::target::FileTarget;

/// Longer lines are forwarded in pieces of this size.
const MAX_LINE_BYTES: usize = 256 * 1024;
/// Bytes read before the checkpoint is updated.
const CHECKPOINT_BYTES: u64 = 64 * 1024;
/// Bytes read per poll before checking the file again.
const MAX_BYTES_PER_POLL: u64 = 4 * 1024 * 1024;

/// One complete line read from a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub path: String,
    pub labels: String,
    pub line: String,
}

#[derive(Debug, Error)]
enum TailError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("checkpoint: {0}")]
    Positions(#[from] PositionsError),
}

/// Follows a single file from its last checkpoint, forwarding every
/// complete line and recording the byte offset after each batch.
pub struct FileTailer {
    target: FileTarget,
    checkpoints: Arc<dyn Checkpoints>,
    sink: mpsc::Sender<LogLine>,
    poll_interval: Duration,
}

impl FileTailer {
    pub fn new(
        target: FileTarget,
        checkpoints: Arc<dyn Checkpoints>,
        sink: mpsc::Sender<LogLine>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            target,
            checkpoints,
            sink,
            poll_interval,
        }
    }

    async fn tail(&self, cancel: &CancellationToken) -> Result<(), TailError> {
        let FileTarget { path, labels } = &self.target;

        let mut offset = match self.checkpoints.get(path, labels) {
            Ok(offset) => u64::try_from(offset).unwrap_or(0),
            Err(e) => {
                warn!(%path, error = %e, "unreadable checkpoint, starting from the beginning");
                0
            }
        };
        debug!(%path, offset, "resuming from checkpoint");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut behind = false;

        loop {
            if behind {
                if cancel.is_cancelled() {
                    return Ok(());
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = ticker.tick() => {}
                }
            }

            let len = match tokio::fs::metadata(path).await {
                Ok(meta) => meta.len(),
                // Gone for now; discovery decides whether we keep waiting.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    behind = false;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if len < offset {
                info!(%path, offset, len, "file shrank, reading from the start");
                offset = 0;
            }
            if len == offset {
                behind = false;
                continue;
            }

            match self.read_lines(offset, cancel).await? {
                Some(read) => {
                    offset = read.offset;
                    behind = read.behind;
                }
                None => return Ok(()),
            }
        }
    }

    /// Forward complete lines starting at `offset`, checkpointing as it goes.
    ///
    /// Returns `None` when the tailer should stop. A trailing fragment without
    /// a newline is left for the next poll.
    async fn read_lines(
        &self,
        mut offset: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<Progress>, TailError> {
        let FileTarget { path, labels } = &self.target;

        let mut file = File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut reader = BufReader::new(file);

        let mut buf = Vec::new();
        let mut read = 0u64;
        let mut saved = offset;
        let mut stop = false;

        while read < MAX_BYTES_PER_POLL {
            buf.clear();
            let n = (&mut reader)
                .take(MAX_LINE_BYTES as u64)
                .read_until(b'\n', &mut buf)
                .await?;
            let complete = buf.last() == Some(&b'\n');
            if n == 0 || (!complete && n < MAX_LINE_BYTES) {
                break;
            }
            if complete {
                buf.pop();
            }

            let line = LogLine {
                path: path.clone(),
                labels: labels.clone(),
                line: String::from_utf8_lossy(&buf).trim_end_matches('\r').to_string(),
            };
            let sent = tokio::select! {
                sent = self.sink.send(line) => sent.is_ok(),
                _ = cancel.cancelled() => false,
            };
            if !sent {
                debug!(%path, "stopped while forwarding lines");
                stop = true;
                break;
            }

            offset += n as u64;
            read += n as u64;
            if offset - saved >= CHECKPOINT_BYTES {
                self.checkpoints.put(path, labels, offset as i64)?;
                saved = offset;
            }
        }

        if offset != saved {
            self.checkpoints.put(path, labels, offset as i64)?;
        }
        if stop {
            return Ok(None);
        }
        Ok(Some(Progress {
            offset,
            behind: read >= MAX_BYTES_PER_POLL,
        }))
    }
}

struct Progress {
    offset: u64,
    /// The per-poll budget ran out before the end of the file.
    behind: bool,
}

#[async_trait]
impl Worker for FileTailer {
    async fn run(&self, cancel: CancellationToken) {
        info!(path = %self.target.path, labels = %self.target.labels, "tailing file");

        if let Err(e) = self.tail(&cancel).await {
            warn!(path = %self.target.path, error = %e, "tailer exited with error");
        }
        info!(path = %self.target.path, "stopped tailing file");
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, fs, io::Write};

    use trail_positions::{Positions, PositionsConfig};

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        log: std::path::PathBuf,
        positions: Arc<Positions>,
        target: FileTarget,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("app.log");
        fs::write(&log, "").unwrap();
        let positions = Arc::new(
            Positions::open(
                PositionsConfig::new(dir.path().join("positions.yml"))
                    .with_sync_period(Duration::from_secs(3600)),
            )
            .unwrap(),
        );
        let target = FileTarget::new(log.display().to_string(), &BTreeMap::new());
        Fixture {
            _dir: dir,
            log,
            positions,
            target,
        }
    }

    fn append(path: &std::path::Path, text: &str) {
        let mut f = fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn spawn_tailer(
        fx: &Fixture,
    ) -> (mpsc::Receiver<LogLine>, CancellationToken, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let checkpoints: Arc<dyn Checkpoints> = fx.positions.clone();
        let tailer = FileTailer::new(fx.target.clone(), checkpoints, tx, Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let run = {
            let cancel = cancel.clone();
            tokio::spawn(async move { tailer.run(cancel).await })
        };
        (rx, cancel, run)
    }

    async fn recv(rx: &mut mpsc::Receiver<LogLine>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no line in time")
            .expect("channel closed")
            .line
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forwards_complete_lines_and_checkpoints() {
        let fx = fixture();
        let (mut rx, cancel, run) = spawn_tailer(&fx);

        append(&fx.log, "first\nsecond\npart");
        assert_eq!(recv(&mut rx).await, "first");
        assert_eq!(recv(&mut rx).await, "second");

        append(&fx.log, "ial\r\n");
        assert_eq!(recv(&mut rx).await, "partial");

        cancel.cancel();
        run.await.unwrap();
        assert_eq!(
            fx.positions.get(&fx.target.path, &fx.target.labels).unwrap(),
            "first\nsecond\npartial\r\n".len() as i64
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resumes_from_checkpoint() {
        let fx = fixture();
        append(&fx.log, "old\nnew\n");
        fx.positions
            .put(&fx.target.path, &fx.target.labels, "old\n".len() as i64)
            .unwrap();

        let (mut rx, cancel, run) = spawn_tailer(&fx);
        assert_eq!(recv(&mut rx).await, "new");

        cancel.cancel();
        run.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn truncated_file_is_reread() {
        let fx = fixture();
        append(&fx.log, "a much longer first generation line\n");
        fx.positions
            .put(&fx.target.path, &fx.target.labels, 1_000)
            .unwrap();

        let (mut rx, cancel, run) = spawn_tailer(&fx);
        assert_eq!(recv(&mut rx).await, "a much longer first generation line");

        cancel.cancel();
        run.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn large_backlog_is_read_in_bounded_steps() {
        let fx = fixture();
        let line = "x".repeat(2047);
        let count = (MAX_BYTES_PER_POLL as usize / 2048) + 500;
        let backlog: String = (0..count).map(|_| format!("{line}\n")).collect();
        append(&fx.log, &backlog);

        let (mut rx, cancel, run) = spawn_tailer(&fx);
        let mut saw_partial_checkpoint = false;
        for i in 0..count {
            assert_eq!(recv(&mut rx).await.len(), 2047);
            if i == count / 2 {
                let saved = fx.positions.get(&fx.target.path, &fx.target.labels).unwrap();
                saw_partial_checkpoint = saved > 0 && saved < backlog.len() as i64;
            }
        }
        assert!(saw_partial_checkpoint);

        cancel.cancel();
        run.await.unwrap();
        assert_eq!(
            fx.positions.get(&fx.target.path, &fx.target.labels).unwrap(),
            backlog.len() as i64
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlong_line_is_split() {
        let fx = fixture();
        append(&fx.log, &format!("{}\nshort\n", "y".repeat(MAX_LINE_BYTES + 10)));

        let (mut rx, cancel, run) = spawn_tailer(&fx);
        assert_eq!(recv(&mut rx).await.len(), MAX_LINE_BYTES);
        assert_eq!(recv(&mut rx).await, "y".repeat(10));
        assert_eq!(recv(&mut rx).await, "short");

        cancel.cancel();
        run.await.unwrap();
    }
}
