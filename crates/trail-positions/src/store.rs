use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    config::PositionsConfig,
    entry::Entry,
    error::PositionsError,
    file::{self, Layout, Table},
};

/// What a worker may do with its checkpoints.
///
/// Workers receive an `Arc<dyn Checkpoints>` rather than the store itself.
pub trait Checkpoints: Send + Sync {
    /// Offset parsed as an integer; `0` when nothing is stored.
    fn get(&self, path: &str, labels: &str) -> Result<i64, PositionsError>;
    /// Raw stored offset; `""` when nothing is stored.
    fn get_string(&self, path: &str, labels: &str) -> String;
    fn put(&self, path: &str, labels: &str, offset: i64) -> Result<(), PositionsError>;
    fn put_string(&self, path: &str, labels: &str, offset: &str) -> Result<(), PositionsError>;
    fn remove(&self, path: &str, labels: &str) -> Result<(), PositionsError>;
    fn sync_period(&self) -> Duration;
}

/// In-memory positions table backed by a YAML file.
///
/// Every access takes one short lock on the table. Flushes copy the table
/// under that lock and write it after releasing it, so disk latency never
/// blocks `put` or `get`.
pub struct Positions {
    shared: Arc<Shared>,
    done: CancellationToken,
    sync_loop: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    cfg: PositionsConfig,
    /// False when read-only or when the file on disk has the legacy layout,
    /// which is never written back.
    persist: bool,
    table: Mutex<Table>,
    /// Held for the whole snapshot-and-write so flushes land in order.
    write: Mutex<()>,
    stopped: AtomicBool,
}

impl Positions {
    /// Load the positions file and, unless read-only, start the flush loop on
    /// the current tokio runtime.
    #[instrument(level = "debug", skip_all, fields(path = %cfg.positions_file.display()))]
    pub fn open(cfg: PositionsConfig) -> Result<Self, PositionsError> {
        if cfg.sync_period.is_zero() && !cfg.read_only {
            return Err(PositionsError::InvalidSyncPeriod);
        }
        let runtime = if cfg.read_only {
            None
        } else {
            Some(Handle::try_current().map_err(|_| PositionsError::NoRuntime)?)
        };

        let (table, layout) = file::read_positions_file(&cfg.positions_file, cfg.ignore_invalid_yaml)?;
        debug!(entries = table.len(), read_only = cfg.read_only, "positions loaded");

        let persist = !cfg.read_only && layout == Layout::Current;
        if !cfg.read_only && !persist {
            warn!(
                "positions file has the legacy layout and will not be updated; \
                 migrate it to a new file to keep offsets across restarts"
            );
        }

        let shared = Arc::new(Shared {
            cfg,
            persist,
            table: Mutex::new(table),
            write: Mutex::new(()),
            stopped: AtomicBool::new(false),
        });
        let done = CancellationToken::new();
        let sync_loop = runtime
            .filter(|_| persist)
            .map(|rt| rt.spawn(sync_loop(Arc::clone(&shared), done.clone())));

        Ok(Self {
            shared,
            done,
            sync_loop: Mutex::new(sync_loop),
        })
    }

    pub fn config(&self) -> &PositionsConfig {
        &self.shared.cfg
    }

    pub fn get(&self, path: &str, labels: &str) -> Result<i64, PositionsError> {
        let raw = self.get_string(path, labels);
        if raw.is_empty() {
            return Ok(0);
        }
        raw.parse().map_err(|_| PositionsError::InvalidOffset {
            path: path.to_string(),
            labels: labels.to_string(),
            value: raw,
        })
    }

    pub fn get_string(&self, path: &str, labels: &str) -> String {
        self.shared
            .table()
            .get(&Entry::new(path, labels))
            .cloned()
            .unwrap_or_default()
    }

    pub fn put(&self, path: &str, labels: &str, offset: i64) -> Result<(), PositionsError> {
        self.put_string(path, labels, &offset.to_string())
    }

    pub fn put_string(&self, path: &str, labels: &str, offset: &str) -> Result<(), PositionsError> {
        self.ensure_running()?;
        self.shared
            .table()
            .insert(Entry::new(path, labels), offset.to_string());
        Ok(())
    }

    pub fn remove(&self, path: &str, labels: &str) -> Result<(), PositionsError> {
        self.ensure_running()?;
        self.shared.table().remove(&Entry::new(path, labels));
        Ok(())
    }

    /// Sorted copy of the whole table.
    pub fn snapshot(&self) -> BTreeMap<Entry, String> {
        self.shared
            .table()
            .iter()
            .map(|(entry, offset)| (entry.clone(), offset.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush the table to disk now. A no-op in read-only mode and for a
    /// legacy-layout file.
    pub fn save(&self) -> Result<(), PositionsError> {
        self.ensure_running()?;
        self.shared.save()
    }

    /// Stop the flush loop and write the table one last time.
    ///
    /// Idempotent. Mutations and explicit saves fail with
    /// [`PositionsError::Stopped`] afterwards.
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.done.cancel();

        let sync_loop = self
            .sync_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sync_loop {
            if let Err(e) = handle.await {
                warn!(error = %e, "positions sync loop failed");
            }
        }

        let shared = Arc::clone(&self.shared);
        match tokio::task::spawn_blocking(move || shared.save()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "error writing positions file on stop"),
            Err(e) => warn!(error = %e, "positions flush on stop failed"),
        }
    }

    fn ensure_running(&self) -> Result<(), PositionsError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(PositionsError::Stopped);
        }
        Ok(())
    }
}

impl Checkpoints for Positions {
    fn get(&self, path: &str, labels: &str) -> Result<i64, PositionsError> {
        Positions::get(self, path, labels)
    }

    fn get_string(&self, path: &str, labels: &str) -> String {
        Positions::get_string(self, path, labels)
    }

    fn put(&self, path: &str, labels: &str, offset: i64) -> Result<(), PositionsError> {
        Positions::put(self, path, labels, offset)
    }

    fn put_string(&self, path: &str, labels: &str, offset: &str) -> Result<(), PositionsError> {
        Positions::put_string(self, path, labels, offset)
    }

    fn remove(&self, path: &str, labels: &str) -> Result<(), PositionsError> {
        Positions::remove(self, path, labels)
    }

    fn sync_period(&self) -> Duration {
        self.shared.cfg.sync_period
    }
}

impl Drop for Positions {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self) -> Result<(), PositionsError> {
        if !self.persist {
            return Ok(());
        }
        let _write = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.table().clone();
        file::write_positions_file(&self.cfg.positions_file, &snapshot)?;
        debug!(entries = snapshot.len(), "positions saved");
        Ok(())
    }
}

async fn sync_loop(shared: Arc<Shared>, done: CancellationToken) {
    let period = shared.cfg.sync_period;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let shared = Arc::clone(&shared);
        match tokio::task::spawn_blocking(move || shared.save()).await {
            Ok(Ok(())) => {}
            // Retried on the next tick with whatever has accumulated.
            Ok(Err(e)) => warn!(error = %e, "error writing positions file"),
            Err(e) => warn!(error = %e, "positions flush task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use super::*;
    use crate::entry::cursor_key;

    fn config(path: &Path) -> PositionsConfig {
        PositionsConfig::new(path).with_sync_period(Duration::from_secs(3600))
    }

    fn reopen(path: &Path) -> Positions {
        Positions::open(config(path).with_read_only(true)).unwrap()
    }

    async fn eventually<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn offsets_survive_stop_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.yml");

        let store = Positions::open(config(&path)).unwrap();
        store.put("/var/log/a", "", 10).unwrap();
        store.put("/var/log/a", "{}", 20).unwrap();
        store.put("/var/log/a", "{job=\"a\", env=\"prod\"}", 30).unwrap();
        store
            .put_string(&cursor_key("events"), "", "rv: 'opaque' #1")
            .unwrap();
        store.stop().await;

        let back = reopen(&path);
        assert_eq!(back.get("/var/log/a", "").unwrap(), 10);
        assert_eq!(back.get("/var/log/a", "{}").unwrap(), 20);
        assert_eq!(back.get("/var/log/a", "{job=\"a\", env=\"prod\"}").unwrap(), 30);
        assert_eq!(back.get_string("cursor-events", ""), "rv: 'opaque' #1");
        assert_eq!(back.len(), 4);
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Positions::open(config(&dir.path().join("absent.yml"))).unwrap();

        assert!(store.is_empty());
        assert_eq!(store.get("/nope", "").unwrap(), 0);
        assert_eq!(store.get_string("/nope", ""), "");
        store.stop().await;
    }

    #[tokio::test]
    async fn absent_and_empty_labels_read_back_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.yml");
        fs::write(
            &path,
            "positions:\n  ? path: /a\n  : \"1\"\n  ? path: /b\n    labels: \"\"\n  : \"2\"\n",
        )
        .unwrap();

        let store = reopen(&path);
        assert_eq!(store.get("/a", "").unwrap(), 1);
        assert_eq!(store.get("/b", "").unwrap(), 2);
        assert!(store.snapshot().keys().all(|e| e.labels.is_empty()));
    }

    #[tokio::test]
    async fn legacy_file_is_read_but_never_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.yaml");
        let legacy = "positions:\n  /var/log/syslog: \"512\"\n  /var/log/auth.log: \"64\"\n";
        fs::write(&path, legacy).unwrap();

        let store = Positions::open(config(&path).with_sync_period(Duration::from_millis(5))).unwrap();
        assert_eq!(store.get("/var/log/syslog", "").unwrap(), 512);
        assert_eq!(store.get("/var/log/auth.log", "").unwrap(), 64);

        // Updates stay in memory; the flush loop and stop never rewrite the file.
        store.put("/var/log/syslog", "", 1024).unwrap();
        store.save().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.stop().await;

        assert_eq!(store.get("/var/log/syslog", "").unwrap(), 1024);
        assert_eq!(fs::read_to_string(&path).unwrap(), legacy);
    }

    #[tokio::test]
    async fn invalid_yaml_is_fatal_unless_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.yml");
        fs::write(&path, "positions: [this is not { valid\n").unwrap();

        let err = Positions::open(config(&path)).err().expect("open should fail");
        assert!(matches!(err, PositionsError::InvalidYaml { .. }));
        assert!(err.to_string().contains(&path.display().to_string()));

        let store = Positions::open(config(&path).with_ignore_invalid_yaml(true)).unwrap();
        assert!(store.is_empty());
        store.stop().await;
    }

    #[tokio::test]
    async fn directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let err = Positions::open(config(dir.path())).err().expect("open should fail");
        assert!(matches!(err, PositionsError::IsDirectory { .. }));
        assert!(err.to_string().contains(&dir.path().display().to_string()));
    }

    #[tokio::test]
    async fn read_only_never_touches_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.yml");
        let writer = Positions::open(config(&path)).unwrap();
        writer.put("/a", "", 5).unwrap();
        writer.stop().await;
        let before = fs::read(&path).unwrap();

        let store = Positions::open(config(&path).with_read_only(true)).unwrap();
        store.put("/a", "", 99).unwrap();
        store.put("/b", "", 1).unwrap();
        assert_eq!(store.get("/a", "").unwrap(), 99);
        store.save().unwrap();
        store.stop().await;

        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn remove_drops_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.yml");

        let store = Positions::open(config(&path)).unwrap();
        store.put("/a", "{}", 1).unwrap();
        store.put("/b", "{}", 2).unwrap();
        store.remove("/a", "{}").unwrap();
        store.remove("/never-there", "").unwrap();
        store.stop().await;

        let back = reopen(&path);
        assert_eq!(back.get_string("/a", "{}"), "");
        assert_eq!(back.get("/b", "{}").unwrap(), 2);
    }

    #[tokio::test]
    async fn non_numeric_offset_is_reported_by_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = Positions::open(config(&dir.path().join("p.yml"))).unwrap();
        store.put_string("/a", "", "abc").unwrap();

        let err = store.get("/a", "").unwrap_err();
        assert!(matches!(err, PositionsError::InvalidOffset { ref value, .. } if value == "abc"));
        assert_eq!(store.get_string("/a", ""), "abc");
        store.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_final() {
        let dir = tempfile::tempdir().unwrap();
        let store = Positions::open(config(&dir.path().join("p.yml"))).unwrap();
        store.put("/a", "", 1).unwrap();

        store.stop().await;
        store.stop().await;

        assert!(matches!(store.put("/a", "", 2), Err(PositionsError::Stopped)));
        assert!(matches!(store.remove("/a", ""), Err(PositionsError::Stopped)));
        assert!(matches!(store.save(), Err(PositionsError::Stopped)));
        assert_eq!(store.get("/a", "").unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn flush_loop_writes_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.yml");
        let store = Positions::open(config(&path).with_sync_period(Duration::from_millis(20))).unwrap();

        store.put("/a", "", 42).unwrap();
        eventually(|| path.exists() && reopen(&path).get("/a", "").unwrap_or(0) == 42).await;

        store.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_flush_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let path = data.join("positions.yml");
        let store = Positions::open(config(&path).with_sync_period(Duration::from_millis(20))).unwrap();

        store.put("/a", "", 7).unwrap();
        assert!(matches!(store.save(), Err(PositionsError::Write { .. })));

        // The loop keeps going and succeeds once the directory shows up.
        tokio::time::sleep(Duration::from_millis(60)).await;
        fs::create_dir(&data).unwrap();
        eventually(|| path.exists()).await;

        store.stop().await;
        assert_eq!(reopen(&path).get("/a", "").unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.yml");
        let store = Arc::new(Positions::open(config(&path).with_sync_period(Duration::from_millis(5))).unwrap());

        let mut handles = Vec::new();
        for worker in 0..8 {
            let checkpoints: Arc<dyn Checkpoints> = store.clone();
            handles.push(tokio::spawn(async move {
                let key = format!("/var/log/{worker}.log");
                for offset in 0..=100 {
                    checkpoints.put(&key, "{}", offset).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        store.stop().await;

        let back = reopen(&path);
        assert_eq!(back.len(), 8);
        for worker in 0..8 {
            assert_eq!(back.get(&format!("/var/log/{worker}.log"), "{}").unwrap(), 100);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn written_file_has_fixed_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.yml");
        let store = Positions::open(config(&path)).unwrap();
        store.put("/a", "", 1).unwrap();
        store.save().unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        store.stop().await;
    }

    #[test]
    fn writable_store_needs_a_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let err = Positions::open(config(&dir.path().join("p.yml")))
            .err()
            .expect("open should fail");
        assert!(matches!(err, PositionsError::NoRuntime));

        let read_only = Positions::open(config(&dir.path().join("p.yml")).with_read_only(true));
        assert!(read_only.is_ok());
    }

    #[tokio::test]
    async fn zero_sync_period_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = Positions::open(config(&dir.path().join("p.yml")).with_sync_period(Duration::ZERO))
            .err()
            .expect("open should fail");
        assert!(matches!(err, PositionsError::InvalidSyncPeriod));
    }
}
