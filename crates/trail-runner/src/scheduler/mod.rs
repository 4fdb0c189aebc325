mod slot;
pub use slot::WorkerState;

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::{
    error::SchedulerError,
    set::TaskSet,
    task::{Task, Worker},
};
use slot::ScheduledWorker;

type WorkerFactory<T, W> = dyn Fn(&T) -> W + Send + Sync;

/// Runs one [`Worker`] per distinct [`Task`] and keeps that set in step with
/// the desired task list handed to [`Scheduler::reconcile`].
///
/// Cloning yields another handle to the same scheduler. Dropping the last
/// handle cancels every worker without waiting for them.
pub struct Scheduler<T, W> {
    inner: Arc<Inner<T, W>>,
}

struct Inner<T, W> {
    factory: Box<WorkerFactory<T, W>>,
    /// Parent of every worker token; cancelled by shutdown.
    root: CancellationToken,
    state: Mutex<State<T, W>>,
}

struct State<T, W> {
    workers: TaskSet<T, ScheduledWorker<W>>,
    /// Desired tasks waiting for their stopping predecessor, by ticket.
    /// Every reconcile replaces the whole set, abandoning older waits.
    deferred: TaskSet<T, u64>,
    next_id: u64,
}

/// What a reconcile has to wait for once the table lock is released.
struct Pending {
    released: Vec<CancellationToken>,
    deferred: Vec<JoinHandle<()>>,
}

impl<T, W> Clone for Scheduler<T, W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Task, W: Worker> Scheduler<T, W> {
    /// Build a scheduler with no running tasks.
    ///
    /// `factory` is called once per newly observed task, while the
    /// scheduler's table lock is held, so it should only construct the worker.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&T) -> W + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                factory: Box::new(factory),
                root: CancellationToken::new(),
                state: Mutex::new(State {
                    workers: TaskSet::new(),
                    deferred: TaskSet::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    /// Make the running workers match `tasks`.
    ///
    /// Workers whose task is absent are cancelled and awaited; tasks without
    /// a worker get one. Equal tasks collapse to a single worker and a task
    /// that is already running is left untouched.
    ///
    /// Returns once every stale worker has exited and been removed. If `ctx`
    /// fires first, [`SchedulerError::Cancelled`] is returned and the stale
    /// workers keep shutting down in the background.
    #[instrument(level = "debug", skip_all)]
    pub async fn reconcile<I>(&self, tasks: I, ctx: &CancellationToken) -> Result<(), SchedulerError>
    where
        I: IntoIterator<Item = T>,
    {
        let desired: TaskSet<T> = tasks.into_iter().collect();
        let pending = Inner::apply(&self.inner, desired)?;

        let wait = async move {
            for released in pending.released {
                released.cancelled().await;
            }
            for handle in pending.deferred {
                if let Err(e) = handle.await {
                    warn!(error = %e, "deferred worker start failed");
                }
            }
        };

        tokio::select! {
            biased;
            _ = wait => Ok(()),
            _ = ctx.cancelled() => Err(SchedulerError::Cancelled),
        }
    }

    /// [`Scheduler::reconcile`] bounded by a timeout instead of a token.
    pub async fn reconcile_timeout<I>(&self, tasks: I, timeout: Duration) -> Result<(), SchedulerError>
    where
        I: IntoIterator<Item = T>,
    {
        let ctx = CancellationToken::new();
        match tokio::time::timeout(timeout, self.reconcile(tasks, &ctx)).await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::DeadlineExceeded(timeout)),
        }
    }

    /// Tasks that are currently desired, including ones whose worker exited
    /// by itself and ones waiting for a predecessor to stop. Tasks being torn
    /// down are not listed.
    pub fn active_tasks(&self) -> Vec<T>
    where
        T: Clone,
    {
        let state = self.inner.lock();
        let running = state
            .workers
            .iter()
            .filter(|(_, slot)| !slot.is_stopping())
            .map(|(task, _)| task.clone());
        let waiting = state.deferred.iter().map(|(task, _)| task.clone());
        running.chain(waiting).collect()
    }

    /// Every worker instance still held by the scheduler, including those
    /// that are shutting down.
    pub fn active_workers(&self) -> Vec<Arc<W>> {
        self.inner
            .lock()
            .workers
            .iter()
            .map(|(_, slot)| Arc::clone(&slot.worker))
            .collect()
    }

    pub fn worker_states(&self) -> Vec<(T, WorkerState)>
    where
        T: Clone,
    {
        self.inner
            .lock()
            .workers
            .iter()
            .map(|(task, slot)| (task.clone(), slot.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Cancel every worker and wait for all of them to exit.
    ///
    /// Idempotent. Afterwards [`Scheduler::reconcile`] fails with
    /// [`SchedulerError::Closed`].
    pub async fn shutdown(&self) {
        let exits: Vec<CancellationToken> = {
            let mut state = self.inner.lock();
            self.inner.root.cancel();
            state.deferred = TaskSet::new();
            state.workers.iter().map(|(_, slot)| slot.exited()).collect()
        };
        debug!(workers = exits.len(), "shutting down scheduler");

        for exited in exits {
            exited.cancelled().await;
        }

        let drained: Vec<_> = self.inner.lock().workers.drain().collect();
        for (_, slot) in drained {
            slot.released().cancel();
        }
    }
}

impl<T: Task, W: Worker> Inner<T, W> {
    fn lock(&self) -> MutexGuard<'_, State<T, W>> {
        // Critical sections never leave the table half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Diff `desired` against the table and act on it under the lock.
    fn apply(this: &Arc<Self>, desired: TaskSet<T>) -> Result<Pending, SchedulerError> {
        let mut state = this.lock();
        if this.root.is_cancelled() {
            return Err(SchedulerError::Closed);
        }
        state.deferred = TaskSet::new();

        let mut pending = Pending {
            released: Vec::new(),
            deferred: Vec::new(),
        };

        let mut stale = 0usize;
        for (task, slot) in state.workers.iter_mut() {
            if desired.contains(task) {
                continue;
            }
            if slot.stop() {
                stale += 1;
                debug!(hash = task.hash_key(), id = slot.id, "stopping worker");
                Self::spawn_reaper(this, task.hash_key(), slot);
            }
            pending.released.push(slot.released());
        }

        let mut started = 0usize;
        for (task, ()) in desired {
            match state.workers.get(&task) {
                None => {
                    this.launch(&mut state, task);
                    started += 1;
                }
                Some(slot) if slot.is_stopping() => {
                    let released = slot.released();
                    state.next_id += 1;
                    let ticket = state.next_id;
                    let hash = task.hash_key();
                    state.deferred.insert(task, ticket);
                    pending
                        .deferred
                        .push(Self::spawn_deferred(this, hash, ticket, released));
                }
                Some(_) => {}
            }
        }

        trace!(
            stale,
            started,
            deferred = state.deferred.len(),
            running = state.workers.len(),
            "reconcile applied"
        );
        Ok(pending)
    }

    fn launch(&self, state: &mut State<T, W>, task: T) {
        state.next_id += 1;
        let id = state.next_id;
        let worker = (self.factory)(&task);
        let slot = ScheduledWorker::launch(id, worker, &self.root);
        debug!(hash = task.hash_key(), id, "started worker");
        state.workers.insert(task, slot);
    }

    /// Wait for the worker to exit, then drop its slot and signal `released`.
    fn spawn_reaper(this: &Arc<Self>, hash: u64, slot: &ScheduledWorker<W>) {
        let inner = Arc::clone(this);
        let id = slot.id;
        let exited = slot.exited();
        let released = slot.released();
        tokio::spawn(async move {
            exited.cancelled().await;
            inner.release(hash, id);
            released.cancel();
        });
    }

    fn release(&self, hash: u64, id: u64) {
        let removed = self
            .lock()
            .workers
            .remove_where(hash, |_, slot| slot.id == id);
        if removed.is_some() {
            debug!(hash, id, "worker exited");
        }
    }

    /// Start the deferred task holding `ticket` once its stopping predecessor
    /// has been released. Nothing happens if a later reconcile or shutdown
    /// dropped the ticket in the meantime.
    fn spawn_deferred(
        this: &Arc<Self>,
        hash: u64,
        ticket: u64,
        predecessor: CancellationToken,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(this);
        tokio::spawn(async move {
            predecessor.cancelled().await;
            let mut state = inner.lock();
            let Some((task, _)) = state.deferred.remove_where(hash, |_, t| *t == ticket) else {
                return;
            };
            if inner.root.is_cancelled() || state.workers.contains(&task) {
                return;
            }
            inner.launch(&mut state, task);
        })
    }
}

impl<T, W> Drop for Inner<T, W> {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
