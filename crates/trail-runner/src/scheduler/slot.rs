use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::task::Worker;

/// Observable lifecycle of a scheduled worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// `run` is executing and the task is still desired.
    Running,
    /// Cancellation was requested; waiting for `run` to return.
    Stopping,
    /// `run` returned on its own. The slot stays until a reconcile drops the task.
    Exited,
}

/// One running worker bound to one task.
///
/// `exited` fires once `run` has returned (or unwound), `released` fires once
/// the slot has been taken out of the scheduler's table. A new worker for an
/// equal task is only ever started after `released`.
pub(crate) struct ScheduledWorker<W> {
    pub(crate) id: u64,
    pub(crate) worker: Arc<W>,
    cancel: CancellationToken,
    exited: CancellationToken,
    released: CancellationToken,
    stopping: bool,
}

impl<W: Worker> ScheduledWorker<W> {
    /// Spawn `worker` on the current runtime under a child of `parent`.
    pub(crate) fn launch(id: u64, worker: W, parent: &CancellationToken) -> Self {
        let worker = Arc::new(worker);
        let cancel = parent.child_token();
        let exited = CancellationToken::new();

        let run_worker = Arc::clone(&worker);
        let run_cancel = cancel.clone();
        let exit_guard = exited.clone().drop_guard();
        tokio::spawn(async move {
            // Dropped on return and on panic alike.
            let _exit_guard = exit_guard;
            run_worker.run(run_cancel).await;
        });

        Self {
            id,
            worker,
            cancel,
            exited,
            released: CancellationToken::new(),
            stopping: false,
        }
    }
}

impl<W> ScheduledWorker<W> {
    /// Request cancellation. Returns `false` if it was already requested.
    pub(crate) fn stop(&mut self) -> bool {
        if self.stopping {
            return false;
        }
        self.stopping = true;
        self.cancel.cancel();
        true
    }

    #[inline]
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub(crate) fn state(&self) -> WorkerState {
        if self.exited.is_cancelled() {
            WorkerState::Exited
        } else if self.stopping {
            WorkerState::Stopping
        } else {
            WorkerState::Running
        }
    }

    #[inline]
    pub(crate) fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    #[inline]
    pub(crate) fn released(&self) -> CancellationToken {
        self.released.clone()
    }
}
