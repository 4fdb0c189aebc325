//! Keeps a set of long-running workers in step with a changing list of tasks.
//!
//! A [`Scheduler`] is handed the full desired task list on every discovery
//! cycle. It starts a [`Worker`] for every task it has not seen yet, cancels
//! workers whose task disappeared, and never lets two workers run for tasks
//! that compare equal.
//!
//! ```no_run
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//! use trail_runner::{Scheduler, Task, Worker, hash_of};
//!
//! #[derive(Clone, PartialEq)]
//! struct Tail(String);
//!
//! impl Task for Tail {
//!     fn hash_key(&self) -> u64 {
//!         hash_of(&self.0)
//!     }
//!     fn equals(&self, other: &Self) -> bool {
//!         self == other
//!     }
//! }
//!
//! struct Tailer(String);
//!
//! #[async_trait]
//! impl Worker for Tailer {
//!     async fn run(&self, cancel: CancellationToken) {
//!         cancel.cancelled().await;
//!     }
//! }
//!
//! # async fn demo() -> Result<(), trail_runner::SchedulerError> {
//! let scheduler = Scheduler::new(|t: &Tail| Tailer(t.0.clone()));
//! scheduler
//!     .reconcile(vec![Tail("/var/log/syslog".into())], &CancellationToken::new())
//!     .await?;
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```
mod error;
pub use error::SchedulerError;

mod task;
pub use task::{Task, Worker, hash_of};

pub mod set;
pub use set::TaskSet;

mod scheduler;
pub use scheduler::{Scheduler, WorkerState};
