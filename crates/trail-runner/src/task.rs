use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use fnv::FnvHasher;
use tokio_util::sync::CancellationToken;

/// Identity of one unit of scheduled work.
///
/// Tasks are rebuilt from scratch on every discovery cycle, so identity is
/// decided by value: `hash_key` picks the bucket and `equals` settles
/// collisions. Two tasks that are `equals` must return the same `hash_key`.
pub trait Task: Send + Sync + 'static {
    fn hash_key(&self) -> u64;
    fn equals(&self, other: &Self) -> bool;
}

/// Long-running business logic for a single [`Task`].
///
/// `run` must return soon after `cancel` fires. The scheduler has no way to
/// forcibly stop a worker, so one that ignores cancellation stalls every
/// reconcile or shutdown waiting on it.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn run(&self, cancel: CancellationToken);
}

/// Stable 64-bit FNV-1a hash of `value`, for deriving [`Task::hash_key`].
pub fn hash_of<H: Hash + ?Sized>(value: &H) -> u64 {
    let mut hasher = FnvHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}
