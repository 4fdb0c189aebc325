//! Hash-keyed task lookup.
//!
//! Tasks are bucketed by [`Task::hash_key`] and resolved inside a bucket with
//! [`Task::equals`], so two separately constructed tasks with the same value
//! land on the same entry.
use std::collections::HashMap;

use crate::task::Task;

pub struct TaskSet<T, V = ()> {
    buckets: HashMap<u64, Vec<(T, V)>>,
    len: usize,
}

impl<T, V> TaskSet<T, V> {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&T, &V)> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.iter().map(|(t, v)| (t, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&T, &mut V)> {
        self.buckets
            .values_mut()
            .flat_map(|bucket| bucket.iter_mut().map(|(t, v)| (&*t, v)))
    }

    /// Remove every entry, leaving the set empty.
    pub fn drain(&mut self) -> impl Iterator<Item = (T, V)> + '_ {
        self.len = 0;
        self.buckets.drain().flat_map(|(_, bucket)| bucket)
    }

    /// Remove the first entry in bucket `hash` accepted by `pred`.
    ///
    /// Lets a caller that only kept the hash and some property of the value
    /// (rather than the task itself) find its entry again.
    pub fn remove_where<F>(&mut self, hash: u64, mut pred: F) -> Option<(T, V)>
    where
        F: FnMut(&T, &V) -> bool,
    {
        let bucket = self.buckets.get_mut(&hash)?;
        let pos = bucket.iter().position(|(t, v)| pred(t, v))?;
        let entry = bucket.swap_remove(pos);
        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        self.len -= 1;
        Some(entry)
    }
}

impl<T: Task, V> TaskSet<T, V> {
    /// Insert `task` unless an equal task is already present.
    ///
    /// Returns `false` (dropping `task` and `value`) on a duplicate.
    pub fn insert(&mut self, task: T, value: V) -> bool {
        let bucket = self.buckets.entry(task.hash_key()).or_default();
        if bucket.iter().any(|(t, _)| t.equals(&task)) {
            return false;
        }
        bucket.push((task, value));
        self.len += 1;
        true
    }

    pub fn contains(&self, task: &T) -> bool {
        self.get(task).is_some()
    }

    pub fn get(&self, task: &T) -> Option<&V> {
        self.buckets
            .get(&task.hash_key())?
            .iter()
            .find(|(t, _)| t.equals(task))
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, task: &T) -> Option<&mut V> {
        self.buckets
            .get_mut(&task.hash_key())?
            .iter_mut()
            .find(|(t, _)| t.equals(task))
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, task: &T) -> Option<(T, V)> {
        self.remove_where(task.hash_key(), |t, _| t.equals(task))
    }
}

impl<T, V> Default for TaskSet<T, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Task> FromIterator<T> for TaskSet<T, ()> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = TaskSet::new();
        for task in iter {
            set.insert(task, ());
        }
        set
    }
}

impl<T, V> IntoIterator for TaskSet<T, V> {
    type Item = (T, V);
    type IntoIter = std::iter::Flatten<std::collections::hash_map::IntoValues<u64, Vec<(T, V)>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.buckets.into_values().flatten()
    }
}
