use std::collections::BTreeMap;

use trail_runner::{Task, hash_of};

/// One file to tail, identified by its path and rendered label set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTarget {
    pub path: String,
    pub labels: String,
}

impl FileTarget {
    pub fn new(path: impl Into<String>, labels: &BTreeMap<String, String>) -> Self {
        Self {
            path: path.into(),
            labels: render_labels(labels),
        }
    }
}

impl Task for FileTarget {
    fn hash_key(&self) -> u64 {
        hash_of(&(self.path.as_str(), self.labels.as_str()))
    }

    fn equals(&self, other: &Self) -> bool {
        self == other
    }
}

/// Render labels as `{a="1", b="2"}`, sorted by name. The empty set is `{}`.
pub fn render_labels(labels: &BTreeMap<String, String>) -> String {
    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v:?}")).collect();
    format!("{{{}}}", pairs.join(", "))
}
