use serde::{Deserialize, Deserializer, Serialize};

const CURSOR_PREFIX: &str = "cursor-";

/// Key of one stored offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Entry {
    pub path: String,
    /// Rendered label set. A missing or null field reads back as `""`.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub labels: String,
}

impl Entry {
    pub fn new(path: impl Into<String>, labels: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            labels: labels.into(),
        }
    }
}

/// Synthetic path for sources that have no file of their own, such as an
/// API cursor or a watch stream.
pub fn cursor_key(identity: &str) -> String {
    format!("{CURSOR_PREFIX}{identity}")
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
