//! On-disk form of the positions table.
use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{
    Deserialize, Deserializer, Serialize,
    de::{self, Visitor},
};
use tracing::{info, warn};

use crate::{entry::Entry, error::PositionsError};

/// Permission bits of every written positions file.
#[cfg(unix)]
const FILE_MODE: u32 = 0o644;

pub(crate) type Table = HashMap<Entry, String>;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PositionsFile {
    #[serde(default)]
    positions: Option<HashMap<Entry, Offset>>,
}

/// Older layout, keyed by path alone.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LegacyPositionsFile {
    #[serde(default)]
    positions: Option<HashMap<String, Offset>>,
}

#[derive(Serialize)]
struct PositionsFileRef<'a> {
    positions: BTreeMap<&'a Entry, &'a str>,
}

/// Offset as found on disk: normally a quoted string, but hand-edited and
/// legacy files may carry bare integers.
struct Offset(String);

impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OffsetVisitor;

        impl Visitor<'_> for OffsetVisitor {
            type Value = Offset;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an offset string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Offset, E> {
                Ok(Offset(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Offset, E> {
                Ok(Offset(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Offset, E> {
                Ok(Offset(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Offset, E> {
                Ok(Offset(v.to_string()))
            }
        }

        deserializer.deserialize_any(OffsetVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    Current,
    Legacy,
}

/// Parse a positions document in either layout.
///
/// A blank document is an empty table. When neither layout fits, the error
/// from the current layout is returned.
pub(crate) fn decode(buf: &str) -> Result<(Table, Layout), serde_yaml::Error> {
    if buf.trim().is_empty() {
        return Ok((Table::new(), Layout::Current));
    }

    let err = match serde_yaml::from_str::<PositionsFile>(buf) {
        Ok(file) => {
            let table = file
                .positions
                .unwrap_or_default()
                .into_iter()
                .map(|(entry, offset)| (entry, offset.0))
                .collect();
            return Ok((table, Layout::Current));
        }
        Err(err) => err,
    };

    match serde_yaml::from_str::<LegacyPositionsFile>(buf) {
        Ok(file) => {
            let table = file
                .positions
                .unwrap_or_default()
                .into_iter()
                .map(|(path, offset)| (Entry::new(path, ""), offset.0))
                .collect();
            Ok((table, Layout::Legacy))
        }
        Err(_) => Err(err),
    }
}

pub(crate) fn encode(table: &Table) -> Result<String, serde_yaml::Error> {
    let file = PositionsFileRef {
        positions: table
            .iter()
            .map(|(entry, offset)| (entry, offset.as_str()))
            .collect(),
    };
    serde_yaml::to_string(&file)
}

/// Load the table stored at `path`, along with the layout it was found in.
///
/// A missing file is an empty table. An unparseable one is an error unless
/// `ignore_invalid` is set, in which case it is treated as empty.
pub(crate) fn read_positions_file(
    path: &Path,
    ignore_invalid: bool,
) -> Result<(Table, Layout), PositionsError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Table::new(), Layout::Current)),
        Err(source) => {
            return Err(PositionsError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if meta.is_dir() {
        return Err(PositionsError::IsDirectory {
            path: path.to_path_buf(),
        });
    }

    let buf = fs::read_to_string(path).map_err(|source| PositionsError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    match decode(&buf) {
        Ok((table, Layout::Legacy)) => {
            info!(path = %path.display(), entries = table.len(), "read legacy positions file");
            Ok((table, Layout::Legacy))
        }
        Ok(decoded) => Ok(decoded),
        Err(e) if ignore_invalid => {
            warn!(path = %path.display(), error = %e, "ignoring invalid positions file");
            Ok((Table::new(), Layout::Current))
        }
        Err(source) => Err(PositionsError::InvalidYaml {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Serialise `table` and atomically replace `path` with it.
pub(crate) fn write_positions_file(path: &Path, table: &Table) -> Result<(), PositionsError> {
    let buf = encode(table)?;
    replace_file(path, buf.as_bytes()).map_err(|source| PositionsError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `buf` to a temporary file next to `path`, then rename it over `path`.
///
/// Readers see either the old or the new content, never a prefix. Where
/// rename cannot replace an existing file, `persist` falls back to the
/// platform's replace-existing move.
fn replace_file(path: &Path, buf: &[u8]) -> io::Result<()> {
    let dir = parent_dir(path);
    let mut tmp = tempfile::Builder::new()
        .prefix(".positions")
        .suffix(".tmp")
        .tempfile_in(&dir)?;

    tmp.write_all(buf)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(FILE_MODE))?;
    }

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
