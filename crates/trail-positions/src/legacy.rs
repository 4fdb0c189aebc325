use std::path::Path;

use tracing::info;

use crate::{error::PositionsError, file};

/// Convert a positions file written by an older agent into the current
/// layout at `new_path`.
///
/// Does nothing when `new_path` already exists or `legacy_path` does not.
/// The legacy file is never modified. Returns whether a file was written.
pub fn migrate_legacy_file(legacy_path: &Path, new_path: &Path) -> Result<bool, PositionsError> {
    if new_path.exists() || !legacy_path.is_file() {
        return Ok(false);
    }

    let (table, _) = file::read_positions_file(legacy_path, false)?;
    file::write_positions_file(new_path, &table)?;

    info!(
        legacy = %legacy_path.display(),
        path = %new_path.display(),
        entries = table.len(),
        "migrated legacy positions file"
    );
    Ok(true)
}
