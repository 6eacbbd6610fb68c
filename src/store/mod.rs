pub mod activity;
pub mod links;
pub mod tasks;

use std::path::Path;

use serde::Serialize;

use crate::error::SyncError;

/// Write JSON next to `path` and rename over it, so a crash never leaves a
/// half-written store behind.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
