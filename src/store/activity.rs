use std::io::Write;
use std::path::PathBuf;

use crate::error::SyncError;
use crate::model::priority::ActivityEntry;

/// Append-only JSONL trail of sync and import records.
pub struct ActivityLog {
    path: PathBuf,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, entry: &ActivityEntry) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Entries for `task_id` (or all tasks), oldest first, keeping the last `limit`.
    pub fn read(&self, task_id: Option<&str>, limit: Option<usize>) -> Vec<ActivityEntry> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let mut entries: Vec<ActivityEntry> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .filter(|e: &ActivityEntry| task_id.map_or(true, |id| e.task_id == id))
            .collect();

        if let Some(limit) = limit {
            let len = entries.len();
            if len > limit {
                entries = entries.split_off(len - limit);
            }
        }

        entries
    }
}

pub fn new_entry(task_id: &str, actor: &str, action: &str, changes: Vec<String>) -> ActivityEntry {
    ActivityEntry {
        timestamp: chrono::Utc::now(),
        task_id: task_id.to_string(),
        actor: actor.to_string(),
        action: action.to_string(),
        changes,
    }
}
