use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::write_json_atomic;
use crate::error::SyncError;
use crate::model::link::Link;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LinkData {
    /// Keyed by task id, which is what makes a link unique per task.
    #[serde(default)]
    links: BTreeMap<String, Link>,
}

/// Persistent task ↔ work item mapping, kept as a JSON document.
pub struct LinkStore {
    path: PathBuf,
    data: Mutex<LinkData>,
}

impl LinkStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            LinkData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn data(&self) -> MutexGuard<'_, LinkData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, task_id: &str) -> Option<Link> {
        self.data().links.get(task_id).cloned()
    }

    pub fn all(&self) -> Vec<Link> {
        self.data().links.values().cloned().collect()
    }

    pub fn find_by_work_item(&self, organization: &str, project: &str, work_item_id: u64) -> Vec<Link> {
        self.data()
            .links
            .values()
            .filter(|l| l.points_at(organization, project, work_item_id))
            .cloned()
            .collect()
    }

    pub fn insert(&self, link: Link) -> Result<Link, SyncError> {
        let mut data = self.data();
        if data.links.contains_key(&link.task_id) {
            return Err(SyncError::AlreadyLinked(format!("task {}", link.task_id)));
        }
        data.links.insert(link.task_id.clone(), link.clone());
        if let Err(e) = write_json_atomic(&self.path, &*data) {
            data.links.remove(&link.task_id);
            return Err(e);
        }
        tracing::debug!(task_id = %link.task_id, work_item_id = link.work_item_id, "link created");
        Ok(link)
    }

    /// Move the link to `state`, provided nobody advanced it since `expected_revision`.
    /// Clears any pending changes, which the caller has just audited.
    pub fn advance(
        &self,
        task_id: &str,
        expected_revision: u64,
        state: &str,
        at: DateTime<Utc>,
    ) -> Result<Link, SyncError> {
        let mut data = self.data();
        let stale = || SyncError::StaleLink {
            task_id: task_id.to_string(),
        };
        let previous = data.links.get(task_id).cloned().ok_or_else(stale)?;
        if previous.revision != expected_revision {
            return Err(stale());
        }

        let next = Link {
            last_synced_state: state.to_string(),
            last_synced_at: at,
            revision: previous.revision + 1,
            pending_changes: Vec::new(),
            ..previous.clone()
        };
        data.links.insert(task_id.to_string(), next.clone());
        if let Err(e) = write_json_atomic(&self.path, &*data) {
            data.links.insert(task_id.to_string(), previous);
            return Err(e);
        }
        Ok(next)
    }

    /// Remember changes a partial sync applied, without advancing the link.
    pub fn defer(&self, task_id: &str, expected_revision: u64, changes: &[String]) -> Result<Link, SyncError> {
        let mut data = self.data();
        let stale = || SyncError::StaleLink {
            task_id: task_id.to_string(),
        };
        let previous = data.links.get(task_id).cloned().ok_or_else(stale)?;
        if previous.revision != expected_revision {
            return Err(stale());
        }

        let mut next = previous.clone();
        for change in changes {
            if !next.pending_changes.contains(change) {
                next.pending_changes.push(change.clone());
            }
        }
        data.links.insert(task_id.to_string(), next.clone());
        if let Err(e) = write_json_atomic(&self.path, &*data) {
            data.links.insert(task_id.to_string(), previous);
            return Err(e);
        }
        Ok(next)
    }

    /// Manual clear, mostly for orphaned links. Needs no remote access.
    pub fn unlink(&self, task_id: &str) -> Result<Link, SyncError> {
        let link = self.remove(task_id)?.ok_or_else(|| SyncError::NotLinked {
            task_id: task_id.to_string(),
        })?;
        tracing::info!(task_id, work_item_id = link.work_item_id, "link removed");
        Ok(link)
    }

    pub fn remove(&self, task_id: &str) -> Result<Option<Link>, SyncError> {
        let mut data = self.data();
        let Some(removed) = data.links.remove(task_id) else {
            return Ok(None);
        };
        if let Err(e) = write_json_atomic(&self.path, &*data) {
            data.links.insert(task_id.to_string(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }
}
