use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::activity::ActivityLog;
use super::write_json_atomic;
use crate::error::SyncError;
use crate::model::priority::{ActivityEntry, Priority};

/// The surrounding CRUD system's view of local tasks. The sync engine only
/// reads and writes tasks through this seam.
pub trait TaskRepository: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Priority>, SyncError>;
    fn list(&self) -> Result<Vec<Priority>, SyncError>;
    fn insert(&self, task: Priority) -> Result<(), SyncError>;
    fn update(&self, task: &Priority) -> Result<(), SyncError>;
    fn delete(&self, id: &str) -> Result<bool, SyncError>;
    fn append_activity(&self, entry: &ActivityEntry) -> Result<(), SyncError>;
    fn activity(&self, task_id: &str) -> Result<Vec<ActivityEntry>, SyncError>;
}

/// File-backed repository: `tasks.json` plus an `activity.jsonl` trail.
pub struct JsonTaskStore {
    path: PathBuf,
    log: ActivityLog,
    tasks: Mutex<BTreeMap<String, Priority>>,
}

impl JsonTaskStore {
    pub fn open(dir: &Path) -> Result<Self, SyncError> {
        let path = dir.join("tasks.json");
        let tasks = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            log: ActivityLog::new(dir.join("activity.jsonl")),
            tasks: Mutex::new(tasks),
        })
    }

    fn tasks(&self) -> MutexGuard<'_, BTreeMap<String, Priority>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskRepository for JsonTaskStore {
    fn get(&self, id: &str) -> Result<Option<Priority>, SyncError> {
        Ok(self.tasks().get(id).cloned())
    }

    fn list(&self) -> Result<Vec<Priority>, SyncError> {
        let mut tasks: Vec<Priority> = self.tasks().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    fn insert(&self, task: Priority) -> Result<(), SyncError> {
        let mut tasks = self.tasks();
        let id = task.id.clone();
        tasks.insert(id.clone(), task);
        if let Err(e) = write_json_atomic(&self.path, &*tasks) {
            tasks.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    fn update(&self, task: &Priority) -> Result<(), SyncError> {
        let mut tasks = self.tasks();
        let Some(previous) = tasks.insert(task.id.clone(), task.clone()) else {
            tasks.remove(&task.id);
            return Err(SyncError::TaskNotFound {
                task_id: task.id.clone(),
            });
        };
        if let Err(e) = write_json_atomic(&self.path, &*tasks) {
            tasks.insert(task.id.clone(), previous);
            return Err(e);
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, SyncError> {
        let mut tasks = self.tasks();
        let Some(removed) = tasks.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = write_json_atomic(&self.path, &*tasks) {
            tasks.insert(id.to_string(), removed);
            return Err(e);
        }
        Ok(true)
    }

    fn append_activity(&self, entry: &ActivityEntry) -> Result<(), SyncError> {
        self.log.append(entry)
    }

    fn activity(&self, task_id: &str) -> Result<Vec<ActivityEntry>, SyncError> {
        Ok(self.log.read(Some(task_id), None))
    }
}
