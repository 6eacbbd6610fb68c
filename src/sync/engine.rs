use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use super::executor::{Executor, HoursMap, SyncResult};
use super::preview::{build_preview, SyncPreview};
use crate::config::SyncConfig;
use crate::error::{GatewayError, OrphanSide, SyncError};
use crate::model::link::Link;
use crate::model::priority::{ChecklistItem, Priority};
use crate::model::work_item::RemoteWorkItem;
use crate::providers::Provider;
use crate::store::activity::new_entry;
use crate::store::links::LinkStore;
use crate::store::tasks::TaskRepository;
use crate::translate::StateTranslator;

/// Per-link outcome of a batch run.
#[derive(Debug)]
pub struct BatchOutcome {
    pub task_id: String,
    pub work_item_id: u64,
    pub result: Result<SyncResult, SyncError>,
}

type LockMap = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Held for the duration of one sync or import. Dropping the last holder
/// evicts the key from the map.
struct KeyLock<'a> {
    locks: &'a LockMap,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        if locks.get(&self.key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.key);
        }
    }
}

/// Entry point the surrounding application talks to.
pub struct SyncEngine {
    config: SyncConfig,
    translator: StateTranslator,
    provider: Arc<dyn Provider>,
    tasks: Arc<dyn TaskRepository>,
    links: Arc<LinkStore>,
    locks: LockMap,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        provider: Arc<dyn Provider>,
        tasks: Arc<dyn TaskRepository>,
        links: Arc<LinkStore>,
    ) -> Result<Self, SyncError> {
        if !config.sync_enabled {
            return Err(SyncError::SyncDisabled);
        }
        let translator = StateTranslator::new(&config.state_mapping);
        Ok(Self {
            config,
            translator,
            provider,
            tasks,
            links,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Serializes syncs of one key; different keys proceed in parallel.
    async fn lock(&self, key: &str) -> KeyLock<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        KeyLock {
            locks: &self.locks,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn executor(&self) -> Executor<'_> {
        Executor {
            provider: self.provider.as_ref(),
            tasks: self.tasks.as_ref(),
            links: self.links.as_ref(),
            actor: self.config.actor(),
        }
    }

    pub async fn compute_preview(&self, task_id: &str) -> Result<SyncPreview, SyncError> {
        let Some(link) = self.links.get(task_id) else {
            return Err(match self.tasks.get(task_id)? {
                Some(_) => SyncError::NotLinked {
                    task_id: task_id.to_string(),
                },
                None => SyncError::TaskNotFound {
                    task_id: task_id.to_string(),
                },
            });
        };

        let task = self
            .tasks
            .get(task_id)?
            .ok_or_else(|| SyncError::OrphanedLink {
                task_id: task_id.to_string(),
                work_item_id: link.work_item_id,
                side: OrphanSide::Local,
            })?;

        if !link.points_at(&self.config.organization, &self.config.project, link.work_item_id) {
            return Err(SyncError::InvalidConfig(format!(
                "task {task_id} is linked in {}/{}, but this installation syncs {}/{}",
                link.organization, link.project, self.config.organization, self.config.project
            )));
        }

        let mut sharing: Vec<String> = self
            .links
            .find_by_work_item(&link.organization, &link.project, link.work_item_id)
            .into_iter()
            .map(|l| l.task_id)
            .collect();
        if sharing.len() > 1 {
            sharing.sort();
            return Err(SyncError::DuplicateLink {
                work_item_id: link.work_item_id,
                task_ids: sharing,
            });
        }

        let remote = match self.provider.fetch_work_item(link.work_item_id).await {
            Ok(remote) => remote,
            Err(GatewayError::NotFound { id }) => {
                return Err(SyncError::OrphanedLink {
                    task_id: task_id.to_string(),
                    work_item_id: id,
                    side: OrphanSide::Remote,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let children = self.provider.fetch_children_of(&remote).await;
        let comment_links = self.provider.fetch_comment_links(link.work_item_id).await;

        let preview = build_preview(&task, &link, &remote, &children, comment_links, &self.translator);
        tracing::debug!(
            task_id,
            work_item_id = link.work_item_id,
            has_changes = preview.has_changes,
            hours_required = preview.hours_required().len(),
            "preview computed"
        );
        Ok(preview)
    }

    /// Apply a preview the caller already showed to a human. Rejected with
    /// `StaleLink` if the link moved since the preview was built.
    pub async fn apply_preview(&self, preview: &SyncPreview, hours: &HoursMap) -> Result<SyncResult, SyncError> {
        let _lock = self.lock(&preview.task_id).await;
        self.executor().apply(preview, hours).await
    }

    pub async fn execute_sync(&self, task_id: &str, hours: &HoursMap) -> Result<SyncResult, SyncError> {
        let _lock = self.lock(task_id).await;
        let preview = self.compute_preview(task_id).await?;
        self.executor().apply(&preview, hours).await
    }

    pub async fn import_as_new_task(&self, work_item_id: u64) -> Result<(String, Link), SyncError> {
        let _lock = self.lock(&format!("work-item:{work_item_id}")).await;

        let existing =
            self.links
                .find_by_work_item(&self.config.organization, &self.config.project, work_item_id);
        if !existing.is_empty() {
            return Err(SyncError::AlreadyLinked(format!("work item #{work_item_id}")));
        }

        let remote = self.provider.fetch_work_item(work_item_id).await?;
        let children = self.provider.fetch_children_of(&remote).await;
        let task = self.task_from_remote(&remote, &children);
        let task_id = task.id.clone();
        self.tasks.insert(task)?;

        let link = Link::new(
            &task_id,
            work_item_id,
            &self.config.organization,
            &self.config.project,
            &remote.state,
        );
        let link = match self.links.insert(link) {
            Ok(link) => link,
            Err(e) => {
                if let Err(cleanup) = self.tasks.delete(&task_id) {
                    tracing::warn!(task_id, error = %cleanup, "could not remove task after failed link");
                }
                return Err(e);
            }
        };

        self.tasks.append_activity(&new_entry(
            &task_id,
            self.config.actor(),
            "azure-devops-import",
            vec![format!("Imported from work item #{work_item_id}: {}", remote.title)],
        ))?;
        tracing::info!(task_id, work_item_id, children = children.len(), "imported work item");
        Ok((task_id, link))
    }

    fn task_from_remote(&self, remote: &RemoteWorkItem, children: &[RemoteWorkItem]) -> Priority {
        let mut task = Priority::new(remote.title.clone(), self.config.actor());
        task.description = remote.description.clone();
        task.status = self.translator.remote_to_local(&remote.state);
        task.checklist = children
            .iter()
            .map(|child| {
                let completed = self.translator.is_closed(&child.state);
                ChecklistItem {
                    text: child.title.clone(),
                    completed,
                    completed_hours: child.completed_work.filter(|_| completed),
                }
            })
            .collect();
        task
    }

    /// Sync every link in turn. One link failing never stops the batch.
    pub async fn sync_all(&self, hours: &HoursMap) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::new();
        for link in self.links.all() {
            let result = self.execute_sync(&link.task_id, hours).await;
            if let Err(e) = &result {
                tracing::warn!(task_id = %link.task_id, error = %e, "sync failed");
            }
            outcomes.push(BatchOutcome {
                task_id: link.task_id,
                work_item_id: link.work_item_id,
                result,
            });
        }
        outcomes
    }

    pub async fn assigned(&self) -> Result<Vec<RemoteWorkItem>, SyncError> {
        Ok(self
            .provider
            .fetch_assigned_work_items(&self.config.identity)
            .await?)
    }
}
