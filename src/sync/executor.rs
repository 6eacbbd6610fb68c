use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::correlate;
use super::preview::{Direction, SyncPreview};
use crate::error::{OrphanSide, SyncError};
use crate::model::priority::{ChecklistItem, PriorityStatus};
use crate::providers::Provider;
use crate::store::activity::new_entry;
use crate::store::links::LinkStore;
use crate::store::tasks::TaskRepository;
use crate::translate::StateTranslator;

/// Hours worked, keyed by remote child id.
pub type HoursMap = HashMap<u64, f64>;

pub const SYNC_ACTION: &str = "azure-devops-sync";

/// Outcome of one sync, reported per half so a retriable partial state is
/// distinguishable from a complete one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncResult {
    /// The local task was written.
    pub local_applied: bool,
    /// The remote half landed and the link advanced.
    pub remote_applied: bool,
    pub from_remote: Vec<String>,
    pub to_remote: Vec<String>,
    /// Best-effort child writes that did not land.
    pub skipped: Vec<String>,
    /// Changes applied by an earlier partial run, audited with this one.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub carried: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_error: Option<String>,
}

impl SyncResult {
    pub fn is_noop(&self) -> bool {
        !self.local_applied && !self.remote_applied && self.remote_error.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.remote_applied
    }

    pub fn is_partial(&self) -> bool {
        self.remote_error.is_some()
    }

    pub fn applied_count(&self) -> usize {
        self.from_remote.len() + self.to_remote.len()
    }

    /// Everything the audit record lists, earlier partial runs first.
    fn audit_changes(&self) -> Vec<String> {
        let mut changes = self.carried.clone();
        let current = self
            .from_remote
            .iter()
            .chain(&self.to_remote)
            .cloned()
            .chain(self.skipped.iter().map(|s| format!("Skipped: {s}")));
        for change in current {
            if !changes.contains(&change) {
                changes.push(change);
            }
        }
        changes
    }
}

pub struct Executor<'a> {
    pub provider: &'a dyn Provider,
    pub tasks: &'a dyn TaskRepository,
    pub links: &'a LinkStore,
    pub actor: &'a str,
}

impl Executor<'_> {
    pub async fn apply(&self, preview: &SyncPreview, hours: &HoursMap) -> Result<SyncResult, SyncError> {
        let link = self
            .links
            .get(&preview.task_id)
            .ok_or_else(|| SyncError::NotLinked {
                task_id: preview.task_id.clone(),
            })?;
        if !preview.has_changes && link.pending_changes.is_empty() {
            tracing::debug!(task_id = %preview.task_id, "nothing to sync");
            return Ok(SyncResult::default());
        }

        validate_hours(preview, hours)?;
        if link.revision != preview.link_revision {
            return Err(SyncError::StaleLink {
                task_id: preview.task_id.clone(),
            });
        }

        let now = Utc::now();
        let mut result = SyncResult {
            local_applied: self.apply_local(preview, hours, now)?,
            from_remote: preview.from_remote.changes.clone(),
            to_remote: preview.to_remote.changes.clone(),
            carried: link.pending_changes.clone(),
            ..SyncResult::default()
        };

        // Children go first: once the local checklist is closed a retry no
        // longer sees them, so their hours must not wait on the parent.
        result.skipped = self.apply_children(preview, hours).await;

        if let Some(state) = &preview.target_remote_state {
            if let Err(e) = self.provider.patch_state(preview.work_item_id, state).await {
                tracing::warn!(
                    task_id = %preview.task_id,
                    work_item_id = preview.work_item_id,
                    error = %e,
                    "remote write failed; local changes kept, link not advanced"
                );
                result.remote_error = Some(e.to_string());
                let landed = landed_changes(preview, &result.skipped);
                if !landed.is_empty() {
                    self.links.defer(&preview.task_id, preview.link_revision, &landed)?;
                }
                return Ok(result);
            }
        }
        result.remote_applied = true;

        let synced_state = preview
            .target_remote_state
            .clone()
            .unwrap_or_else(|| preview.remote_state.clone());
        self.links
            .advance(&preview.task_id, preview.link_revision, &synced_state, now)?;

        self.tasks.append_activity(&new_entry(
            &preview.task_id,
            self.actor,
            SYNC_ACTION,
            result.audit_changes(),
        ))?;

        tracing::info!(
            task_id = %preview.task_id,
            work_item_id = preview.work_item_id,
            applied = result.applied_count(),
            carried = result.carried.len(),
            skipped = result.skipped.len(),
            state = %synced_state,
            "sync complete"
        );
        Ok(result)
    }

    /// Returns whether the task was written.
    fn apply_local(&self, preview: &SyncPreview, hours: &HoursMap, now: DateTime<Utc>) -> Result<bool, SyncError> {
        let needs_write = preview.will_update_local_state
            || preview.tasks.iter().any(|t| t.is_new || t.will_close);
        if !needs_write {
            return Ok(false);
        }

        let mut task = self
            .tasks
            .get(&preview.task_id)?
            .ok_or_else(|| SyncError::OrphanedLink {
                task_id: preview.task_id.clone(),
                work_item_id: preview.work_item_id,
                side: OrphanSide::Local,
            })?;

        if let Some(status) = preview.target_local_status {
            task.status = status;
        }

        for entry in &preview.tasks {
            let existing = correlate::find_by_text(&task.checklist, &entry.text);
            if entry.is_new {
                if existing.is_none() {
                    task.checklist.push(ChecklistItem {
                        text: entry.text.clone(),
                        completed: entry.remote_completed,
                        completed_hours: entry.remote_completed_work.filter(|_| entry.remote_completed),
                    });
                }
            } else if entry.will_close {
                if let Some(idx) = existing {
                    let item = &mut task.checklist[idx];
                    item.completed = true;
                    item.completed_hours = hours.get(&entry.task_id).copied();
                }
            }
        }

        task.updated_at = now;
        self.tasks.update(&task)?;
        tracing::debug!(task_id = %task.id, status = %task.status, "local task updated");
        Ok(true)
    }

    /// Child writes are best effort: a rejected transition becomes a skipped
    /// entry instead of failing the sync.
    async fn apply_children(&self, preview: &SyncPreview, hours: &HoursMap) -> Vec<String> {
        let closing_state = StateTranslator::local_to_remote(PriorityStatus::Done);
        let mut skipped = Vec::new();

        for entry in &preview.tasks {
            match entry.direction {
                Direction::ToRemote => {
                    if let Err(e) = self.provider.patch_state(entry.task_id, closing_state).await {
                        tracing::warn!(child = entry.task_id, error = %e, "could not close remote task");
                        skipped.push(format!("close remote task #{} ({}): {e}", entry.task_id, entry.text));
                    }
                }
                Direction::FromRemote if entry.will_close => {
                    let Some(h) = hours.get(&entry.task_id) else {
                        continue;
                    };
                    if let Err(e) = self.provider.log_completed_work(entry.task_id, *h).await {
                        tracing::warn!(child = entry.task_id, error = %e, "could not log completed work");
                        skipped.push(format!("log {h}h on remote task #{} ({}): {e}", entry.task_id, entry.text));
                    }
                }
                _ => {}
            }
        }
        skipped
    }
}

/// What a failed parent write leaves behind: every change except the parent
/// push itself, which the next preview proposes again.
fn landed_changes(preview: &SyncPreview, skipped: &[String]) -> Vec<String> {
    let child_pushes = if preview.target_remote_state.is_some() {
        preview.to_remote.changes.get(1..).unwrap_or_default()
    } else {
        &preview.to_remote.changes[..]
    };
    preview
        .from_remote
        .changes
        .iter()
        .chain(child_pushes)
        .cloned()
        .chain(skipped.iter().map(|s| format!("Skipped: {s}")))
        .collect()
}

fn validate_hours(preview: &SyncPreview, hours: &HoursMap) -> Result<(), SyncError> {
    let required = preview.hours_required();
    let missing: Vec<u64> = required
        .iter()
        .copied()
        .filter(|id| !hours.contains_key(id))
        .collect();
    if !missing.is_empty() {
        return Err(SyncError::MissingHours { task_ids: missing });
    }
    for id in required {
        let h = hours[&id];
        if !h.is_finite() || h < 0.0 {
            return Err(SyncError::InvalidHours { task_id: id, hours: h });
        }
    }
    Ok(())
}
