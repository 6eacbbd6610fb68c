//! Side-effect-free diff between a local task, its link, and a fresh fetch of
//! the remote work item.

use serde::Serialize;

use super::correlate;
use crate::model::link::Link;
use crate::model::priority::{Priority, PriorityStatus};
use crate::model::work_item::{CommentLink, RemoteWorkItem};
use crate::translate::StateTranslator;

/// Which side a child-task entry will write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    FromRemote,
    ToRemote,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskPreview {
    pub text: String,
    /// Remote child work item id.
    pub task_id: u64,
    pub local_completed: bool,
    pub remote_completed: bool,
    /// The local item will be completed; hours must be supplied for it.
    pub will_close: bool,
    /// Never set: a remote reopen is not written back.
    pub will_reopen: bool,
    pub is_new: bool,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_completed_work: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub changes: Vec<String>,
    pub will_update: bool,
}

impl ChangeSet {
    fn push(&mut self, change: String) {
        self.changes.push(change);
        self.will_update = true;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncPreview {
    pub task_id: String,
    pub work_item_id: u64,
    pub work_item_title: String,
    pub local_state: String,
    pub remote_state: String,
    pub last_synced_state: String,
    pub link_revision: u64,
    pub will_update_local_state: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_local_status: Option<PriorityStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_remote_state: Option<String>,
    pub tasks: Vec<TaskPreview>,
    pub from_remote: ChangeSet,
    pub to_remote: ChangeSet,
    /// Links found in the item's discussion; evidence only.
    pub links: Vec<CommentLink>,
    pub has_changes: bool,
}

impl SyncPreview {
    /// Remote child ids that need an hours entry before the sync can run.
    pub fn hours_required(&self) -> Vec<u64> {
        self.tasks
            .iter()
            .filter(|t| t.will_close)
            .map(|t| t.task_id)
            .collect()
    }
}

pub fn build_preview(
    task: &Priority,
    link: &Link,
    remote: &RemoteWorkItem,
    children: &[RemoteWorkItem],
    links: Vec<CommentLink>,
    translator: &StateTranslator,
) -> SyncPreview {
    let mut from_remote = ChangeSet::default();
    let mut to_remote = ChangeSet::default();

    let remote_status = translator.remote_to_local(&remote.state);
    let baseline = translator.remote_to_local(&link.last_synced_state);
    let remote_changed = remote_status != baseline;

    let mut target_local_status = None;
    let mut target_remote_state = None;

    if task.status != remote_status {
        if remote_changed && !local_edit_is_newer(task, link, remote) {
            target_local_status = Some(remote_status);
            from_remote.push(format!(
                "Status: {} → {} (remote moved {} → {})",
                task.status, remote_status, link.last_synced_state, remote.state
            ));
        } else {
            // Only push when the fixed candidate lands in a different class,
            // otherwise lossy statuses like AT_RISK would rewrite "Active" forever.
            let candidate = StateTranslator::local_to_remote(task.status);
            if candidate != remote.state && translator.remote_to_local(candidate) != remote_status {
                target_remote_state = Some(candidate.to_string());
                to_remote.push(format!(
                    "State: {} → {candidate} (local status {})",
                    remote.state, task.status
                ));
            }
        }
    }

    let tasks = children
        .iter()
        .map(|child| classify_child(task, child, translator, &mut from_remote, &mut to_remote))
        .collect();

    let will_update_local_state = target_local_status.is_some();
    let has_changes = will_update_local_state || from_remote.will_update || to_remote.will_update;

    SyncPreview {
        task_id: task.id.clone(),
        work_item_id: remote.id,
        work_item_title: remote.title.clone(),
        local_state: task.status.to_string(),
        remote_state: remote.state.clone(),
        last_synced_state: link.last_synced_state.clone(),
        link_revision: link.revision,
        will_update_local_state,
        target_local_status,
        target_remote_state,
        tasks,
        from_remote,
        to_remote,
        links,
        has_changes,
    }
}

/// Most recent wins: the local status only beats a remote change when it was
/// edited after both the last sync and the remote change.
fn local_edit_is_newer(task: &Priority, link: &Link, remote: &RemoteWorkItem) -> bool {
    task.updated_at > link.last_synced_at
        && remote
            .changed_date
            .is_some_and(|changed| task.updated_at > changed)
}

fn classify_child(
    task: &Priority,
    child: &RemoteWorkItem,
    translator: &StateTranslator,
    from_remote: &mut ChangeSet,
    to_remote: &mut ChangeSet,
) -> TaskPreview {
    let remote_completed = translator.is_closed(&child.state);
    let mut entry = TaskPreview {
        text: child.title.clone(),
        task_id: child.id,
        local_completed: false,
        remote_completed,
        will_close: false,
        will_reopen: false,
        is_new: false,
        direction: Direction::None,
        remote_completed_work: child.completed_work,
    };

    let Some(idx) = correlate::match_checklist_item(&task.checklist, child) else {
        entry.is_new = true;
        entry.direction = Direction::FromRemote;
        from_remote.push(format!("New task: {}", child.title));
        return entry;
    };

    entry.local_completed = task.checklist[idx].completed;
    match (entry.local_completed, remote_completed) {
        (false, true) => {
            entry.will_close = true;
            entry.direction = Direction::FromRemote;
            from_remote.push(format!("Complete task: {} (hours required)", child.title));
        }
        (true, false) => {
            entry.direction = Direction::ToRemote;
            to_remote.push(format!("Close remote task #{}: {}", child.id, child.title));
        }
        _ => {}
    }
    entry
}
