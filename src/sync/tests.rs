use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use super::engine::SyncEngine;
use super::executor::HoursMap;
use crate::config::{SyncConfig, DEFAULT_STATE_FIELD};
use crate::error::{OrphanSide, SyncError};
use crate::model::link::Link;
use crate::model::priority::{ChecklistItem, Priority, PriorityStatus};
use crate::model::work_item::RemoteWorkItem;
use crate::providers::mock::{child, work_item, MockProvider};
use crate::providers::Provider;
use crate::store::links::LinkStore;
use crate::store::tasks::{JsonTaskStore, TaskRepository};

struct Harness {
    _dir: TempDir,
    provider: Arc<MockProvider>,
    tasks: Arc<JsonTaskStore>,
    links: Arc<LinkStore>,
    engine: SyncEngine,
}

fn sync_config() -> SyncConfig {
    SyncConfig {
        organization: "contoso".into(),
        project: "Web".into(),
        pat: "secret".into(),
        identity: "dana@contoso.com".into(),
        sync_enabled: true,
        base_url: "https://dev.azure.com".into(),
        state_field: DEFAULT_STATE_FIELD.into(),
        api_version: "7.0".into(),
        timeout_secs: 5,
        state_mapping: HashMap::new(),
    }
}

fn harness(provider: MockProvider) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(provider);
    let tasks = Arc::new(JsonTaskStore::open(dir.path()).unwrap());
    let links = Arc::new(LinkStore::open(dir.path().join("links.json")).unwrap());
    let engine = SyncEngine::new(
        sync_config(),
        provider.clone() as Arc<dyn Provider>,
        tasks.clone() as Arc<dyn TaskRepository>,
        links.clone(),
    )
    .unwrap();
    Harness {
        _dir: dir,
        provider,
        tasks,
        links,
        engine,
    }
}

impl Harness {
    /// Store a task linked to `work_item_id`, last synced at `state` an hour ago.
    fn seed(&self, status: PriorityStatus, checklist: Vec<ChecklistItem>, work_item_id: u64, state: &str) -> String {
        let mut task = Priority::new("Checkout revamp", "dana@contoso.com");
        task.status = status;
        task.checklist = checklist;
        task.updated_at = Utc::now() - Duration::hours(2);
        let id = task.id.clone();
        self.tasks.insert(task).unwrap();

        let mut link = Link::new(&id, work_item_id, "contoso", "Web", state);
        link.last_synced_at = Utc::now() - Duration::hours(1);
        self.links.insert(link).unwrap();
        id
    }

    fn task(&self, id: &str) -> Priority {
        self.tasks.get(id).unwrap().unwrap()
    }

    /// Simulate a user editing the status in the CRUD layer.
    fn edit_status(&self, id: &str, status: PriorityStatus) {
        let mut task = self.task(id);
        task.status = status;
        task.updated_at = Utc::now();
        self.tasks.update(&task).unwrap();
    }
}

fn open(text: &str) -> ChecklistItem {
    ChecklistItem::open(text)
}

fn done(text: &str) -> ChecklistItem {
    ChecklistItem {
        text: text.into(),
        completed: true,
        completed_hours: Some(1.0),
    }
}

fn story_with_children(state: &str, children: &[&RemoteWorkItem]) -> RemoteWorkItem {
    RemoteWorkItem {
        child_ids: children.iter().map(|c| c.id).collect(),
        ..work_item(42, "Checkout revamp", state)
    }
}

/// Remote moved Active -> Resolved and closed one child the local side still has open.
fn resolved_scenario() -> (Harness, String) {
    let write_tests = child(43, "Write tests", "Closed");
    let provider = MockProvider::new()
        .with_item(story_with_children("Resolved", &[&write_tests]))
        .with_item(write_tests)
        .with_comment_link("PR 12", "https://github.com/contoso/web/pull/12");
    let h = harness(provider);
    let id = h.seed(PriorityStatus::OnTrack, vec![open("Write tests")], 42, "Active");
    (h, id)
}

#[tokio::test]
async fn resolved_remote_needs_hours_for_closed_child() {
    let (h, id) = resolved_scenario();
    let preview = h.engine.compute_preview(&id).await.unwrap();

    assert!(preview.will_update_local_state);
    assert_eq!(preview.target_local_status, Some(PriorityStatus::Done));
    assert_eq!(preview.local_state, "ON_TRACK");
    assert_eq!(preview.remote_state, "Resolved");
    assert_eq!(preview.tasks.len(), 1);
    assert!(preview.tasks[0].will_close);
    assert_eq!(preview.hours_required(), vec![43]);
    assert!(preview.has_changes);
    assert_eq!(preview.links.len(), 1);
}

#[tokio::test]
async fn preview_is_repeatable_and_side_effect_free() {
    let (h, id) = resolved_scenario();
    let first = h.engine.compute_preview(&id).await.unwrap();
    let second = h.engine.compute_preview(&id).await.unwrap();

    assert_eq!(first, second);
    assert!(h.provider.patches().is_empty());
    assert_eq!(h.task(&id).status, PriorityStatus::OnTrack);
    assert_eq!(h.links.get(&id).unwrap().revision, 0);
}

#[tokio::test]
async fn missing_hours_blocks_every_write() {
    let (h, id) = resolved_scenario();
    let before = h.task(&id);

    let err = h.engine.execute_sync(&id, &HoursMap::new()).await.unwrap_err();
    match err {
        SyncError::MissingHours { task_ids } => assert_eq!(task_ids, vec![43]),
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(h.task(&id), before);
    let link = h.links.get(&id).unwrap();
    assert_eq!(link.revision, 0);
    assert_eq!(link.last_synced_state, "Active");
    assert!(h.provider.patches().is_empty());
    assert!(h.provider.logged_hours().is_empty());
    assert!(h.tasks.activity(&id).unwrap().is_empty());
}

#[tokio::test]
async fn negative_hours_are_rejected() {
    let (h, id) = resolved_scenario();
    let hours = HoursMap::from([(43, -1.0)]);
    let err = h.engine.execute_sync(&id, &hours).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidHours { task_id: 43, .. }));
    assert_eq!(h.task(&id).status, PriorityStatus::OnTrack);
}

#[tokio::test]
async fn full_sync_updates_both_sides_and_audits() {
    let (h, id) = resolved_scenario();
    let hours = HoursMap::from([(43, 3.0)]);

    let result = h.engine.execute_sync(&id, &hours).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.from_remote.len(), 2);
    assert!(result.to_remote.is_empty());
    assert!(result.skipped.is_empty());

    let task = h.task(&id);
    assert_eq!(task.status, PriorityStatus::Done);
    assert!(task.checklist[0].completed);
    assert_eq!(task.checklist[0].completed_hours, Some(3.0));
    assert_eq!(h.provider.logged_hours(), vec![(43, 3.0)]);

    let link = h.links.get(&id).unwrap();
    assert_eq!(link.last_synced_state, "Resolved");
    assert_eq!(link.revision, 1);

    let activity = h.tasks.activity(&id).unwrap();
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0].actor, "dana@contoso.com");
    assert_eq!(activity[0].changes, result.from_remote);

    let after = h.engine.compute_preview(&id).await.unwrap();
    assert!(!after.has_changes);
}

#[tokio::test]
async fn sync_without_changes_is_a_pure_noop() {
    let provider = MockProvider::new().with_item(work_item(42, "Checkout revamp", "Active"));
    let h = harness(provider);
    let id = h.seed(PriorityStatus::OnTrack, vec![], 42, "Active");
    let before = h.task(&id);

    let result = h.engine.execute_sync(&id, &HoursMap::new()).await.unwrap();
    assert!(result.is_noop());
    assert_eq!(result.applied_count(), 0);
    assert_eq!(h.task(&id), before);
    assert_eq!(h.links.get(&id).unwrap().revision, 0);
    assert!(h.provider.patches().is_empty());
    assert!(h.tasks.activity(&id).unwrap().is_empty());
}

#[tokio::test]
async fn local_status_edit_is_pushed_to_remote() {
    let provider = MockProvider::new().with_item(work_item(42, "Checkout revamp", "Active"));
    let h = harness(provider);
    let id = h.seed(PriorityStatus::OnTrack, vec![], 42, "Active");
    h.edit_status(&id, PriorityStatus::Blocked);

    let preview = h.engine.compute_preview(&id).await.unwrap();
    assert_eq!(preview.target_remote_state.as_deref(), Some("Removed"));
    assert!(!preview.will_update_local_state);

    let result = h.engine.execute_sync(&id, &HoursMap::new()).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(h.provider.patches(), vec![(42, "Removed".to_string())]);
    assert_eq!(h.links.get(&id).unwrap().last_synced_state, "Removed");
    assert_eq!(h.task(&id).status, PriorityStatus::Blocked);
}

#[tokio::test]
async fn failed_remote_write_leaves_retriable_partial_state() {
    let provider = MockProvider::new().with_item(work_item(42, "Checkout revamp", "Active"));
    provider.fail_patches_for(42);
    let h = harness(provider);
    let id = h.seed(PriorityStatus::OnTrack, vec![], 42, "Active");
    h.edit_status(&id, PriorityStatus::Done);

    let before = h.engine.compute_preview(&id).await.unwrap();
    let result = h.engine.execute_sync(&id, &HoursMap::new()).await.unwrap();
    assert!(result.is_partial());
    assert!(!result.is_noop());
    assert!(result.remote_error.is_some());
    assert!(!result.local_applied, "a pure push writes nothing locally");

    let link = h.links.get(&id).unwrap();
    assert_eq!(link.revision, 0);
    assert_eq!(link.last_synced_state, "Active");
    assert!(link.pending_changes.is_empty());
    assert!(h.tasks.activity(&id).unwrap().is_empty());

    let retry = h.engine.compute_preview(&id).await.unwrap();
    assert_eq!(retry, before);

    h.provider.heal(42);
    let result = h.engine.execute_sync(&id, &HoursMap::new()).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(h.provider.state_of(42).as_deref(), Some("Closed"));
    assert_eq!(h.links.get(&id).unwrap().last_synced_state, "Closed");
}

/// Local DONE edit to push, while the remote already closed a child the
/// local checklist still has open.
fn push_with_closed_child() -> (Harness, String) {
    let write_tests = child(43, "Write tests", "Closed");
    let provider = MockProvider::new()
        .with_item(story_with_children("Active", &[&write_tests]))
        .with_item(write_tests);
    provider.fail_patches_for(42);
    let h = harness(provider);
    let id = h.seed(PriorityStatus::OnTrack, vec![open("Write tests")], 42, "Active");
    h.edit_status(&id, PriorityStatus::Done);
    (h, id)
}

#[tokio::test]
async fn hours_and_audit_survive_a_failed_parent_write() {
    let (h, id) = push_with_closed_child();

    let first = h.engine.execute_sync(&id, &HoursMap::from([(43, 2.5)])).await.unwrap();
    assert!(first.is_partial());
    assert!(first.local_applied);
    assert_eq!(h.task(&id).checklist[0].completed_hours, Some(2.5));
    assert_eq!(h.provider.logged_hours(), vec![(43, 2.5)]);
    assert!(h.tasks.activity(&id).unwrap().is_empty());

    let link = h.links.get(&id).unwrap();
    assert_eq!(link.revision, 0);
    assert_eq!(link.pending_changes, first.from_remote);

    h.provider.heal(42);
    let retry = h.engine.compute_preview(&id).await.unwrap();
    assert!(retry.hours_required().is_empty());
    assert_eq!(retry.target_remote_state.as_deref(), Some("Closed"));

    let second = h.engine.execute_sync(&id, &HoursMap::new()).await.unwrap();
    assert!(second.is_complete());
    assert_eq!(second.carried, first.from_remote);
    assert_eq!(h.provider.logged_hours(), vec![(43, 2.5)]);
    assert_eq!(h.provider.patches(), vec![(42, "Closed".to_string())]);

    let link = h.links.get(&id).unwrap();
    assert_eq!(link.revision, 1);
    assert!(link.pending_changes.is_empty());

    let activity = h.tasks.activity(&id).unwrap();
    assert_eq!(activity.len(), 1);
    let mut expected = first.from_remote.clone();
    expected.extend(second.to_remote.iter().cloned());
    assert_eq!(activity[0].changes, expected);
}

#[tokio::test]
async fn pending_changes_are_audited_when_remote_catches_up() {
    let (h, id) = push_with_closed_child();
    let first = h.engine.execute_sync(&id, &HoursMap::from([(43, 1.5)])).await.unwrap();
    assert!(first.is_partial());

    // Someone closes the parent by hand; nothing is left to push.
    h.provider.set_state(42, "Closed");
    let preview = h.engine.compute_preview(&id).await.unwrap();
    assert!(!preview.has_changes);

    let result = h.engine.execute_sync(&id, &HoursMap::new()).await.unwrap();
    assert!(result.is_complete());
    assert!(!result.local_applied);
    assert!(h.provider.patches().is_empty());

    let link = h.links.get(&id).unwrap();
    assert_eq!(link.last_synced_state, "Closed");
    assert!(link.pending_changes.is_empty());
    assert_eq!(h.tasks.activity(&id).unwrap()[0].changes, first.from_remote);

    let again = h.engine.execute_sync(&id, &HoursMap::new()).await.unwrap();
    assert!(again.is_noop());
}

#[tokio::test]
async fn preview_reads_the_parent_once() {
    let (h, id) = resolved_scenario();
    let preview = h.engine.compute_preview(&id).await.unwrap();
    assert_eq!(preview.tasks.len(), 1);
    assert_eq!(h.provider.fetch_count(), 1);
}

#[tokio::test]
async fn new_remote_child_is_added_locally() {
    let deploy = child(45, "Deploy", "Active");
    let provider = MockProvider::new()
        .with_item(story_with_children("Active", &[&deploy]))
        .with_item(deploy);
    let h = harness(provider);
    let id = h.seed(PriorityStatus::OnTrack, vec![open("Write tests")], 42, "Active");

    let preview = h.engine.compute_preview(&id).await.unwrap();
    assert!(preview.tasks[0].is_new);
    assert!(preview.hours_required().is_empty());

    let result = h.engine.execute_sync(&id, &HoursMap::new()).await.unwrap();
    assert!(result.is_complete());
    let texts: Vec<String> = h.task(&id).checklist.into_iter().map(|i| i.text).collect();
    assert_eq!(texts, vec!["Write tests", "Deploy"]);
}

#[tokio::test]
async fn locally_completed_item_closes_remote_child() {
    let write_tests = child(43, "Write tests", "Active");
    let provider = MockProvider::new()
        .with_item(story_with_children("Active", &[&write_tests]))
        .with_item(write_tests);
    let h = harness(provider);
    let id = h.seed(PriorityStatus::OnTrack, vec![done("Write tests")], 42, "Active");

    let result = h.engine.execute_sync(&id, &HoursMap::new()).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.to_remote.len(), 1);
    assert_eq!(h.provider.patches(), vec![(43, "Closed".to_string())]);
}

#[tokio::test]
async fn rejected_child_transition_is_recorded_not_fatal() {
    let write_tests = child(43, "Write tests", "Active");
    let provider = MockProvider::new()
        .with_item(story_with_children("Active", &[&write_tests]))
        .with_item(write_tests);
    provider.fail_patches_for(43);
    let h = harness(provider);
    let id = h.seed(PriorityStatus::OnTrack, vec![done("Write tests")], 42, "Active");

    let result = h.engine.execute_sync(&id, &HoursMap::new()).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(h.links.get(&id).unwrap().revision, 1);

    let activity = h.tasks.activity(&id).unwrap();
    assert!(activity[0].changes.iter().any(|c| c.starts_with("Skipped:")));
}

#[tokio::test]
async fn deleted_local_task_is_an_orphan() {
    let (h, id) = resolved_scenario();
    h.tasks.delete(&id).unwrap();

    let err = h.engine.compute_preview(&id).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::OrphanedLink {
            side: OrphanSide::Local,
            work_item_id: 42,
            ..
        }
    ));
    assert_eq!(h.provider.fetch_count(), 0);
}

#[tokio::test]
async fn deleted_remote_item_is_an_orphan() {
    let (h, id) = resolved_scenario();
    h.provider.remove(42);

    let err = h.engine.compute_preview(&id).await.unwrap_err();
    assert!(err.is_orphan());
    assert!(matches!(
        err,
        SyncError::OrphanedLink {
            side: OrphanSide::Remote,
            ..
        }
    ));
}

#[tokio::test]
async fn unlink_clears_an_orphan() {
    let (h, id) = resolved_scenario();
    h.tasks.delete(&id).unwrap();
    let link = h.links.unlink(&id).unwrap();
    assert_eq!(link.work_item_id, 42);
    assert!(matches!(
        h.engine.compute_preview(&id).await,
        Err(SyncError::TaskNotFound { .. })
    ));
    assert!(matches!(h.links.unlink(&id), Err(SyncError::NotLinked { .. })));
}

#[tokio::test]
async fn two_links_on_one_work_item_conflict() {
    let (h, id) = resolved_scenario();
    let other = h.seed(PriorityStatus::OnTrack, vec![], 42, "Active");

    let err = h.engine.compute_preview(&id).await.unwrap_err();
    match err {
        SyncError::DuplicateLink {
            work_item_id,
            task_ids,
        } => {
            assert_eq!(work_item_id, 42);
            assert!(task_ids.contains(&id) && task_ids.contains(&other));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unlinked_task_is_reported() {
    let h = harness(MockProvider::new());
    let task = Priority::new("Local only", "dana");
    let id = task.id.clone();
    h.tasks.insert(task).unwrap();

    assert!(matches!(
        h.engine.compute_preview(&id).await,
        Err(SyncError::NotLinked { .. })
    ));
    assert!(matches!(
        h.engine.compute_preview("missing").await,
        Err(SyncError::TaskNotFound { .. })
    ));
}

#[tokio::test]
async fn import_creates_task_and_link() {
    let tests = RemoteWorkItem {
        completed_work: Some(2.0),
        ..child(43, "Write tests", "Closed")
    };
    let deploy = RemoteWorkItem {
        completed_work: Some(1.0),
        ..child(44, "Deploy", "Active")
    };
    let provider = MockProvider::new()
        .with_item(story_with_children("Active", &[&tests, &deploy]))
        .with_item(tests)
        .with_item(deploy);
    let h = harness(provider);

    let (id, link) = h.engine.import_as_new_task(42).await.unwrap();
    assert_eq!(link.task_id, id);
    assert_eq!(link.last_synced_state, "Active");

    let task = h.task(&id);
    assert_eq!(task.title, "Checkout revamp");
    assert_eq!(task.status, PriorityStatus::OnTrack);
    assert_eq!(task.owner, "dana@contoso.com");
    assert_eq!(task.checklist.len(), 2);
    assert!(task.checklist[0].completed);
    assert_eq!(task.checklist[0].completed_hours, Some(2.0));
    assert!(!task.checklist[1].completed);
    assert_eq!(task.checklist[1].completed_hours, None);
    assert_eq!(h.tasks.activity(&id).unwrap().len(), 1);

    let preview = h.engine.compute_preview(&id).await.unwrap();
    assert!(!preview.has_changes);

    assert!(matches!(
        h.engine.import_as_new_task(42).await,
        Err(SyncError::AlreadyLinked(_))
    ));
}

#[tokio::test]
async fn import_of_missing_item_creates_nothing() {
    let h = harness(MockProvider::new());
    assert!(matches!(
        h.engine.import_as_new_task(99).await,
        Err(SyncError::Gateway(_))
    ));
    assert!(h.tasks.list().unwrap().is_empty());
    assert!(h.links.all().is_empty());
}

#[tokio::test]
async fn stale_preview_is_rejected_before_writing() {
    let (h, id) = resolved_scenario();
    let preview = h.engine.compute_preview(&id).await.unwrap();
    h.links.advance(&id, 0, "Resolved", Utc::now()).unwrap();

    let hours = HoursMap::from([(43, 1.0)]);
    let err = h.engine.apply_preview(&preview, &hours).await.unwrap_err();
    assert!(matches!(err, SyncError::StaleLink { .. }));
    assert_eq!(h.task(&id).status, PriorityStatus::OnTrack);
}

#[tokio::test]
async fn concurrent_syncs_of_one_link_write_once() {
    let provider = MockProvider::new().with_item(work_item(42, "Checkout revamp", "Active"));
    let h = harness(provider);
    let id = h.seed(PriorityStatus::OnTrack, vec![], 42, "Active");
    h.edit_status(&id, PriorityStatus::Blocked);

    let hours = HoursMap::new();
    let (a, b) = tokio::join!(
        h.engine.execute_sync(&id, &hours),
        h.engine.execute_sync(&id, &hours)
    );
    let results = [a.unwrap(), b.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_complete()).count(), 1);
    assert_eq!(results.iter().filter(|r| r.is_noop()).count(), 1);
    assert_eq!(h.provider.patches().len(), 1);
    assert_eq!(h.engine.lock_count(), 0);
}

#[tokio::test]
async fn finished_syncs_release_their_locks() {
    let (h, id) = resolved_scenario();
    h.engine.execute_sync(&id, &HoursMap::from([(43, 1.0)])).await.unwrap();
    assert!(h.engine.execute_sync("missing", &HoursMap::new()).await.is_err());

    h.provider.insert(work_item(50, "Search filters", "Active"));
    h.engine.import_as_new_task(50).await.unwrap();
    assert!(h.engine.import_as_new_task(50).await.is_err());

    assert_eq!(h.engine.lock_count(), 0);
}

#[tokio::test]
async fn batch_sync_reports_each_link() {
    let (h, needs_hours) = resolved_scenario();
    h.provider.insert(work_item(50, "Search filters", "Active"));
    let clean = h.seed(PriorityStatus::OnTrack, vec![], 50, "Active");

    let outcomes = h.engine.sync_all(&HoursMap::new()).await;
    assert_eq!(outcomes.len(), 2);

    let by_task = |id: &str| outcomes.iter().find(|o| o.task_id == id).unwrap();
    assert!(matches!(
        by_task(&needs_hours).result,
        Err(SyncError::MissingHours { .. })
    ));
    assert!(by_task(&clean).result.as_ref().unwrap().is_noop());
}

#[test]
fn disabled_sync_refuses_to_build_engine() {
    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        sync_enabled: false,
        ..sync_config()
    };
    let result = SyncEngine::new(
        config,
        Arc::new(MockProvider::new()),
        Arc::new(JsonTaskStore::open(dir.path()).unwrap()),
        Arc::new(LinkStore::open(dir.path().join("links.json")).unwrap()),
    );
    assert!(matches!(result, Err(SyncError::SyncDisabled)));
}
