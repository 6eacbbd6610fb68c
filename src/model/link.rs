use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable correlation between one local task and one remote work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub task_id: String,
    pub work_item_id: u64,
    pub organization: String,
    pub project: String,
    /// Remote state observed at the end of the last successful sync.
    pub last_synced_state: String,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Bumped on every advance; guards against concurrent syncs of one link.
    #[serde(default)]
    pub revision: u64,
    /// Changes a partial sync already applied; audited once the link advances.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_changes: Vec<String>,
}

impl Link {
    pub fn new(
        task_id: impl Into<String>,
        work_item_id: u64,
        organization: impl Into<String>,
        project: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            work_item_id,
            organization: organization.into(),
            project: project.into(),
            last_synced_state: state.into(),
            last_synced_at: now,
            created_at: now,
            revision: 0,
            pending_changes: Vec::new(),
        }
    }

    pub fn points_at(&self, organization: &str, project: &str, work_item_id: u64) -> bool {
        self.work_item_id == work_item_id
            && self.organization.eq_ignore_ascii_case(organization)
            && self.project.eq_ignore_ascii_case(project)
    }
}
