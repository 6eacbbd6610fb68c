use thiserror::Error;

/// Failures reported by the remote tracker gateway. Never retried in place.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request to Azure DevOps failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Azure DevOps rejected the credential (HTTP {status})")]
    Auth { status: u16 },

    #[error("work item {id} not found")]
    NotFound { id: u64 },

    #[error("Azure DevOps returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
}

/// Which side of a link has disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanSide {
    Local,
    Remote,
}

impl std::fmt::Display for OrphanSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrphanSide::Local => f.write_str("local task"),
            OrphanSide::Remote => f.write_str("remote work item"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Azure DevOps sync is not configured")]
    NotConfigured,

    #[error("Azure DevOps sync is disabled for this installation")]
    SyncDisabled,

    #[error("invalid sync configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("task {task_id} not found")]
    TaskNotFound { task_id: String },

    #[error("task {task_id} is not linked to a work item")]
    NotLinked { task_id: String },

    #[error("link for task {task_id} is orphaned: {side} (work item {work_item_id}) no longer exists, please unlink")]
    OrphanedLink {
        task_id: String,
        work_item_id: u64,
        side: OrphanSide,
    },

    #[error("work item {work_item_id} is linked to more than one task: {}", task_ids.join(", "))]
    DuplicateLink {
        work_item_id: u64,
        task_ids: Vec<String>,
    },

    #[error("{0} is already linked")]
    AlreadyLinked(String),

    #[error("hours worked are required for closing tasks: {}", format_ids(task_ids))]
    MissingHours { task_ids: Vec<u64> },

    #[error("invalid hours {hours} for task {task_id}")]
    InvalidHours { task_id: u64, hours: f64 },

    #[error("link for task {task_id} changed since the preview was computed")]
    StaleLink { task_id: String },

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store data: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| format!("#{id}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SyncError {
    /// True when the error marks a link that must be cleared by hand.
    pub fn is_orphan(&self) -> bool {
        matches!(self, SyncError::OrphanedLink { .. })
    }
}
