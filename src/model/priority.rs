use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityStatus {
    OnTrack,
    AtRisk,
    Blocked,
    Done,
}

impl PriorityStatus {
    pub const ALL: [PriorityStatus; 4] = [
        PriorityStatus::OnTrack,
        PriorityStatus::AtRisk,
        PriorityStatus::Blocked,
        PriorityStatus::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityStatus::OnTrack => "ON_TRACK",
            PriorityStatus::AtRisk => "AT_RISK",
            PriorityStatus::Blocked => "BLOCKED",
            PriorityStatus::Done => "DONE",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, PriorityStatus::Done)
    }
}

impl fmt::Display for PriorityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PriorityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        PriorityStatus::ALL
            .iter()
            .find(|status| status.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("unknown status '{s}' (expected ON_TRACK, AT_RISK, BLOCKED or DONE)"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_hours: Option<f64>,
}

impl ChecklistItem {
    pub fn open(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            completed: false,
            completed_hours: None,
        }
    }
}

/// The locally tracked unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Priority {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: PriorityStatus,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Priority {
    pub fn new(title: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: None,
            status: PriorityStatus::OnTrack,
            checklist: Vec::new(),
            owner: owner.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One immutable entry in a task's activity trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub actor: String,
    pub action: String,
    #[serde(default)]
    pub changes: Vec<String>,
}
