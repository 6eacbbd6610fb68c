use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A work item as seen in the remote tracker. Not owned by this system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWorkItem {
    pub id: u64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub state: String,
    pub work_item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_work: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_estimate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_work: Option<f64>,
    /// Ids of direct children (hierarchy-forward relations).
    #[serde(default)]
    pub child_ids: Vec<u64>,
}

/// A hyperlink pulled out of a work item's discussion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentLink {
    pub title: String,
    pub url: String,
}
