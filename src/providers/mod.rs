pub mod azure_devops;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::model::work_item::{CommentLink, RemoteWorkItem};

/// Typed access to the remote work-item tracker. No business logic lives here
/// and nothing is retried; callers own the retry policy.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Non-terminal, non-task items assigned to `identity`, most recently changed first.
    async fn fetch_assigned_work_items(
        &self,
        identity: &str,
    ) -> Result<Vec<RemoteWorkItem>, GatewayError>;

    async fn fetch_work_item(&self, id: u64) -> Result<RemoteWorkItem, GatewayError>;

    /// Direct children of `id`. Empty when there are none or the lookup fails.
    async fn fetch_child_tasks(&self, id: u64) -> Vec<RemoteWorkItem>;

    /// Children of an item already in hand, so they share its snapshot.
    async fn fetch_children_of(&self, parent: &RemoteWorkItem) -> Vec<RemoteWorkItem> {
        self.fetch_child_tasks(parent.id).await
    }

    /// Links mentioned in the item's discussion. Empty on failure.
    async fn fetch_comment_links(&self, id: u64) -> Vec<CommentLink>;

    async fn patch_state(&self, id: u64, state: &str) -> Result<(), GatewayError>;

    /// Record hours worked on a task. Providers without time tracking accept and ignore it.
    async fn log_completed_work(&self, _id: u64, _hours: f64) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn test_connection(&self) -> Result<bool, GatewayError>;
}

#[cfg(test)]
pub mod mock;
