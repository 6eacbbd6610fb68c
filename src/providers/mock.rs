use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::Provider;
use crate::error::GatewayError;
use crate::model::work_item::{CommentLink, RemoteWorkItem};

/// In-memory tracker that records every write, for engine tests.
#[derive(Default)]
pub struct MockProvider {
    items: Mutex<HashMap<u64, RemoteWorkItem>>,
    comment_links: Mutex<Vec<CommentLink>>,
    patches: Mutex<Vec<(u64, String)>>,
    hours: Mutex<Vec<(u64, f64)>>,
    failing: Mutex<HashSet<u64>>,
    fetches: Mutex<usize>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(self, item: RemoteWorkItem) -> Self {
        self.insert(item);
        self
    }

    pub fn with_comment_link(self, title: &str, url: &str) -> Self {
        self.comment_links.lock().unwrap().push(CommentLink {
            title: title.into(),
            url: url.into(),
        });
        self
    }

    pub fn insert(&self, item: RemoteWorkItem) {
        self.items.lock().unwrap().insert(item.id, item);
    }

    pub fn set_state(&self, id: u64, state: &str) {
        if let Some(item) = self.items.lock().unwrap().get_mut(&id) {
            item.state = state.into();
        }
    }

    pub fn remove(&self, id: u64) {
        self.items.lock().unwrap().remove(&id);
    }

    pub fn state_of(&self, id: u64) -> Option<String> {
        self.items.lock().unwrap().get(&id).map(|i| i.state.clone())
    }

    pub fn fail_patches_for(&self, id: u64) {
        self.failing.lock().unwrap().insert(id);
    }

    pub fn heal(&self, id: u64) {
        self.failing.lock().unwrap().remove(&id);
    }

    pub fn patches(&self) -> Vec<(u64, String)> {
        self.patches.lock().unwrap().clone()
    }

    pub fn logged_hours(&self) -> Vec<(u64, f64)> {
        self.hours.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

pub fn work_item(id: u64, title: &str, state: &str) -> RemoteWorkItem {
    RemoteWorkItem {
        id,
        title: title.into(),
        description: None,
        state: state.into(),
        work_item_type: "User Story".into(),
        url: Some(format!("https://dev.azure.com/contoso/Web/_workitems/edit/{id}")),
        changed_date: None,
        completed_work: None,
        original_estimate: None,
        remaining_work: None,
        child_ids: Vec::new(),
    }
}

pub fn child(id: u64, title: &str, state: &str) -> RemoteWorkItem {
    RemoteWorkItem {
        work_item_type: "Task".into(),
        ..work_item(id, title, state)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "Mock"
    }

    async fn fetch_assigned_work_items(
        &self,
        _identity: &str,
    ) -> Result<Vec<RemoteWorkItem>, GatewayError> {
        let mut items: Vec<_> = self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.work_item_type != "Task")
            .cloned()
            .collect();
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    async fn fetch_work_item(&self, id: u64) -> Result<RemoteWorkItem, GatewayError> {
        *self.fetches.lock().unwrap() += 1;
        self.items
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(GatewayError::NotFound { id })
    }

    async fn fetch_child_tasks(&self, id: u64) -> Vec<RemoteWorkItem> {
        *self.fetches.lock().unwrap() += 1;
        let parent = self.items.lock().unwrap().get(&id).cloned();
        match parent {
            Some(parent) => self.fetch_children_of(&parent).await,
            None => Vec::new(),
        }
    }

    async fn fetch_children_of(&self, parent: &RemoteWorkItem) -> Vec<RemoteWorkItem> {
        let items = self.items.lock().unwrap();
        parent
            .child_ids
            .iter()
            .filter_map(|child_id| items.get(child_id).cloned())
            .collect()
    }

    async fn fetch_comment_links(&self, _id: u64) -> Vec<CommentLink> {
        self.comment_links.lock().unwrap().clone()
    }

    async fn patch_state(&self, id: u64, state: &str) -> Result<(), GatewayError> {
        if self.failing.lock().unwrap().contains(&id) {
            return Err(GatewayError::Api {
                status: 503,
                message: "Service Unavailable".into(),
            });
        }
        self.patches.lock().unwrap().push((id, state.to_string()));
        self.set_state(id, state);
        Ok(())
    }

    async fn log_completed_work(&self, id: u64, hours: f64) -> Result<(), GatewayError> {
        if self.failing.lock().unwrap().contains(&id) {
            return Err(GatewayError::Api {
                status: 503,
                message: "Service Unavailable".into(),
            });
        }
        self.hours.lock().unwrap().push((id, hours));
        if let Some(item) = self.items.lock().unwrap().get_mut(&id) {
            item.completed_work = Some(hours);
        }
        Ok(())
    }

    async fn test_connection(&self) -> Result<bool, GatewayError> {
        Ok(true)
    }
}
