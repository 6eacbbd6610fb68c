use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::Provider;
use crate::config::SyncConfig;
use crate::error::GatewayError;
use crate::model::work_item::{CommentLink, RemoteWorkItem};
use crate::util::html::{dedupe_links, extract_links};

const CHILD_RELATION: &str = "System.LinkTypes.Hierarchy-Forward";
const COMPLETED_WORK_FIELD: &str = "Microsoft.VSTS.Scheduling.CompletedWork";
const ORIGINAL_ESTIMATE_FIELD: &str = "Microsoft.VSTS.Scheduling.OriginalEstimate";
const REMAINING_WORK_FIELD: &str = "Microsoft.VSTS.Scheduling.RemainingWork";
const BATCH_LIMIT: usize = 200;

pub struct AzureDevOpsProvider {
    base_url: String,
    organization: String,
    project: String,
    api_version: String,
    state_field: String,
    auth_header: String,
    excluded_states: Vec<String>,
    client: reqwest::Client,
}

impl AzureDevOpsProvider {
    /// `excluded_states` are the terminal states left out of the assigned-items query.
    pub fn new(config: &SyncConfig, excluded_states: Vec<String>) -> Result<Self, GatewayError> {
        let creds = format!(":{}", config.pat);
        let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.clone(),
            organization: config.organization.clone(),
            project: config.project.clone(),
            api_version: config.api_version.clone(),
            state_field: config.state_field.clone(),
            auth_header: format!("Basic {encoded}"),
            excluded_states,
            client,
        })
    }

    fn project_url(&self, tail: &str) -> String {
        format!(
            "{}/{}/{}/_apis/{}",
            self.base_url,
            urlencoding::encode(&self.organization),
            urlencoding::encode(&self.project),
            tail
        )
    }

    fn fields(&self) -> Vec<&str> {
        vec![
            "System.Id",
            "System.Title",
            "System.Description",
            "System.WorkItemType",
            "System.ChangedDate",
            self.state_field.as_str(),
            COMPLETED_WORK_FIELD,
            ORIGINAL_ESTIMATE_FIELD,
            REMAINING_WORK_FIELD,
        ]
    }

    fn wiql(&self, identity: &str) -> String {
        let assignee = if identity.is_empty() {
            "@Me".to_string()
        } else {
            format!("'{}'", identity.replace('\'', "''"))
        };
        let mut query = format!(
            "SELECT [System.Id] FROM WorkItems \
             WHERE [System.TeamProject] = @project \
             AND [System.AssignedTo] = {assignee} \
             AND [System.WorkItemType] <> 'Task'"
        );
        if !self.excluded_states.is_empty() {
            let states = self
                .excluded_states
                .iter()
                .map(|s| format!("'{}'", s.replace('\'', "''")))
                .collect::<Vec<_>>()
                .join(", ");
            query.push_str(&format!(" AND [{}] NOT IN ({states})", self.state_field));
        }
        query.push_str(" ORDER BY [System.ChangedDate] DESC");
        query
    }

    async fn fetch_batch(&self, ids: &[u64]) -> Result<Vec<RemoteWorkItem>, GatewayError> {
        let mut by_id = HashMap::new();
        for chunk in ids.chunks(BATCH_LIMIT) {
            let body = json!({
                "ids": chunk,
                "fields": self.fields(),
                "errorPolicy": "omit",
            });
            let resp = self
                .client
                .post(self.project_url("wit/workitemsbatch"))
                .query(&[("api-version", self.api_version.as_str())])
                .header(AUTHORIZATION, &self.auth_header)
                .header(ACCEPT, "application/json")
                .json(&body)
                .send()
                .await?;
            let batch: BatchResponse = check(resp, None).await?.json().await?;
            for item in batch.value.into_iter().flatten() {
                let item = self.convert(item);
                by_id.insert(item.id, item);
            }
        }
        // Keep the caller's ordering; omitted ids simply drop out.
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    fn convert(&self, item: ApiWorkItem) -> RemoteWorkItem {
        let text = |name: &str| {
            item.fields
                .get(name)
                .and_then(Value::as_str)
                .map(String::from)
        };
        let number = |name: &str| item.fields.get(name).and_then(Value::as_f64);

        let child_ids = item
            .relations
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|r| r.rel == CHILD_RELATION)
            .filter_map(|r| r.url.rsplit('/').next()?.parse::<u64>().ok())
            .collect();

        let url = item
            .links
            .as_ref()
            .and_then(|l| l.html.as_ref())
            .map(|h| h.href.clone())
            .unwrap_or_else(|| {
                format!(
                    "{}/{}/{}/_workitems/edit/{}",
                    self.base_url,
                    urlencoding::encode(&self.organization),
                    urlencoding::encode(&self.project),
                    item.id
                )
            });

        RemoteWorkItem {
            id: item.id,
            title: text("System.Title").unwrap_or_default(),
            description: text("System.Description").filter(|d| !d.trim().is_empty()),
            state: text(&self.state_field).unwrap_or_default(),
            work_item_type: text("System.WorkItemType").unwrap_or_default(),
            url: Some(url),
            changed_date: text("System.ChangedDate").and_then(|d| d.parse().ok()),
            completed_work: number(COMPLETED_WORK_FIELD),
            original_estimate: number(ORIGINAL_ESTIMATE_FIELD),
            remaining_work: number(REMAINING_WORK_FIELD),
            child_ids,
        }
    }

    async fn patch_field(&self, id: u64, field: &str, value: Value) -> Result<(), GatewayError> {
        let ops = json!([{ "op": "add", "path": format!("/fields/{field}"), "value": value }]);
        let resp = self
            .client
            .patch(self.project_url(&format!("wit/workitems/{id}")))
            .query(&[("api-version", self.api_version.as_str())])
            .header(AUTHORIZATION, &self.auth_header)
            .header(CONTENT_TYPE, "application/json-patch+json")
            .json(&ops)
            .send()
            .await?;
        check(resp, Some(id)).await?;
        Ok(())
    }
}

/// Map HTTP status to gateway errors. A 203 is the sign-in page Azure DevOps
/// serves for a bad credential.
async fn check(resp: reqwest::Response, id: Option<u64>) -> Result<reqwest::Response, GatewayError> {
    let status = resp.status();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NON_AUTHORITATIVE_INFORMATION => {
            return Err(GatewayError::Auth {
                status: status.as_u16(),
            });
        }
        StatusCode::NOT_FOUND => {
            if let Some(id) = id {
                return Err(GatewayError::NotFound { id });
            }
        }
        _ => {}
    }
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
        .unwrap_or(body)
        .chars()
        .take(300)
        .collect();
    Err(GatewayError::Api {
        status: status.as_u16(),
        message,
    })
}

#[derive(Deserialize)]
struct WiqlResponse {
    #[serde(rename = "workItems", default)]
    work_items: Vec<WiqlRef>,
}

#[derive(Deserialize)]
struct WiqlRef {
    id: u64,
}

#[derive(Deserialize)]
struct BatchResponse {
    #[serde(default)]
    value: Vec<Option<ApiWorkItem>>,
}

#[derive(Deserialize)]
struct ApiWorkItem {
    id: u64,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
    relations: Option<Vec<Relation>>,
    #[serde(rename = "_links")]
    links: Option<ApiLinks>,
}

#[derive(Deserialize)]
struct Relation {
    rel: String,
    url: String,
}

#[derive(Deserialize)]
struct ApiLinks {
    html: Option<Href>,
}

#[derive(Deserialize)]
struct Href {
    href: String,
}

#[derive(Deserialize)]
struct CommentsResponse {
    #[serde(default)]
    comments: Vec<ApiComment>,
}

#[derive(Deserialize)]
struct ApiComment {
    text: Option<String>,
}

#[async_trait]
impl Provider for AzureDevOpsProvider {
    fn name(&self) -> &str {
        "Azure DevOps"
    }

    async fn fetch_assigned_work_items(
        &self,
        identity: &str,
    ) -> Result<Vec<RemoteWorkItem>, GatewayError> {
        let query = self.wiql(identity);
        tracing::debug!(%query, "running WIQL query");

        let resp = self
            .client
            .post(self.project_url("wit/wiql"))
            .query(&[("api-version", self.api_version.as_str()), ("$top", "200")])
            .header(AUTHORIZATION, &self.auth_header)
            .header(ACCEPT, "application/json")
            .json(&json!({ "query": query }))
            .send()
            .await?;
        let wiql: WiqlResponse = check(resp, None).await?.json().await?;

        let ids: Vec<u64> = wiql.work_items.iter().map(|w| w.id).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let items = self.fetch_batch(&ids).await?;
        tracing::info!(count = items.len(), "fetched assigned work items");
        Ok(items)
    }

    async fn fetch_work_item(&self, id: u64) -> Result<RemoteWorkItem, GatewayError> {
        let resp = self
            .client
            .get(self.project_url(&format!("wit/workitems/{id}")))
            .query(&[("api-version", self.api_version.as_str()), ("$expand", "relations")])
            .header(AUTHORIZATION, &self.auth_header)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let item: ApiWorkItem = check(resp, Some(id)).await?.json().await?;
        let item = self.convert(item);
        tracing::debug!(id, state = %item.state, children = item.child_ids.len(), "fetched work item");
        Ok(item)
    }

    async fn fetch_child_tasks(&self, id: u64) -> Vec<RemoteWorkItem> {
        match self.fetch_work_item(id).await {
            Ok(parent) => self.fetch_children_of(&parent).await,
            Err(e) => {
                tracing::warn!(id, error = %e, "could not resolve child tasks");
                Vec::new()
            }
        }
    }

    async fn fetch_children_of(&self, parent: &RemoteWorkItem) -> Vec<RemoteWorkItem> {
        if parent.child_ids.is_empty() {
            return Vec::new();
        }
        match self.fetch_batch(&parent.child_ids).await {
            Ok(children) => children,
            Err(e) => {
                tracing::warn!(id = parent.id, error = %e, "could not fetch child tasks");
                Vec::new()
            }
        }
    }

    async fn fetch_comment_links(&self, id: u64) -> Vec<CommentLink> {
        let preview_version = format!("{}-preview", self.api_version);
        let result = async {
            let resp = self
                .client
                .get(self.project_url(&format!("wit/workItems/{id}/comments")))
                .query(&[("api-version", preview_version.as_str())])
                .header(AUTHORIZATION, &self.auth_header)
                .header(ACCEPT, "application/json")
                .send()
                .await?;
            let comments: CommentsResponse = check(resp, Some(id)).await?.json().await?;
            Ok::<_, GatewayError>(comments)
        }
        .await;

        match result {
            Ok(comments) => dedupe_links(
                comments
                    .comments
                    .iter()
                    .filter_map(|c| c.text.as_deref())
                    .flat_map(extract_links),
            ),
            Err(e) => {
                tracing::warn!(id, error = %e, "could not read comments");
                Vec::new()
            }
        }
    }

    async fn patch_state(&self, id: u64, state: &str) -> Result<(), GatewayError> {
        self.patch_field(id, &self.state_field, json!(state)).await?;
        tracing::info!(id, state, "patched remote state");
        Ok(())
    }

    async fn log_completed_work(&self, id: u64, hours: f64) -> Result<(), GatewayError> {
        self.patch_field(id, COMPLETED_WORK_FIELD, json!(hours)).await?;
        tracing::info!(id, hours, "logged completed work");
        Ok(())
    }

    async fn test_connection(&self) -> Result<bool, GatewayError> {
        let url = format!(
            "{}/{}/_apis/projects/{}",
            self.base_url,
            urlencoding::encode(&self.organization),
            urlencoding::encode(&self.project)
        );
        let resp = self
            .client
            .get(url)
            .query(&[("api-version", self.api_version.as_str())])
            .header(AUTHORIZATION, &self.auth_header)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        match check(resp, None).await {
            Ok(_) => Ok(true),
            Err(GatewayError::Auth { status }) => {
                tracing::warn!(status, "connection test rejected the credential");
                Ok(false)
            }
            Err(GatewayError::Api { status: 404, .. }) => {
                tracing::warn!(project = %self.project, "connection test could not find the project");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
