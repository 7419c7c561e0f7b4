//! Typed views over GraphQL response nodes.
//!
//! Nodes are decoded from the raw `serde_json::Value` so the original payload
//! can still be stored alongside the normalized columns.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::SyncError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// A connection page with nodes left undecoded.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub page_info: PageInfo,
    #[serde(default)]
    pub nodes: Vec<Value>,
}

impl Connection {
    /// Non-null nodes of the page.
    pub fn nodes(&self) -> impl Iterator<Item = &Value> {
        self.nodes.iter().filter(|n| !n.is_null())
    }

    pub fn next_cursor(&self) -> Option<&str> {
        if self.page_info.has_next_page {
            self.page_info.end_cursor.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeList<T> {
    #[serde(default = "Vec::new")]
    pub nodes: Vec<Option<T>>,
}

impl<T> NodeList<T> {
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.nodes.iter().flatten()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdNode {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorNode {
    #[serde(rename = "__typename")]
    pub typename: Option<String>,
    pub id: Option<String>,
    pub login: Option<String>,
    /// Teams have a slug instead of a login.
    pub slug: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryNode {
    pub id: String,
    pub name: String,
    pub name_with_owner: String,
    pub visibility: Option<String>,
    #[serde(default)]
    pub is_archived: bool,
    pub url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub owner: ActorNode,
}

impl RepositoryNode {
    /// Split `nameWithOwner` into owner login and repository name.
    pub fn owner_and_name(&self) -> (&str, &str) {
        match self.name_with_owner.split_once('/') {
            Some((owner, name)) => (owner, name),
            None => ("", self.name.as_str()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionNode {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub user: Option<ActorNode>,
}

/// An issue or a discussion; `typename` decides which.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemNode {
    #[serde(rename = "__typename")]
    pub typename: String,
    pub id: String,
    pub number: i64,
    pub title: String,
    pub state: Option<String>,
    pub closed: Option<bool>,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub author: Option<ActorNode>,
    pub project_items: Option<NodeList<IdNode>>,
    pub reactions: Option<NodeList<ReactionNode>>,
    pub repository: Option<RepositoryNode>,
}

impl ItemNode {
    /// Discussions expose `closed` rather than `state`.
    pub fn normalized_state(&self) -> String {
        match (&self.state, self.closed) {
            (Some(state), _) => state.clone(),
            (None, Some(true)) => "CLOSED".to_string(),
            (None, _) => "OPEN".to_string(),
        }
    }

    pub fn project_item_ids(&self) -> Vec<String> {
        self.project_items
            .as_ref()
            .map(|items| items.iter().map(|i| i.id.clone()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestNode {
    pub id: String,
    pub number: i64,
    pub title: String,
    pub state: String,
    #[serde(default)]
    pub merged: bool,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub author: Option<ActorNode>,
    pub closing_issues_references: Option<NodeList<IdNode>>,
    pub reactions: Option<NodeList<ReactionNode>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentNode {
    pub id: String,
    pub body: Option<String>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub author: Option<ActorNode>,
    pub reactions: Option<NodeList<ReactionNode>>,
    pub pull_request_review: Option<IdNode>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewNode {
    pub id: String,
    pub state: String,
    pub body: Option<String>,
    pub url: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub author: Option<ActorNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewThreadNode {
    pub id: String,
    pub comments: Connection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEventNode {
    #[serde(rename = "__typename")]
    pub typename: String,
    pub created_at: Option<DateTime<Utc>>,
    pub requested_reviewer: Option<ActorNode>,
}

/// Decode a typed view of `value`.
pub fn decode<T: DeserializeOwned>(value: &Value, what: &str) -> Result<T, SyncError> {
    T::deserialize(value)
        .map_err(|e| SyncError::PayloadError(format!("Failed to decode {}: {}", what, e)))
}

/// Read the connection at JSON `pointer`, `None` when the parent node is null.
pub fn connection_at(data: &Value, pointer: &str) -> Result<Option<Connection>, SyncError> {
    match data.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => decode(value, pointer).map(Some),
    }
}
