use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Issues and discussions share one table; the kind is fixed at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Issue,
    Discussion,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Issue => "issue",
            ItemKind::Discussion => "discussion",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "issue" => Some(ItemKind::Issue),
            "discussion" => Some(ItemKind::Discussion),
            _ => None,
        }
    }

    /// Map a GraphQL `__typename`.
    pub fn from_typename(typename: &str) -> Option<Self> {
        match typename {
            "Issue" => Some(ItemKind::Issue),
            "Discussion" => Some(ItemKind::Discussion),
            _ => None,
        }
    }
}

/// Remote connections tracked with their own cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Issues,
    Discussions,
    PullRequests,
}

impl Resource {
    pub const ALL: [Resource; 3] = [
        Resource::Issues,
        Resource::Discussions,
        Resource::PullRequests,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Issues => "issues",
            Resource::Discussions => "discussions",
            Resource::PullRequests => "pull_requests",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "issues" => Some(Resource::Issues),
            "discussions" => Some(Resource::Discussions),
            "pull_requests" => Some(Resource::PullRequests),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Automatic,
    Manual,
    Backfill,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Automatic => "automatic",
            RunType::Manual => "manual",
            RunType::Backfill => "backfill",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "automatic" => Some(RunType::Automatic),
            "manual" => Some(RunType::Manual),
            "backfill" => Some(RunType::Backfill),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    Incremental,
    Backfill,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStrategy::Incremental => "incremental",
            SyncStrategy::Backfill => "backfill",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "incremental" => Some(SyncStrategy::Incremental),
            "backfill" => Some(SyncStrategy::Backfill),
            _ => None,
        }
    }
}

/// Owning entity of a comment or reaction; exactly one applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ParentRef {
    Issue(String),
    PullRequest(String),
}

impl ParentRef {
    pub fn issue_id(&self) -> Option<&str> {
        match self {
            ParentRef::Issue(id) => Some(id),
            ParentRef::PullRequest(_) => None,
        }
    }

    pub fn pull_request_id(&self) -> Option<&str> {
        match self {
            ParentRef::PullRequest(id) => Some(id),
            ParentRef::Issue(_) => None,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ParentRef::Issue(id) | ParentRef::PullRequest(id) => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub login: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub name_with_owner: String,
    pub owner_id: String,
    pub visibility: Option<String>,
    pub is_archived: bool,
    pub url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub number: i64,
    pub repository_id: String,
    pub author_id: Option<String>,
    pub kind: ItemKind,
    pub title: String,
    pub state: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub ownership_verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: String,
    pub number: i64,
    pub repository_id: String,
    pub author_id: Option<String>,
    pub title: String,
    pub state: String,
    pub merged: bool,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub pull_request_id: String,
    pub author_id: Option<String>,
    pub state: String,
    pub body: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

/// A reviewer whose request is still outstanding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub pull_request_id: String,
    pub reviewer_id: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub parent: ParentRef,
    pub review_id: Option<String>,
    pub author_id: Option<String>,
    pub body: String,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub id: String,
    pub parent: ParentRef,
    pub comment_id: Option<String>,
    pub actor_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCursor {
    pub resource: Resource,
    pub cursor: Option<String>,
    pub last_item_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: String,
    pub run_type: RunType,
    pub strategy: SyncStrategy,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub summary: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: i64,
    pub run_id: String,
    pub resource: Resource,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub items_processed: i64,
    pub error: Option<String>,
}

/// Per-organization sync configuration and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    pub organization: String,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_successful_at: Option<DateTime<Utc>>,
    pub auto_sync_enabled: bool,
    pub auto_sync_interval_minutes: Option<i64>,
}

/// An issue selected for an ownership re-check.
#[derive(Debug, Clone, Serialize)]
pub struct RealignCandidate {
    pub id: String,
    pub kind: ItemKind,
    pub number: i64,
    pub url: String,
    pub repository_id: String,
    pub repository_name_with_owner: String,
    pub mismatched: bool,
    pub ownership_verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSnapshot {
    pub issue_id: String,
    pub comment_count: i64,
    pub reaction_count: i64,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub issue_id: String,
    pub state: String,
    pub changed_at: DateTime<Utc>,
}

/// Locally curated project fields; never fetched from the remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectOverride {
    pub issue_id: String,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub target_date: Option<String>,
    pub updated_at: DateTime<Utc>,
}
