#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use activity_sync::config::{AppConfig, RealignSettings, RetrySettings};
use activity_sync::database::models::{Actor, Comment, Issue, ItemKind, ParentRef, Repository};
use activity_sync::database::upsert::Upserts;
use activity_sync::database::Database;
use activity_sync::github::{GraphClient, GraphError, GraphResponse, RateLimit};
use activity_sync::realign::Realigner;
use activity_sync::sync::SyncOrchestrator;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

pub const ORG: &str = "acme";

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory()
        .await
        .expect("Failed to create test database")
}

/// Config with small pages and millisecond backoff
pub fn test_config() -> AppConfig {
    AppConfig {
        organization: ORG.to_string(),
        github_token: "test-token".to_string(),
        page_size: 2,
        retry: RetrySettings {
            max_retries: 2,
            min_backoff_ms: 1,
            max_backoff_ms: 5,
            max_wait_secs: 5,
        },
        realign: RealignSettings {
            after_sync: false,
            ..RealignSettings::default()
        },
        ..AppConfig::default()
    }
}

pub struct TestEngine {
    pub db: Database,
    pub client: Arc<MockGraphClient>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub realigner: Arc<Realigner>,
}

pub async fn setup_engine(client: MockGraphClient) -> TestEngine {
    setup_engine_with(client, test_config()).await
}

pub async fn setup_engine_with(client: MockGraphClient, config: AppConfig) -> TestEngine {
    let db = setup_test_db().await;
    let client = Arc::new(client);
    let (orchestrator, realigner) =
        activity_sync::build_engine(&config, db.clone(), client.clone());

    TestEngine {
        db,
        client,
        orchestrator,
        realigner,
    }
}

pub fn at(value: &str) -> DateTime<Utc> {
    value.parse().expect("valid RFC 3339 timestamp")
}

// ---------------------------------------------------------------------------
// Scripted GraphQL client
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    repositories: Vec<Value>,
    /// (operation, "owner/name") -> item nodes
    items: HashMap<(String, String), Vec<Value>>,
    /// (operation, node id) -> nested connection nodes
    nested: HashMap<(String, String), Vec<Value>>,
    nodes: HashMap<String, Value>,
    resources: HashMap<String, Value>,
    redirects: HashMap<String, String>,
    /// (operation, key) -> error returned on every matching call; key "*" matches all
    failures: HashMap<(String, String), GraphError>,
    scripted: HashMap<String, VecDeque<GraphResponse>>,
    rate_limit: Option<RateLimit>,
    delay: Option<Duration>,
    calls: Vec<(String, Value)>,
    call_times: Vec<DateTime<Utc>>,
    redirect_calls: Vec<String>,
}

/// In-process stand-in for the GitHub GraphQL API.
///
/// Responses are keyed by operation name and variables; connections are
/// paged using the request's `first`/`after` with numeric cursors.
#[derive(Default)]
pub struct MockGraphClient {
    state: Mutex<MockState>,
}

impl MockGraphClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn add_repository(&self, repository: Value) {
        self.lock().repositories.push(repository);
    }

    pub fn set_issues(&self, repo: &str, nodes: Vec<Value>) {
        self.set_items("RepositoryIssues", repo, nodes);
    }

    pub fn set_discussions(&self, repo: &str, nodes: Vec<Value>) {
        self.set_items("RepositoryDiscussions", repo, nodes);
    }

    pub fn set_pull_requests(&self, repo: &str, nodes: Vec<Value>) {
        self.set_items("RepositoryPullRequests", repo, nodes);
    }

    fn set_items(&self, operation: &str, repo: &str, nodes: Vec<Value>) {
        self.lock()
            .items
            .insert((operation.to_string(), repo.to_string()), nodes);
    }

    pub fn set_comments(&self, node_id: &str, nodes: Vec<Value>) {
        self.set_nested("NodeComments", node_id, nodes);
    }

    pub fn set_reviews(&self, pr_id: &str, nodes: Vec<Value>) {
        self.set_nested("PullRequestReviews", pr_id, nodes);
    }

    pub fn set_timeline(&self, pr_id: &str, nodes: Vec<Value>) {
        self.set_nested("PullRequestReviewRequests", pr_id, nodes);
    }

    pub fn set_review_threads(&self, pr_id: &str, nodes: Vec<Value>) {
        self.set_nested("PullRequestReviewThreads", pr_id, nodes);
    }

    pub fn set_thread_comments(&self, thread_id: &str, nodes: Vec<Value>) {
        self.set_nested("ReviewThreadComments", thread_id, nodes);
    }

    fn set_nested(&self, operation: &str, id: &str, nodes: Vec<Value>) {
        self.lock()
            .nested
            .insert((operation.to_string(), id.to_string()), nodes);
    }

    /// Node returned by `ItemById` for `id`.
    pub fn set_node(&self, id: &str, node: Value) {
        self.lock().nodes.insert(id.to_string(), node);
    }

    /// Node returned by `ItemByUrl` for `url`.
    pub fn set_resource(&self, url: &str, node: Value) {
        self.lock().resources.insert(url.to_string(), node);
    }

    pub fn set_redirect(&self, from: &str, to: &str) {
        self.lock()
            .redirects
            .insert(from.to_string(), to.to_string());
    }

    pub fn fail(&self, operation: &str, key: &str, error: GraphError) {
        self.lock()
            .failures
            .insert((operation.to_string(), key.to_string()), error);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Responses served, in order, before normal handling of `operation` resumes.
    pub fn script(&self, operation: &str, responses: Vec<GraphResponse>) {
        self.lock()
            .scripted
            .entry(operation.to_string())
            .or_default()
            .extend(responses);
    }

    pub fn set_rate_limit(&self, rate_limit: Option<RateLimit>) {
        self.lock().rate_limit = rate_limit;
    }

    /// Delay applied to every organization repository listing.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    pub fn calls(&self, operation: &str) -> Vec<Value> {
        self.lock()
            .calls
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, variables)| variables.clone())
            .collect()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls(operation).len()
    }

    /// When each request arrived, in order.
    pub fn call_times(&self) -> Vec<DateTime<Utc>> {
        self.lock().call_times.clone()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn redirect_calls(&self) -> Vec<String> {
        self.lock().redirect_calls.clone()
    }

    fn respond(&self, operation: &str, variables: &Value) -> (GraphResponse, Option<Duration>) {
        let mut state = self.lock();
        state
            .calls
            .push((operation.to_string(), variables.clone()));
        state.call_times.push(Utc::now());

        let delay = if operation == "OrganizationRepositories" {
            state.delay
        } else {
            None
        };
        let rate_limit = state.rate_limit;

        if let Some(response) = state
            .scripted
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            return (response, delay);
        }

        let key = request_key(variables);
        for candidate in [key.as_str(), "*"] {
            if let Some(error) = state
                .failures
                .get(&(operation.to_string(), candidate.to_string()))
            {
                return (GraphResponse::error(error.clone(), rate_limit), delay);
            }
        }

        let data = match operation {
            "OrganizationRepositories" => json!({
                "organization": { "repositories": page(&state.repositories, variables) }
            }),
            "RepositoryIssues" | "RepositoryDiscussions" | "RepositoryPullRequests" => {
                let field = match operation {
                    "RepositoryIssues" => "issues",
                    "RepositoryDiscussions" => "discussions",
                    _ => "pullRequests",
                };
                let mut nodes = state
                    .items
                    .get(&(operation.to_string(), key.clone()))
                    .cloned()
                    .unwrap_or_default();
                nodes.sort_by_key(|n| std::cmp::Reverse(updated_at(n)));
                let mut repository = serde_json::Map::new();
                repository.insert(field.to_string(), page(&nodes, variables));
                json!({ "repository": repository })
            }
            "NodeComments" | "PullRequestReviews" | "PullRequestReviewRequests"
            | "PullRequestReviewThreads" | "ReviewThreadComments" => {
                let field = match operation {
                    "PullRequestReviews" => "reviews",
                    "PullRequestReviewRequests" => "timelineItems",
                    "PullRequestReviewThreads" => "reviewThreads",
                    _ => "comments",
                };
                let nodes = state
                    .nested
                    .get(&(operation.to_string(), key.clone()))
                    .cloned()
                    .unwrap_or_default();
                let mut node = serde_json::Map::new();
                node.insert(field.to_string(), page(&nodes, variables));
                json!({ "node": node })
            }
            "ItemById" => json!({
                "node": state.nodes.get(&key).cloned().unwrap_or(Value::Null)
            }),
            "ItemByUrl" => json!({
                "resource": state.resources.get(&key).cloned().unwrap_or(Value::Null)
            }),
            other => {
                return (
                    GraphResponse::error(
                        GraphError::Query(vec![format!("unknown operation {}", other)]),
                        rate_limit,
                    ),
                    delay,
                )
            }
        };

        (GraphResponse::data(data, rate_limit), delay)
    }
}

#[async_trait]
impl GraphClient for MockGraphClient {
    async fn request(&self, document: &str, variables: Value) -> GraphResponse {
        let operation = operation_name(document);
        let (response, delay) = self.respond(&operation, &variables);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        response
    }

    async fn resolve_redirects(&self, url: &str, max_hops: usize) -> Result<String, GraphError> {
        let mut state = self.lock();
        state.redirect_calls.push(url.to_string());

        let mut current = url.to_string();
        for _ in 0..max_hops {
            match state.redirects.get(&current) {
                Some(next) => current = next.clone(),
                None => break,
            }
        }
        Ok(current)
    }
}

/// `OrganizationRepositories` from `"\nquery OrganizationRepositories($org: ..."`.
pub fn operation_name(document: &str) -> String {
    document
        .split("query ")
        .nth(1)
        .and_then(|rest| rest.split('(').next())
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn request_key(variables: &Value) -> String {
    if let (Some(owner), Some(name)) = (
        variables.get("owner").and_then(Value::as_str),
        variables.get("name").and_then(Value::as_str),
    ) {
        return format!("{}/{}", owner, name);
    }
    for field in ["id", "url", "org"] {
        if let Some(value) = variables.get(field).and_then(Value::as_str) {
            return value.to_string();
        }
    }
    String::new()
}

fn updated_at(node: &Value) -> DateTime<Utc> {
    node.get("updatedAt")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default()
}

fn page(nodes: &[Value], variables: &Value) -> Value {
    let first = variables
        .get("first")
        .and_then(Value::as_u64)
        .unwrap_or(100) as usize;
    let start = variables
        .get("after")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(0)
        .min(nodes.len());
    let end = (start + first).min(nodes.len());

    connection(&nodes[start..end], end < nodes.len(), &end.to_string())
}

pub fn connection(nodes: &[Value], has_next_page: bool, end_cursor: &str) -> Value {
    json!({
        "pageInfo": { "hasNextPage": has_next_page, "endCursor": end_cursor },
        "nodes": nodes
    })
}

// ---------------------------------------------------------------------------
// Payload builders
// ---------------------------------------------------------------------------

pub fn user(id: &str, login: &str) -> Value {
    json!({
        "__typename": "User",
        "id": id,
        "login": login,
        "name": null,
        "avatarUrl": format!("https://avatars.example/{}", login),
        "createdAt": "2020-01-01T00:00:00Z",
        "updatedAt": "2020-01-01T00:00:00Z"
    })
}

pub fn organization(login: &str) -> Value {
    json!({
        "__typename": "Organization",
        "id": format!("O_{}", login),
        "login": login,
        "name": login,
        "avatarUrl": null,
        "createdAt": "2019-01-01T00:00:00Z",
        "updatedAt": "2019-01-01T00:00:00Z"
    })
}

/// Repository node for `owner/name` with id `id`.
pub fn repository(id: &str, name_with_owner: &str) -> Value {
    let (owner, name) = name_with_owner.split_once('/').unwrap();
    json!({
        "id": id,
        "name": name,
        "nameWithOwner": name_with_owner,
        "visibility": "PUBLIC",
        "isArchived": false,
        "url": format!("https://github.com/{}", name_with_owner),
        "createdAt": "2021-01-01T00:00:00Z",
        "updatedAt": "2021-01-01T00:00:00Z",
        "owner": organization(owner)
    })
}

pub fn issue(id: &str, name_with_owner: &str, number: i64, updated_at: &str) -> Value {
    json!({
        "__typename": "Issue",
        "id": id,
        "number": number,
        "title": format!("Issue {}", number),
        "state": "OPEN",
        "url": format!("https://github.com/{}/issues/{}", name_with_owner, number),
        "createdAt": updated_at,
        "updatedAt": updated_at,
        "closedAt": null,
        "author": user("U_alice", "alice"),
        "projectItems": { "nodes": [] },
        "reactions": { "nodes": [] }
    })
}

pub fn discussion(id: &str, name_with_owner: &str, number: i64, updated_at: &str) -> Value {
    json!({
        "__typename": "Discussion",
        "id": id,
        "number": number,
        "title": format!("Discussion {}", number),
        "closed": false,
        "url": format!("https://github.com/{}/discussions/{}", name_with_owner, number),
        "createdAt": updated_at,
        "updatedAt": updated_at,
        "closedAt": null,
        "author": user("U_bob", "bob"),
        "reactions": { "nodes": [] }
    })
}

pub fn pull_request(id: &str, name_with_owner: &str, number: i64, updated_at: &str) -> Value {
    json!({
        "__typename": "PullRequest",
        "id": id,
        "number": number,
        "title": format!("Change {}", number),
        "state": "OPEN",
        "merged": false,
        "url": format!("https://github.com/{}/pull/{}", name_with_owner, number),
        "createdAt": updated_at,
        "updatedAt": updated_at,
        "closedAt": null,
        "mergedAt": null,
        "author": user("U_carol", "carol"),
        "closingIssuesReferences": { "nodes": [] },
        "reactions": { "nodes": [] }
    })
}

pub fn comment(id: &str, created_at: &str) -> Value {
    json!({
        "__typename": "IssueComment",
        "id": id,
        "body": format!("comment {}", id),
        "url": format!("https://github.com/comments/{}", id),
        "createdAt": created_at,
        "updatedAt": created_at,
        "author": user("U_dave", "dave"),
        "reactions": { "nodes": [] }
    })
}

pub fn reaction(id: &str, content: &str, created_at: &str) -> Value {
    json!({
        "id": id,
        "content": content,
        "createdAt": created_at,
        "user": user("U_erin", "erin")
    })
}

pub fn review(id: &str, author: Value, state: &str, submitted_at: &str) -> Value {
    json!({
        "id": id,
        "state": state,
        "body": "",
        "url": null,
        "submittedAt": submitted_at,
        "author": author
    })
}

pub fn review_requested(reviewer: Value, created_at: &str) -> Value {
    json!({
        "__typename": "ReviewRequestedEvent",
        "createdAt": created_at,
        "requestedReviewer": reviewer
    })
}

pub fn review_request_removed(reviewer: Value, created_at: &str) -> Value {
    json!({
        "__typename": "ReviewRequestRemovedEvent",
        "createdAt": created_at,
        "requestedReviewer": reviewer
    })
}

/// Review thread carrying the first page of its comments inline.
pub fn review_thread(id: &str, comments: Vec<Value>, more: bool) -> Value {
    let cursor = comments.len().to_string();
    json!({
        "id": id,
        "comments": connection(&comments, more, &cursor)
    })
}

/// `ItemById`/`ItemByUrl` node: an issue with its repository inlined.
pub fn resolved_issue(id: &str, repository_id: &str, name_with_owner: &str, number: i64) -> Value {
    let mut node = issue(id, name_with_owner, number, "2024-03-01T00:00:00Z");
    node["repository"] = repository(repository_id, name_with_owner);
    node
}

pub fn rate_limit(remaining: i64, reset_at: DateTime<Utc>) -> RateLimit {
    RateLimit {
        remaining,
        reset_at,
    }
}

// ---------------------------------------------------------------------------
// Direct store seeding
// ---------------------------------------------------------------------------

pub fn test_actor(id: &str, login: &str) -> Actor {
    Actor {
        id: id.to_string(),
        login: login.to_string(),
        name: None,
        avatar_url: None,
        created_at: None,
        updated_at: None,
        payload: json!({ "id": id, "login": login }),
    }
}

pub fn test_repository(id: &str, name_with_owner: &str) -> Repository {
    let name = name_with_owner
        .split_once('/')
        .map(|(_, name)| name)
        .unwrap_or(name_with_owner);
    Repository {
        id: id.to_string(),
        name: name.to_string(),
        name_with_owner: name_with_owner.to_string(),
        owner_id: format!("O_{}", ORG),
        visibility: Some("PUBLIC".to_string()),
        is_archived: false,
        url: Some(format!("https://github.com/{}", name_with_owner)),
        created_at: None,
        updated_at: None,
        payload: json!({ "id": id }),
    }
}

pub fn test_issue(id: &str, repository_id: &str, url: &str, number: i64) -> Issue {
    Issue {
        id: id.to_string(),
        number,
        repository_id: repository_id.to_string(),
        author_id: None,
        kind: ItemKind::Issue,
        title: format!("Issue {}", number),
        state: "OPEN".to_string(),
        url: url.to_string(),
        created_at: at("2024-01-01T00:00:00Z"),
        updated_at: at("2024-01-02T00:00:00Z"),
        closed_at: None,
        payload: json!({ "id": id }),
        ownership_verified_at: None,
    }
}

pub fn test_comment(id: &str, issue_id: &str, created_at: &str) -> Comment {
    Comment {
        id: id.to_string(),
        parent: ParentRef::Issue(issue_id.to_string()),
        review_id: None,
        author_id: None,
        body: format!("comment {}", id),
        url: None,
        created_at: at(created_at),
        updated_at: None,
        payload: json!({ "id": id }),
    }
}

/// Seed the organization actor and one repository.
pub async fn seed_repository(db: &Database, id: &str, name_with_owner: &str) {
    let mut conn = db.pool().acquire().await.unwrap();
    Upserts::upsert_actor(&mut conn, &test_actor(&format!("O_{}", ORG), ORG))
        .await
        .unwrap();
    Upserts::upsert_repository(&mut conn, &test_repository(id, name_with_owner))
        .await
        .unwrap();
}

pub async fn seed_issue(db: &Database, issue: &Issue) {
    let mut conn = db.pool().acquire().await.unwrap();
    Upserts::upsert_issue(&mut conn, issue).await.unwrap();
}

pub async fn seed_comment(db: &Database, comment: &Comment) {
    let mut conn = db.pool().acquire().await.unwrap();
    Upserts::upsert_comment(&mut conn, comment).await.unwrap();
}
