//! Conversion of raw GraphQL nodes into store records.
//!
//! Each converter keeps the raw node as the record payload and returns the
//! actors it references so callers can upsert them first.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

use super::types::{
    decode, ActorNode, CommentNode, ItemNode, PullRequestNode, RepositoryNode, ReviewNode,
    TimelineEventNode,
};
use crate::database::models::{
    Actor, Comment, Issue, ItemKind, ParentRef, PullRequest, Reaction, Repository, Review,
    ReviewRequest,
};
use crate::error::SyncError;

/// A canonical issue or discussion URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUrl {
    pub owner: String,
    pub name: String,
    pub kind: ItemKind,
    pub number: i64,
}

impl ItemUrl {
    pub fn parse(url: &str) -> Option<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^https?://github\.com/([^/]+)/([^/]+)/(issues|discussions)/(\d+)/?(?:[?#].*)?$")
                .unwrap_or_else(|e| panic!("invalid item url pattern: {}", e))
        });

        let captures = pattern.captures(url.trim())?;
        let kind = match &captures[3] {
            "issues" => ItemKind::Issue,
            _ => ItemKind::Discussion,
        };

        Some(Self {
            owner: captures[1].to_string(),
            name: captures[2].to_string(),
            kind,
            number: captures[4].parse().ok()?,
        })
    }

    pub fn name_with_owner(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

pub struct ConvertedRepository {
    pub owner: Actor,
    pub repository: Repository,
}

pub struct ConvertedItem {
    pub author: Option<Actor>,
    pub issue: Issue,
    pub project_item_ids: Vec<String>,
    pub reactions: Vec<(Option<Actor>, Reaction)>,
}

pub struct ConvertedPullRequest {
    pub author: Option<Actor>,
    pub pull_request: PullRequest,
    pub closing_issue_ids: Vec<String>,
    pub reactions: Vec<(Option<Actor>, Reaction)>,
}

pub struct ConvertedComment {
    pub author: Option<Actor>,
    pub comment: Comment,
    pub reactions: Vec<(Option<Actor>, Reaction)>,
}

/// Build an actor record; `None` for null or id-less actors (e.g. deleted users).
pub fn actor(raw: &Value) -> Result<Option<Actor>, SyncError> {
    if raw.is_null() {
        return Ok(None);
    }
    let node: ActorNode = decode(raw, "actor")?;
    Ok(actor_from_node(node, raw))
}

fn actor_from_node(node: ActorNode, raw: &Value) -> Option<Actor> {
    let id = node.id?;
    let login = node.login.or(node.slug)?;

    Some(Actor {
        id,
        login,
        name: node.name,
        avatar_url: node.avatar_url,
        created_at: node.created_at,
        updated_at: node.updated_at,
        payload: raw.clone(),
    })
}

fn actor_at(raw: &Value, field: &str) -> Result<Option<Actor>, SyncError> {
    match raw.get(field) {
        Some(value) => actor(value),
        None => Ok(None),
    }
}

pub fn repository(raw: &Value) -> Result<ConvertedRepository, SyncError> {
    let node: RepositoryNode = decode(raw, "repository")?;
    let owner = actor_at(raw, "owner")?.ok_or_else(|| SyncError::missing_field("repository.owner.id"))?;

    let repository = Repository {
        id: node.id,
        name: node.name,
        name_with_owner: node.name_with_owner,
        owner_id: owner.id.clone(),
        visibility: node.visibility,
        is_archived: node.is_archived,
        url: node.url,
        created_at: node.created_at,
        updated_at: node.updated_at,
        payload: raw.clone(),
    };

    Ok(ConvertedRepository { owner, repository })
}

/// Convert an issue or discussion node owned by `repository_id`.
pub fn item(raw: &Value, repository_id: &str) -> Result<ConvertedItem, SyncError> {
    let node: ItemNode = decode(raw, "item")?;
    let kind = ItemKind::from_typename(&node.typename).ok_or_else(|| {
        SyncError::PayloadError(format!("Unsupported item type: {}", node.typename))
    })?;

    let author = actor_at(raw, "author")?;
    let parent = ParentRef::Issue(node.id.clone());
    let reactions = reactions(raw.get("reactions"), &parent, None)?;
    let project_item_ids = node.project_item_ids();
    let state = node.normalized_state();

    let issue = Issue {
        id: node.id,
        number: node.number,
        repository_id: repository_id.to_string(),
        author_id: author.as_ref().map(|a| a.id.clone()),
        kind,
        title: node.title,
        state,
        url: node.url,
        created_at: node.created_at,
        updated_at: node.updated_at,
        closed_at: node.closed_at,
        payload: raw.clone(),
        ownership_verified_at: None,
    };

    Ok(ConvertedItem {
        author,
        issue,
        project_item_ids,
        reactions,
    })
}

pub fn pull_request(raw: &Value, repository_id: &str) -> Result<ConvertedPullRequest, SyncError> {
    let node: PullRequestNode = decode(raw, "pull request")?;
    let author = actor_at(raw, "author")?;
    let parent = ParentRef::PullRequest(node.id.clone());
    let reactions = reactions(raw.get("reactions"), &parent, None)?;
    let closing_issue_ids = node
        .closing_issues_references
        .as_ref()
        .map(|refs| refs.iter().map(|r| r.id.clone()).collect())
        .unwrap_or_default();

    let pull_request = PullRequest {
        id: node.id,
        number: node.number,
        repository_id: repository_id.to_string(),
        author_id: author.as_ref().map(|a| a.id.clone()),
        title: node.title,
        state: node.state,
        merged: node.merged,
        url: node.url,
        created_at: node.created_at,
        updated_at: node.updated_at,
        closed_at: node.closed_at,
        merged_at: node.merged_at,
        payload: raw.clone(),
    };

    Ok(ConvertedPullRequest {
        author,
        pull_request,
        closing_issue_ids,
        reactions,
    })
}

pub fn comment(raw: &Value, parent: &ParentRef) -> Result<ConvertedComment, SyncError> {
    let node: CommentNode = decode(raw, "comment")?;
    let author = actor_at(raw, "author")?;
    let reactions = reactions(raw.get("reactions"), parent, Some(&node.id))?;

    let comment = Comment {
        id: node.id,
        parent: parent.clone(),
        review_id: node.pull_request_review.map(|r| r.id),
        author_id: author.as_ref().map(|a| a.id.clone()),
        body: node.body.unwrap_or_default(),
        url: node.url,
        created_at: node.created_at,
        updated_at: node.updated_at,
        payload: raw.clone(),
    };

    Ok(ConvertedComment {
        author,
        comment,
        reactions,
    })
}

pub fn review(raw: &Value, pull_request_id: &str) -> Result<(Option<Actor>, Review), SyncError> {
    let node: ReviewNode = decode(raw, "review")?;
    let author = actor_at(raw, "author")?;

    let review = Review {
        id: node.id,
        pull_request_id: pull_request_id.to_string(),
        author_id: author.as_ref().map(|a| a.id.clone()),
        state: node.state,
        body: node.body,
        submitted_at: node.submitted_at,
        payload: raw.clone(),
    };

    Ok((author, review))
}

/// Reactions from a `reactions { nodes }` block.
pub fn reactions(
    block: Option<&Value>,
    parent: &ParentRef,
    comment_id: Option<&str>,
) -> Result<Vec<(Option<Actor>, Reaction)>, SyncError> {
    let Some(nodes) = block.and_then(|b| b.get("nodes")).and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let mut converted = Vec::with_capacity(nodes.len());
    for raw in nodes.iter().filter(|n| !n.is_null()) {
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::missing_field("reaction.id"))?;
        let content = raw
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::missing_field("reaction.content"))?;
        let created_at: DateTime<Utc> = decode(
            raw.get("createdAt").unwrap_or(&Value::Null),
            "reaction.createdAt",
        )?;
        let user = actor_at(raw, "user")?;

        let reaction = Reaction {
            id: id.to_string(),
            parent: parent.clone(),
            comment_id: comment_id.map(str::to_string),
            actor_id: user.as_ref().map(|u| u.id.clone()),
            content: content.to_string(),
            created_at,
        };
        converted.push((user, reaction));
    }

    Ok(converted)
}

/// Replay review-request timeline events into the set of reviewers still pending.
///
/// A reviewer drops out when a later removal event is seen or when they
/// submitted a review at or after their latest request.
pub fn pending_review_requests(
    pull_request_id: &str,
    events: &[Value],
    reviews: &[Review],
) -> Result<Vec<(Actor, ReviewRequest)>, SyncError> {
    let mut pending: BTreeMap<String, (Actor, DateTime<Utc>)> = BTreeMap::new();

    for raw in events.iter().filter(|e| !e.is_null()) {
        let event: TimelineEventNode = decode(raw, "timeline event")?;
        let Some(reviewer) = actor_at(raw, "requestedReviewer")? else {
            continue;
        };

        match event.typename.as_str() {
            "ReviewRequestedEvent" => {
                let requested_at = event
                    .created_at
                    .ok_or_else(|| SyncError::missing_field("timelineItems.createdAt"))?;
                pending.insert(reviewer.id.clone(), (reviewer, requested_at));
            }
            "ReviewRequestRemovedEvent" => {
                pending.remove(&reviewer.id);
            }
            _ => {}
        }
    }

    pending.retain(|reviewer_id, (_, requested_at)| {
        !reviews.iter().any(|review| {
            review.author_id.as_deref() == Some(reviewer_id.as_str())
                && review.submitted_at.is_some_and(|at| at >= *requested_at)
        })
    });

    Ok(pending
        .into_values()
        .map(|(reviewer, requested_at)| {
            let request = ReviewRequest {
                pull_request_id: pull_request_id.to_string(),
                reviewer_id: reviewer.id.clone(),
                requested_at,
            };
            (reviewer, request)
        })
        .collect())
}
