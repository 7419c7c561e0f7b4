//! GraphQL documents issued by the collector and the realignment pass.
//!
//! Every document selects `rateLimit` so the budget is refreshed on each call.

const ACTOR_FIELDS: &str = r#"
fragment ActorFields on Actor {
  __typename
  login
  avatarUrl
  ... on User { id name createdAt updatedAt }
  ... on Organization { id name createdAt updatedAt }
  ... on Bot { id createdAt updatedAt }
  ... on Mannequin { id createdAt updatedAt }
}
"#;

const REACTION_FIELDS: &str = r#"
fragment ReactionFields on Reaction {
  id
  content
  createdAt
  user { __typename id login name avatarUrl createdAt updatedAt }
}
"#;

const REPOSITORY_FIELDS: &str = r#"
fragment RepositoryFields on Repository {
  id
  name
  nameWithOwner
  visibility
  isArchived
  url
  createdAt
  updatedAt
  owner { ...ActorFields }
}
"#;

const COMMENT_FIELDS: &str = r#"
fragment CommentFields on Comment {
  __typename
  id
  body
  createdAt
  updatedAt
  author { ...ActorFields }
  ... on IssueComment { url reactions(first: 50) { nodes { ...ReactionFields } } }
  ... on DiscussionComment { url reactions(first: 50) { nodes { ...ReactionFields } } }
  ... on PullRequestReviewComment { url pullRequestReview { id } reactions(first: 50) { nodes { ...ReactionFields } } }
}
"#;

const ISSUE_FIELDS: &str = r#"
fragment IssueFields on Issue {
  __typename
  id
  number
  title
  state
  url
  createdAt
  updatedAt
  closedAt
  author { ...ActorFields }
  projectItems(first: 20) { nodes { id } }
  reactions(first: 50) { nodes { ...ReactionFields } }
}
"#;

const DISCUSSION_FIELDS: &str = r#"
fragment DiscussionFields on Discussion {
  __typename
  id
  number
  title
  closed
  url
  createdAt
  updatedAt
  closedAt
  author { ...ActorFields }
  reactions(first: 50) { nodes { ...ReactionFields } }
}
"#;

pub const ORGANIZATION_REPOSITORIES: &str = r#"
query OrganizationRepositories($org: String!, $first: Int!, $after: String) {
  rateLimit { remaining resetAt }
  organization(login: $org) {
    repositories(first: $first, after: $after, orderBy: { field: NAME, direction: ASC }) {
      pageInfo { hasNextPage endCursor }
      nodes { ...RepositoryFields }
    }
  }
}
"#;

pub const REPOSITORY_ISSUES: &str = r#"
query RepositoryIssues($owner: String!, $name: String!, $first: Int!, $after: String, $since: DateTime) {
  rateLimit { remaining resetAt }
  repository(owner: $owner, name: $name) {
    issues(first: $first, after: $after, orderBy: { field: UPDATED_AT, direction: DESC }, filterBy: { since: $since }) {
      pageInfo { hasNextPage endCursor }
      nodes { ...IssueFields }
    }
  }
}
"#;

pub const REPOSITORY_DISCUSSIONS: &str = r#"
query RepositoryDiscussions($owner: String!, $name: String!, $first: Int!, $after: String) {
  rateLimit { remaining resetAt }
  repository(owner: $owner, name: $name) {
    discussions(first: $first, after: $after, orderBy: { field: UPDATED_AT, direction: DESC }) {
      pageInfo { hasNextPage endCursor }
      nodes { ...DiscussionFields }
    }
  }
}
"#;

pub const REPOSITORY_PULL_REQUESTS: &str = r#"
query RepositoryPullRequests($owner: String!, $name: String!, $first: Int!, $after: String) {
  rateLimit { remaining resetAt }
  repository(owner: $owner, name: $name) {
    pullRequests(first: $first, after: $after, orderBy: { field: UPDATED_AT, direction: DESC }) {
      pageInfo { hasNextPage endCursor }
      nodes {
        __typename
        id
        number
        title
        state
        merged
        url
        createdAt
        updatedAt
        closedAt
        mergedAt
        author { ...ActorFields }
        closingIssuesReferences(first: 20) { nodes { id } }
        reactions(first: 50) { nodes { ...ReactionFields } }
      }
    }
  }
}
"#;

pub const NODE_COMMENTS: &str = r#"
query NodeComments($id: ID!, $first: Int!, $after: String) {
  rateLimit { remaining resetAt }
  node(id: $id) {
    ... on Issue { comments(first: $first, after: $after) { pageInfo { hasNextPage endCursor } nodes { ...CommentFields } } }
    ... on Discussion { comments(first: $first, after: $after) { pageInfo { hasNextPage endCursor } nodes { ...CommentFields } } }
    ... on PullRequest { comments(first: $first, after: $after) { pageInfo { hasNextPage endCursor } nodes { ...CommentFields } } }
  }
}
"#;

pub const PULL_REQUEST_REVIEWS: &str = r#"
query PullRequestReviews($id: ID!, $first: Int!, $after: String) {
  rateLimit { remaining resetAt }
  node(id: $id) {
    ... on PullRequest {
      reviews(first: $first, after: $after) {
        pageInfo { hasNextPage endCursor }
        nodes { id state body url submittedAt author { ...ActorFields } }
      }
    }
  }
}
"#;

pub const PULL_REQUEST_REVIEW_REQUESTS: &str = r#"
query PullRequestReviewRequests($id: ID!, $first: Int!, $after: String) {
  rateLimit { remaining resetAt }
  node(id: $id) {
    ... on PullRequest {
      timelineItems(first: $first, after: $after, itemTypes: [REVIEW_REQUESTED_EVENT, REVIEW_REQUEST_REMOVED_EVENT]) {
        pageInfo { hasNextPage endCursor }
        nodes {
          __typename
          ... on ReviewRequestedEvent { createdAt requestedReviewer { ...ReviewerFields } }
          ... on ReviewRequestRemovedEvent { createdAt requestedReviewer { ...ReviewerFields } }
        }
      }
    }
  }
}

fragment ReviewerFields on RequestedReviewer {
  __typename
  ... on User { id login name avatarUrl createdAt updatedAt }
  ... on Team { id slug name avatarUrl createdAt updatedAt }
  ... on Mannequin { id login avatarUrl createdAt updatedAt }
  ... on Bot { id login avatarUrl createdAt updatedAt }
}
"#;

pub const PULL_REQUEST_REVIEW_THREADS: &str = r#"
query PullRequestReviewThreads($id: ID!, $first: Int!, $after: String) {
  rateLimit { remaining resetAt }
  node(id: $id) {
    ... on PullRequest {
      reviewThreads(first: $first, after: $after) {
        pageInfo { hasNextPage endCursor }
        nodes {
          id
          comments(first: 50) { pageInfo { hasNextPage endCursor } nodes { ...CommentFields } }
        }
      }
    }
  }
}
"#;

pub const REVIEW_THREAD_COMMENTS: &str = r#"
query ReviewThreadComments($id: ID!, $first: Int!, $after: String) {
  rateLimit { remaining resetAt }
  node(id: $id) {
    ... on PullRequestReviewThread {
      comments(first: $first, after: $after) { pageInfo { hasNextPage endCursor } nodes { ...CommentFields } }
    }
  }
}
"#;

pub const ITEM_BY_ID: &str = r#"
query ItemById($id: ID!) {
  rateLimit { remaining resetAt }
  node(id: $id) {
    __typename
    ... on Issue { ...IssueFields repository { ...RepositoryFields } }
    ... on Discussion { ...DiscussionFields repository { ...RepositoryFields } }
  }
}
"#;

pub const ITEM_BY_URL: &str = r#"
query ItemByUrl($url: URI!) {
  rateLimit { remaining resetAt }
  resource(url: $url) {
    __typename
    ... on Issue { ...IssueFields repository { ...RepositoryFields } }
    ... on Discussion { ...DiscussionFields repository { ...RepositoryFields } }
  }
}
"#;

/// Append exactly the fragments a document references; GitHub rejects unused fragments.
pub fn document(query: &str) -> String {
    let mut doc = String::from(query);

    for (spread, fragment) in [
        ("...RepositoryFields", REPOSITORY_FIELDS),
        ("...IssueFields", ISSUE_FIELDS),
        ("...DiscussionFields", DISCUSSION_FIELDS),
        ("...CommentFields", COMMENT_FIELDS),
        ("...ReactionFields", REACTION_FIELDS),
        ("...ActorFields", ACTOR_FIELDS),
    ] {
        // Later fragments may be referenced by earlier ones, so test the growing document.
        if doc.contains(spread) {
            doc.push_str(fragment);
        }
    }
    doc
}
