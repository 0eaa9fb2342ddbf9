//! GraphQL query documents and typed responses
//!
//! The documents are an external contract with the upstream API. Response
//! structs derive `Serialize` as well so a normalized node can be stored
//! verbatim as an entity's raw payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::UserRecord;

const ACTOR_FIELDS: &str = r#"
fragment ActorFields on Actor {
  __typename
  login
  avatarUrl
  ... on User { id name }
  ... on Bot { id }
  ... on Organization { id name }
  ... on Mannequin { id }
}
"#;

const REACTION_FIELDS: &str = r#"
fragment ReactionFields on Reaction {
  id
  content
  createdAt
  user { __typename id login name avatarUrl }
}
"#;

const REPOSITORY_FIELDS: &str = r#"
fragment RepositoryFields on Repository {
  id
  name
  nameWithOwner
  url
  isPrivate
  isArchived
  updatedAt
}
"#;

const COMMENT_FIELDS: &str = r#"
fragment CommentFields on Comment {
  __typename
  ... on Node { id }
  body
  createdAt
  updatedAt
  author { ...ActorFields }
  ... on UniformResourceLocatable { url }
  ... on Reactable { reactions(first: 50) { nodes { ...ReactionFields } } }
  ... on PullRequestReviewComment { pullRequestReview { id } replyTo { id } }
  ... on DiscussionComment { replyTo { id } }
}
"#;

const ISSUE_FIELDS: &str = r#"
fragment IssueFields on Issue {
  id
  number
  title
  body
  state
  url
  createdAt
  updatedAt
  closedAt
  author { ...ActorFields }
  assignees(first: 25) { nodes { ...ActorFields } }
  labels(first: 25) { nodes { name } }
  reactions(first: 50) { nodes { ...ReactionFields } }
  projectItems(first: 20) {
    nodes {
      id
      updatedAt
      project { title }
      status: fieldValueByName(name: $statusField) {
        __typename
        ... on ProjectV2ItemFieldSingleSelectValue { name updatedAt }
        ... on ProjectV2ItemFieldIterationValue { title updatedAt }
        ... on ProjectV2ItemFieldTextValue { text updatedAt }
        ... on ProjectV2ItemFieldNumberValue { number updatedAt }
        ... on ProjectV2ItemFieldDateValue { date updatedAt }
      }
    }
  }
}
"#;

const PULL_REQUEST_FIELDS: &str = r#"
fragment PullRequestFields on PullRequest {
  id
  number
  title
  body
  state
  url
  isDraft
  createdAt
  updatedAt
  closedAt
  mergedAt
  author { ...ActorFields }
  assignees(first: 25) { nodes { ...ActorFields } }
  labels(first: 25) { nodes { name } }
  reactions(first: 50) { nodes { ...ReactionFields } }
  reviewRequests(first: 50) {
    nodes {
      id
      requestedReviewer {
        __typename
        ... on User { id login name avatarUrl }
        ... on Team { id name }
      }
    }
  }
}
"#;

const DISCUSSION_FIELDS: &str = r#"
fragment DiscussionFields on Discussion {
  id
  number
  title
  body
  url
  closed
  createdAt
  updatedAt
  closedAt
  author { ...ActorFields }
  category { name }
  labels(first: 25) { nodes { name } }
  reactions(first: 50) { nodes { ...ReactionFields } }
  answer { ...CommentFields }
}
"#;

const REPOSITORIES_QUERY: &str = r#"
query OrgRepositories($org: String!, $cursor: String, $pageSize: Int!) {
  organization(login: $org) {
    repositories(first: $pageSize, after: $cursor, orderBy: { field: UPDATED_AT, direction: DESC }) {
      pageInfo { hasNextPage endCursor }
      nodes { ...RepositoryFields }
    }
  }
}
"#;

const ISSUES_QUERY: &str = r#"
query RepoIssues($owner: String!, $name: String!, $cursor: String, $pageSize: Int!, $statusField: String!) {
  repository(owner: $owner, name: $name) {
    issues(first: $pageSize, after: $cursor, orderBy: { field: UPDATED_AT, direction: DESC }) {
      pageInfo { hasNextPage endCursor }
      nodes { ...IssueFields }
    }
  }
}
"#;

const DISCUSSIONS_QUERY: &str = r#"
query RepoDiscussions($owner: String!, $name: String!, $cursor: String, $pageSize: Int!) {
  repository(owner: $owner, name: $name) {
    discussions(first: $pageSize, after: $cursor, orderBy: { field: UPDATED_AT, direction: DESC }) {
      pageInfo { hasNextPage endCursor }
      nodes { ...DiscussionFields }
    }
  }
}
"#;

const PULL_REQUESTS_QUERY: &str = r#"
query RepoPullRequests($owner: String!, $name: String!, $cursor: String, $pageSize: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequests(first: $pageSize, after: $cursor, orderBy: { field: UPDATED_AT, direction: DESC }) {
      pageInfo { hasNextPage endCursor }
      nodes { ...PullRequestFields }
    }
  }
}
"#;

const COMMENTS_QUERY: &str = r#"
query NodeComments($id: ID!, $cursor: String, $pageSize: Int!) {
  node(id: $id) {
    __typename
    ... on Issue {
      comments(first: $pageSize, after: $cursor) { pageInfo { hasNextPage endCursor } nodes { ...CommentFields } }
    }
    ... on PullRequest {
      comments(first: $pageSize, after: $cursor) { pageInfo { hasNextPage endCursor } nodes { ...CommentFields } }
    }
    ... on PullRequestReview {
      comments(first: $pageSize, after: $cursor) { pageInfo { hasNextPage endCursor } nodes { ...CommentFields } }
    }
    ... on Discussion {
      comments(first: $pageSize, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes {
          ...CommentFields
          replies(first: 50) { pageInfo { hasNextPage endCursor } nodes { ...CommentFields } }
        }
      }
    }
    ... on DiscussionComment {
      comments: replies(first: $pageSize, after: $cursor) { pageInfo { hasNextPage endCursor } nodes { ...CommentFields } }
    }
  }
}
"#;

const REVIEWS_QUERY: &str = r#"
query PullRequestReviews($id: ID!, $cursor: String, $pageSize: Int!) {
  node(id: $id) {
    __typename
    ... on PullRequest {
      reviews(first: $pageSize, after: $cursor) {
        pageInfo { hasNextPage endCursor }
        nodes {
          id
          state
          body
          url
          submittedAt
          createdAt
          updatedAt
          author { ...ActorFields }
          reactions(first: 50) { nodes { ...ReactionFields } }
        }
      }
    }
  }
}
"#;

const OPEN_ISSUES_QUERY: &str = r#"
query OpenIssues($owner: String!, $name: String!, $cursor: String, $pageSize: Int!) {
  repository(owner: $owner, name: $name) {
    issues(first: $pageSize, after: $cursor, states: [OPEN]) {
      pageInfo { hasNextPage endCursor }
      nodes {
        id
        number
        updatedAt
        assignees(first: 25) { nodes { ...ActorFields } }
      }
    }
  }
}
"#;

const OPEN_PULL_REQUESTS_QUERY: &str = r#"
query OpenPullRequests($owner: String!, $name: String!, $cursor: String, $pageSize: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequests(first: $pageSize, after: $cursor, states: [OPEN]) {
      pageInfo { hasNextPage endCursor }
      nodes {
        id
        number
        updatedAt
        assignees(first: 25) { nodes { ...ActorFields } }
        reviewRequests(first: 50) {
          nodes {
            id
            requestedReviewer {
              __typename
              ... on User { id login name avatarUrl }
              ... on Team { id name }
            }
          }
        }
      }
    }
  }
}
"#;

const NODE_QUERY: &str = r#"
query SingleNode($id: ID!, $statusField: String!) {
  node(id: $id) {
    __typename
    ... on Issue { ...IssueFields repository { ...RepositoryFields } }
    ... on PullRequest { ...PullRequestFields repository { ...RepositoryFields } }
    ... on Discussion { ...DiscussionFields repository { ...RepositoryFields } }
  }
}
"#;

/// Assembled query documents, one per upstream operation
pub mod queries {
    use super::*;

    fn document(parts: &[&str]) -> String {
        parts.concat()
    }

    pub fn repositories() -> String {
        document(&[REPOSITORIES_QUERY, REPOSITORY_FIELDS])
    }

    pub fn issues() -> String {
        document(&[ISSUES_QUERY, ISSUE_FIELDS, ACTOR_FIELDS, REACTION_FIELDS])
    }

    pub fn discussions() -> String {
        document(&[
            DISCUSSIONS_QUERY,
            DISCUSSION_FIELDS,
            COMMENT_FIELDS,
            ACTOR_FIELDS,
            REACTION_FIELDS,
        ])
    }

    pub fn pull_requests() -> String {
        document(&[
            PULL_REQUESTS_QUERY,
            PULL_REQUEST_FIELDS,
            ACTOR_FIELDS,
            REACTION_FIELDS,
        ])
    }

    pub fn comments() -> String {
        document(&[COMMENTS_QUERY, COMMENT_FIELDS, ACTOR_FIELDS, REACTION_FIELDS])
    }

    pub fn reviews() -> String {
        document(&[REVIEWS_QUERY, ACTOR_FIELDS, REACTION_FIELDS])
    }

    pub fn open_issues() -> String {
        document(&[OPEN_ISSUES_QUERY, ACTOR_FIELDS])
    }

    pub fn open_pull_requests() -> String {
        document(&[OPEN_PULL_REQUESTS_QUERY, ACTOR_FIELDS])
    }

    pub fn node() -> String {
        document(&[
            NODE_QUERY,
            ISSUE_FIELDS,
            PULL_REQUEST_FIELDS,
            DISCUSSION_FIELDS,
            COMMENT_FIELDS,
            REPOSITORY_FIELDS,
            ACTOR_FIELDS,
            REACTION_FIELDS,
        ])
    }
}

// ============================================================================
// Response shapes
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(default)]
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// A cursor-paginated list. Small nested lists reuse it without page info.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection<T> {
    #[serde(default)]
    pub page_info: PageInfo,
    #[serde(default = "Vec::new")]
    pub nodes: Vec<Option<T>>,
}

impl<T> Default for Connection<T> {
    fn default() -> Self {
        Self {
            page_info: PageInfo::default(),
            nodes: Vec::new(),
        }
    }
}

impl<T> Connection<T> {
    /// Non-null nodes, in connection order.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.nodes.iter().flatten()
    }

    pub fn into_items(self) -> Vec<T> {
        self.nodes.into_iter().flatten().collect()
    }

    /// Cursor for the next page, or `None` once the connection is exhausted.
    pub fn next_cursor(&self) -> Option<String> {
        if self.page_info.has_next_page {
            self.page_info.end_cursor.clone()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(rename = "__typename", default, skip_serializing_if = "Option::is_none")]
    pub typename: Option<String>,
    pub id: Option<String>,
    #[serde(default)]
    pub login: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

impl Actor {
    /// Store record for this actor; actors without a node id are not mirrored.
    pub fn to_record(&self) -> Option<UserRecord> {
        let id = self.id.clone()?;
        Some(UserRecord {
            id,
            login: self.login.clone(),
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
            raw: serde_json::to_value(self).unwrap_or(Value::Null),
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryNode {
    pub id: String,
    pub name: String,
    pub name_with_owner: String,
    pub url: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_archived: bool,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionNode {
    pub id: String,
    pub content: String,
    pub created_at: Option<String>,
    pub user: Option<Actor>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectRef {
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectItemNode {
    pub id: String,
    pub updated_at: Option<String>,
    pub project: Option<ProjectRef>,
    /// Raw field-value object; its label key depends on the field type.
    pub status: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueNode {
    pub id: String,
    pub number: i64,
    #[serde(default)]
    pub title: String,
    pub body: Option<String>,
    #[serde(default)]
    pub state: String,
    pub url: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub closed_at: Option<String>,
    pub author: Option<Actor>,
    #[serde(default)]
    pub assignees: Connection<Actor>,
    #[serde(default)]
    pub labels: Connection<Label>,
    #[serde(default)]
    pub reactions: Connection<ReactionNode>,
    #[serde(default)]
    pub project_items: Connection<ProjectItemNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryNode>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedReviewer {
    #[serde(rename = "__typename")]
    pub typename: String,
    pub id: Option<String>,
    pub login: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

impl RequestedReviewer {
    /// The reviewer as a user actor; team requests yield `None`.
    pub fn as_user(&self) -> Option<Actor> {
        if self.typename != "User" {
            return None;
        }
        Some(Actor {
            typename: Some(self.typename.clone()),
            id: Some(self.id.clone()?),
            login: self.login.clone().unwrap_or_default(),
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequestNode {
    pub id: String,
    pub requested_reviewer: Option<RequestedReviewer>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestNode {
    pub id: String,
    pub number: i64,
    #[serde(default)]
    pub title: String,
    pub body: Option<String>,
    #[serde(default)]
    pub state: String,
    pub url: Option<String>,
    #[serde(default)]
    pub is_draft: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub closed_at: Option<String>,
    pub merged_at: Option<String>,
    pub author: Option<Actor>,
    #[serde(default)]
    pub assignees: Connection<Actor>,
    #[serde(default)]
    pub labels: Connection<Label>,
    #[serde(default)]
    pub reactions: Connection<ReactionNode>,
    #[serde(default)]
    pub review_requests: Connection<ReviewRequestNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryNode>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Category {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentNode {
    #[serde(rename = "__typename", default, skip_serializing_if = "Option::is_none")]
    pub typename: Option<String>,
    pub id: String,
    pub body: Option<String>,
    pub url: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub author: Option<Actor>,
    #[serde(default)]
    pub reactions: Connection<ReactionNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_review: Option<NodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<NodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies: Option<Connection<CommentNode>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionNode {
    pub id: String,
    pub number: i64,
    #[serde(default)]
    pub title: String,
    pub body: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub closed: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub closed_at: Option<String>,
    pub author: Option<Actor>,
    pub category: Option<Category>,
    #[serde(default)]
    pub labels: Connection<Label>,
    #[serde(default)]
    pub reactions: Connection<ReactionNode>,
    pub answer: Option<CommentNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryNode>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewNode {
    pub id: String,
    #[serde(default)]
    pub state: String,
    pub body: Option<String>,
    pub url: Option<String>,
    pub submitted_at: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub author: Option<Actor>,
    #[serde(default)]
    pub reactions: Connection<ReactionNode>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenItemNode {
    pub id: String,
    pub number: i64,
    pub updated_at: Option<String>,
    #[serde(default)]
    pub assignees: Connection<Actor>,
    #[serde(default)]
    pub review_requests: Connection<ReviewRequestNode>,
}

// ---------------------------------------------------------------------------
// Top-level `data` payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OrgRepositoriesData {
    pub organization: Option<OrgRepositories>,
}

#[derive(Debug, Deserialize)]
pub struct OrgRepositories {
    pub repositories: Connection<RepositoryNode>,
}

#[derive(Debug, Deserialize)]
pub struct RepoIssuesData {
    pub repository: Option<RepoIssues>,
}

#[derive(Debug, Deserialize)]
pub struct RepoIssues {
    pub issues: Connection<IssueNode>,
}

#[derive(Debug, Deserialize)]
pub struct RepoDiscussionsData {
    pub repository: Option<RepoDiscussions>,
}

#[derive(Debug, Deserialize)]
pub struct RepoDiscussions {
    pub discussions: Connection<DiscussionNode>,
}

#[derive(Debug, Deserialize)]
pub struct RepoPullRequestsData {
    pub repository: Option<RepoPullRequests>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoPullRequests {
    pub pull_requests: Connection<PullRequestNode>,
}

#[derive(Debug, Deserialize)]
pub struct NodeCommentsData {
    pub node: Option<CommentsHolder>,
}

#[derive(Debug, Deserialize)]
pub struct CommentsHolder {
    #[serde(rename = "__typename")]
    pub typename: String,
    pub comments: Option<Connection<CommentNode>>,
}

#[derive(Debug, Deserialize)]
pub struct NodeReviewsData {
    pub node: Option<ReviewsHolder>,
}

#[derive(Debug, Deserialize)]
pub struct ReviewsHolder {
    pub reviews: Option<Connection<ReviewNode>>,
}

#[derive(Debug, Deserialize)]
pub struct OpenIssuesData {
    pub repository: Option<OpenIssues>,
}

#[derive(Debug, Deserialize)]
pub struct OpenIssues {
    pub issues: Connection<OpenItemNode>,
}

#[derive(Debug, Deserialize)]
pub struct OpenPullRequestsData {
    pub repository: Option<OpenPullRequests>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPullRequests {
    pub pull_requests: Connection<OpenItemNode>,
}

#[derive(Debug, Deserialize)]
pub struct SingleNodeData {
    pub node: Option<Value>,
}
