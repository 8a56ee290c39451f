//! Upstream wire types
//!
//! The upstream API wraps everything in listing envelopes whose children
//! carry a kind tag (`t1` comment, `t3` post, `t4` message). The raw shapes
//! are deserialized here and mapped onto the flat types the workers use.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use super::Error;

/// Listing envelope as returned by the upstream API.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    pub data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EnvelopeData {
    #[serde(default)]
    pub children: Vec<Child>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Child {
    pub kind: String,
    pub data: serde_json::Value,
}

fn timestamp(value: &serde_json::Value, key: &str) -> DateTime<Utc> {
    let secs = value.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
    Utc.timestamp_opt(secs as i64, 0).single().unwrap_or_default()
}

fn text(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn number(value: &serde_json::Value, key: &str) -> i64 {
    value.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
}

// =============================================================================
// Inbox messages
// =============================================================================

/// One inbox item: a comment reply, post reply, mention or private message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Short id (no kind prefix)
    pub id: String,
    /// Fullname (kind-prefixed id) used as the high-water marker
    pub name: String,
    /// Child kind: "t1" for comment-shaped, "t4" for message-shaped
    pub kind: String,
    pub subject: String,
    pub author: String,
    pub body: String,
    pub subreddit: String,
    /// Permalink context for comment-shaped items
    pub context: String,
    pub parent_id: String,
    /// Title of the post a comment-shaped item belongs to
    pub link_title: String,
    pub destination: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub(crate) fn from_child(child: &Child) -> Self {
        let d = &child.data;
        Self {
            id: text(d, "id"),
            name: text(d, "name"),
            kind: child.kind.clone(),
            subject: text(d, "subject"),
            author: text(d, "author"),
            body: text(d, "body"),
            subreddit: text(d, "subreddit"),
            context: text(d, "context"),
            parent_id: text(d, "parent_id"),
            link_title: text(d, "link_title"),
            destination: text(d, "dest"),
            created_at: timestamp(d, "created_utc"),
        }
    }
}

// =============================================================================
// Posts
// =============================================================================

/// A submitted post, as observed by the watcher workers.
#[derive(Debug, Clone)]
pub struct Post {
    /// Fullname (t3-prefixed)
    pub id: String,
    pub title: String,
    pub author: String,
    pub subreddit: String,
    /// Self-text body; empty for link posts
    pub body: String,
    pub flair: String,
    pub domain: String,
    pub score: i64,
    pub num_comments: i64,
    pub created_at: DateTime<Utc>,
    pub permalink: String,
}

impl Post {
    pub(crate) fn from_child(child: &Child) -> Self {
        let d = &child.data;
        Self {
            id: text(d, "name"),
            title: text(d, "title"),
            author: text(d, "author"),
            subreddit: text(d, "subreddit"),
            body: text(d, "selftext"),
            flair: text(d, "link_flair_text"),
            domain: text(d, "domain"),
            score: number(d, "score"),
            num_comments: number(d, "num_comments"),
            created_at: timestamp(d, "created_utc"),
            permalink: text(d, "permalink"),
        }
    }
}

// =============================================================================
// Thread comments
// =============================================================================

/// A top-level comment on a tracked thread.
#[derive(Debug, Clone)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub body: String,
    pub score: i64,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub(crate) fn from_child(child: &Child) -> Self {
        let d = &child.data;
        Self {
            id: text(d, "id"),
            author: text(d, "author"),
            body: text(d, "body"),
            score: number(d, "score"),
            created_at: timestamp(d, "created_utc"),
        }
    }
}

/// A thread post together with its top-level comments.
#[derive(Debug, Clone)]
pub struct Thread {
    pub post: Post,
    pub comments: Vec<Comment>,
}

impl Thread {
    /// The comments endpoint returns two envelopes: the post listing and
    /// the comment listing.
    pub(crate) fn from_envelopes(envelopes: Vec<Envelope>) -> Result<Self, Error> {
        let mut iter = envelopes.into_iter();
        let post_env = iter
            .next()
            .ok_or_else(|| Error::Decode("missing post listing".to_string()))?;
        let comments_env = iter
            .next()
            .ok_or_else(|| Error::Decode("missing comment listing".to_string()))?;

        let post_child = post_env
            .data
            .children
            .first()
            .ok_or_else(|| Error::Decode("empty post listing".to_string()))?;
        let post = Post::from_child(post_child);

        let comments = comments_env
            .data
            .children
            .iter()
            .filter(|child| child.kind == "t1")
            .map(Comment::from_child)
            .collect();

        Ok(Self { post, comments })
    }
}

// =============================================================================
// Token refresh
// =============================================================================

/// Result of a refresh-token exchange.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of the new access token
    pub expiry: std::time::Duration,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(json: &str) -> Envelope {
        serde_json::from_str(json).expect("envelope parses")
    }

    #[test]
    fn message_parses_comment_reply_fields() {
        let envelope = listing(
            r#"{"kind": "Listing", "data": {"children": [
                {"kind": "t1", "data": {
                    "id": "abc", "name": "t1_abc", "subject": "comment reply",
                    "author": "alice", "body": "nice post", "subreddit": "rust",
                    "context": "/r/rust/comments/xyz/_/abc/?context=3",
                    "parent_id": "t3_xyz", "link_title": "A post",
                    "created_utc": 1685620800.0
                }}
            ], "after": null}}"#,
        );

        let message = Message::from_child(&envelope.data.children[0]);
        assert_eq!(message.name, "t1_abc");
        assert_eq!(message.kind, "t1");
        assert_eq!(message.subject, "comment reply");
        assert_eq!(message.link_title, "A post");
        assert_eq!(message.created_at.timestamp(), 1_685_620_800);
    }

    #[test]
    fn post_parses_filterable_fields() {
        let envelope = listing(
            r#"{"kind": "Listing", "data": {"children": [
                {"kind": "t3", "data": {
                    "name": "t3_xyz", "title": "HELLO world", "author": "alice",
                    "subreddit": "r", "selftext": "", "link_flair_text": "News",
                    "domain": "example.com", "score": 10, "num_comments": 4,
                    "created_utc": 1685620800.0, "permalink": "/r/r/comments/xyz"
                }}
            ]}}"#,
        );

        let post = Post::from_child(&envelope.data.children[0]);
        assert_eq!(post.id, "t3_xyz");
        assert_eq!(post.flair, "News");
        assert_eq!(post.score, 10);
        assert_eq!(post.domain, "example.com");
    }

    #[test]
    fn thread_splits_post_and_comments() {
        let envelopes: Vec<Envelope> = serde_json::from_str(
            r#"[
                {"kind": "Listing", "data": {"children": [
                    {"kind": "t3", "data": {"name": "t3_xyz", "title": "Game thread",
                     "author": "mod", "subreddit": "r", "score": 100,
                     "num_comments": 2, "created_utc": 1685620800.0}}
                ]}},
                {"kind": "Listing", "data": {"children": [
                    {"kind": "t1", "data": {"id": "c1", "author": "a", "body": "first",
                     "score": 5, "created_utc": 1685620860.0}},
                    {"kind": "more", "data": {}},
                    {"kind": "t1", "data": {"id": "c2", "author": "b", "body": "second",
                     "score": 9, "created_utc": 1685620920.0}}
                ]}}
            ]"#,
        )
        .expect("thread envelopes parse");

        let thread = Thread::from_envelopes(envelopes).expect("thread builds");
        assert_eq!(thread.post.num_comments, 2);
        assert_eq!(thread.comments.len(), 2);
        assert_eq!(thread.comments[1].id, "c2");
    }

    #[test]
    fn missing_fields_default() {
        let envelope = listing(
            r#"{"kind": "Listing", "data": {"children": [
                {"kind": "t4", "data": {"id": "m1", "name": "t4_m1"}}
            ]}}"#,
        );

        let message = Message::from_child(&envelope.data.children[0]);
        assert_eq!(message.author, "");
        assert_eq!(message.created_at.timestamp(), 0);
    }
}
