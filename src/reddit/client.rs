//! Upstream OAuth client
//!
//! One shared `Client` per process; per-account state lives on a
//! lightweight [`AuthenticatedClient`] handle constructed on each use.
//! Token refreshes are single-flighted per `(account id, refresh token)`
//! and total in-flight requests are bounded by a process-wide semaphore.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;

use super::singleflight;
use super::types::{Envelope, Message, Post, RefreshedTokens, Thread, TokenResponse};
use crate::metrics::UPSTREAM_REQUESTS_TOTAL;

const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
const API_BASE: &str = "https://oauth.reddit.com";

/// Default access-token lifetime when the exchange omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Longest the client will sleep waiting out a quota window.
const MAX_RATE_LIMIT_SLEEP: Duration = Duration::from_secs(10);

/// Upstream client error.
///
/// Clonable so that single-flighted refresh results can be shared across
/// concurrent callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The token endpoint answered `invalid_grant`
    #[error("upstream OAuth grant revoked")]
    OauthRevoked,

    /// The upstream signaled throttling; retried on a later tick
    #[error("upstream rate limit exceeded")]
    RateLimited,

    /// Any other non-success status
    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream response decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Remaining-quota hints read from upstream response headers.
#[derive(Debug, Clone, Copy)]
struct RateStatus {
    remaining: f64,
    reset_at: Option<Instant>,
}

/// Shared upstream client.
pub struct Client {
    client_id: String,
    client_secret: String,
    user_agent: String,
    http: reqwest::Client,
    /// Bounds total concurrent upstream requests (pool size P)
    permits: Arc<Semaphore>,
    refresh_group: singleflight::Group<(String, String), Result<RefreshedTokens, Error>>,
    rate: Mutex<RateStatus>,
}

impl Client {
    pub fn new(client_id: &str, client_secret: &str, user_agent: &str, pool_size: usize) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with static configuration");

        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            user_agent: user_agent.to_string(),
            http,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            refresh_group: singleflight::Group::new(),
            rate: Mutex::new(RateStatus {
                remaining: f64::MAX,
                reset_at: None,
            }),
        }
    }

    /// Construct a per-account handle carrying its own tokens. No I/O.
    pub fn new_authenticated(
        &self,
        reddit_account_id: &str,
        refresh_token: &str,
        access_token: &str,
    ) -> AuthenticatedClient<'_> {
        AuthenticatedClient {
            client: self,
            reddit_account_id: reddit_account_id.to_string(),
            refresh_token: refresh_token.to_string(),
            access_token: access_token.to_string(),
        }
    }

    fn observe_rate_headers(&self, headers: &reqwest::header::HeaderMap) {
        let remaining = headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        let reset = headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        if let Some(remaining) = remaining {
            let mut rate = self.rate.lock().expect("rate mutex poisoned");
            rate.remaining = remaining;
            rate.reset_at = reset.map(|secs| Instant::now() + Duration::from_secs(secs));
        }
    }

    /// Time to sleep before the next request, when the quota is exhausted.
    fn rate_limit_delay(&self) -> Option<Duration> {
        let rate = self.rate.lock().expect("rate mutex poisoned");
        if rate.remaining >= 1.0 {
            return None;
        }
        let reset_at = rate.reset_at?;
        let remaining = reset_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        Some(remaining.min(MAX_RATE_LIMIT_SLEEP))
    }
}

/// Per-account handle over the shared client.
pub struct AuthenticatedClient<'a> {
    client: &'a Client,
    reddit_account_id: String,
    refresh_token: String,
    access_token: String,
}

impl AuthenticatedClient<'_> {
    pub fn obfuscated_access_token(&self) -> String {
        obfuscate(&self.access_token)
    }

    pub fn obfuscated_refresh_token(&self) -> String {
        obfuscate(&self.refresh_token)
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Single-flight per `(account id, refresh token)`: concurrent callers
    /// with the same pair receive the result of one underlying exchange.
    pub async fn refresh_tokens(&self) -> Result<RefreshedTokens, Error> {
        let key = (self.reddit_account_id.clone(), self.refresh_token.clone());
        self.client
            .refresh_group
            .work(key, || self.exchange_refresh_token())
            .await
    }

    async fn exchange_refresh_token(&self) -> Result<RefreshedTokens, Error> {
        let _permit = self
            .client
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Transport("request pool closed".to_string()))?;

        let response = self
            .client
            .http
            .post(TOKEN_URL)
            .basic_auth(&self.client.client_id, Some(&self.client.client_secret))
            .header(reqwest::header::USER_AGENT, &self.client.user_agent)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.as_str()),
            ])
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&["token", "transport_error"])
                    .inc();
                return Err(err.into());
            }
        };

        let status = response.status();
        if status.as_u16() == 429 {
            UPSTREAM_REQUESTS_TOTAL
                .with_label_values(&["token", "rate_limited"])
                .inc();
            return Err(Error::RateLimited);
        }

        let text = response
            .text()
            .await
            .map_err(|err| Error::Decode(err.to_string()))?;
        let body = serde_json::from_str::<TokenResponse>(&text).ok();

        if let Some(body) = &body {
            if body.error.as_deref() == Some("invalid_grant") {
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&["token", "revoked"])
                    .inc();
                return Err(Error::OauthRevoked);
            }
        }

        let body = match body {
            Some(body) if status.is_success() && !body.access_token.is_empty() => body,
            _ => {
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&["token", "error"])
                    .inc();
                return Err(Error::Status(status.as_u16()));
            }
        };

        UPSTREAM_REQUESTS_TOTAL
            .with_label_values(&["token", "ok"])
            .inc();

        Ok(RefreshedTokens {
            access_token: body.access_token,
            // The exchange may omit the refresh token; keep the current one.
            refresh_token: body
                .refresh_token
                .unwrap_or_else(|| self.refresh_token.clone()),
            expiry: body
                .expires_in
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TOKEN_LIFETIME),
        })
    }

    /// Fetch inbox messages newer than `before`, newest-first.
    pub async fn inbox(&self, before: Option<&str>) -> Result<Vec<Message>, Error> {
        let mut query = vec![("limit", "100".to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }

        let envelope = self.get_envelope("/message/inbox", &query, "inbox").await?;
        Ok(envelope
            .data
            .children
            .iter()
            .map(Message::from_child)
            .collect())
    }

    /// Look up a single message by fullname. `None` when the upstream no
    /// longer knows the id (deleted or pruned).
    pub async fn message_by_id(&self, fullname: &str) -> Result<Option<Message>, Error> {
        let query = vec![("id", fullname.to_string())];
        let envelope = self.get_envelope("/api/info", &query, "info").await?;
        Ok(envelope.data.children.first().map(Message::from_child))
    }

    /// Newest posts in a subreddit.
    pub async fn subreddit_posts(&self, subreddit: &str) -> Result<Vec<Post>, Error> {
        let path = format!("/r/{}/new", subreddit);
        self.posts(&path, &[("limit", "100".to_string())], "subreddit_posts")
            .await
    }

    /// Newest submissions by a user.
    pub async fn user_posts(&self, username: &str) -> Result<Vec<Post>, Error> {
        let path = format!("/user/{}/submitted", username);
        self.posts(
            &path,
            &[("limit", "100".to_string()), ("sort", "new".to_string())],
            "user_posts",
        )
        .await
    }

    /// Top posts of the day for a subreddit; feeds trending watchers.
    pub async fn trending_posts(&self, subreddit: &str) -> Result<Vec<Post>, Error> {
        let path = format!("/r/{}/top", subreddit);
        self.posts(
            &path,
            &[("limit", "25".to_string()), ("t", "day".to_string())],
            "trending_posts",
        )
        .await
    }

    /// Thread post plus top-level comments, newest-first.
    pub async fn top_level_comments(
        &self,
        subreddit: &str,
        thread_id: &str,
    ) -> Result<Thread, Error> {
        let path = format!("/r/{}/comments/{}", subreddit, thread_id);
        let query = vec![
            ("depth", "1".to_string()),
            ("limit", "100".to_string()),
            ("sort", "new".to_string()),
        ];

        let body = self.get_raw(&path, &query, "comments").await?;
        let envelopes: Vec<Envelope> =
            serde_json::from_str(&body).map_err(|err| Error::Decode(err.to_string()))?;
        Thread::from_envelopes(envelopes)
    }

    async fn posts(
        &self,
        path: &str,
        query: &[(&str, String)],
        endpoint: &str,
    ) -> Result<Vec<Post>, Error> {
        let envelope = self.get_envelope(path, query, endpoint).await?;
        Ok(envelope
            .data
            .children
            .iter()
            .filter(|child| child.kind == "t3")
            .map(Post::from_child)
            .collect())
    }

    async fn get_envelope(
        &self,
        path: &str,
        query: &[(&str, String)],
        endpoint: &str,
    ) -> Result<Envelope, Error> {
        let body = self.get_raw(path, query, endpoint).await?;
        serde_json::from_str(&body).map_err(|err| Error::Decode(err.to_string()))
    }

    async fn get_raw(
        &self,
        path: &str,
        query: &[(&str, String)],
        endpoint: &str,
    ) -> Result<String, Error> {
        let _permit = self
            .client
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Transport("request pool closed".to_string()))?;

        if let Some(delay) = self.client.rate_limit_delay() {
            tracing::debug!(
                delay_ms = delay.as_millis() as u64,
                endpoint,
                "Sleeping out upstream quota window"
            );
            tokio::time::sleep(delay).await;
        }

        let url = format!("{}{}", API_BASE, path);
        let response = self
            .client
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .header(reqwest::header::USER_AGENT, &self.client.user_agent)
            .query(query)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&[endpoint, "transport_error"])
                    .inc();
                return Err(err.into());
            }
        };

        self.client.observe_rate_headers(response.headers());

        let status = response.status();
        match status.as_u16() {
            200..=299 => {
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&[endpoint, "ok"])
                    .inc();
                response
                    .text()
                    .await
                    .map_err(|err| Error::Decode(err.to_string()))
            }
            429 => {
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&[endpoint, "rate_limited"])
                    .inc();
                Err(Error::RateLimited)
            }
            code => {
                UPSTREAM_REQUESTS_TOTAL
                    .with_label_values(&[endpoint, "error"])
                    .inc();
                Err(Error::Status(code))
            }
        }
    }
}

/// Render a token for logs: `<SHORT>` for tokens of length <= 8,
/// otherwise the first and last three characters around an ellipsis.
pub fn obfuscate(token: &str) -> String {
    if token.len() <= 8 {
        return "<SHORT>".to_string();
    }
    format!("{}...{}", &token[..3], &token[token.len() - 3..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obfuscate_short_tokens() {
        assert_eq!(obfuscate(""), "<SHORT>");
        assert_eq!(obfuscate("abc"), "<SHORT>");
        assert_eq!(obfuscate("abcdefgh"), "<SHORT>");
    }

    #[test]
    fn obfuscate_long_tokens() {
        assert_eq!(obfuscate("abcdefghi"), "abc...ghi");
        assert_eq!(obfuscate("0123456789abcdef"), "012...def");
    }

    #[test]
    fn obfuscate_is_bounded() {
        for len in 0..64 {
            let token: String = "x".repeat(len);
            assert!(obfuscate(&token).len() <= 9);
        }
    }

    #[test]
    fn authenticated_client_obfuscates_its_tokens() {
        let client = Client::new("<SECRET>", "<SECRET>", "test-agent", 1);
        let handle = client.new_authenticated("<ID>", "<REFRESH>", "abcdefghi");
        assert_eq!(handle.obfuscated_access_token(), "abc...ghi");
        assert_eq!(handle.obfuscated_refresh_token(), "<SHORT>");
    }

    #[test]
    fn rate_delay_absent_with_quota() {
        let client = Client::new("id", "secret", "test-agent", 1);
        assert!(client.rate_limit_delay().is_none());
    }

    #[test]
    fn rate_delay_caps_at_maximum() {
        let client = Client::new("id", "secret", "test-agent", 1);
        {
            let mut rate = client.rate.lock().unwrap();
            rate.remaining = 0.0;
            rate.reset_at = Some(Instant::now() + Duration::from_secs(600));
        }
        let delay = client.rate_limit_delay().expect("delay present");
        assert!(delay <= MAX_RATE_LIMIT_SLEEP);
    }
}
