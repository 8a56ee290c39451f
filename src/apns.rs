//! APNs dispatcher
//!
//! Token-authenticated push client. Production and sandbox clients are
//! built from the same ES256 signing key; the per-entity sandbox flag
//! selects the host at push time. Failures are classified into retriable
//! (keep the entity, next tick retries) and permanent (delete the device
//! or live activity).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;

use crate::config::AppleConfig;
use crate::error::{AppError, Result};

const PRODUCTION_HOST: &str = "https://api.push.apple.com";
const SANDBOX_HOST: &str = "https://api.sandbox.push.apple.com";

/// Apple accepts provider tokens for up to an hour; re-mint well before.
const PROVIDER_TOKEN_LIFETIME: Duration = Duration::from_secs(50 * 60);

/// APNs reasons that mean the token will never work again.
const PERMANENT_REASONS: [&str; 3] = ["BadDeviceToken", "Unregistered", "DeviceTokenNotForTopic"];

// =============================================================================
// Notifications
// =============================================================================

/// Push type, mapped to the `apns-push-type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushType {
    Alert,
    LiveActivity,
}

impl PushType {
    fn header_value(self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::LiveActivity => "liveactivity",
        }
    }
}

/// One outbound push.
#[derive(Debug, Clone)]
pub struct Notification {
    pub device_token: String,
    pub topic: String,
    pub push_type: PushType,
    pub payload: serde_json::Value,
}

/// Rolling content state for a live activity.
///
/// Field names are part of the client contract.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DynamicIslandNotification {
    #[serde(rename = "postTotalComments")]
    pub post_total_comments: i64,
    #[serde(rename = "postScore")]
    pub post_score: i64,
    #[serde(rename = "commentId", skip_serializing_if = "String::is_empty")]
    pub comment_id: String,
    #[serde(rename = "commentAuthor", skip_serializing_if = "String::is_empty")]
    pub comment_author: String,
    #[serde(rename = "commentBody", skip_serializing_if = "String::is_empty")]
    pub comment_body: String,
    #[serde(rename = "commentAge", skip_serializing_if = "is_zero")]
    pub comment_age: i64,
    #[serde(rename = "commentScore", skip_serializing_if = "is_zero")]
    pub comment_score: i64,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Standard alert payload with client-routing custom keys.
pub fn alert_payload(
    title: &str,
    body: &str,
    thread_id: &str,
    custom: &[(&str, serde_json::Value)],
) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "aps": {
            "alert": {
                "title": title,
                "body": body,
            },
            "sound": "default",
            "thread-id": thread_id,
            "mutable-content": 1,
        }
    });
    if let Some(object) = payload.as_object_mut() {
        for (key, value) in custom {
            object.insert((*key).to_string(), value.clone());
        }
    }
    payload
}

/// Live-activity payload: content state plus event bookkeeping.
pub fn live_activity_payload(
    content_state: &DynamicIslandNotification,
    event: &str,
    dismissal_date: i64,
    timestamp: i64,
) -> serde_json::Value {
    serde_json::json!({
        "aps": {
            "content-state": content_state,
            "dismissal-date": dismissal_date,
            "event": event,
            "timestamp": timestamp,
        }
    })
}

// =============================================================================
// Outcome classification
// =============================================================================

/// APNs response, normalized.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: Option<String>,
}

impl Response {
    pub fn sent(&self) -> bool {
        self.status == 200
    }
}

/// What the worker should do with the subscribing entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted by APNs
    Sent,
    /// Permanent rejection; delete the device or live activity
    Permanent(String),
    /// Transport error or server-side failure; retry next tick
    Retriable(String),
}

/// Classify a push result per the delivery-failure policy.
pub fn classify(result: &std::result::Result<Response, AppError>) -> PushOutcome {
    match result {
        Ok(response) if response.sent() => PushOutcome::Sent,
        Ok(response) if response.status >= 500 => {
            PushOutcome::Retriable(format!("status {}", response.status))
        }
        Ok(response) => {
            let reason = response.reason.clone().unwrap_or_default();
            if PERMANENT_REASONS.contains(&reason.as_str()) {
                PushOutcome::Permanent(reason)
            } else {
                PushOutcome::Retriable(format!("status {} reason {}", response.status, reason))
            }
        }
        Err(error) => PushOutcome::Retriable(error.to_string()),
    }
}

// =============================================================================
// Provider token signing
// =============================================================================

#[derive(Debug, Serialize)]
struct ProviderClaims<'a> {
    iss: &'a str,
    iat: u64,
}

/// ES256 provider-token signer shared by both clients.
pub struct TokenSigner {
    encoding_key: jsonwebtoken::EncodingKey,
    key_id: String,
    team_id: String,
    cached: Mutex<Option<(String, Instant)>>,
}

impl TokenSigner {
    /// Load the .p8 signing key from disk.
    pub fn from_config(config: &AppleConfig) -> Result<Self> {
        let pem = std::fs::read(&config.key_path).map_err(|err| {
            AppError::Config(format!(
                "failed to read APNs key {}: {}",
                config.key_path.display(),
                err
            ))
        })?;
        let encoding_key = jsonwebtoken::EncodingKey::from_ec_pem(&pem)
            .map_err(|err| AppError::Config(format!("invalid APNs signing key: {}", err)))?;

        Ok(Self {
            encoding_key,
            key_id: config.key_id.clone(),
            team_id: config.team_id.clone(),
            cached: Mutex::new(None),
        })
    }

    /// Current provider token, minting a fresh one when the cached token
    /// nears Apple's lifetime cap.
    fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().expect("token mutex poisoned");
        if let Some((token, minted_at)) = cached.as_ref() {
            if minted_at.elapsed() < PROVIDER_TOKEN_LIFETIME {
                return Ok(token.clone());
            }
        }

        let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::ES256);
        header.kid = Some(self.key_id.clone());
        let claims = ProviderClaims {
            iss: &self.team_id,
            iat: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let token = jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|err| AppError::Apns(format!("failed to sign provider token: {}", err)))?;

        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

// =============================================================================
// Clients
// =============================================================================

struct Client {
    http: reqwest::Client,
    host: &'static str,
    signer: Arc<TokenSigner>,
}

impl Client {
    async fn push(&self, notification: &Notification) -> Result<Response> {
        let url = format!("{}/3/device/{}", self.host, notification.device_token);
        let token = self.signer.token()?;

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header("apns-topic", &notification.topic)
            .header("apns-push-type", notification.push_type.header_value())
            .json(&notification.payload)
            .send()
            .await?;

        let status = response.status().as_u16();
        let reason = if status == 200 {
            None
        } else {
            response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("reason")
                        .and_then(|r| r.as_str())
                        .map(str::to_string)
                })
        };

        Ok(Response { status, reason })
    }
}

/// Push surface used by the workers.
#[async_trait]
pub trait Pusher: Send + Sync {
    /// Push to the environment selected by `sandbox` and classify the result.
    async fn push(&self, notification: &Notification, sandbox: bool) -> PushOutcome;
}

/// Holds the production and sandbox clients built from one signing key.
pub struct Dispatcher {
    production: Client,
    sandbox: Client,
}

impl Dispatcher {
    pub fn new(config: &AppleConfig) -> Result<Self> {
        let signer = Arc::new(TokenSigner::from_config(config)?);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| AppError::Apns(format!("failed to build APNs client: {}", err)))?;

        Ok(Self {
            production: Client {
                http: http.clone(),
                host: PRODUCTION_HOST,
                signer: signer.clone(),
            },
            sandbox: Client {
                http,
                host: SANDBOX_HOST,
                signer,
            },
        })
    }
}

#[async_trait]
impl Pusher for Dispatcher {
    async fn push(&self, notification: &Notification, sandbox: bool) -> PushOutcome {
        let client = if sandbox {
            &self.sandbox
        } else {
            &self.production
        };
        classify(&client.push(notification).await)
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory pusher capturing notifications for tests.

    use super::*;
    use std::sync::Mutex;

    pub struct MemoryPusher {
        pub outcome: PushOutcome,
        pub pushed: Mutex<Vec<(Notification, bool)>>,
    }

    impl MemoryPusher {
        pub fn sending() -> Self {
            Self {
                outcome: PushOutcome::Sent,
                pushed: Mutex::new(Vec::new()),
            }
        }

        pub fn failing_permanently(reason: &str) -> Self {
            Self {
                outcome: PushOutcome::Permanent(reason.to_string()),
                pushed: Mutex::new(Vec::new()),
            }
        }

        pub fn count(&self) -> usize {
            self.pushed.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Pusher for MemoryPusher {
        async fn push(&self, notification: &Notification, sandbox: bool) -> PushOutcome {
            self.pushed
                .lock()
                .unwrap()
                .push((notification.clone(), sandbox));
            self.outcome.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_payload_shape() {
        let payload = alert_payload(
            "alice in A post",
            "nice post",
            "t3_xyz",
            &[("message_id", serde_json::json!("t1_abc"))],
        );

        assert_eq!(payload["aps"]["alert"]["title"], "alice in A post");
        assert_eq!(payload["aps"]["alert"]["body"], "nice post");
        assert_eq!(payload["aps"]["thread-id"], "t3_xyz");
        assert_eq!(payload["aps"]["mutable-content"], 1);
        assert_eq!(payload["message_id"], "t1_abc");
    }

    #[test]
    fn live_activity_payload_shape() {
        let state = DynamicIslandNotification {
            post_total_comments: 12,
            post_score: 345,
            comment_id: "c1".to_string(),
            comment_author: "alice".to_string(),
            comment_body: "goal!".to_string(),
            comment_age: 1_685_620_800,
            comment_score: 9,
        };
        let payload = live_activity_payload(&state, "update", 1_685_624_400, 1_685_620_900);

        assert_eq!(payload["aps"]["event"], "update");
        assert_eq!(payload["aps"]["dismissal-date"], 1_685_624_400);
        assert_eq!(payload["aps"]["timestamp"], 1_685_620_900);
        assert_eq!(payload["aps"]["content-state"]["postTotalComments"], 12);
        assert_eq!(payload["aps"]["content-state"]["commentAuthor"], "alice");
    }

    #[test]
    fn empty_comment_fields_are_omitted() {
        let state = DynamicIslandNotification {
            post_total_comments: 3,
            post_score: 10,
            ..Default::default()
        };
        let value = serde_json::to_value(&state).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("commentId"));
        assert!(!object.contains_key("commentScore"));
        assert_eq!(object["postScore"], 10);
    }

    #[test]
    fn classify_sent() {
        let result = Ok(Response {
            status: 200,
            reason: None,
        });
        assert_eq!(classify(&result), PushOutcome::Sent);
    }

    #[test]
    fn classify_permanent_reasons() {
        for reason in ["BadDeviceToken", "Unregistered", "DeviceTokenNotForTopic"] {
            let result = Ok(Response {
                status: 410,
                reason: Some(reason.to_string()),
            });
            assert_eq!(
                classify(&result),
                PushOutcome::Permanent(reason.to_string())
            );
        }
    }

    #[test]
    fn classify_server_errors_as_retriable() {
        let result = Ok(Response {
            status: 503,
            reason: Some("ServiceUnavailable".to_string()),
        });
        assert!(matches!(classify(&result), PushOutcome::Retriable(_)));
    }

    #[test]
    fn classify_transport_errors_as_retriable() {
        let result = Err(AppError::Apns("connection reset".to_string()));
        assert!(matches!(classify(&result), PushOutcome::Retriable(_)));
    }

    #[test]
    fn classify_other_rejections_as_retriable() {
        let result = Ok(Response {
            status: 400,
            reason: Some("TooManyRequests".to_string()),
        });
        assert!(matches!(classify(&result), PushOutcome::Retriable(_)));
    }
}
