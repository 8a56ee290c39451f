//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub reddit: RedditConfig,
    pub apple: AppleConfig,
    pub workers: WorkersConfig,
    pub logging: LoggingConfig,
}

/// Worker HTTP listener (health + metrics only)
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 4000)
    pub port: u16,
}

/// Postgres configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (postgres://...)
    pub url: String,
    /// Connection pool size
    pub max_connections: u32,
}

/// Redis configuration (locks and queues)
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Connection URL (redis://...)
    pub url: String,
}

/// Upstream platform OAuth client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedditConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Bound on concurrent in-flight upstream requests
    #[serde(default = "default_request_pool_size")]
    pub request_pool_size: usize,
    /// User-Agent sent with every upstream request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_request_pool_size() -> usize {
    16
}

fn default_user_agent() -> String {
    "server:comet-backend:v1.2.0 (by /u/cometapp)".to_string()
}

/// APNs provider-token credentials
#[derive(Debug, Clone, Deserialize)]
pub struct AppleConfig {
    /// Path to the .p8 signing key
    pub key_path: PathBuf,
    /// Key ID issued with the signing key
    pub key_id: String,
    /// Apple developer team ID
    pub team_id: String,
    /// App bundle ID; also the base of the live-activity topic
    #[serde(default = "default_bundle_id")]
    pub bundle_id: String,
}

fn default_bundle_id() -> String {
    "com.cometapp.Comet".to_string()
}

/// Consumer counts per queue
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    pub notifications: usize,
    pub subreddits: usize,
    pub users: usize,
    pub trending: usize,
    pub live_activities: usize,
    pub stuck_notifications: usize,
    /// Whether this process also runs the enqueue scheduler
    #[serde(default = "default_enqueuer_enabled")]
    pub enqueuer: bool,
}

fn default_enqueuer_enabled() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (COMET_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 4000)?
            .set_default("database.max_connections", 32)?
            .set_default("reddit.request_pool_size", 16)?
            .set_default("reddit.user_agent", default_user_agent())?
            .set_default("apple.bundle_id", default_bundle_id())?
            .set_default("workers.notifications", 4)?
            .set_default("workers.subreddits", 2)?
            .set_default("workers.users", 2)?
            .set_default("workers.trending", 1)?
            .set_default("workers.live_activities", 2)?
            .set_default("workers.stuck_notifications", 1)?
            .set_default("workers.enqueuer", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("COMET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.reddit.client_id.is_empty() || self.reddit.client_secret.is_empty() {
            return Err(crate::error::AppError::Config(
                "reddit.client_id and reddit.client_secret must be set".to_string(),
            ));
        }

        if self.reddit.request_pool_size == 0 {
            return Err(crate::error::AppError::Config(
                "reddit.request_pool_size must be greater than 0".to_string(),
            ));
        }

        if self.apple.key_id.is_empty() || self.apple.team_id.is_empty() {
            return Err(crate::error::AppError::Config(
                "apple.key_id and apple.team_id must be set".to_string(),
            ));
        }

        let consumer_counts = [
            ("workers.notifications", self.workers.notifications),
            ("workers.subreddits", self.workers.subreddits),
            ("workers.users", self.workers.users),
            ("workers.trending", self.workers.trending),
            ("workers.live_activities", self.workers.live_activities),
            (
                "workers.stuck_notifications",
                self.workers.stuck_notifications,
            ),
        ];
        for (name, count) in consumer_counts {
            if count == 0 {
                return Err(crate::error::AppError::Config(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 4000,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/comet_test".to_string(),
                max_connections: 4,
            },
            redis: RedisConfig {
                url: "redis://localhost".to_string(),
            },
            reddit: RedditConfig {
                client_id: "client-id".to_string(),
                client_secret: "client-secret".to_string(),
                request_pool_size: 16,
                user_agent: default_user_agent(),
            },
            apple: AppleConfig {
                key_path: PathBuf::from("/etc/comet/AuthKey.p8"),
                key_id: "KEYID12345".to_string(),
                team_id: "TEAMID1234".to_string(),
                bundle_id: default_bundle_id(),
            },
            workers: WorkersConfig {
                notifications: 4,
                subreddits: 2,
                users: 2,
                trending: 1,
                live_activities: 2,
                stuck_notifications: 1,
                enqueuer: true,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_upstream_credentials() {
        let mut config = valid_config();
        config.reddit.client_secret = String::new();

        let error = config
            .validate()
            .expect_err("empty client secret must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("reddit.client_id")
        ));
    }

    #[test]
    fn validate_rejects_zero_consumers() {
        let mut config = valid_config();
        config.workers.live_activities = 0;

        let error = config.validate().expect_err("zero consumers must fail");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message)
                if message.contains("workers.live_activities")
        ));
    }

    #[test]
    fn validate_rejects_zero_request_pool() {
        let mut config = valid_config();
        config.reddit.request_pool_size = 0;

        assert!(config.validate().is_err());
    }
}
