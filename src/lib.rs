//! Comet backend - push notification service for the Comet client
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Enqueuer                              │
//! │  - Periodic due-scans per work kind                         │
//! │  - Lock-before-publish deduplication                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  (named Redis queues)
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Worker fleets                            │
//! │  - inbox / subreddit / user / trending watchers             │
//! │  - live activities, stuck-marker repair                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │   Upstream client (OAuth)        APNs dispatcher             │
//! │   Postgres store (sqlx)          Redis locks                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `reddit`: upstream OAuth client with single-flight token refresh
//! - `store`: entity models and Postgres repositories
//! - `queue`: named work queues over Redis lists
//! - `lock`: short-TTL distributed locks
//! - `apns`: provider-token push clients and payloads
//! - `worker`: queue consumers, one fleet per kind
//! - `enqueuer`: periodic due-scans and pruning
//! - `config`: configuration management
//! - `error`: error types

pub mod apns;
pub mod config;
pub mod enqueuer;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod queue;
pub mod reddit;
pub mod store;
pub mod worker;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::apns::Pusher;
use crate::lock::{Locker, RedisLocker};
use crate::queue::QueueConnection;

/// Shared resources handed to workers and the enqueuer.
#[derive(Clone)]
pub struct AppContext {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Postgres connection pool
    pub pool: PgPool,

    /// Named work queues
    pub queue: QueueConnection,

    /// Distributed per-item locks
    pub locks: Arc<dyn Locker>,

    /// Shared upstream client
    pub reddit: Arc<reddit::Client>,

    /// APNs dispatcher (production + sandbox)
    pub apns: Arc<dyn Pusher>,
}

impl AppContext {
    /// Initialize shared state
    ///
    /// # Steps
    /// 1. Connect to Postgres
    /// 2. Connect to Redis (locks and queues)
    /// 3. Build the shared upstream client
    /// 4. Load the APNs signing key and build both push clients
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await?;
        tracing::info!("Database connected");

        let redis_client = redis::Client::open(config.redis.url.as_str())?;
        let redis_manager = redis::aio::ConnectionManager::new(redis_client).await?;
        tracing::info!("Redis connected");

        let queue = QueueConnection::new(redis_manager.clone());
        let locks: Arc<dyn Locker> = Arc::new(RedisLocker::new(redis_manager));

        let reddit = Arc::new(reddit::Client::new(
            &config.reddit.client_id,
            &config.reddit.client_secret,
            &config.reddit.user_agent,
            config.reddit.request_pool_size,
        ));

        let apns: Arc<dyn Pusher> = Arc::new(apns::Dispatcher::new(&config.apple)?);
        tracing::info!("APNs clients initialized");

        Ok(Self {
            config: Arc::new(config),
            pool,
            queue,
            locks,
            reddit,
            apns,
        })
    }

    /// Spawn every consumer fleet configured for this process.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        use crate::store::{
            PostgresAccountRepository, PostgresDeviceRepository, PostgresLiveActivityRepository,
            PostgresSubredditRepository, PostgresUserRepository, PostgresWatcherRepository,
        };
        use crate::worker::{
            live_activities::LiveActivitiesConsumer, notifications::NotificationsConsumer,
            spawn_fleet, stuck_notifications::StuckNotificationsConsumer,
            subreddits::SubredditsConsumer, trending::TrendingConsumer, users::UsersConsumer,
        };

        let account_repo: Arc<dyn store::AccountRepository> =
            Arc::new(PostgresAccountRepository::new(self.pool.clone()));
        let device_repo: Arc<dyn store::DeviceRepository> =
            Arc::new(PostgresDeviceRepository::new(self.pool.clone()));
        let subreddit_repo: Arc<dyn store::SubredditRepository> =
            Arc::new(PostgresSubredditRepository::new(self.pool.clone()));
        let user_repo: Arc<dyn store::UserRepository> =
            Arc::new(PostgresUserRepository::new(self.pool.clone()));
        let watcher_repo: Arc<dyn store::WatcherRepository> =
            Arc::new(PostgresWatcherRepository::new(self.pool.clone()));
        let live_activity_repo: Arc<dyn store::LiveActivityRepository> =
            Arc::new(PostgresLiveActivityRepository::new(self.pool.clone()));

        let workers = &self.config.workers;
        let bundle_id = self.config.apple.bundle_id.clone();
        let mut handles = Vec::new();

        handles.extend(spawn_fleet(
            self.queue.clone(),
            Arc::new(NotificationsConsumer::new(
                account_repo.clone(),
                device_repo.clone(),
                self.locks.clone(),
                self.reddit.clone(),
                self.apns.clone(),
                bundle_id.clone(),
            )),
            workers.notifications,
            shutdown.clone(),
        ));

        handles.extend(spawn_fleet(
            self.queue.clone(),
            Arc::new(SubredditsConsumer::new(
                subreddit_repo.clone(),
                watcher_repo.clone(),
                account_repo.clone(),
                device_repo.clone(),
                self.locks.clone(),
                self.reddit.clone(),
                self.apns.clone(),
                bundle_id.clone(),
            )),
            workers.subreddits,
            shutdown.clone(),
        ));

        handles.extend(spawn_fleet(
            self.queue.clone(),
            Arc::new(UsersConsumer::new(
                user_repo,
                watcher_repo.clone(),
                account_repo.clone(),
                device_repo.clone(),
                self.locks.clone(),
                self.reddit.clone(),
                self.apns.clone(),
                bundle_id.clone(),
            )),
            workers.users,
            shutdown.clone(),
        ));

        handles.extend(spawn_fleet(
            self.queue.clone(),
            Arc::new(TrendingConsumer::new(
                subreddit_repo,
                watcher_repo,
                account_repo.clone(),
                device_repo,
                self.locks.clone(),
                self.reddit.clone(),
                self.apns.clone(),
                bundle_id.clone(),
            )),
            workers.trending,
            shutdown.clone(),
        ));

        handles.extend(spawn_fleet(
            self.queue.clone(),
            Arc::new(LiveActivitiesConsumer::new(
                live_activity_repo,
                self.locks.clone(),
                self.reddit.clone(),
                self.apns.clone(),
                bundle_id,
            )),
            workers.live_activities,
            shutdown.clone(),
        ));

        handles.extend(spawn_fleet(
            self.queue.clone(),
            Arc::new(StuckNotificationsConsumer::new(
                account_repo,
                self.locks.clone(),
                self.reddit.clone(),
            )),
            workers.stuck_notifications,
            shutdown,
        ));

        handles
    }

    /// Spawn the enqueue scheduler ticks.
    pub fn spawn_enqueuer(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        use crate::store::{
            PostgresAccountRepository, PostgresDeviceRepository, PostgresLiveActivityRepository,
            PostgresSubredditRepository, PostgresUserRepository,
        };

        let enqueuer = Arc::new(enqueuer::Enqueuer::new(
            Arc::new(PostgresAccountRepository::new(self.pool.clone())),
            Arc::new(PostgresDeviceRepository::new(self.pool.clone())),
            Arc::new(PostgresSubredditRepository::new(self.pool.clone())),
            Arc::new(PostgresUserRepository::new(self.pool.clone())),
            Arc::new(PostgresLiveActivityRepository::new(self.pool.clone())),
            self.locks.clone(),
            Arc::new(self.queue.clone()),
            self.queue.clone(),
        ));

        enqueuer.spawn(shutdown)
    }
}

/// Build the worker HTTP router (health and metrics only).
///
/// Shared by the binary and integration tests to keep route composition
/// consistent across environments.
pub fn build_router() -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(serve_metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn serve_metrics() -> String {
    metrics::gather()
}
