//! tootvault - status storage core for a federated social server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - StatusService: lookups, population, writes, traversal    │
//! │  - WorkQueue: change notifications for side effects         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - EntityCache / IdListCache (single-flight, multi-alias)   │
//! │  - KeyLockTable (per-key read/write locks)                  │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `service`: Status repository
//! - `data`: Database, caches and lock table
//! - `queue`: Status change notifications
//! - `config`: Configuration management
//! - `logging`: Tracing subscriber setup
//! - `metrics`: Prometheus instruments
//! - `error`: Error types

pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod service;

use std::sync::Arc;

use tokio::sync::mpsc;

/// Application state shared across all callers
///
/// Built once at start-up; every store receives its caches from here.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Status and ID-list caches (volatile)
    pub caches: Arc<data::Caches>,

    /// Status repository
    pub statuses: Arc<service::StatusService>,

    /// Status change notifications
    pub queue: queue::WorkQueue,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Initialize caches
    /// 3. Create the status event queue
    ///
    /// # Returns
    /// The state plus the receiving end of the status event queue
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(
        config: config::AppConfig,
    ) -> Result<(Self, mpsc::Receiver<queue::StatusEvent>), error::AppError> {
        tracing::info!("Initializing application state...");

        let db = data::Database::connect(&config.database.path).await?;
        Ok(Self::with_database(config, db))
    }

    /// Build state around an already connected database.
    pub fn with_database(
        config: config::AppConfig,
        db: data::Database,
    ) -> (Self, mpsc::Receiver<queue::StatusEvent>) {
        let db = Arc::new(db);
        let caches = Arc::new(data::Caches::new(config.cache.lock_gc_frequency));
        tracing::info!("Caches initialized");

        let (queue, events) = queue::WorkQueue::new(config.queue.capacity);
        let statuses = Arc::new(service::StatusService::new(
            Arc::clone(&db),
            Arc::clone(&caches),
            queue.clone(),
        ));

        tracing::info!("Application state initialized successfully");

        let state = Self {
            config: Arc::new(config),
            db,
            caches,
            statuses,
            queue,
        };
        (state, events)
    }
}
