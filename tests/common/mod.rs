//! Common test utilities for integration tests

#![allow(dead_code)]

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tootvault::data::{Account, Status};
use tootvault::queue::StatusEvent;
use tootvault::{AppState, config};

/// Status store over a throwaway database
pub struct TestStore {
    pub state: AppState,
    pub events: mpsc::Receiver<StatusEvent>,
    pub _temp_dir: TempDir,
}

impl TestStore {
    /// Create a new store backed by a temporary SQLite file
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            database: config::DatabaseConfig { path: db_path },
            cache: config::CacheConfig {
                lock_gc_frequency: 16,
            },
            queue: config::QueueConfig { capacity: 256 },
            logging: config::LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
            },
        };

        let (state, events) = AppState::new(config).await.unwrap();

        Self {
            state,
            events,
            _temp_dir: temp_dir,
        }
    }

    /// Insert an account row
    pub async fn create_test_account(&self, id: &str) -> Account {
        let now = Utc::now();
        let account = Account {
            id: id.to_string(),
            username: format!("user{}", id.to_lowercase()),
            domain: None,
            uri: format!("https://test.example.com/users/{}", id.to_lowercase()),
            display_name: Some(format!("User {id}")),
            created_at: now,
            updated_at: now,
        };

        self.state.db.insert_account(&account).await.unwrap();
        account
    }

    /// Store a top-level status
    pub async fn post(&self, id: &str, account: &Account) -> Status {
        let mut status = Status::new(id, account, format!("<p>status {id}</p>"));
        self.state.statuses.put(&mut status).await.unwrap();
        status
    }

    /// Store a reply to `parent`
    pub async fn reply(&self, id: &str, account: &Account, parent: &Status) -> Status {
        let mut status =
            Status::new(id, account, format!("<p>reply {id}</p>")).reply_to(parent);
        self.state.statuses.put(&mut status).await.unwrap();
        status
    }

    /// Store a boost of `target`
    pub async fn boost(&self, id: &str, account: &Account, target: &Status) -> Status {
        let mut status = Status::new(id, account, "").boost_of(target);
        self.state.statuses.put(&mut status).await.unwrap();
        status
    }

    /// Every event published so far
    pub fn drain_events(&mut self) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// IDs of `statuses`, in order
pub fn ids(statuses: &[Status]) -> Vec<&str> {
    statuses.iter().map(|status| status.id.as_str()).collect()
}
