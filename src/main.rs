//! tootvault binary entry point
//!
//! Opens the status store and drains its change notifications until
//! interrupted.

use tokio::sync::mpsc;
use tootvault::{AppState, config, queue::StatusEvent};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Initialize AppState
/// 5. Start the status event consumer
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    tootvault::logging::init(&config.logging);
    tracing::info!("Starting tootvault...");
    tracing::info!(
        database = %config.database.path.display(),
        lock_gc_frequency = config.cache.lock_gc_frequency,
        queue_capacity = config.queue.capacity,
        "Configuration loaded"
    );

    // 3. Initialize metrics
    tootvault::metrics::init_metrics();

    // 4. Initialize application state
    let (state, events) = AppState::new(config).await?;

    // 5. Start the status event consumer
    let consumer = spawn_event_consumer(events);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    // Dropping the last sender ends the consumer once the queue is drained.
    drop(state);
    consumer.await?;

    Ok(())
}

/// Spawn background status event consumer
fn spawn_event_consumer(mut events: mpsc::Receiver<StatusEvent>) -> tokio::task::JoinHandle<()> {
    let handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(
                action = event.action.as_str(),
                status_id = %event.status.id,
                uri = %event.status.uri,
                "Status event"
            );
        }
        tracing::debug!("Status event queue closed");
    });

    tracing::info!("Status event consumer spawned");
    handle
}
