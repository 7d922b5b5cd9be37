//! Cairn - backup scheduler and retention manager.
//!
//! Cairn does not move backup data itself. It drives an external workflow
//! engine that runs the per-backup create/delete jobs, records completed
//! backups in an embedded sqlite store, and prunes them with calendar-bucket
//! retention (minutely/hourly/daily/weekly/monthly/yearly).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          cairn                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  HTTP API: spec CRUD | health          Metrics: /metrics    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Scheduler: cron timers reconciled against enabled specs    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Engine: create/delete state machine | retention tagging    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Store: sqlite           Workflow engine: conductor client  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod cli;
pub mod conductor;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod model;
pub mod observability;
pub mod retention;
pub mod scheduling;
pub mod server;
pub mod store;

// Re-exports
pub use engine::Engine;
pub use error::{CairnError, Result};

use crate::conductor::{ConductorClient, WorkflowEngine};
use crate::config::CairnConfig;
use crate::scheduling::Scheduler;
use crate::store::BackupStore;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Run cairn with the given configuration until interrupted.
pub async fn run(config: CairnConfig) -> Result<()> {
    observability::init(&config.observability)?;
    info!("Starting cairn");

    std::fs::create_dir_all(&config.storage.data_dir)?;
    let store = Arc::new(BackupStore::open(config.storage.data_dir.join("cairn.db"))?);
    let workflows: Arc<dyn WorkflowEngine> = Arc::new(ConductorClient::new(&config.conductor)?);

    let engine = Arc::new(Engine::new(store, workflows));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&engine)));
    scheduler.reconcile().await?;

    let mut handles = Vec::new();

    let state = server::AppState {
        engine: Arc::clone(&engine),
        scheduler: Arc::clone(&scheduler),
    };
    let api_addr = config.api.bind_addr;
    let handle = tokio::spawn(async move {
        if let Err(e) = server::run_api_server(api_addr, state).await {
            error!("API server error: {}", e);
        }
    });
    handles.push(("api", handle));

    if config.observability.metrics_enabled {
        let obs_config = config.observability.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = observability::run_metrics_server(obs_config).await {
                error!("Metrics server error: {}", e);
            }
        });
        handles.push(("metrics", handle));
    }

    let scheduler_loop = Arc::clone(&scheduler);
    handles.push(("scheduler", tokio::spawn(scheduler_loop.run())));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down cairn gracefully...");

    scheduler.shutdown();
    for (name, handle) in handles {
        if !handle.is_finished() {
            warn!(service = %name, "Force aborting service");
            handle.abort();
        }
    }

    info!("cairn shutdown complete");
    Ok(())
}
