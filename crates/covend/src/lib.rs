//! covend - Coven daemon.
//!
//! Library components for the daemon process: the workflow Interpreter,
//! the claim-loop Scheduler, the Event Bus, storage, git/worktree
//! plumbing, and the HTTP/RPC surface.

pub mod agent_process;
pub mod event_bus;
pub mod git;
pub mod grimoire_loader;
pub mod interpreter;
pub mod review_gate;
pub mod scheduler;
pub mod script_exec;
pub mod server;
pub mod storage;
pub mod task_store;
pub mod worktree;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use coven_core::Config;
use tokio_util::sync::CancellationToken;

use event_bus::EventBus;
use review_gate::ReviewGates;
use scheduler::Scheduler;
use storage::Storage;

pub type AppResult<T> = eyre::Result<T>;

/// Interval between heartbeat events on the Event Bus (spec Section 4.5).
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// The running daemon: storage, event bus, review gates, and the
/// scheduler that drives claimed tasks through the Interpreter, wired
/// together and ready to serve the HTTP/RPC surface (spec Section 6.1).
pub struct Daemon {
    pub storage: Arc<Storage>,
    pub events: Arc<EventBus>,
    pub gates: Arc<ReviewGates>,
    pub scheduler: Arc<Scheduler>,
    pub config: Config,
    pub workspace_root: PathBuf,
    heartbeat: tokio::task::JoinHandle<()>,
}

impl Daemon {
    /// Open (or create) the data store, migrate it, and wire up the
    /// scheduler and event bus. Does not start the claim loop or HTTP
    /// server; call [`Daemon::run`] for that.
    pub async fn new(config: Config, workspace_root: PathBuf) -> AppResult<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let db_path = config.data_dir.join("coven.db");
        let storage = Arc::new(Storage::new(&db_path).await?);
        storage.migrate_embedded().await?;

        let events = Arc::new(EventBus::new(Arc::clone(&storage)));
        let gates = Arc::new(ReviewGates::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&storage),
            Arc::clone(&events),
            Arc::clone(&gates),
            config.clone(),
            workspace_root.clone(),
        ));

        scheduler.resume_suspended_workflows().await?;
        let heartbeat = Arc::clone(&events).spawn_heartbeat(HEARTBEAT_INTERVAL);

        Ok(Self { storage, events, gates, scheduler, config, workspace_root, heartbeat })
    }

    /// Run the claim loop and HTTP server until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> AppResult<()> {
        let app = server::build_router(
            Arc::clone(&self.storage),
            Arc::clone(&self.events),
            Arc::clone(&self.gates),
            Arc::clone(&self.scheduler),
            self.config.clone(),
            shutdown.clone(),
        );

        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], self.config.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "covend listening");

        let scheduler = Arc::clone(&self.scheduler);
        let scheduler_shutdown = shutdown.clone();
        let scheduler_task = tokio::spawn(async move {
            scheduler.run(scheduler_shutdown).await;
        });

        let serve_shutdown = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await?;

        scheduler_task.await.ok();
        self.heartbeat.abort();
        Ok(())
    }
}
