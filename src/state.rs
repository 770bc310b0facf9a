//! Shared application state for axum handlers.
//!
//! Wires the storage backends into the toolkit services (policy cache,
//! credential lookup, subject resolver, cache manager) and registers the
//! demo operations. All components are behind `Arc` and safe to clone per
//! request.
//!
//! # Background Tasks
//!
//! The only background worker is the idempotency cleanup sweep, which
//! periodically bulk-deletes expired records. It is tracked by a
//! `TaskTracker` and stopped through a `CancellationToken`; call
//! `shutdown()` before process exit to terminate it cleanly. A failed sweep
//! is logged and retried on the next tick.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::cache_manager::TtlCacheManager;
use crate::chain::{Toolkit, ToolkitSettings};
use crate::config::Config;
use crate::credentials::CredentialLookup;
use crate::handlers::demo::DemoOperations;
use crate::policy::PolicyService;
use crate::store::memory::MemoryStore;
use crate::store::postgres::PostgresStore;
use crate::store::{AuditStore, CredentialStore, IdempotencyStore, PolicyStore};
use crate::subject::{ApiKeyHasher, SubjectResolver};

/// The four storage contracts bundled for state construction.
pub struct Backends {
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub audit: Arc<dyn AuditStore>,
    pub policies: Arc<dyn PolicyStore>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl Backends {
    /// Production wiring: every contract is served by Postgres.
    pub fn from_postgres(store: Arc<PostgresStore>) -> Self {
        Self {
            idempotency: store.clone(),
            audit: store.clone(),
            policies: store.clone(),
            credentials: store,
        }
    }

    /// Test / local-development wiring over the in-memory store.
    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            idempotency: store.clone(),
            audit: store.clone(),
            policies: store.clone(),
            credentials: store,
        }
    }
}

/// Shared application state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// The interceptor chain registry.
    pub toolkit: Arc<Toolkit>,
    /// Caller identity resolution.
    pub subject_resolver: Arc<SubjectResolver>,
    /// Registered demo operations.
    pub demo: Arc<DemoOperations>,
    /// Timestamp when the application started.
    pub started_at: Instant,
    /// Store handle kept for the cleanup sweep.
    idempotency_store: Arc<dyn IdempotencyStore>,
    /// Tracks spawned background tasks for graceful shutdown.
    task_tracker: TaskTracker,
    /// Signals background tasks to stop.
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build the full service graph and spawn the cleanup sweep.
    pub fn new(config: Config, backends: Backends) -> Self {
        let config = Arc::new(config);

        let cache_manager = Arc::new(TtlCacheManager::with_defaults());
        let policies = Arc::new(PolicyService::new(backends.policies));
        let toolkit = Arc::new(Toolkit::new(
            ToolkitSettings::from_config(&config),
            backends.audit,
            backends.idempotency.clone(),
            policies,
            cache_manager,
        ));

        let hasher = ApiKeyHasher::new(config.api_key_pepper.clone(), config.api_key_algorithm);
        let credentials = Arc::new(CredentialLookup::new(backends.credentials));
        let subject_resolver = Arc::new(SubjectResolver::new(hasher, credentials));

        let demo = Arc::new(DemoOperations::register(&toolkit));

        let state = Self {
            config,
            toolkit,
            subject_resolver,
            demo,
            started_at: Instant::now(),
            idempotency_store: backends.idempotency,
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_idempotency_cleanup_task();
        state
    }

    /// Spawn the periodic sweep deleting expired idempotency records.
    fn spawn_idempotency_cleanup_task(&self) {
        let store = self.idempotency_store.clone();
        let period = self.config.idempotency_cleanup_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased; // Check cancellation first

                    _ = cancel.cancelled() => {
                        debug!("Idempotency cleanup task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        match store.delete_expired().await {
                            Ok(0) => {}
                            Ok(deleted) => {
                                info!(deleted, "Idempotency cleanup deleted expired records");
                            }
                            Err(e) => {
                                // Retried on the next tick.
                                warn!(error = %e, "Idempotency cleanup failed");
                            }
                        }
                    }
                }
            }

            debug!("Idempotency cleanup task shutting down");
        });
    }

    /// Gracefully shut down background tasks: signal, close, wait.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
