//! Wires a `ServiceConfig` into the long-lived handles the HTTP façade
//! needs — job store, TAP pool, credential manager, sandbox runner,
//! worker pool — and spawns their background tasks. Mirrors the
//! teacher's own `Services::new`, minus the database layer this service
//! has no use for.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use validation_common::config::ServiceConfig;

use crate::api::AppState;
use crate::job_store::JobStore;
use crate::pool::credential::{CredentialManager, FileTokenMinter};
use crate::pool::tap::TapPool;
use crate::pool::{PoolMetrics, WorkerPool};
use crate::sandbox::{FirecrackerSandboxRunner, SandboxRunner};

pub struct Bootstrapped {
    pub state: Arc<AppState>,
    pub registry: prometheus::Registry,
}

/// Builds every handle the service needs for the lifetime of the
/// process and starts the worker loop and credential refresh loop.
pub async fn bootstrap(config: &ServiceConfig) -> anyhow::Result<Bootstrapped> {
    let registry = prometheus::Registry::new();

    let job_store = JobStore::new(config.paths.jobs_dir());

    let tap_pool = TapPool::new(&config.pool.tap_device_prefix, config.pool.workers)
        .ok_or_else(|| anyhow::anyhow!("failed to reserve {} TAP devices", config.pool.workers))?;

    let minter = Arc::new(FileTokenMinter::new(
        config.credential.token_file.clone(),
        Duration::from_secs(config.credential.token_lifetime_s),
    ));
    let credentials = Arc::new(CredentialManager::new(
        minter,
        config.pool.token_refresh_fraction,
        Duration::from_millis(config.pool.token_mint_deadline_ms),
    ));
    tokio::spawn(credentials.clone().run_refresh_loop());
    if let Err(err) = credentials.current_token().await {
        tracing::warn!(error = %err, "initial credential mint failed, starting not-ready");
    }

    let sandbox_ready = FirecrackerSandboxRunner::check_not_root().await.is_ok();
    if !sandbox_ready {
        tracing::warn!("sandbox preflight check failed, /health will report sandbox_ready=false");
    }
    let sandbox: Arc<dyn SandboxRunner> = Arc::new(FirecrackerSandboxRunner::new(config.sandbox.clone()));

    let metrics = Arc::new(PoolMetrics::register(&registry));
    let pool = WorkerPool::start(
        config.pool.workers,
        config.pool.queue_capacity,
        job_store.clone(),
        tap_pool,
        credentials,
        sandbox,
        metrics,
    );

    let state = Arc::new(AppState {
        job_store,
        pool,
        ingestion: config.ingestion.clone(),
        paths: config.paths.clone(),
        sandbox_ready: AtomicBool::new(sandbox_ready),
    });

    Ok(Bootstrapped { state, registry })
}
