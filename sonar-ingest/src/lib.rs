pub mod api;
pub mod client;
pub mod config;
pub mod directory;
pub mod errors;
pub mod metrics_defs;
pub mod projector;
pub mod reconcile;
pub mod service;
pub mod statistics;
pub mod store;
pub mod tasks;
pub mod telemetry;
pub mod test_records;
pub mod tickets;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::client::HttpClient;
use crate::config::{CollaboratorConfig, Config, ScanStoreConfig};
use crate::directory::{HttpProjectDirectory, MemoryProjectDirectory, ProjectDirectory};
use crate::reconcile::Reconciler;
use crate::service::SonarService;
use crate::store::{FilesystemScanStore, MemoryScanStore, ScanStore};
use crate::tasks::{JobRunner, TaskQueue};
use crate::telemetry::{
    HttpMetricsCollector, MemoryMetricsCollector, MetricsCollector, MetricsEmitter, RetryPolicy,
};
use crate::test_records::{HttpTestRecordSource, MemoryTestRecordSource, TestRecordSource};
use crate::tickets::{HttpTicketService, MemoryTicketService, TicketService};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use errors::SonarIngestError;

/// The HTTP client for an `http` collaborator, `None` for `memory`.
fn http_client(config: &CollaboratorConfig) -> Result<Option<HttpClient>, SonarIngestError> {
    match config {
        CollaboratorConfig::Http { url, timeout_secs } => Ok(Some(HttpClient::new(
            url,
            Duration::from_secs(*timeout_secs),
        )?)),
        CollaboratorConfig::Memory => Ok(None),
    }
}

fn open_store(config: &ScanStoreConfig) -> Result<Arc<dyn ScanStore>, SonarIngestError> {
    let store: Arc<dyn ScanStore> = match config {
        ScanStoreConfig::Memory => Arc::new(MemoryScanStore::new()),
        ScanStoreConfig::Filesystem { path } => Arc::new(FilesystemScanStore::open(path)?),
    };
    Ok(store)
}

async fn shutdown_signal(ready: Arc<AtomicBool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    ready.store(false, Ordering::SeqCst);
    tracing::info!("shutting down sonar ingestion");
}

pub async fn run(config: Config) -> Result<(), SonarIngestError> {
    config.validate()?;

    let ready = Arc::new(AtomicBool::new(false));
    let store = open_store(&config.store)?;

    let tickets: Arc<dyn TicketService> = match http_client(&config.tickets)? {
        Some(client) => Arc::new(HttpTicketService::new(client)),
        None => Arc::new(MemoryTicketService::new()),
    };
    let test_records: Arc<dyn TestRecordSource> = match http_client(&config.test_records)? {
        Some(client) => Arc::new(HttpTestRecordSource::new(client)),
        None => Arc::new(MemoryTestRecordSource::new()),
    };
    let collector: Arc<dyn MetricsCollector> = match http_client(&config.collector)? {
        Some(client) => Arc::new(HttpMetricsCollector::new(client)),
        None => Arc::new(MemoryMetricsCollector::new()),
    };
    let directory: Arc<dyn ProjectDirectory> = match http_client(&config.directory)? {
        Some(client) => Arc::new(HttpProjectDirectory::new(client)),
        None => Arc::new(MemoryProjectDirectory::new()),
    };

    let reconciler = Arc::new(Reconciler::new(tickets, config.reconcile.policy.strategy()));
    let emitter = Arc::new(MetricsEmitter::new(
        collector,
        directory,
        RetryPolicy {
            attempts: config.telemetry.retry_attempts,
            interval: config.telemetry.retry_interval(),
        },
        config.telemetry.org_cache_size,
        config.telemetry.org_cache_ttl(),
    ));
    let tasks = Arc::new(TaskQueue::start(
        Arc::new(JobRunner::new(reconciler, emitter)),
        config.tasks.workers,
        config.tasks.queue_capacity,
    ));

    let service = Arc::new(SonarService::new(
        store,
        test_records,
        tasks.clone(),
        config.reconcile.policy,
    ));
    let app = api::router(service, config.credential.clone());

    let ready_flag = ready.clone();
    let admin: AdminService<_, std::io::Error> =
        AdminService::new(move || ready_flag.load(Ordering::SeqCst));

    ready.store(true, Ordering::SeqCst);
    tracing::info!(
        policy = ?config.reconcile.policy,
        workers = config.tasks.workers,
        "sonar ingestion ready"
    );

    // The admin listener only returns on error.
    tokio::select! {
        result = api::serve(config.listener.clone(), app, shutdown_signal(ready)) => result?,
        result = run_http_service(&config.admin_listener.host, config.admin_listener.port, admin) => result?,
    }

    tasks.shutdown().await;
    Ok(())
}
