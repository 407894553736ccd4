use crate::reconcile::ReconcilePolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),

    #[error("credential cluster_name cannot be empty")]
    EmptyClusterName,
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum ScanStoreConfig {
    Memory,
    /// The whole table is kept in one JSON document at `path`.
    Filesystem { path: PathBuf },
}

/// Where a collaborator lives. `memory` keeps everything in process and is
/// meant for local runs.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum CollaboratorConfig {
    Http {
        url: Url,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    Memory,
}

fn default_timeout_secs() -> u64 {
    10
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_org_cache_size")]
    pub org_cache_size: u64,
    #[serde(default = "default_org_cache_ttl_secs")]
    pub org_cache_ttl_secs: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_interval_secs() -> u64 {
    60
}

fn default_org_cache_size() -> u64 {
    1_000
}

fn default_org_cache_ttl_secs() -> u64 {
    600
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            retry_attempts: default_retry_attempts(),
            retry_interval_secs: default_retry_interval_secs(),
            org_cache_size: default_org_cache_size(),
            org_cache_ttl_secs: default_org_cache_ttl_secs(),
        }
    }
}

impl TelemetryConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn org_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.org_cache_ttl_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TaskConfig {
    /// Jobs of one lane (tickets or telemetry) that may run at the same time
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Jobs of one lane that may wait for a worker before new ones are rejected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    1_024
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub policy: ReconcilePolicy,
}

/// What `/sonar-credential` hands out to scanners.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CredentialConfig {
    /// Name of the cluster this service runs in
    pub cluster_name: String,
    /// Scanner address reachable from inside `cluster_name`
    pub addr: String,
    /// Scanner address for everyone else
    pub public_url: String,
    pub admin_token: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for the ingest and query API
    pub listener: Listener,
    /// Listener for health and readiness checks
    pub admin_listener: Listener,
    pub store: ScanStoreConfig,
    pub tickets: CollaboratorConfig,
    pub test_records: CollaboratorConfig,
    pub collector: CollaboratorConfig,
    pub directory: CollaboratorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    pub credential: CredentialConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.telemetry.retry_attempts == 0 {
            return Err(ValidationError::ZeroLimit("telemetry.retry_attempts"));
        }
        if self.tasks.workers == 0 {
            return Err(ValidationError::ZeroLimit("tasks.workers"));
        }
        if self.tasks.queue_capacity == 0 {
            return Err(ValidationError::ZeroLimit("tasks.queue_capacity"));
        }
        if self.credential.cluster_name.is_empty() {
            return Err(ValidationError::EmptyClusterName);
        }

        Ok(())
    }
}
