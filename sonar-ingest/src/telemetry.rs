//! Pushes per-scan quality numbers to the platform's metrics collector.
//!
//! Delivery is best effort: a bounded number of attempts with a fixed pause
//! between them, after which the sample is logged and dropped.
use crate::client::{ClientError, HttpClient};
use crate::directory::ProjectDirectory;
use crate::metrics_defs::{TELEMETRY_DELIVERED, TELEMETRY_DROPPED};
use crate::types::ScanPayload;
use async_trait::async_trait;
use indexmap::IndexMap;
use moka::sync::Cache;
use parking_lot::Mutex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use shared::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const SCAN_METRIC_NAME: &str = "sonar_metrics_statistics";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    /// Unix time in nanoseconds.
    pub timestamp: i64,
    pub tags: IndexMap<String, String>,
    pub fields: IndexMap<String, f64>,
}

#[derive(Serialize)]
struct MetricBatch<'a> {
    metric: &'a [Metric],
}

#[async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn collect(&self, metrics: &[Metric]) -> Result<(), ClientError>;
}

pub struct HttpMetricsCollector {
    client: HttpClient,
}

impl HttpMetricsCollector {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricsCollector for HttpMetricsCollector {
    async fn collect(&self, metrics: &[Metric]) -> Result<(), ClientError> {
        let request = self
            .client
            .request(Method::POST, "/api/collect/metrics")?
            .json(&MetricBatch { metric: metrics });
        self.client.send::<serde_json::Value>(request).await?;
        Ok(())
    }
}

/// Collector that keeps accepted samples in memory. The first `failures`
/// attempts are rejected.
#[derive(Default)]
pub struct MemoryMetricsCollector {
    failures: AtomicUsize,
    attempts: AtomicUsize,
    accepted: Mutex<Vec<Metric>>,
}

impl MemoryMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> Vec<Metric> {
        self.accepted.lock().clone()
    }
}

#[async_trait]
impl MetricsCollector for MemoryMetricsCollector {
    async fn collect(&self, metrics: &[Metric]) -> Result<(), ClientError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let rejected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(ClientError::Unavailable("collector rejected batch".into()));
        }

        self.accepted.lock().extend_from_slice(metrics);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            interval: Duration::from_secs(60),
        }
    }
}

/// How a sample ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u32 },
    Dropped { attempts: u32 },
}

pub struct MetricsEmitter {
    collector: Arc<dyn MetricsCollector>,
    directory: Arc<dyn ProjectDirectory>,
    retry: RetryPolicy,
    // project id -> org name
    org_names: Cache<i64, String>,
}

impl MetricsEmitter {
    pub fn new(
        collector: Arc<dyn MetricsCollector>,
        directory: Arc<dyn ProjectDirectory>,
        retry: RetryPolicy,
        org_cache_size: u64,
        org_cache_ttl: Duration,
    ) -> Self {
        let org_names = Cache::builder()
            .max_capacity(org_cache_size)
            .time_to_live(org_cache_ttl)
            .build();

        MetricsEmitter {
            collector,
            directory,
            retry,
            org_names,
        }
    }

    /// Builds the sample for `payload` and delivers it. Never fails; the
    /// outcome is returned for the caller's information only.
    pub async fn emit(&self, payload: &ScanPayload) -> Delivery {
        let org_name = self.org_name(payload.project_id).await;
        let metric = build_sample(payload, org_name);
        let batch = [metric];

        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.collector.collect(&batch).await {
                Ok(()) => {
                    counter!(TELEMETRY_DELIVERED).increment(1);
                    tracing::debug!(key = %payload.key, attempt, "delivered scan metrics");
                    return Delivery::Delivered { attempts: attempt };
                }
                Err(e) => {
                    tracing::warn!(key = %payload.key, attempt, error = %e, "scan metrics delivery failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.interval).await;
                    }
                }
            }
        }

        tracing::error!(sample = ?batch[0], attempts, "dropping scan metrics");
        counter!(TELEMETRY_DROPPED).increment(1);
        Delivery::Dropped { attempts }
    }

    async fn org_name(&self, project_id: i64) -> Option<String> {
        if let Some(name) = self.org_names.get(&project_id) {
            return Some(name);
        }

        let project = match self.directory.get_project(project_id).await {
            Ok(project) => project,
            Err(e) => {
                tracing::error!(project_id, error = %e, "project lookup failed");
                return None;
            }
        };
        let org = match self.directory.get_org(project.org_id).await {
            Ok(org) => org,
            Err(e) => {
                tracing::error!(project_id, org_id = project.org_id, error = %e, "org lookup failed");
                return None;
            }
        };

        self.org_names.insert(project_id, org.name.clone());
        Some(org.name)
    }
}

fn build_sample(payload: &ScanPayload, org_name: Option<String>) -> Metric {
    let mut tags = IndexMap::new();
    tags.insert("app_id".to_string(), payload.application_id.to_string());
    tags.insert("operator_id".to_string(), payload.operator_id.clone());
    tags.insert("project_id".to_string(), payload.project_id.to_string());
    tags.insert("commit_id".to_string(), payload.commit_id.clone());
    tags.insert("branch".to_string(), payload.branch.clone());
    tags.insert("git_repo".to_string(), payload.git_repo.clone());
    tags.insert("build_id".to_string(), payload.build_id.to_string());
    tags.insert("log_id".to_string(), payload.log_id.clone());
    tags.insert("app_name".to_string(), payload.application_name.clone());
    tags.insert("project_name".to_string(), payload.project_name.clone());
    tags.insert("_meta".to_string(), "true".to_string());
    tags.insert("_metric_scope".to_string(), "org".to_string());
    if let Some(org_name) = org_name {
        tags.insert("_metric_scope_id".to_string(), org_name.clone());
        tags.insert("org_name".to_string(), org_name);
    }

    let statistics = payload.statistics().unwrap_or_else(|e| {
        tracing::warn!(key = %payload.key, error = %e, "scan statistics unreadable, reporting zeros");
        Default::default()
    });
    let number = |raw: &str| raw.parse::<f64>().unwrap_or(0.0);

    let mut fields = IndexMap::new();
    fields.insert("bugs_num".to_string(), number(&statistics.bugs));
    fields.insert("coverage".to_string(), number(&statistics.coverage));
    fields.insert("vulnerabilities".to_string(), number(&statistics.vulnerabilities));
    fields.insert("codeSmells".to_string(), number(&statistics.code_smells));
    fields.insert("duplications".to_string(), number(&statistics.duplications));
    fields.insert("num".to_string(), 1.0);

    Metric {
        name: SCAN_METRIC_NAME.to_string(),
        timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        tags,
        fields,
    }
}
