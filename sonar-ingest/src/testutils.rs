use crate::directory::MemoryProjectDirectory;
use crate::reconcile::{ReconcilePolicy, Reconciler};
use crate::service::SonarService;
use crate::store::MemoryScanStore;
use crate::tasks::{JobRunner, TaskQueue};
use crate::telemetry::{MemoryMetricsCollector, MetricsEmitter, RetryPolicy};
use crate::test_records::MemoryTestRecordSource;
use crate::tickets::MemoryTicketService;
use crate::types::{Issue, ScanPayload, TextRange};
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub fn issue(path: &str, message: &str) -> Issue {
    Issue {
        path: path.to_string(),
        message: message.to_string(),
        rule: "go:S1144".to_string(),
        severity: "MAJOR".to_string(),
        status: "OPEN".to_string(),
        line: 12,
        code: vec!["x := nil".to_string(), "x.Call()".to_string()],
        text_range: TextRange {
            start_line: 12,
            end_line: 13,
            start_offset: 0,
            end_offset: 8,
        },
    }
}

pub fn payload(
    key: &str,
    commit_id: &str,
    application_id: i64,
    bugs: Vec<Issue>,
    statistics: Value,
) -> ScanPayload {
    ScanPayload {
        key: key.to_string(),
        commit_id: commit_id.to_string(),
        branch: "master".to_string(),
        git_repo: "https://git.example.com/acme/shop".to_string(),
        project_id: 3,
        project_name: "shop".to_string(),
        application_id,
        application_name: "shop-web".to_string(),
        build_id: 101,
        operator_id: "1001".to_string(),
        log_id: "log-1".to_string(),
        issues_statistics: Some(statistics),
        bugs: Some(serde_json::to_value(bugs).unwrap()),
        ..Default::default()
    }
}

/// A service wired to in-memory collaborators.
pub struct Harness {
    pub service: Arc<SonarService>,
    pub store: Arc<MemoryScanStore>,
    pub tickets: Arc<MemoryTicketService>,
    pub collector: Arc<MemoryMetricsCollector>,
    pub test_records: Arc<MemoryTestRecordSource>,
}

impl Harness {
    pub fn new(policy: ReconcilePolicy) -> Self {
        Self::with_collector(
            policy,
            MemoryMetricsCollector::new(),
            Duration::from_millis(1),
        )
    }

    /// Like `new`, with a given collector and pause between delivery attempts.
    pub fn with_collector(
        policy: ReconcilePolicy,
        collector: MemoryMetricsCollector,
        retry_interval: Duration,
    ) -> Self {
        let store = Arc::new(MemoryScanStore::new());
        let tickets = Arc::new(MemoryTicketService::new());
        let collector = Arc::new(collector);
        let test_records = Arc::new(MemoryTestRecordSource::new());

        let reconciler = Arc::new(Reconciler::new(tickets.clone(), policy.strategy()));
        let emitter = Arc::new(MetricsEmitter::new(
            collector.clone(),
            Arc::new(MemoryProjectDirectory::new()),
            RetryPolicy {
                attempts: 3,
                interval: retry_interval,
            },
            16,
            Duration::from_secs(60),
        ));
        let tasks = Arc::new(TaskQueue::start(
            Arc::new(JobRunner::new(reconciler, emitter)),
            4,
            64,
        ));

        let service = Arc::new(SonarService::new(
            store.clone(),
            test_records.clone(),
            tasks,
            policy,
        ));

        Harness {
            service,
            store,
            tickets,
            collector,
            test_records,
        }
    }
}

/// Recorder that keeps counter totals by metric name and ignores the rest.
/// Install it with `metrics::with_local_recorder`.
#[derive(Default)]
pub struct CountingRecorder {
    counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl CountingRecorder {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .get(name)
            .map_or(0, |value| value.load(Ordering::SeqCst))
    }
}

impl Recorder for CountingRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        let value = self
            .counters
            .lock()
            .entry(key.name().to_string())
            .or_default()
            .clone();
        Counter::from_arc(value)
    }

    fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::noop()
    }
}
