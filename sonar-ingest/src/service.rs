//! Ingestion and read paths over the scan store.
//!
//! Ingest stores the scan synchronously and hands ticket reconciliation and
//! metrics delivery to the task queue. Reads re-aggregate on every request.
use crate::metrics_defs::SCANS_STORED;
use crate::projector::IssueProjector;
use crate::reconcile::{ReconcileJob, ReconcilePolicy};
use crate::statistics::{StatisticsAggregator, StatisticsError};
use crate::store::{ScanRecord, ScanStore, StoreError};
use crate::tasks::{Job, TaskQueue};
use crate::test_records::TestRecordSource;
use crate::types::{Category, Issue, IssueQueryType, IssueStatistics, IssueTree, ScanPayload};
use serde::Serialize;
use shared::counter;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum SonarError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Statistics(#[from] StatisticsError),
}

/// Result of a per-commit query; the shape depends on the requested type.
#[derive(Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum IssuesView {
    Statistics(IssueStatistics),
    Issues(Vec<Issue>),
    Trees(Vec<IssueTree>),
}

pub struct SonarService {
    store: Arc<dyn ScanStore>,
    aggregator: StatisticsAggregator,
    projector: IssueProjector,
    tasks: Arc<TaskQueue>,
    policy: ReconcilePolicy,
}

impl SonarService {
    pub fn new(
        store: Arc<dyn ScanStore>,
        test_records: Arc<dyn TestRecordSource>,
        tasks: Arc<TaskQueue>,
        policy: ReconcilePolicy,
    ) -> Self {
        SonarService {
            aggregator: StatisticsAggregator::new(store.clone(), test_records),
            projector: IssueProjector::new(store.clone()),
            store,
            tasks,
            policy,
        }
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    /// Stores one scan and queues its follow-up work. The stored row is
    /// returned without waiting for that work.
    pub fn store_scan(&self, payload: ScanPayload) -> Result<ScanRecord, SonarError> {
        if payload.key.is_empty() {
            return Err(SonarError::InvalidParameter("key"));
        }
        if payload.commit_id.is_empty() {
            return Err(SonarError::InvalidParameter("commitId"));
        }
        if payload.application_id <= 0 {
            return Err(SonarError::InvalidParameter("applicationId"));
        }

        // Diffing needs the application's scan as it was before this one.
        let previous = match self.policy {
            ReconcilePolicy::DiffBased => self.store.latest_by_application(payload.application_id)?,
            ReconcilePolicy::FullReplace => None,
        };
        let jobs = reconcile_jobs(&payload, previous.as_ref());

        let stored = self.store.upsert(ScanRecord::from_payload(&payload))?;
        counter!(SCANS_STORED).increment(1);
        tracing::info!(
            key = %stored.key,
            commit_id = %stored.commit_id,
            application_id = stored.application_id,
            id = stored.id,
            "stored scan"
        );

        // Rejected jobs are logged and counted by the queue.
        for job in jobs {
            let _ = self.tasks.submit(Job::Reconcile(job));
        }
        let _ = self.tasks.submit(Job::EmitMetrics(Box::new(payload)));

        Ok(stored)
    }

    /// Statistics of the application's most recently updated scan.
    pub async fn latest_summary(&self, application_id: i64) -> Result<IssueStatistics, SonarError> {
        let rows: Vec<_> = self
            .store
            .latest_by_application(application_id)?
            .into_iter()
            .collect();
        Ok(self.aggregator.summarize(&rows, false).await?)
    }

    pub async fn issues_by_commit(
        &self,
        commit_id: &str,
        query: IssueQueryType,
    ) -> Result<IssuesView, SonarError> {
        let view = match query {
            IssueQueryType::Statistics => {
                IssuesView::Statistics(self.aggregator.aggregate(commit_id, true).await?)
            }
            IssueQueryType::Issues(category) if category.is_tree() => {
                IssuesView::Trees(self.projector.project_tree(category, commit_id)?)
            }
            IssueQueryType::Issues(category) => {
                IssuesView::Issues(self.projector.project_flat(category, commit_id)?)
            }
        };
        Ok(view)
    }
}

/// One job per flat category. A category whose fragment does not decode is
/// left alone so an unreadable payload never purges tickets.
fn reconcile_jobs(payload: &ScanPayload, previous: Option<&ScanRecord>) -> Vec<ReconcileJob> {
    let mut jobs = Vec::with_capacity(Category::FLAT.len());

    for category in Category::FLAT {
        let issues = match payload.issues(category) {
            Ok(issues) => issues,
            Err(e) => {
                tracing::warn!(key = %payload.key, %category, error = %e, "not reconciling unreadable fragment");
                continue;
            }
        };

        let previous = previous.and_then(|row| {
            let raw = row.fragment(category)?;
            serde_json::from_str::<Vec<Issue>>(raw)
                .inspect_err(|e| {
                    tracing::warn!(key = %row.key, %category, error = %e, "previous scan fragment unreadable");
                })
                .ok()
        });

        jobs.push(ReconcileJob {
            application_id: payload.application_id,
            branch: payload.branch.clone(),
            category,
            issues,
            previous,
        });
    }

    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemoryMetricsCollector;
    use crate::test_records::{TestRecord, TestTotals};
    use crate::testutils::{Harness, issue, payload};
    use crate::tickets::{TicketStatus, TicketType};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    fn record_tests(harness: &Harness, commit_id: &str) {
        harness.test_records.insert(TestRecord {
            commit_id: commit_id.to_string(),
            totals: TestTotals {
                tests: 4,
                statuses: HashMap::from([("passed".to_string(), 3), ("skipped".to_string(), 0)]),
            },
        });
    }

    #[tokio::test]
    async fn test_two_sub_scans_end_to_end() {
        let harness = Harness::new(ReconcilePolicy::FullReplace);
        let b1 = issue("api/a.go", "b1");
        let b2 = issue("web/b.go", "b2");

        harness
            .service
            .store_scan(payload("scan-api", "c1", 7, vec![b1.clone()], json!({"bugs": "1", "coverage": "40"})))
            .unwrap();
        harness
            .service
            .store_scan(payload("scan-web", "c1", 7, vec![b2.clone()], json!({"bugs": "1", "coverage": "2.5"})))
            .unwrap();
        harness.service.tasks().wait_idle().await;
        record_tests(&harness, "c1");

        let IssuesView::Statistics(stats) = harness
            .service
            .issues_by_commit("c1", IssueQueryType::Statistics)
            .await
            .unwrap()
        else {
            panic!("expected statistics");
        };
        assert_eq!(stats.bugs, "2");
        assert_eq!(stats.coverage, "42.5");
        assert_eq!(stats.ut, "75.00");

        let bugs = harness
            .service
            .issues_by_commit("c1", IssueQueryType::Issues(Category::Bugs))
            .await
            .unwrap();
        assert_eq!(bugs, IssuesView::Issues(vec![b1.clone(), b2.clone()]));

        // Each sub-scan replaced the application's bug tickets with its own.
        let tickets = harness.tickets.tickets_of("7", TicketType::Bug);
        assert_eq!(tickets.len(), 1);
        let path = &tickets[0].label["path"];
        assert!(path == &b1.path || path == &b2.path);

        assert_eq!(harness.collector.accepted().len(), 2);
    }

    #[tokio::test]
    async fn test_partial_fragment_tolerance() {
        let harness = Harness::new(ReconcilePolicy::FullReplace);
        let mut scan = payload("scan-1", "c1", 7, vec![issue("a.go", "boom")], json!({}));
        scan.coverage = Some(json!("not a tree"));

        let stored = harness.service.store_scan(scan).unwrap();
        assert!(stored.coverage.is_none());

        let coverage = harness
            .service
            .issues_by_commit("c1", IssueQueryType::Issues(Category::Coverage))
            .await
            .unwrap();
        assert_eq!(coverage, IssuesView::Trees(vec![]));

        let IssuesView::Issues(bugs) = harness
            .service
            .issues_by_commit("c1", IssueQueryType::Issues(Category::Bugs))
            .await
            .unwrap()
        else {
            panic!("expected issues");
        };
        assert_eq!(bugs.len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_category_is_not_reconciled() {
        let harness = Harness::new(ReconcilePolicy::FullReplace);
        harness
            .service
            .store_scan(payload("scan-1", "c1", 7, vec![issue("a.go", "one")], json!({})))
            .unwrap();
        harness.service.tasks().wait_idle().await;

        let mut scan = payload("scan-2", "c2", 7, vec![], json!({}));
        scan.bugs = Some(json!({"not": "a list"}));
        harness.service.store_scan(scan).unwrap();
        harness.service.tasks().wait_idle().await;

        assert_eq!(harness.tickets.tickets_of("7", TicketType::Bug).len(), 1);
    }

    #[tokio::test]
    async fn test_validation() {
        let harness = Harness::new(ReconcilePolicy::FullReplace);

        let mut scan = payload("", "c1", 7, vec![], json!({}));
        assert!(matches!(
            harness.service.store_scan(scan.clone()),
            Err(SonarError::InvalidParameter("key"))
        ));
        scan.key = "scan-1".into();
        scan.commit_id.clear();
        assert!(matches!(
            harness.service.store_scan(scan.clone()),
            Err(SonarError::InvalidParameter("commitId"))
        ));
        scan.commit_id = "c1".into();
        scan.application_id = 0;
        assert!(matches!(
            harness.service.store_scan(scan),
            Err(SonarError::InvalidParameter("applicationId"))
        ));

        assert!(harness.store.find_by_commit("c1").unwrap().is_empty());
        assert_eq!(harness.service.tasks().pending(), 0);
    }

    #[tokio::test]
    async fn test_latest_summary() {
        let harness = Harness::new(ReconcilePolicy::FullReplace);
        assert_eq!(harness.service.latest_summary(7).await.unwrap().bugs, "0");

        harness
            .service
            .store_scan(payload("scan-1", "c1", 7, vec![], json!({"bugs": "3"})))
            .unwrap();
        harness
            .service
            .store_scan(payload("scan-2", "c2", 7, vec![], json!({"bugs": "5"})))
            .unwrap();

        // Only the newest row counts, even though no test record exists.
        let summary = harness.service.latest_summary(7).await.unwrap();
        assert_eq!(summary.bugs, "5");
        assert_eq!(summary.commit_id, "c2");
        assert_eq!(summary.ut, "");
    }

    #[tokio::test]
    async fn test_statistics_query_requires_test_record() {
        let harness = Harness::new(ReconcilePolicy::FullReplace);
        harness
            .service
            .store_scan(payload("scan-1", "c1", 7, vec![], json!({"bugs": "3"})))
            .unwrap();

        assert!(matches!(
            harness
                .service
                .issues_by_commit("c1", IssueQueryType::Statistics)
                .await,
            Err(SonarError::Statistics(StatisticsError::TestRecordMissing(_)))
        ));
    }

    #[tokio::test]
    async fn test_diff_based_policy_uses_previous_scan() {
        let harness = Harness::new(ReconcilePolicy::DiffBased);
        let kept = issue("a.go", "kept");
        let fixed = issue("b.go", "fixed");

        harness
            .service
            .store_scan(payload("scan-1", "c1", 7, vec![kept.clone(), fixed.clone()], json!({})))
            .unwrap();
        harness.service.tasks().wait_idle().await;
        harness
            .service
            .store_scan(payload("scan-2", "c2", 7, vec![kept.clone()], json!({})))
            .unwrap();
        harness.service.tasks().wait_idle().await;

        let tickets = harness.tickets.tickets_of("7", TicketType::Bug);
        assert_eq!(tickets.len(), 2);
        let open: Vec<_> = tickets
            .iter()
            .filter(|t| t.status == TicketStatus::Open)
            .map(|t| t.label["path"].as_str())
            .collect();
        assert_eq!(open, vec!["a.go"]);
    }

    #[tokio::test]
    async fn test_collector_outage_does_not_delay_tickets() {
        let harness = Harness::with_collector(
            ReconcilePolicy::FullReplace,
            MemoryMetricsCollector::failing(usize::MAX),
            Duration::from_secs(60),
        );

        // Enough scans to keep every metrics worker in a retry pause.
        for app in 1..=4 {
            harness
                .service
                .store_scan(payload(&format!("scan-{app}"), "c1", app, vec![], json!({})))
                .unwrap();
        }
        harness
            .service
            .store_scan(payload("scan-9", "c9", 9, vec![issue("a.go", "boom")], json!({})))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.tickets.tickets_of("9", TicketType::Bug).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(harness.collector.accepted().is_empty());
    }
}
