//! Merges the summary statistics of every sub-scan of a commit.
//!
//! Counts and percentages travel as strings. They are parsed into typed
//! totals here and only turned back into strings when the result is built.
use crate::client::ClientError;
use crate::metrics_defs::ROWS_SKIPPED;
use crate::store::{ScanRecord, ScanStore, StoreError};
use crate::test_records::TestRecordSource;
use crate::types::{IssueStatistics, Rating};
use shared::counter;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum StatisticsError {
    #[error("scan store error: {0}")]
    Store(#[from] StoreError),
    #[error("test record lookup failed: {0}")]
    TestRecordLookup(#[from] ClientError),
    #[error("no test record for commit {0}")]
    TestRecordMissing(String),
    #[error("test record for commit {commit_id} has no {counter} counter")]
    TestCounterMissing {
        commit_id: String,
        counter: &'static str,
    },
}

pub struct StatisticsAggregator {
    store: Arc<dyn ScanStore>,
    test_records: Arc<dyn TestRecordSource>,
}

impl StatisticsAggregator {
    pub fn new(store: Arc<dyn ScanStore>, test_records: Arc<dyn TestRecordSource>) -> Self {
        Self {
            store,
            test_records,
        }
    }

    /// Statistics of every stored sub-scan of `commit_id`.
    pub async fn aggregate(
        &self,
        commit_id: &str,
        include_ut: bool,
    ) -> Result<IssueStatistics, StatisticsError> {
        let rows = self.store.find_by_commit(commit_id)?;
        self.summarize(&rows, include_ut).await
    }

    /// Statistics of the given rows. Rows belonging to a different commit than
    /// the first one are ignored.
    pub async fn summarize(
        &self,
        rows: &[ScanRecord],
        include_ut: bool,
    ) -> Result<IssueStatistics, StatisticsError> {
        let mut statistics = merge_rows(rows);

        if include_ut && !rows.is_empty() {
            statistics.ut = self.unit_test_pass_rate(&statistics.commit_id).await?;
        }

        Ok(statistics)
    }

    async fn unit_test_pass_rate(&self, commit_id: &str) -> Result<String, StatisticsError> {
        let record = self
            .test_records
            .latest_by_commit(commit_id)
            .await?
            .ok_or_else(|| StatisticsError::TestRecordMissing(commit_id.to_string()))?;

        let counter = |name: &'static str| {
            record
                .totals
                .statuses
                .get(name)
                .copied()
                .ok_or_else(|| StatisticsError::TestCounterMissing {
                    commit_id: commit_id.to_string(),
                    counter: name,
                })
        };
        let passed = counter("passed")?;
        let skipped = counter("skipped")?;

        if record.totals.tests <= 0 {
            return Err(StatisticsError::TestCounterMissing {
                commit_id: commit_id.to_string(),
                counter: "tests",
            });
        }

        let rate = (passed + skipped) as f64 * 100.0 / record.totals.tests as f64;
        Ok(format!("{rate:.2}"))
    }
}

#[derive(Default)]
struct Totals {
    bugs: Option<i64>,
    code_smells: Option<i64>,
    vulnerabilities: Option<i64>,
    coverage: Option<f64>,
    duplications: Option<f64>,
}

impl Totals {
    fn add_count(total: &mut Option<i64>, field: &str, raw: &str, key: &str) {
        if raw.is_empty() {
            return;
        }
        match raw.parse::<i64>() {
            Ok(value) => *total = Some(total.unwrap_or(0).saturating_add(value)),
            Err(e) => tracing::warn!(key, field, value = raw, error = %e, "skipping unparsable count"),
        }
    }

    fn add_percentage(total: &mut Option<f64>, field: &str, raw: &str, key: &str) {
        if raw.is_empty() {
            return;
        }
        match raw.parse::<f64>() {
            Ok(value) => *total = Some(total.unwrap_or(0.0) + value),
            Err(e) => {
                tracing::warn!(key, field, value = raw, error = %e, "skipping unparsable percentage")
            }
        }
    }

    fn add(&mut self, row: &IssueStatistics, key: &str) {
        Self::add_count(&mut self.bugs, "bugs", &row.bugs, key);
        Self::add_count(&mut self.code_smells, "codeSmells", &row.code_smells, key);
        Self::add_count(
            &mut self.vulnerabilities,
            "vulnerabilities",
            &row.vulnerabilities,
            key,
        );
        Self::add_percentage(&mut self.coverage, "coverage", &row.coverage, key);
        Self::add_percentage(&mut self.duplications, "duplications", &row.duplications, key);
    }
}

fn format_count(total: Option<i64>) -> String {
    total.unwrap_or(0).to_string()
}

// Shortest representation that reads back to the same value, never exponent form.
fn format_percentage(total: Option<f64>) -> String {
    match total {
        Some(value) => value.to_string(),
        None => "0.0".to_string(),
    }
}

fn join_accumulated(acc: &mut String, value: &str) {
    if value.is_empty() {
        return;
    }
    if !acc.is_empty() {
        acc.push(',');
    }
    acc.push_str(value);
}

/// Folds the statistics of all rows into one value. Rows whose statistics do
/// not decode are skipped.
fn merge_rows(rows: &[ScanRecord]) -> IssueStatistics {
    let mut merged = IssueStatistics {
        rating: Some(Rating::default()),
        ..Default::default()
    };
    let mut totals = Totals::default();

    if let Some(first) = rows.first() {
        merged.commit_id = first.commit_id.clone();
        merged.branch = first.branch.clone();
        merged.time = Some(first.updated_at);
    }

    for row in rows.iter().filter(|row| row.commit_id == merged.commit_id) {
        let Some(raw) = row.issues_statistics.as_deref() else {
            continue;
        };

        let reported: IssueStatistics = match serde_json::from_str(raw) {
            Ok(reported) => reported,
            Err(e) => {
                tracing::warn!(key = %row.key, error = %e, "skipping row with unreadable statistics");
                counter!(ROWS_SKIPPED).increment(1);
                continue;
            }
        };

        totals.add(&reported, &row.key);
        join_accumulated(&mut merged.sonar_key, &reported.sonar_key);
        join_accumulated(&mut merged.path, &reported.path);
        if reported.rating.is_some() {
            merged.rating = reported.rating;
        }
    }

    merged.bugs = format_count(totals.bugs);
    merged.code_smells = format_count(totals.code_smells);
    merged.vulnerabilities = format_count(totals.vulnerabilities);
    merged.coverage = format_percentage(totals.coverage);
    merged.duplications = format_percentage(totals.duplications);
    merged
}
