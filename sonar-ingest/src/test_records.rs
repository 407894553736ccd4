//! Access to unit test results reported by CI, used for the UT pass rate.
use crate::client::{ClientError, HttpClient};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestTotals {
    #[serde(default)]
    pub tests: i64,
    #[serde(default)]
    pub statuses: HashMap<String, i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    #[serde(default)]
    pub commit_id: String,
    #[serde(default)]
    pub totals: TestTotals,
}

#[async_trait]
pub trait TestRecordSource: Send + Sync {
    /// The most recent test record of a commit, if any was reported.
    async fn latest_by_commit(&self, commit_id: &str) -> Result<Option<TestRecord>, ClientError>;
}

pub struct HttpTestRecordSource {
    client: HttpClient,
}

impl HttpTestRecordSource {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TestRecordSource for HttpTestRecordSource {
    async fn latest_by_commit(&self, commit_id: &str) -> Result<Option<TestRecord>, ClientError> {
        let request = self
            .client
            .request(Method::GET, "/api/qa/test-records/actions/latest")?
            .query(&[("commitID", commit_id)]);

        match self.client.send::<TestRecord>(request).await {
            Ok(record) => Ok(record),
            Err(ClientError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Records held in memory; newer inserts for a commit shadow older ones.
#[derive(Default)]
pub struct MemoryTestRecordSource {
    records: RwLock<HashMap<String, TestRecord>>,
}

impl MemoryTestRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: TestRecord) {
        self.records.write().insert(record.commit_id.clone(), record);
    }
}

#[async_trait]
impl TestRecordSource for MemoryTestRecordSource {
    async fn latest_by_commit(&self, commit_id: &str) -> Result<Option<TestRecord>, ClientError> {
        Ok(self.records.read().get(commit_id).cloned())
    }
}
