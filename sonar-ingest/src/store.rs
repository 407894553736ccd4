//! Durable storage for ingested scans.
//!
//! Rows are keyed by the scan `key` for upserts but read back by commit or by
//! application. Several rows can share a commit when a build is analysed in
//! per-module sub-scans.
use crate::metrics_defs::FRAGMENT_DROPPED;
use crate::types::{Category, Issue, IssueStatistics, IssueTree, ScanPayload};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::counter;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("could not encode scan table: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("could not decode scan table {path:?}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// One stored scan. Result fragments are kept as the JSON text they were
/// stored with and decoded again on read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub id: u64,
    pub key: String,
    pub commit_id: String,
    pub branch: String,
    pub git_repo: String,
    pub project_id: i64,
    pub application_id: i64,
    pub application_name: String,
    pub build_id: i64,
    pub operator_id: String,
    pub log_id: String,
    pub issues_statistics: Option<String>,
    pub bugs: Option<String>,
    pub code_smells: Option<String>,
    pub vulnerabilities: Option<String>,
    pub coverage: Option<String>,
    pub duplications: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanRecord {
    /// Builds the row for `payload`. Each fragment is validated against its
    /// schema on its own; a fragment that does not fit is logged and left out
    /// so the rest of the scan is still stored.
    pub fn from_payload(payload: &ScanPayload) -> Self {
        let now = Utc::now();
        ScanRecord {
            id: 0,
            key: payload.key.clone(),
            commit_id: payload.commit_id.clone(),
            branch: payload.branch.clone(),
            git_repo: payload.git_repo.clone(),
            project_id: payload.project_id,
            application_id: payload.application_id,
            application_name: payload.application_name.clone(),
            build_id: payload.build_id,
            operator_id: payload.operator_id.clone(),
            log_id: payload.log_id.clone(),
            issues_statistics: encode_fragment::<IssueStatistics>(
                &payload.key,
                "issuesStatistics",
                payload.issues_statistics.as_ref(),
            ),
            bugs: encode_flat(payload, Category::Bugs),
            code_smells: encode_flat(payload, Category::CodeSmells),
            vulnerabilities: encode_flat(payload, Category::Vulnerabilities),
            coverage: encode_tree(payload, Category::Coverage),
            duplications: encode_tree(payload, Category::Duplications),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn fragment(&self, category: Category) -> Option<&str> {
        match category {
            Category::Bugs => self.bugs.as_deref(),
            Category::CodeSmells => self.code_smells.as_deref(),
            Category::Vulnerabilities => self.vulnerabilities.as_deref(),
            Category::Coverage => self.coverage.as_deref(),
            Category::Duplications => self.duplications.as_deref(),
        }
    }
}

fn encode_flat(payload: &ScanPayload, category: Category) -> Option<String> {
    encode_fragment::<Vec<Issue>>(&payload.key, category.as_str(), payload.fragment(category))
}

fn encode_tree(payload: &ScanPayload, category: Category) -> Option<String> {
    encode_fragment::<Vec<IssueTree>>(&payload.key, category.as_str(), payload.fragment(category))
}

fn encode_fragment<T>(key: &str, name: &str, value: Option<&serde_json::Value>) -> Option<String>
where
    T: Serialize + DeserializeOwned,
{
    let value = value.filter(|v| !v.is_null())?;

    let encoded = T::deserialize(value).and_then(|typed| serde_json::to_string(&typed));
    match encoded {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!(key, fragment = name, error = %e, "dropping malformed scan fragment");
            counter!(FRAGMENT_DROPPED, "fragment" => name.to_string()).increment(1);
            None
        }
    }
}

pub trait ScanStore: Send + Sync {
    /// Replaces the row with the same key, or inserts a new one. The stored
    /// row is returned with its id and timestamps filled in.
    fn upsert(&self, record: ScanRecord) -> Result<ScanRecord, StoreError>;

    /// All rows of a commit, in store order.
    fn find_by_commit(&self, commit_id: &str) -> Result<Vec<ScanRecord>, StoreError>;

    /// The most recently updated row of an application.
    fn latest_by_application(&self, application_id: i64)
    -> Result<Option<ScanRecord>, StoreError>;
}

#[derive(Default, Serialize, Deserialize)]
struct Table {
    next_id: u64,
    #[serde(default)]
    last_update: Option<DateTime<Utc>>,
    rows: Vec<ScanRecord>,
    #[serde(skip)]
    by_key: HashMap<String, usize>,
}

impl Table {
    fn reindex(&mut self) {
        self.by_key = self
            .rows
            .iter()
            .enumerate()
            .map(|(idx, row)| (row.key.clone(), idx))
            .collect();
    }

    /// Update timestamps strictly increase so "most recent" is never a tie.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_update
            && now <= last
        {
            now = last + TimeDelta::nanoseconds(1);
        }
        self.last_update = Some(now);
        now
    }

    fn upsert(&mut self, mut record: ScanRecord) -> ScanRecord {
        let now = self.next_timestamp();
        record.updated_at = now;

        match self.by_key.get(&record.key) {
            Some(&idx) => {
                let existing = &mut self.rows[idx];
                record.id = existing.id;
                record.created_at = existing.created_at;
                *existing = record.clone();
            }
            None => {
                self.next_id += 1;
                record.id = self.next_id;
                record.created_at = now;
                self.by_key.insert(record.key.clone(), self.rows.len());
                self.rows.push(record.clone());
            }
        }

        record
    }

    fn find_by_commit(&self, commit_id: &str) -> Vec<ScanRecord> {
        self.rows
            .iter()
            .filter(|row| row.commit_id == commit_id)
            .cloned()
            .collect()
    }

    fn latest_by_application(&self, application_id: i64) -> Option<ScanRecord> {
        self.rows
            .iter()
            .filter(|row| row.application_id == application_id)
            .max_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)))
            .cloned()
    }
}

/// Volatile store, used for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryScanStore {
    table: RwLock<Table>,
}

impl MemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScanStore for MemoryScanStore {
    fn upsert(&self, record: ScanRecord) -> Result<ScanRecord, StoreError> {
        Ok(self.table.write().upsert(record))
    }

    fn find_by_commit(&self, commit_id: &str) -> Result<Vec<ScanRecord>, StoreError> {
        Ok(self.table.read().find_by_commit(commit_id))
    }

    fn latest_by_application(
        &self,
        application_id: i64,
    ) -> Result<Option<ScanRecord>, StoreError> {
        Ok(self.table.read().latest_by_application(application_id))
    }
}

/// Keeps the table in memory and writes it through to a single JSON file on
/// every upsert. The file is replaced atomically by writing a sibling
/// temporary file and renaming it over the old one.
pub struct FilesystemScanStore {
    path: PathBuf,
    table: RwLock<Table>,
}

impl FilesystemScanStore {
    /// Opens the store at `path`, loading existing rows if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let mut table = match File::open(&path) {
            Ok(file) => serde_json::from_reader::<_, Table>(BufReader::new(file)).map_err(
                |source| StoreError::Decode {
                    path: path.clone(),
                    source,
                },
            )?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Table::default(),
            Err(e) => return Err(e.into()),
        };
        table.reindex();

        tracing::info!(path = ?path, rows = table.rows.len(), "loaded scan store");

        Ok(FilesystemScanStore {
            path,
            table: RwLock::new(table),
        })
    }

    fn persist(&self, encoded: &[u8]) -> Result<(), StoreError> {
        let tmp_path = self.path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(encoded)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl ScanStore for FilesystemScanStore {
    /// Writers are serialized for the whole call. Readers are only held off
    /// while the row is applied and the table encoded, not during the file
    /// write; they may see the new row before it is durable, and it is rolled
    /// back if the write fails.
    fn upsert(&self, record: ScanRecord) -> Result<ScanRecord, StoreError> {
        let mut table = self.table.write();
        let previous = table.by_key.get(&record.key).map(|&idx| table.rows[idx].clone());
        let next_id = table.next_id;
        let last_update = table.last_update;

        let stored = table.upsert(record);
        let encoded = serde_json::to_vec(&*table).map_err(StoreError::Encode);

        let table = RwLockWriteGuard::downgrade_to_upgradable(table);
        let Err(e) = encoded.and_then(|encoded| self.persist(&encoded)) else {
            return Ok(stored);
        };

        let mut table = RwLockUpgradableReadGuard::upgrade(table);
        match previous {
            Some(row) => {
                let idx = table.by_key[&row.key];
                table.rows[idx] = row;
            }
            None => {
                table.rows.pop();
                table.by_key.remove(&stored.key);
                table.next_id = next_id;
            }
        }
        table.last_update = last_update;
        Err(e)
    }

    fn find_by_commit(&self, commit_id: &str) -> Result<Vec<ScanRecord>, StoreError> {
        Ok(self.table.read().find_by_commit(commit_id))
    }

    fn latest_by_application(
        &self,
        application_id: i64,
    ) -> Result<Option<ScanRecord>, StoreError> {
        Ok(self.table.read().latest_by_application(application_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{issue, payload};
    use serde_json::json;

    #[test]
    fn test_upsert_same_key_is_idempotent() {
        let store = MemoryScanStore::new();
        let scan = payload("scan-1", "c1", 7, vec![issue("a.go", "boom")], json!({"bugs": "1"}));

        let first = store.upsert(ScanRecord::from_payload(&scan)).unwrap();
        let second = store.upsert(ScanRecord::from_payload(&scan)).unwrap();

        let rows = store.find_by_commit("c1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(rows[0].bugs, first.bugs);
        assert_eq!(rows[0].issues_statistics, first.issues_statistics);
    }

    #[test]
    fn test_upsert_replaces_whole_row() {
        let store = MemoryScanStore::new();
        let mut scan = payload("scan-1", "c1", 7, vec![issue("a.go", "boom")], json!({}));
        scan.coverage = Some(json!([{"path": "a.go", "coverage": "10"}]));
        store.upsert(ScanRecord::from_payload(&scan)).unwrap();

        // The replacement no longer reports coverage; nothing of the old row survives.
        let mut replacement = payload("scan-1", "c2", 7, vec![], json!({}));
        replacement.branch = "develop".into();
        store.upsert(ScanRecord::from_payload(&replacement)).unwrap();

        assert!(store.find_by_commit("c1").unwrap().is_empty());
        let rows = store.find_by_commit("c2").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].coverage, None);
        assert_eq!(rows[0].branch, "develop");
        assert_eq!(rows[0].bugs.as_deref(), Some("[]"));
    }

    #[test]
    fn test_rows_keep_insertion_order_across_replace() {
        let store = MemoryScanStore::new();
        for key in ["scan-1", "scan-2", "scan-3"] {
            store
                .upsert(ScanRecord::from_payload(&payload(key, "c1", 7, vec![], json!({}))))
                .unwrap();
        }
        store
            .upsert(ScanRecord::from_payload(&payload("scan-1", "c1", 7, vec![], json!({}))))
            .unwrap();

        let keys: Vec<_> = store
            .find_by_commit("c1")
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["scan-1", "scan-2", "scan-3"]);
    }

    #[test]
    fn test_malformed_fragment_is_dropped() {
        let mut scan = payload("scan-1", "c1", 7, vec![issue("a.go", "boom")], json!({}));
        scan.coverage = Some(json!("{not json"));
        scan.duplications = Some(json!({"unexpected": "object"}));

        let record = ScanRecord::from_payload(&scan);
        assert_eq!(record.coverage, None);
        assert_eq!(record.duplications, None);
        assert!(record.bugs.is_some());
        assert!(record.issues_statistics.is_some());
    }

    #[test]
    fn test_latest_by_application() {
        let store = MemoryScanStore::new();
        store
            .upsert(ScanRecord::from_payload(&payload("scan-1", "c1", 7, vec![], json!({}))))
            .unwrap();
        store
            .upsert(ScanRecord::from_payload(&payload("scan-2", "c2", 7, vec![], json!({}))))
            .unwrap();
        store
            .upsert(ScanRecord::from_payload(&payload("scan-3", "c3", 8, vec![], json!({}))))
            .unwrap();

        let latest = store.latest_by_application(7).unwrap().unwrap();
        assert_eq!(latest.key, "scan-2");
        assert!(store.latest_by_application(9).unwrap().is_none());

        // Re-ingesting an older scan makes it the most recent one.
        store
            .upsert(ScanRecord::from_payload(&payload("scan-1", "c1", 7, vec![], json!({}))))
            .unwrap();
        assert_eq!(store.latest_by_application(7).unwrap().unwrap().key, "scan-1");
    }

    #[test]
    fn test_filesystem_store_reloads_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scans.json");

        let store = FilesystemScanStore::open(&path).unwrap();
        store
            .upsert(ScanRecord::from_payload(&payload(
                "scan-1",
                "c1",
                7,
                vec![issue("a.go", "boom")],
                json!({"bugs": "1"}),
            )))
            .unwrap();
        store
            .upsert(ScanRecord::from_payload(&payload("scan-2", "c1", 7, vec![], json!({}))))
            .unwrap();
        drop(store);

        let reopened = FilesystemScanStore::open(&path).unwrap();
        let rows = reopened.find_by_commit("c1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "scan-1");

        // Keys are indexed again after a reload.
        let replaced = reopened
            .upsert(ScanRecord::from_payload(&payload("scan-1", "c1", 7, vec![], json!({}))))
            .unwrap();
        assert_eq!(replaced.id, rows[0].id);
        assert_eq!(reopened.find_by_commit("c1").unwrap().len(), 2);

        let added = reopened
            .upsert(ScanRecord::from_payload(&payload("scan-3", "c1", 7, vec![], json!({}))))
            .unwrap();
        assert_eq!(added.id, 3);
    }

    #[test]
    fn test_filesystem_store_rolls_back_failed_write() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir(&data_dir).unwrap();
        let store = FilesystemScanStore::open(data_dir.join("scans.json")).unwrap();
        let original = store
            .upsert(ScanRecord::from_payload(&payload("scan-1", "c1", 7, vec![], json!({"bugs": "1"}))))
            .unwrap();

        std::fs::remove_dir_all(&data_dir).unwrap();
        let replace = store.upsert(ScanRecord::from_payload(&payload(
            "scan-1",
            "c1",
            7,
            vec![],
            json!({"bugs": "9"}),
        )));
        assert!(matches!(replace, Err(StoreError::Io(_))));
        let insert = store.upsert(ScanRecord::from_payload(&payload("scan-2", "c1", 7, vec![], json!({}))));
        assert!(insert.is_err());

        assert_eq!(store.find_by_commit("c1").unwrap(), vec![original]);
    }

    #[test]
    fn test_filesystem_store_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scans.json");
        let store = std::sync::Arc::new(FilesystemScanStore::open(&path).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|writer| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for n in 0..10 {
                        let key = format!("scan-{writer}-{n}");
                        store
                            .upsert(ScanRecord::from_payload(&payload(&key, "c1", 7, vec![], json!({}))))
                            .unwrap();
                        assert!(!store.find_by_commit("c1").unwrap().is_empty());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        drop(store);

        let reopened = FilesystemScanStore::open(&path).unwrap();
        assert_eq!(reopened.find_by_commit("c1").unwrap().len(), 40);
    }

    #[test]
    fn test_filesystem_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scans.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            FilesystemScanStore::open(&path),
            Err(StoreError::Decode { .. })
        ));
    }
}
