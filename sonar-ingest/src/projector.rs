use crate::metrics_defs::ROWS_SKIPPED;
use crate::store::{ScanRecord, ScanStore, StoreError};
use crate::types::{Category, Issue, IssueTree};
use serde::de::DeserializeOwned;
use shared::counter;
use std::sync::Arc;

/// Concatenates the issue lists or trees of every sub-scan of a commit.
pub struct IssueProjector {
    store: Arc<dyn ScanStore>,
}

impl IssueProjector {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        Self { store }
    }

    /// Bugs, code smells or vulnerabilities of a commit, in row order.
    pub fn project_flat(&self, category: Category, commit_id: &str) -> Result<Vec<Issue>, StoreError> {
        debug_assert!(!category.is_tree());
        let rows = self.store.find_by_commit(commit_id)?;
        Ok(concat_rows(&rows, category))
    }

    /// Coverage or duplication trees of a commit, in row order.
    pub fn project_tree(
        &self,
        category: Category,
        commit_id: &str,
    ) -> Result<Vec<IssueTree>, StoreError> {
        debug_assert!(category.is_tree());
        let rows = self.store.find_by_commit(commit_id)?;
        Ok(concat_rows(&rows, category))
    }
}

fn concat_rows<T: DeserializeOwned>(rows: &[ScanRecord], category: Category) -> Vec<T> {
    let mut out = Vec::new();

    for row in rows {
        let Some(raw) = row.fragment(category) else {
            continue;
        };
        match serde_json::from_str::<Vec<T>>(raw) {
            Ok(items) => out.extend(items),
            Err(e) => {
                tracing::warn!(key = %row.key, %category, error = %e, "skipping unreadable fragment");
                counter!(ROWS_SKIPPED).increment(1);
            }
        }
    }

    out
}
