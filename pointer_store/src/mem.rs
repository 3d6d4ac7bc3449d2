//! In-memory pointer store for testing.

use crate::interface::{PointerStore, Result};
use async_trait::async_trait;
use data_types::{Checkpoint, TableReference};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use warehouse::mock::MockWarehouse;

/// A staged-row merge observed by [`MemPointerStore::commit_with_merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedMerge {
    /// Worker whose pointer advanced.
    pub worker: String,
    /// Committed checkpoint.
    pub checkpoint: Checkpoint,
    /// Ephemeral staging table.
    pub staging: TableReference,
    /// Long-lived raw table.
    pub raw: TableReference,
}

#[derive(Debug, Default)]
struct MemPointerStoreState {
    pointers: BTreeMap<String, Checkpoint>,
    commits: Vec<(String, Checkpoint)>,
    merges: Vec<ObservedMerge>,
}

/// [`PointerStore`] backed by process memory.
///
/// When built with a [`MockWarehouse`] attached, `commit_with_merge`
/// actually moves the staged rows so whole-pipeline tests keep row-level
/// fidelity through the parallel path.
#[derive(Debug)]
pub struct MemPointerStore {
    table: TableReference,
    state: Mutex<MemPointerStoreState>,
    warehouse: Option<Arc<MockWarehouse>>,
}

impl MemPointerStore {
    /// Create an empty store.
    pub fn new(table: TableReference) -> Self {
        Self {
            table,
            state: Default::default(),
            warehouse: None,
        }
    }

    /// Create an empty store that moves staged rows through `warehouse` on
    /// `commit_with_merge`.
    pub fn with_warehouse(table: TableReference, warehouse: Arc<MockWarehouse>) -> Self {
        Self {
            table,
            state: Default::default(),
            warehouse: Some(warehouse),
        }
    }

    /// Pre-set a worker's pointer.
    pub fn set(&self, worker: impl Into<String>, checkpoint: Checkpoint) {
        self.state.lock().pointers.insert(worker.into(), checkpoint);
    }

    /// The worker's current pointer, if any.
    pub fn get(&self, worker: &str) -> Option<Checkpoint> {
        self.state.lock().pointers.get(worker).cloned()
    }

    /// Every commit in order, including those via `commit_with_merge`.
    pub fn commit_history(&self) -> Vec<(String, Checkpoint)> {
        self.state.lock().commits.clone()
    }

    /// Every staged-row merge in order.
    pub fn merges(&self) -> Vec<ObservedMerge> {
        self.state.lock().merges.clone()
    }
}

#[async_trait]
impl PointerStore for MemPointerStore {
    async fn ensure(&self) -> Result<()> {
        Ok(())
    }

    async fn read_all(&self) -> Result<BTreeMap<String, Checkpoint>> {
        Ok(self.state.lock().pointers.clone())
    }

    async fn commit(&self, worker: &str, checkpoint: &Checkpoint) -> Result<()> {
        let mut state = self.state.lock();
        state
            .pointers
            .insert(worker.to_string(), checkpoint.clone());
        state.commits.push((worker.to_string(), checkpoint.clone()));
        Ok(())
    }

    async fn commit_with_merge(
        &self,
        worker: &str,
        checkpoint: &Checkpoint,
        staging: &TableReference,
        raw: &TableReference,
    ) -> Result<()> {
        if let Some(warehouse) = &self.warehouse {
            warehouse.append_table(staging, raw);
        }

        let mut state = self.state.lock();
        state
            .pointers
            .insert(worker.to_string(), checkpoint.clone());
        state.commits.push((worker.to_string(), checkpoint.clone()));
        state.merges.push(ObservedMerge {
            worker: worker.to_string(),
            checkpoint: checkpoint.clone(),
            staging: staging.clone(),
            raw: raw.clone(),
        });
        Ok(())
    }

    fn table(&self) -> &TableReference {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warehouse::mock::MockRow;

    fn table() -> TableReference {
        TableReference::new("proj", "working", "traces_pointer_state")
    }

    #[tokio::test]
    async fn test_commit_replaces_single_row() {
        let store = MemPointerStore::new(table());
        assert!(store.read_all().await.unwrap().is_empty());

        store.commit("0", &Checkpoint::new(100, "a", 1)).await.unwrap();
        store.commit("0", &Checkpoint::new(100, "a", 2)).await.unwrap();

        let all = store.read_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["0"], Checkpoint::new(100, "a", 2));
        assert_eq!(store.commit_history().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_with_merge_moves_rows() {
        let warehouse = Arc::new(MockWarehouse::new());
        let staging = TableReference::new("proj", "working", "traces_0_x");
        let raw = TableReference::new("proj", "working", "traces_0");
        warehouse.set_table(&staging, vec![MockRow::new("a", 1)]);
        warehouse.set_table(&raw, vec![MockRow::new("b", 2)]);

        let store = MemPointerStore::with_warehouse(table(), Arc::clone(&warehouse));
        store
            .commit_with_merge("0", &Checkpoint::new(100, "a", 5), &staging, &raw)
            .await
            .unwrap();

        assert_eq!(warehouse.rows(&raw).len(), 2);
        assert_eq!(store.get("0").unwrap(), Checkpoint::new(100, "a", 5));
        assert_eq!(store.merges().len(), 1);
    }
}
