//! Mocked external collaborators for testing.
//!
//! [`MockWarehouse`] keeps datasets and table contents in memory and records
//! every SQL script and bulk load it is asked to run. Row contents are
//! reduced to the two columns the engine's semantics actually revolve
//! around: the unique column and the order column. Bulk loads resolve rows
//! from a seeded URI → rows mapping, so tests wire "object x holds rows y"
//! without real Parquet in the way.
//!
//! [`MockTransform`] implements the documented semantics of the dedupe and
//! merge models over [`MockWarehouse`] tables, which lets whole-pipeline
//! tests assert destination contents and idempotence.

use crate::cluster::{ClusterError, ClusterProvider, ClusterSpec, ComputeCluster, RewriteTask};
use crate::core::{
    LoadMode, PointerRow, Transform, TransformParams, UpdateStrategy, Warehouse, WarehouseError,
    WarehouseErrorKind,
};
use async_trait::async_trait;
use data_types::TableReference;
use parking_lot::Mutex;
use schema::WarehouseField;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// One row of a mocked table, reduced to the columns the engine keys on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRow {
    /// Value of the configured unique column.
    pub unique_key: String,
    /// Value of the configured order column.
    pub order_key: i64,
}

impl MockRow {
    /// Create a row.
    pub fn new(unique_key: impl Into<String>, order_key: i64) -> Self {
        Self {
            unique_key: unique_key.into(),
            order_key,
        }
    }
}

/// A recorded bulk load.
#[derive(Debug, Clone)]
pub struct MockLoad {
    /// URIs as passed in, wildcards unexpanded.
    pub uris: Vec<String>,
    /// Destination table FQN.
    pub table: String,
    /// Explicit schema, if any.
    pub fields: Option<Vec<WarehouseField>>,
    /// Append or overwrite.
    pub mode: LoadMode,
}

#[derive(Debug, Default)]
struct MockWarehouseState {
    datasets: BTreeSet<String>,
    tables: BTreeMap<String, Vec<MockRow>>,
    source_rows: BTreeMap<String, Vec<MockRow>>,
    pointer_rows: BTreeMap<String, Vec<PointerRow>>,
    queries: Vec<String>,
    loads: Vec<MockLoad>,
    load_outcomes: VecDeque<Result<(), (WarehouseErrorKind, String)>>,
}

/// In-memory [`Warehouse`] implementation.
#[derive(Debug, Default)]
pub struct MockWarehouse {
    state: Mutex<MockWarehouseState>,
}

impl MockWarehouse {
    /// Create an empty warehouse.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that the object at `uri` holds `rows`.
    pub fn seed_source_rows(&self, uri: impl Into<String>, rows: Vec<MockRow>) {
        self.state.lock().source_rows.insert(uri.into(), rows);
    }

    /// Seed the contents of a pointer table for `query_pointer_rows`.
    pub fn seed_pointer_rows(&self, table: &TableReference, rows: Vec<PointerRow>) {
        self.state
            .lock()
            .pointer_rows
            .insert(table.to_string(), rows);
    }

    /// Current rows of `table`; empty when the table does not exist.
    pub fn rows(&self, table: &TableReference) -> Vec<MockRow> {
        self.state
            .lock()
            .tables
            .get(&table.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the contents of `table`.
    pub fn set_table(&self, table: &TableReference, rows: Vec<MockRow>) {
        self.state.lock().tables.insert(table.to_string(), rows);
    }

    /// Append all rows of `from` to `to` (the staging-merge building block
    /// used by the in-memory pointer store).
    pub fn append_table(&self, from: &TableReference, to: &TableReference) {
        let mut state = self.state.lock();
        let rows = state
            .tables
            .get(&from.to_string())
            .cloned()
            .unwrap_or_default();
        state.tables.entry(to.to_string()).or_default().extend(rows);
    }

    /// Names of all existing tables.
    pub fn table_names(&self) -> Vec<String> {
        self.state.lock().tables.keys().cloned().collect()
    }

    /// Names of all existing datasets.
    pub fn dataset_names(&self) -> Vec<String> {
        self.state.lock().datasets.iter().cloned().collect()
    }

    /// All SQL scripts run so far.
    pub fn queries(&self) -> Vec<String> {
        self.state.lock().queries.clone()
    }

    /// All bulk loads run so far.
    pub fn loads(&self) -> Vec<MockLoad> {
        self.state.lock().loads.clone()
    }

    /// Let the next (otherwise unscripted) bulk load succeed.
    pub fn succeed_next_load(&self) {
        self.state.lock().load_outcomes.push_back(Ok(()));
    }

    /// Make the next bulk load fail with the given kind.
    pub fn fail_next_load(&self, kind: WarehouseErrorKind, message: impl Into<String>) {
        self.state
            .lock()
            .load_outcomes
            .push_back(Err((kind, message.into())));
    }

    fn resolve_uri(state: &MockWarehouseState, uri: &str) -> Vec<MockRow> {
        match uri.split_once('*') {
            // wildcard loads match on the prefix, like the real service
            Some((prefix, _)) => state
                .source_rows
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .flat_map(|(_, rows)| rows.clone())
                .collect(),
            None => state.source_rows.get(uri).cloned().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Warehouse for MockWarehouse {
    async fn ensure_dataset(&self, dataset: &str) -> Result<(), WarehouseError> {
        self.state.lock().datasets.insert(dataset.to_string());
        Ok(())
    }

    async fn table_exists(&self, table: &TableReference) -> Result<bool, WarehouseError> {
        Ok(self.state.lock().tables.contains_key(&table.to_string()))
    }

    async fn load_from_uris(
        &self,
        uris: &[String],
        table: &TableReference,
        fields: Option<&[WarehouseField]>,
        mode: LoadMode,
        _timeout: Duration,
    ) -> Result<(), WarehouseError> {
        let mut state = self.state.lock();

        state.loads.push(MockLoad {
            uris: uris.to_vec(),
            table: table.to_string(),
            fields: fields.map(|f| f.to_vec()),
            mode,
        });

        if let Some(Err((kind, message))) = state.load_outcomes.pop_front() {
            return Err(WarehouseError::new(kind, message));
        }

        if !state.datasets.contains(&table.dataset) {
            return Err(WarehouseError::not_found(format!(
                "dataset {} does not exist",
                table.dataset
            )));
        }

        let mut rows = Vec::new();
        for uri in uris {
            rows.extend(Self::resolve_uri(&state, uri));
        }

        let key = table.to_string();
        match mode {
            LoadMode::Append => state.tables.entry(key).or_default().extend(rows),
            LoadMode::Overwrite => {
                state.tables.insert(key, rows);
            }
        }
        Ok(())
    }

    async fn query_and_wait(&self, sql: &str, _timeout: Duration) -> Result<(), WarehouseError> {
        self.state.lock().queries.push(sql.to_string());
        Ok(())
    }

    async fn query_pointer_rows(
        &self,
        table: &TableReference,
        _timeout: Duration,
    ) -> Result<Vec<PointerRow>, WarehouseError> {
        self.state
            .lock()
            .pointer_rows
            .get(&table.to_string())
            .cloned()
            .ok_or_else(|| WarehouseError::not_found(format!("table {table} does not exist")))
    }

    async fn delete_table(&self, table: &TableReference) -> Result<(), WarehouseError> {
        match self.state.lock().tables.remove(&table.to_string()) {
            Some(_) => Ok(()),
            None => Err(WarehouseError::not_found(format!(
                "table {table} does not exist"
            ))),
        }
    }

    fn type_name(&self) -> &'static str {
        "mock"
    }
}

/// A recorded transform invocation.
#[derive(Debug, Clone)]
pub struct TransformCall {
    /// Model name.
    pub model: String,
    /// Destination table FQN.
    pub destination: String,
    /// Parameters as passed.
    pub params: TransformParams,
}

/// [`Transform`] implementation with the documented model semantics.
///
/// A call with `raw_table` set behaves as the dedupe model: one surviving
/// row per unique key, the row with the greatest order value winning. A
/// call with `workers` set behaves as the merge model: the union of the
/// worker tables is merged into the destination keyed on the unique column.
#[derive(Debug)]
pub struct MockTransform {
    warehouse: Arc<MockWarehouse>,
    calls: Mutex<Vec<TransformCall>>,
}

impl MockTransform {
    /// Create a transform layer operating on `warehouse`.
    pub fn new(warehouse: Arc<MockWarehouse>) -> Self {
        Self {
            warehouse,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// All transform invocations so far.
    pub fn calls(&self) -> Vec<TransformCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Transform for MockTransform {
    async fn transform(
        &self,
        model: &str,
        destination: &TableReference,
        params: TransformParams,
    ) -> Result<(), WarehouseError> {
        if let Some(raw_table) = &params.raw_table {
            let deduped = dedupe_rows(self.warehouse.rows(raw_table));
            self.warehouse.set_table(destination, deduped);
        } else if params.update_strategy == Some(UpdateStrategy::Merge) {
            let mut rows = self.warehouse.rows(destination);
            for worker_table in &params.workers {
                rows.extend(self.warehouse.rows(worker_table));
            }
            self.warehouse.set_table(destination, dedupe_rows(rows));
        }

        self.calls.lock().push(TransformCall {
            model: model.to_string(),
            destination: destination.to_string(),
            params,
        });
        Ok(())
    }
}

/// One row per unique key; the greatest order value survives.
fn dedupe_rows(rows: Vec<MockRow>) -> Vec<MockRow> {
    let mut best: BTreeMap<String, i64> = BTreeMap::new();
    for row in rows {
        let entry = best.entry(row.unique_key).or_insert(row.order_key);
        if row.order_key > *entry {
            *entry = row.order_key;
        }
    }
    best.into_iter()
        .map(|(unique_key, order_key)| MockRow {
            unique_key,
            order_key,
        })
        .collect()
}

/// [`ComputeCluster`] whose tasks always fail; used to exercise the
/// cluster-rebuild retry discipline.
#[derive(Debug, Default)]
pub struct FailingCluster;

#[async_trait]
impl ComputeCluster for FailingCluster {
    async fn rewrite(&self, _task: RewriteTask) -> Result<(), ClusterError> {
        Err(ClusterError::Disconnected {
            message: "worker pod evicted".to_string(),
        })
    }

    async fn close(&self) {}

    fn type_name(&self) -> &'static str {
        "failing"
    }
}

/// [`ClusterProvider`] handing out a scripted sequence of clusters; the last
/// entry repeats once the script is used up.
#[derive(Debug)]
pub struct SequenceClusterProvider {
    clusters: Mutex<VecDeque<Arc<dyn ComputeCluster>>>,
}

impl SequenceClusterProvider {
    /// Create a provider from at least one cluster.
    pub fn new(clusters: Vec<Arc<dyn ComputeCluster>>) -> Self {
        assert!(!clusters.is_empty(), "need at least one cluster");
        Self {
            clusters: Mutex::new(clusters.into()),
        }
    }
}

#[async_trait]
impl ClusterProvider for SequenceClusterProvider {
    async fn connect(&self, _spec: &ClusterSpec) -> Result<Arc<dyn ComputeCluster>, ClusterError> {
        let mut clusters = self.clusters.lock();
        if clusters.len() > 1 {
            Ok(clusters.pop_front().expect("checked non-empty"))
        } else {
            Ok(Arc::clone(clusters.front().expect("checked non-empty")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn table(name: &str) -> TableReference {
        TableReference::new("proj", "working", name)
    }

    async fn warehouse_with_dataset() -> MockWarehouse {
        let warehouse = MockWarehouse::new();
        warehouse.ensure_dataset("working").await.unwrap();
        warehouse
    }

    #[tokio::test]
    async fn test_load_append_and_overwrite() {
        let warehouse = warehouse_with_dataset().await;
        warehouse.seed_source_rows("gs://b/one", vec![MockRow::new("a", 1)]);
        warehouse.seed_source_rows("gs://b/two", vec![MockRow::new("b", 2)]);

        let raw = table("traces_0");
        warehouse
            .load_from_uris(
                &["gs://b/one".to_string(), "gs://b/two".to_string()],
                &raw,
                None,
                LoadMode::Append,
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(warehouse.rows(&raw).len(), 2);

        warehouse
            .load_from_uris(
                &["gs://b/one".to_string()],
                &raw,
                None,
                LoadMode::Overwrite,
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(warehouse.rows(&raw), vec![MockRow::new("a", 1)]);
        assert_eq!(warehouse.loads().len(), 2);
    }

    #[tokio::test]
    async fn test_load_resolves_wildcards() {
        let warehouse = warehouse_with_dataset().await;
        warehouse.seed_source_rows("gs://b/pre/table_1.parquet", vec![MockRow::new("a", 1)]);
        warehouse.seed_source_rows("gs://b/pre/table_2.parquet", vec![MockRow::new("b", 2)]);
        warehouse.seed_source_rows("gs://b/other/table_9.parquet", vec![MockRow::new("z", 9)]);

        let raw = table("traces_0");
        warehouse
            .load_from_uris(
                &["gs://b/pre/table_*.parquet".to_string()],
                &raw,
                None,
                LoadMode::Overwrite,
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(warehouse.rows(&raw).len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_load_failures() {
        let warehouse = warehouse_with_dataset().await;
        warehouse.succeed_next_load();
        warehouse.fail_next_load(WarehouseErrorKind::TransientServer, "rate limited");

        let raw = table("traces_0");
        warehouse
            .load_from_uris(&[], &raw, None, LoadMode::Append, Duration::from_secs(1))
            .await
            .unwrap();
        let err = warehouse
            .load_from_uris(&[], &raw, None, LoadMode::Append, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), WarehouseErrorKind::TransientServer);
    }

    #[tokio::test]
    async fn test_missing_pointer_table_is_not_found() {
        let warehouse = MockWarehouse::new();
        let err = warehouse
            .query_pointer_rows(&table("pointer_state"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), WarehouseErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_dedupe_model_keeps_greatest_order_value() {
        let warehouse = Arc::new(warehouse_with_dataset().await);
        let raw = table("traces_0");
        warehouse.set_table(
            &raw,
            vec![
                MockRow::new("x", 1),
                MockRow::new("x", 5),
                MockRow::new("x", 3),
                MockRow::new("y", 2),
            ],
        );

        let transform = MockTransform::new(Arc::clone(&warehouse));
        let deduped = table("traces_deduped_0");
        transform
            .transform(
                "dedupe",
                &deduped,
                TransformParams {
                    raw_table: Some(raw),
                    unique_column: Some("id".to_string()),
                    order_column: Some("block_number".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(
            warehouse.rows(&deduped),
            vec![MockRow::new("x", 5), MockRow::new("y", 2)]
        );
        assert_matches!(transform.calls().as_slice(), [call] => {
            assert_eq!(call.model, "dedupe");
        });
    }

    #[tokio::test]
    async fn test_merge_model_is_idempotent() {
        let warehouse = Arc::new(warehouse_with_dataset().await);
        let destination = TableReference::new("proj", "prod", "traces");
        let w0 = table("traces_deduped_0");
        let w1 = table("traces_deduped_1");
        warehouse.set_table(&w0, vec![MockRow::new("x", 1), MockRow::new("y", 2)]);
        warehouse.set_table(&w1, vec![MockRow::new("x", 7)]);

        let transform = MockTransform::new(Arc::clone(&warehouse));
        let params = TransformParams {
            update_strategy: Some(UpdateStrategy::Merge),
            workers: vec![w0, w1],
            unique_column: Some("id".to_string()),
            order_column: Some("block_number".to_string()),
            ..Default::default()
        };

        transform
            .transform("merge", &destination, params.clone())
            .await
            .unwrap();
        let first = warehouse.rows(&destination);
        assert_eq!(first, vec![MockRow::new("x", 7), MockRow::new("y", 2)]);

        // merging the same inputs again changes nothing
        transform
            .transform("merge", &destination, params)
            .await
            .unwrap();
        assert_eq!(warehouse.rows(&destination), first);
    }
}
