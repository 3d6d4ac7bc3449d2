//! In-process compute cluster.
//!
//! Performs the same per-file rewrites a distributed cluster would, on the
//! local tokio runtime. Serves single-node deployments and the test suite;
//! a Kubernetes-backed cluster binds the same traits elsewhere.

use crate::cluster::{ClusterError, ClusterProvider, ClusterSpec, ComputeCluster, RewriteTask};
use arrow::array::{ArrayRef, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use object_store::ObjectStore;
use observability_deps::tracing::debug;
use parquet::arrow::{ArrowReader, ArrowWriter, ParquetFileArrowReader};
use parquet::file::reader::FileReader;
use parquet::file::serialized_reader::SerializedFileReader;
use std::sync::Arc;

/// Row-group size of rewritten files; rewrites are per micro-batch file, so
/// batches stay small.
const BATCH_SIZE: usize = 8 * 1024;

/// [`ComputeCluster`] that executes rewrites in-process against the object
/// store.
#[derive(Debug)]
pub struct LocalCluster {
    source: Arc<dyn ObjectStore>,
    staging: Arc<dyn ObjectStore>,
}

impl LocalCluster {
    /// Create a cluster reading from `source` and writing to `staging`.
    pub fn new(source: Arc<dyn ObjectStore>, staging: Arc<dyn ObjectStore>) -> Self {
        Self { source, staging }
    }
}

#[async_trait]
impl ComputeCluster for LocalCluster {
    async fn rewrite(&self, task: RewriteTask) -> Result<(), ClusterError> {
        debug!(
            source = %task.source,
            destination = %task.destination,
            checkpoint = task.checkpoint,
            "rewriting source file",
        );

        let bytes = self
            .source
            .get(&task.source)
            .await
            .map_err(ClusterError::task)?
            .bytes()
            .await
            .map_err(ClusterError::task)?;

        let rewritten = rewrite_with_checkpoint(bytes, task.checkpoint)?;

        self.staging
            .put(&task.destination, rewritten)
            .await
            .map_err(ClusterError::task)?;

        Ok(())
    }

    async fn close(&self) {}

    fn type_name(&self) -> &'static str {
        "local"
    }
}

/// Copy a Parquet file, prepending a `_checkpoint` column that holds
/// `checkpoint` in every row.
fn rewrite_with_checkpoint(bytes: Bytes, checkpoint: i64) -> Result<Bytes, ClusterError> {
    let file_reader: Arc<dyn FileReader> =
        Arc::new(SerializedFileReader::new(bytes).map_err(ClusterError::task)?);
    let mut reader = ParquetFileArrowReader::new(file_reader);
    let source_schema = reader.get_schema().map_err(ClusterError::task)?;

    let mut fields = Vec::with_capacity(source_schema.fields().len() + 1);
    fields.push(Field::new("_checkpoint", DataType::Int64, false));
    fields.extend(source_schema.fields().iter().cloned());
    let schema = Arc::new(Schema::new(fields));

    let mut buffer = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buffer, Arc::clone(&schema), None).map_err(ClusterError::task)?;

    let record_reader = reader
        .get_record_reader(BATCH_SIZE)
        .map_err(ClusterError::task)?;
    for batch in record_reader {
        let batch = batch.map_err(ClusterError::task)?;

        let checkpoint_column: ArrayRef =
            Arc::new(Int64Array::from(vec![checkpoint; batch.num_rows()]));
        let mut columns = Vec::with_capacity(batch.num_columns() + 1);
        columns.push(checkpoint_column);
        columns.extend(batch.columns().iter().cloned());

        let batch =
            RecordBatch::try_new(Arc::clone(&schema), columns).map_err(ClusterError::task)?;
        writer.write(&batch).map_err(ClusterError::task)?;
    }
    writer.close().map_err(ClusterError::task)?;

    Ok(Bytes::from(buffer))
}

/// [`ClusterProvider`] handing out [`LocalCluster`]s.
#[derive(Debug)]
pub struct LocalClusterProvider {
    source: Arc<dyn ObjectStore>,
    staging: Arc<dyn ObjectStore>,
}

impl LocalClusterProvider {
    /// Create a provider over the given stores.
    pub fn new(source: Arc<dyn ObjectStore>, staging: Arc<dyn ObjectStore>) -> Self {
        Self { source, staging }
    }
}

#[async_trait]
impl ClusterProvider for LocalClusterProvider {
    async fn connect(&self, spec: &ClusterSpec) -> Result<Arc<dyn ComputeCluster>, ClusterError> {
        debug!(name = %spec.name, "connecting local cluster");
        Ok(Arc::new(LocalCluster::new(
            Arc::clone(&self.source),
            Arc::clone(&self.staging),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::StringArray;
    use object_store::{memory::InMemory, path::Path};

    fn sample_parquet() -> Bytes {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("value", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(StringArray::from(vec!["a", "b"])),
                Arc::new(Int64Array::from(vec![10, 20])),
            ],
        )
        .unwrap();

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        Bytes::from(buffer)
    }

    #[tokio::test]
    async fn test_rewrite_adds_leading_checkpoint_column() {
        let source: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let staging: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

        let source_path = Path::from("goldsky/src/100-x-0-7.parquet");
        source.put(&source_path, sample_parquet()).await.unwrap();

        let cluster = LocalCluster::new(Arc::clone(&source), Arc::clone(&staging));
        let destination = Path::from("preload/202301010000/0/table_7.parquet");
        cluster
            .rewrite(RewriteTask {
                source: source_path,
                destination: destination.clone(),
                checkpoint: 7,
            })
            .await
            .unwrap();

        let bytes = staging
            .get(&destination)
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let file_reader: Arc<dyn FileReader> = Arc::new(SerializedFileReader::new(bytes).unwrap());
        let mut reader = ParquetFileArrowReader::new(file_reader);

        let schema = reader.get_schema().unwrap();
        assert_eq!(schema.field(0).name(), "_checkpoint");
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).name(), "id");
        assert_eq!(schema.field(2).name(), "value");

        let batches: Vec<_> = reader
            .get_record_reader(1024)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(batches.len(), 1);
        let checkpoints = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(checkpoints.values(), &[7, 7]);
    }

    #[tokio::test]
    async fn test_rewrite_of_missing_source_fails() {
        let source: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let staging: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let cluster = LocalCluster::new(source, staging);

        let err = cluster
            .rewrite(RewriteTask {
                source: Path::from("nope.parquet"),
                destination: Path::from("out.parquet"),
                checkpoint: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Task { .. }));
    }
}
