//! Schema inference: read one representative source file's Parquet footer
//! and translate it into the warehouse schema.

use crate::error::{DownloadSampleSnafu, MapSchemaSnafu, NoSampleBlobSnafu, Result, SampleSchemaSnafu};
use data_types::Queues;
use object_store::path::Path;
use object_store::ObjectStore;
use observability_deps::tracing::{debug, info};
use parquet::arrow::parquet_to_arrow_schema;
use parquet::file::reader::FileReader;
use parquet::file::serialized_reader::SerializedFileReader;
use schema::WarehouseField;
use snafu::{OptionExt, ResultExt};

/// Infer the warehouse schema from one queued source file, applying
/// `overrides` by field name.
///
/// Any queued file works as a sample: the upstream schema is consistent
/// across a pipeline incarnation.
pub(crate) async fn infer_schema(
    store: &dyn ObjectStore,
    queues: &Queues,
    overrides: &[WarehouseField],
) -> Result<Vec<WarehouseField>> {
    let blob_name = queues
        .peek()
        .context(NoSampleBlobSnafu)?
        .blob_name
        .clone();
    info!(blob = %blob_name, "sampling source schema");

    let bytes = store
        .get(&Path::from(blob_name.as_str()))
        .await
        .context(DownloadSampleSnafu { blob: &blob_name })?
        .bytes()
        .await
        .context(DownloadSampleSnafu { blob: &blob_name })?;

    let reader = SerializedFileReader::new(bytes).context(SampleSchemaSnafu { blob: &blob_name })?;
    let file_metadata = reader.metadata().file_metadata();
    let arrow_schema = parquet_to_arrow_schema(
        file_metadata.schema_descr(),
        file_metadata.key_value_metadata(),
    )
    .context(SampleSchemaSnafu { blob: &blob_name })?;

    let fields = schema::warehouse_schema(&arrow_schema, overrides).context(MapSchemaSnafu)?;
    debug!(fields = fields.len(), "inferred warehouse schema");
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use data_types::{Checkpoint, QueueItem};
    use object_store::memory::InMemory;
    use parquet::arrow::ArrowWriter;
    use schema::{FieldMode, WarehouseType};
    use std::sync::Arc;

    fn schema_only_parquet(schema: ArrowSchema) -> Bytes {
        let mut buffer = Vec::new();
        let writer = ArrowWriter::try_new(&mut buffer, Arc::new(schema), None).unwrap();
        writer.close().unwrap();
        Bytes::from(buffer)
    }

    fn queues_with(blob_name: &str) -> Queues {
        let mut queues = Queues::new(10);
        queues.enqueue(
            "0",
            QueueItem::new(Checkpoint::new(100, "aaaa", 1), blob_name),
        );
        queues
    }

    #[tokio::test]
    async fn test_infers_and_overrides() {
        let store = InMemory::new();
        let blob_name = "dir/src/sample.parquet";
        store
            .put(
                &Path::from(blob_name),
                schema_only_parquet(ArrowSchema::new(vec![
                    Field::new("id", DataType::Utf8, false),
                    Field::new("amount", DataType::Decimal(38, 9), true),
                    Field::new("block_number", DataType::Int64, true),
                ])),
            )
            .await
            .unwrap();

        let overrides = vec![WarehouseField::new("amount", WarehouseType::Numeric)];
        let fields = infer_schema(&store, &queues_with(blob_name), &overrides)
            .await
            .unwrap();

        assert_eq!(
            fields,
            vec![
                WarehouseField::new("id", WarehouseType::String),
                WarehouseField::new("amount", WarehouseType::Numeric),
                WarehouseField::new("block_number", WarehouseType::Int64),
            ]
        );
        assert!(fields.iter().all(|f| f.mode == FieldMode::Nullable));
    }

    #[tokio::test]
    async fn test_empty_queues_have_no_sample() {
        let store = InMemory::new();
        let err = infer_schema(&store, &Queues::new(10), &[])
            .await
            .unwrap_err();
        assert_matches!(err, crate::error::Error::NoSampleBlob);
    }

    #[tokio::test]
    async fn test_missing_sample_object_fails() {
        let store = InMemory::new();
        let err = infer_schema(&store, &queues_with("dir/src/gone.parquet"), &[])
            .await
            .unwrap_err();
        assert_matches!(err, crate::error::Error::DownloadSample { .. });
    }
}
