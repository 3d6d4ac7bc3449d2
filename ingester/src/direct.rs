//! Direct loader: drains a worker's queue straight into its raw table via
//! the warehouse's bulk-load-from-URIs capability.

use crate::error::{Error, Result};
use crate::worker::WorkerContext;
use backoff::{Backoff, BackoffConfig, RetryError};
use data_types::{Checkpoint, Queue, TableReference};
use observability_deps::tracing::{debug, info};
use pointer_store::PointerStore;
use schema::WarehouseField;
use snafu::ResultExt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use warehouse::{LoadMode, Warehouse, WarehouseErrorKind};

/// Loads a worker's queue in batches of `pointer_size` URIs, advancing the
/// pointer after each batch.
///
/// A batch is durable once its pointer commit returns; a crash between
/// batches loses only uncommitted work, which the next run re-discovers.
#[derive(Debug)]
pub struct DirectLoader {
    ctx: WorkerContext,
    queue: Queue,
    warehouse: Arc<dyn Warehouse>,
    pointer: Arc<dyn PointerStore>,
    fields: Option<Vec<WarehouseField>>,

    pointer_size: usize,
    load_timeout: Duration,
    load_backoff: BackoffConfig,
}

impl DirectLoader {
    /// Create a loader for one worker.
    pub fn new(
        ctx: WorkerContext,
        queue: Queue,
        warehouse: Arc<dyn Warehouse>,
        pointer: Arc<dyn PointerStore>,
        fields: Option<Vec<WarehouseField>>,
        pointer_size: usize,
        load_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            queue,
            warehouse,
            pointer,
            fields,
            pointer_size,
            load_timeout,
            load_backoff: BackoffConfig::default(),
        }
    }

    /// Replace the load retry policy, mainly to drop waits in tests.
    pub fn with_load_backoff(mut self, config: BackoffConfig) -> Self {
        self.load_backoff = config;
        self
    }

    /// Drain the queue. Returns the worker context for the later stages.
    pub async fn run(mut self) -> Result<WorkerContext> {
        let raw_table = self.ctx.raw_table();
        let mut to_load: Vec<String> = Vec::new();
        let mut latest_checkpoint: Option<Checkpoint> = None;

        while let Some(item) = self.queue.dequeue() {
            to_load.push(self.ctx.source_uri(&item.blob_name));
            let checkpoint = item.checkpoint;

            if to_load.len() >= self.pointer_size.max(1) {
                self.commit_batch(&to_load, &checkpoint, &raw_table).await?;
                to_load.clear();
            }
            latest_checkpoint = Some(checkpoint);
        }

        if !to_load.is_empty() {
            let checkpoint = latest_checkpoint
                .take()
                .expect("non-empty batch implies a dequeued checkpoint");
            self.commit_batch(&to_load, &checkpoint, &raw_table).await?;
        }

        debug!(worker = %self.ctx.name, "all data loaded");
        Ok(self.ctx)
    }

    /// Bulk-load one batch and advance the pointer to its checkpoint.
    async fn commit_batch(
        &self,
        uris: &[String],
        checkpoint: &Checkpoint,
        raw_table: &TableReference,
    ) -> Result<()> {
        if self.fields.is_some() {
            debug!(worker = %self.ctx.name, "loading with overridden schema");
        }

        let mut backoff = Backoff::new(&self.load_backoff);
        backoff
            .retry_with_backoff("bulk load", || {
                let load = self.warehouse.load_from_uris(
                    uris,
                    raw_table,
                    self.fields.as_deref(),
                    LoadMode::Append,
                    self.load_timeout,
                );
                async move {
                    match load.await {
                        Ok(()) => ControlFlow::Break(Ok(())),
                        Err(e) if e.kind() == WarehouseErrorKind::TransientServer => {
                            ControlFlow::Continue(e)
                        }
                        Err(e) => ControlFlow::Break(Err(e)),
                    }
                }
            })
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, source } => Error::LoadExhausted {
                    worker: self.ctx.name.clone(),
                    table: raw_table.to_string(),
                    attempts,
                    source,
                },
                RetryError::Fatal { source } => Error::Load {
                    worker: self.ctx.name.clone(),
                    table: raw_table.to_string(),
                    source,
                },
            })?;
        info!(worker = %self.ctx.name, files = uris.len(), "data loaded into the warehouse");

        self.pointer
            .commit(&self.ctx.name, checkpoint)
            .await
            .context(crate::error::PointerSnafu)?;
        info!(
            worker = %self.ctx.name,
            checkpoint = %checkpoint,
            "pointer advanced",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use assert_matches::assert_matches;
    use data_types::QueueItem;
    use pointer_store::MemPointerStore;
    use warehouse::mock::{MockRow, MockWarehouse};

    const JOB_ID: &str = "0e32cbc0-7b5e-4050-8bd8-38937f9e6559";

    fn config() -> Arc<IngestConfig> {
        Arc::new(IngestConfig {
            source_name: "src".to_string(),
            source_bucket_name: "bucket".to_string(),
            source_goldsky_dir: "dir".to_string(),
            destination_bucket_name: "staging".to_string(),
            working_destination_preload_path: "preload".to_string(),
            project_id: "proj".to_string(),
            destination_dataset_name: "prod".to_string(),
            working_destination_dataset_name: "working".to_string(),
            destination_table_name: "traces".to_string(),
            pointer_size: 2,
            max_objects_to_load: 100,
            load_table_timeout: Duration::from_secs(10),
            transform_timeout: Duration::from_secs(10),
            dedupe_model: "dedupe".to_string(),
            merge_workers_model: "merge_workers".to_string(),
            dedupe_unique_column: "id".to_string(),
            dedupe_order_column: "block_number".to_string(),
            partition_column_name: None,
            partition_column_type: None,
            partition_column_transform: None,
            schema_overrides: vec![],
            cluster_is_enabled: false,
            cluster_scheduler_memory: "2Gi".to_string(),
            cluster_worker_memory: "4Gi".to_string(),
            cluster_image: "img".to_string(),
            retention_files: 10,
        })
    }

    fn checkpoint(worker_checkpoint: i64) -> Checkpoint {
        Checkpoint::new(100, JOB_ID, worker_checkpoint)
    }

    fn queue_of(checkpoints: &[i64]) -> Queue {
        let mut queue = Queue::new(100);
        for &c in checkpoints {
            queue.enqueue(QueueItem::new(
                checkpoint(c),
                format!("dir/src/100-{JOB_ID}-0-{c}.parquet"),
            ));
        }
        queue
    }

    fn no_wait() -> BackoffConfig {
        BackoffConfig {
            retries: 5,
            min_wait: Duration::ZERO,
            jitter: false,
        }
    }

    async fn loader(
        checkpoints: &[i64],
        warehouse: Arc<MockWarehouse>,
        pointer: Arc<MemPointerStore>,
    ) -> DirectLoader {
        let config = config();
        warehouse.ensure_dataset("working").await.unwrap();
        let ctx = WorkerContext::new("0", "202301010000", None, Arc::clone(&config));
        DirectLoader::new(
            ctx,
            queue_of(checkpoints),
            warehouse,
            pointer,
            None,
            config.pointer_size,
            config.load_table_timeout,
        )
        .with_load_backoff(no_wait())
    }

    #[tokio::test]
    async fn test_batches_and_trailing_flush() {
        let warehouse = Arc::new(MockWarehouse::new());
        for c in 1..=3 {
            warehouse.seed_source_rows(
                format!("gs://bucket/dir/src/100-{JOB_ID}-0-{c}.parquet"),
                vec![MockRow::new(format!("row{c}"), c)],
            );
        }
        let pointer = Arc::new(MemPointerStore::new(config().pointer_table("")));

        let ctx = loader(&[1, 2, 3], Arc::clone(&warehouse), Arc::clone(&pointer))
            .await
            .run()
            .await
            .unwrap();
        assert_eq!(ctx.name, "0");

        // two loads: a full batch of two and the trailing single file
        let loads = warehouse.loads();
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].uris.len(), 2);
        assert_eq!(loads[0].mode, LoadMode::Append);
        assert_eq!(loads[1].uris.len(), 1);

        // pointer advanced once per batch, ending on the last checkpoint
        assert_eq!(
            pointer.commit_history(),
            vec![
                ("0".to_string(), checkpoint(2)),
                ("0".to_string(), checkpoint(3)),
            ]
        );
        assert_eq!(warehouse.rows(&config().raw_table("0")).len(), 3);
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_no_op() {
        let warehouse = Arc::new(MockWarehouse::new());
        let pointer = Arc::new(MemPointerStore::new(config().pointer_table("")));

        loader(&[], Arc::clone(&warehouse), Arc::clone(&pointer))
            .await
            .run()
            .await
            .unwrap();

        assert!(warehouse.loads().is_empty());
        assert!(pointer.commit_history().is_empty());
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.fail_next_load(WarehouseErrorKind::TransientServer, "backendError");
        let pointer = Arc::new(MemPointerStore::new(config().pointer_table("")));

        loader(&[1], Arc::clone(&warehouse), Arc::clone(&pointer))
            .await
            .run()
            .await
            .unwrap();

        assert_eq!(warehouse.loads().len(), 2);
        assert_eq!(pointer.get("0").unwrap(), checkpoint(1));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.fail_next_load(WarehouseErrorKind::Client, "permission denied");
        let pointer = Arc::new(MemPointerStore::new(config().pointer_table("")));

        let err = loader(&[1], Arc::clone(&warehouse), Arc::clone(&pointer))
            .await
            .run()
            .await
            .unwrap_err();

        assert_matches!(err, Error::Load { .. });
        assert_eq!(warehouse.loads().len(), 1);
        assert!(pointer.get("0").is_none());
    }

    #[tokio::test]
    async fn test_transient_exhaustion_surfaces_attempts() {
        let warehouse = Arc::new(MockWarehouse::new());
        for _ in 0..5 {
            warehouse.fail_next_load(WarehouseErrorKind::TransientServer, "rate limited");
        }
        let pointer = Arc::new(MemPointerStore::new(config().pointer_table("")));

        let err = loader(&[1], Arc::clone(&warehouse), Arc::clone(&pointer))
            .await
            .run()
            .await
            .unwrap_err();

        assert_matches!(err, Error::LoadExhausted { attempts: 5, .. });
        assert!(pointer.get("0").is_none());
    }

    #[tokio::test]
    async fn test_schema_fields_are_passed_through() {
        let warehouse = Arc::new(MockWarehouse::new());
        warehouse.ensure_dataset("working").await.unwrap();
        let pointer = Arc::new(MemPointerStore::new(config().pointer_table("")));
        let config = config();

        let fields = vec![WarehouseField::new("id", schema::WarehouseType::String)];
        let ctx = WorkerContext::new("0", "202301010000", None, Arc::clone(&config));
        DirectLoader::new(
            ctx,
            queue_of(&[1]),
            Arc::clone(&warehouse) as _,
            pointer,
            Some(fields.clone()),
            config.pointer_size,
            config.load_table_timeout,
        )
        .with_load_backoff(no_wait())
        .run()
        .await
        .unwrap();

        assert_eq!(warehouse.loads()[0].fields.as_deref(), Some(&fields[..]));
    }
}
