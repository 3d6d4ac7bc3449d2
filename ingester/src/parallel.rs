//! Parallel loader: offloads per-file rewrites to a compute cluster, then
//! bulk-loads the staged copies.
//!
//! Each queue item becomes a remote task that copies the source Parquet
//! file into a run-scoped staging prefix with a leading `_checkpoint`
//! column. Once `pointer_size` tasks are in flight the loader awaits them
//! all and advances the pointer in a two-phase commit: bulk-load the staged
//! wildcard into an ephemeral table, then transactionally append it to the
//! raw table together with the pointer update.

use crate::error::{CleanStagingSnafu, Error, PointerSnafu, Result, WarehouseSnafu};
use crate::worker::WorkerContext;
use data_types::{Checkpoint, Queue};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use object_store::path::Path;
use object_store::ObjectStore;
use observability_deps::tracing::{debug, info};
use pointer_store::PointerStore;
use snafu::ResultExt;
use std::sync::Arc;
use std::time::Duration;
use warehouse::{ComputeCluster, LoadMode, RewriteTask, Warehouse};

/// Rebuild discipline for the compute cluster.
///
/// A failed attempt inside the window consumes one retry; once the window
/// has passed, the budget resets with the next failure.
#[derive(Debug, Clone, Copy)]
pub struct ClusterRetryConfig {
    /// Length of one retry window.
    pub window: Duration,
    /// Cluster rebuilds allowed per window.
    pub max_retries: usize,
}

impl Default for ClusterRetryConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(600),
            max_retries: 3,
        }
    }
}

/// Loads a worker's queue through the compute cluster.
#[derive(Debug)]
pub struct ParallelLoader {
    ctx: WorkerContext,
    queue: Queue,
    warehouse: Arc<dyn Warehouse>,
    pointer: Arc<dyn PointerStore>,
    cluster: Arc<dyn ComputeCluster>,
    staging_store: Arc<dyn ObjectStore>,

    pointer_size: usize,
    load_timeout: Duration,
}

impl ParallelLoader {
    /// Create a loader for one worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: WorkerContext,
        queue: Queue,
        warehouse: Arc<dyn Warehouse>,
        pointer: Arc<dyn PointerStore>,
        cluster: Arc<dyn ComputeCluster>,
        staging_store: Arc<dyn ObjectStore>,
        pointer_size: usize,
        load_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            queue,
            warehouse,
            pointer,
            cluster,
            staging_store,
            pointer_size,
            load_timeout,
        }
    }

    /// Drain the queue. The run-scoped staging prefix is deleted whether or
    /// not processing succeeded, so no half-written files survive a failed
    /// run.
    pub async fn run(mut self) -> Result<WorkerContext> {
        let result = self.process_all_files().await;
        let cleaned = self.clean_staged_files().await;
        result?;
        cleaned?;
        Ok(self.ctx)
    }

    async fn process_all_files(&mut self) -> Result<()> {
        let mut in_flight = FuturesUnordered::new();
        let mut submitted = 0usize;
        let mut latest_checkpoint: Option<Checkpoint> = None;

        while let Some(item) = self.queue.dequeue() {
            let task = RewriteTask {
                source: Path::from(item.blob_name.as_str()),
                destination: self.ctx.staging_path(&format!(
                    "table_{}.parquet",
                    item.checkpoint.worker_checkpoint
                )),
                checkpoint: item.checkpoint.worker_checkpoint,
            };
            debug!(
                worker = %self.ctx.name,
                source = %task.source,
                destination = %task.destination,
                "submitting rewrite",
            );

            let cluster = Arc::clone(&self.cluster);
            in_flight.push(async move {
                let source = task.source.clone();
                (source, cluster.rewrite(task).await)
            });
            submitted += 1;

            if submitted >= self.pointer_size.max(1) {
                debug!(
                    worker = %self.ctx.name,
                    in_flight = submitted,
                    "waiting for in-flight rewrites",
                );
                self.drain_in_flight(&mut in_flight, submitted).await?;
                self.advance_pointer(&item.checkpoint).await?;
                submitted = 0;
            }

            latest_checkpoint = Some(item.checkpoint);
        }

        if !in_flight.is_empty() {
            let checkpoint = latest_checkpoint
                .take()
                .expect("in-flight rewrites imply a dequeued checkpoint");
            debug!(
                worker = %self.ctx.name,
                in_flight = submitted,
                checkpoint = %checkpoint,
                "finalizing trailing rewrites",
            );
            self.drain_in_flight(&mut in_flight, submitted).await?;
            self.advance_pointer(&checkpoint).await?;
        }

        Ok(())
    }

    /// Await every in-flight rewrite; all of them are driven to completion
    /// before the first failure (if any) is surfaced, so the staging prefix
    /// is quiescent afterwards.
    async fn drain_in_flight(
        &self,
        in_flight: &mut FuturesUnordered<
            impl std::future::Future<Output = (Path, std::result::Result<(), warehouse::ClusterError>)>,
        >,
        total: usize,
    ) -> Result<()> {
        let mut first_error = None;
        let mut progress = 0usize;

        while let Some((source, result)) = in_flight.next().await {
            progress += 1;
            match result {
                Ok(()) => debug!(worker = %self.ctx.name, progress, total, "rewrite finished"),
                Err(source_error) => {
                    if first_error.is_none() {
                        first_error = Some(Error::Rewrite {
                            worker: self.ctx.name.clone(),
                            source_object: source.to_string(),
                            source: source_error,
                        });
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Two-phase pointer advance over the staged files.
    async fn advance_pointer(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let raw_table = self.ctx.raw_table();
        let wildcard = vec![self.ctx.staging_wildcard_uri()];

        let raw_exists = self
            .warehouse
            .table_exists(&raw_table)
            .await
            .context(WarehouseSnafu)?;

        if raw_exists {
            info!(worker = %self.ctx.name, "merging staged files into the raw table");
            let ephemeral = self.ctx.ephemeral_table();
            self.warehouse
                .load_from_uris(
                    &wildcard,
                    &ephemeral,
                    None,
                    LoadMode::Overwrite,
                    self.load_timeout,
                )
                .await
                .map_err(|source| Error::Load {
                    worker: self.ctx.name.clone(),
                    table: ephemeral.to_string(),
                    source,
                })?;
            self.pointer
                .commit_with_merge(&self.ctx.name, checkpoint, &ephemeral, &raw_table)
                .await
                .context(PointerSnafu)?;
            self.warehouse
                .delete_table(&ephemeral)
                .await
                .context(WarehouseSnafu)?;
        } else {
            info!(worker = %self.ctx.name, "creating the raw table from staged files");
            self.warehouse
                .load_from_uris(
                    &wildcard,
                    &raw_table,
                    None,
                    LoadMode::Overwrite,
                    self.load_timeout,
                )
                .await
                .map_err(|source| Error::Load {
                    worker: self.ctx.name.clone(),
                    table: raw_table.to_string(),
                    source,
                })?;
            self.pointer
                .commit(&self.ctx.name, checkpoint)
                .await
                .context(PointerSnafu)?;
        }

        info!(worker = %self.ctx.name, checkpoint = %checkpoint, "pointer advanced");
        self.ctx.latest_checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    /// Delete every object under the run-scoped staging prefix.
    async fn clean_staged_files(&self) -> Result<()> {
        let prefix = self.ctx.staging_prefix();
        info!(worker = %self.ctx.name, prefix = %prefix, "deleting staged files");

        let mut object_stream =
            self.staging_store
                .list(Some(&prefix))
                .await
                .context(CleanStagingSnafu {
                    prefix: prefix.to_string(),
                })?;
        let mut locations = Vec::new();
        while let Some(meta) = object_stream.next().await {
            let meta = meta.context(CleanStagingSnafu {
                prefix: prefix.to_string(),
            })?;
            locations.push(meta.location);
        }
        drop(object_stream);

        for location in locations {
            self.staging_store
                .delete(&location)
                .await
                .context(CleanStagingSnafu {
                    prefix: prefix.to_string(),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
    use arrow::record_batch::RecordBatch;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use data_types::QueueItem;
    use object_store::memory::InMemory;
    use parquet::arrow::ArrowWriter;
    use pointer_store::MemPointerStore;
    use warehouse::local::LocalCluster;
    use warehouse::mock::{FailingCluster, MockWarehouse};

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
            cluster_is_enabled: true,
            cluster_scheduler_memory: "2Gi".to_string(),
            cluster_worker_memory: "4Gi".to_string(),
            cluster_image: "img".to_string(),
            retention_files: 10,
        })
    }

    fn checkpoint(worker_checkpoint: i64) -> Checkpoint {
        Checkpoint::new(100, JOB_ID, worker_checkpoint)
    }

    fn blob_name(worker_checkpoint: i64) -> String {
        format!("dir/src/100-{JOB_ID}-0-{worker_checkpoint}.parquet")
    }

    fn sample_parquet(id: &str) -> Bytes {
        let schema = Arc::new(ArrowSchema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("block_number", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(StringArray::from(vec![id])),
                Arc::new(Int64Array::from(vec![1])),
            ],
        )
        .unwrap();

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        Bytes::from(buffer)
    }

    struct Fixture {
        source: Arc<InMemory>,
        staging: Arc<InMemory>,
        warehouse: Arc<MockWarehouse>,
        pointer: Arc<MemPointerStore>,
        config: Arc<IngestConfig>,
    }

    impl Fixture {
        async fn new() -> Self {
            let config = config();
            let warehouse = Arc::new(MockWarehouse::new());
            warehouse.ensure_dataset("working").await.unwrap();
            Self {
                source: Arc::new(InMemory::new()),
                staging: Arc::new(InMemory::new()),
                pointer: Arc::new(MemPointerStore::with_warehouse(
                    config.pointer_table(""),
                    Arc::clone(&warehouse),
                )),
                warehouse,
                config,
            }
        }

        async fn seed_blobs(&self, checkpoints: &[i64]) -> Queue {
            let mut queue = Queue::new(100);
            for &c in checkpoints {
                let name = blob_name(c);
                self.source
                    .put(&Path::from(name.as_str()), sample_parquet(&format!("row{c}")))
                    .await
                    .unwrap();
                queue.enqueue(QueueItem::new(checkpoint(c), name));
            }
            queue
        }

        fn loader(&self, queue: Queue, cluster: Arc<dyn ComputeCluster>) -> ParallelLoader {
            let ctx = WorkerContext::new("0", "202301010000", None, Arc::clone(&self.config));
            ParallelLoader::new(
                ctx,
                queue,
                Arc::clone(&self.warehouse) as _,
                Arc::clone(&self.pointer) as _,
                cluster,
                Arc::clone(&self.staging) as _,
                self.config.pointer_size,
                self.config.load_table_timeout,
            )
        }

        fn local_cluster(&self) -> Arc<dyn ComputeCluster> {
            Arc::new(LocalCluster::new(
                Arc::clone(&self.source) as _,
                Arc::clone(&self.staging) as _,
            ))
        }

        async fn staged_files(&self) -> usize {
            let mut stream = self.staging.list(None).await.unwrap();
            let mut n = 0;
            while let Some(meta) = stream.next().await {
                meta.unwrap();
                n += 1;
            }
            n
        }
    }

    #[tokio::test]
    async fn test_two_phase_commits_and_cleanup() {
        let fixture = Fixture::new().await;
        let queue = fixture.seed_blobs(&[1, 2, 3]).await;

        let ctx = fixture
            .loader(queue, fixture.local_cluster())
            .run()
            .await
            .unwrap();
        assert_eq!(ctx.latest_checkpoint, Some(checkpoint(3)));

        // first batch created the raw table from the staged wildcard,
        // the trailing batch went through the ephemeral table
        let loads = fixture.warehouse.loads();
        assert_eq!(loads.len(), 2);
        assert_eq!(
            loads[0].uris,
            vec!["gs://staging/preload/202301010000/0/table_*.parquet".to_string()]
        );
        assert_eq!(loads[0].table, "proj.working.traces_0");
        assert_eq!(loads[0].mode, LoadMode::Overwrite);
        assert_eq!(loads[1].table, "proj.working.traces_0_202301010000");

        assert_eq!(
            fixture.pointer.commit_history(),
            vec![
                ("0".to_string(), checkpoint(2)),
                ("0".to_string(), checkpoint(3)),
            ]
        );
        assert_eq!(fixture.pointer.merges().len(), 1);

        // the ephemeral table was dropped again
        assert!(!fixture
            .warehouse
            .table_names()
            .contains(&"proj.working.traces_0_202301010000".to_string()));

        // staged files are gone
        assert_eq!(fixture.staged_files().await, 0);
    }

    #[tokio::test]
    async fn test_failed_rewrite_fails_worker_but_cleans_staging() {
        let fixture = Fixture::new().await;
        let queue = fixture.seed_blobs(&[1, 2]).await;

        let err = fixture
            .loader(queue, Arc::new(FailingCluster))
            .run()
            .await
            .unwrap_err();
        assert_matches!(err, Error::Rewrite { .. });

        assert!(fixture.pointer.commit_history().is_empty());
        assert_eq!(fixture.staged_files().await, 0);
    }
}
