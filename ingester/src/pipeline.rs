//! The per-run orchestrator: discovery, loading, dedupe, merge, cleanup.

use crate::config::IngestConfig;
use crate::direct::DirectLoader;
use crate::discovery;
use crate::error::{
    ClusterConnectSnafu, Error, NoClusterProviderSnafu, PointerSnafu, Result, WarehouseSnafu,
};
use crate::parallel::{ClusterRetryConfig, ParallelLoader};
use crate::schema_inference;
use crate::worker::WorkerContext;
use backoff::BackoffConfig;
use chrono::Utc;
use data_types::{Checkpoint, CheckpointRange, Queues, SourceBlob};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use object_store::ObjectStore;
use observability_deps::tracing::{error, info, warn};
use pointer_store::PointerStore;
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use warehouse::{
    ClusterProvider, ComputeCluster, Transform, TransformParams, UpdateStrategy, Warehouse,
    WarehouseErrorKind,
};

/// One materialization of a source into its destination table.
///
/// The stages run strictly in order; any error stops the run before
/// dedupe/merge can observe partial loads. Already-committed pointer rows
/// and raw tables survive a failed run, so the next run resumes strictly
/// above the pointer.
#[derive(Debug)]
pub struct Pipeline {
    config: Arc<IngestConfig>,
    store: Arc<dyn ObjectStore>,
    staging_store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
    transform: Arc<dyn Transform>,
    pointer: Arc<dyn PointerStore>,
    cluster_provider: Option<Arc<dyn ClusterProvider>>,

    job_id: String,
    load_backoff: BackoffConfig,
    cluster_retry: ClusterRetryConfig,

    /// One listing per run is enough; cluster-rebuild retries re-filter the
    /// cached listing against the advanced pointer instead of re-listing.
    cached_blobs: tokio::sync::Mutex<Option<Arc<Vec<SourceBlob>>>>,
}

impl Pipeline {
    /// Create a pipeline for one run. The run id is the minute-precision
    /// UTC timestamp of construction.
    pub fn new(
        config: Arc<IngestConfig>,
        store: Arc<dyn ObjectStore>,
        staging_store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        transform: Arc<dyn Transform>,
        pointer: Arc<dyn PointerStore>,
    ) -> Self {
        Self {
            config,
            store,
            staging_store,
            warehouse,
            transform,
            pointer,
            cluster_provider: None,
            job_id: Utc::now().format("%Y%m%d%H%M").to_string(),
            load_backoff: BackoffConfig::default(),
            cluster_retry: ClusterRetryConfig::default(),
            cached_blobs: tokio::sync::Mutex::new(None),
        }
    }

    /// Fix the run id, e.g. for reproducible tests.
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    /// Attach the cluster provider backing the parallel loader.
    pub fn with_cluster_provider(mut self, provider: Arc<dyn ClusterProvider>) -> Self {
        self.cluster_provider = Some(provider);
        self
    }

    /// Replace the bulk-load retry policy.
    pub fn with_load_backoff(mut self, config: BackoffConfig) -> Self {
        self.load_backoff = config;
        self
    }

    /// Replace the cluster rebuild policy.
    pub fn with_cluster_retry(mut self, config: ClusterRetryConfig) -> Self {
        self.cluster_retry = config;
        self
    }

    /// The run id.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub(crate) fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub(crate) fn pointer(&self) -> &Arc<dyn PointerStore> {
        &self.pointer
    }

    /// Run the pipeline, optionally restricted to a checkpoint range (the
    /// backfill entry point passes one together with a label-suffixed
    /// pointer store).
    pub async fn run(&self, checkpoint_range: Option<&CheckpointRange>) -> Result<()> {
        info!(source = %self.config.source_name, job_id = %self.job_id, "starting ingest run");

        self.ensure_datasets().await?;
        self.pointer.ensure().await.context(PointerSnafu)?;

        let workers = self.load_worker_tables(checkpoint_range).await?;

        self.dedupe_worker_tables(&workers).await?;
        self.merge_worker_tables(&workers).await?;
        self.clean_working_tables(&workers).await?;

        info!(source = %self.config.source_name, "ingest run complete");
        Ok(())
    }

    async fn ensure_datasets(&self) -> Result<()> {
        for dataset in [
            &self.config.destination_dataset_name,
            &self.config.working_destination_dataset_name,
        ] {
            self.warehouse
                .ensure_dataset(dataset)
                .await
                .context(WarehouseSnafu)?;
        }
        Ok(())
    }

    /// List (or reuse the cached listing of) all parseable source objects.
    async fn cached_source_blobs(&self) -> Result<Arc<Vec<SourceBlob>>> {
        let mut cached = self.cached_blobs.lock().await;
        if let Some(blobs) = cached.as_ref() {
            info!("using cached source listing");
            return Ok(Arc::clone(blobs));
        }
        let blobs = Arc::new(discovery::list_source_blobs(&*self.store, &self.config).await?);
        *cached = Some(Arc::clone(&blobs));
        Ok(blobs)
    }

    /// Read the pointer and build the per-worker queues of remaining work.
    async fn load_queues_to_process(
        &self,
        checkpoint_range: Option<&CheckpointRange>,
    ) -> Result<(BTreeMap<String, Checkpoint>, Queues)> {
        let worker_status = self.pointer.read_all().await.context(PointerSnafu)?;
        let blobs = self.cached_source_blobs().await?;
        let queues = discovery::build_queues(
            &blobs,
            &worker_status,
            checkpoint_range,
            self.config.max_objects_to_load,
        );
        Ok((worker_status, queues))
    }

    async fn load_worker_tables(
        &self,
        checkpoint_range: Option<&CheckpointRange>,
    ) -> Result<Vec<WorkerContext>> {
        if self.config.cluster_is_enabled {
            self.parallel_load_worker_tables(checkpoint_range).await
        } else {
            self.direct_load_worker_tables(checkpoint_range).await
        }
    }

    /// Direct backend: one [`DirectLoader`] per non-empty worker queue.
    async fn direct_load_worker_tables(
        &self,
        checkpoint_range: Option<&CheckpointRange>,
    ) -> Result<Vec<WorkerContext>> {
        let (worker_status, queues) = self.load_queues_to_process(checkpoint_range).await?;

        let fields = if self.config.schema_overrides.is_empty() {
            None
        } else {
            Some(
                schema_inference::infer_schema(
                    &*self.store,
                    &queues,
                    &self.config.schema_overrides,
                )
                .await?,
            )
        };

        let mut loaders = Vec::new();
        for (worker_name, queue) in queues.into_worker_queues() {
            if queue.is_empty() {
                continue;
            }
            let ctx = WorkerContext::new(
                &worker_name,
                &self.job_id,
                worker_status.get(&worker_name).cloned(),
                Arc::clone(&self.config),
            );
            loaders.push(
                DirectLoader::new(
                    ctx,
                    queue,
                    Arc::clone(&self.warehouse),
                    Arc::clone(&self.pointer),
                    fields.clone(),
                    self.config.pointer_size,
                    self.config.load_table_timeout,
                )
                .with_load_backoff(self.load_backoff.clone()),
            );
        }

        await_workers(loaders.into_iter().map(|loader| loader.run())).await
    }

    /// Parallel backend: provision a cluster, drain all workers through it,
    /// and rebuild the cluster on failure within the retry window.
    async fn parallel_load_worker_tables(
        &self,
        checkpoint_range: Option<&CheckpointRange>,
    ) -> Result<Vec<WorkerContext>> {
        let provider = self
            .cluster_provider
            .as_ref()
            .context(NoClusterProviderSnafu)?;
        let spec = self.config.cluster_spec(&self.job_id);

        let mut last_restart = Instant::now();
        let mut retries = 0usize;
        loop {
            let attempt = async {
                let cluster = provider.connect(&spec).await.context(ClusterConnectSnafu)?;
                let result = self
                    .parallel_load_attempt(Arc::clone(&cluster), checkpoint_range)
                    .await;
                cluster.close().await;
                result
            };

            match attempt.await {
                Ok(workers) => return Ok(workers),
                Err(e) => {
                    // Rebuilding the cluster can only cure cluster-scoped
                    // failures. Warehouse loads and pointer commits carry
                    // their own retry discipline, so their errors propagate
                    // as-is.
                    if !matches!(e, Error::Rewrite { .. } | Error::ClusterConnect { .. }) {
                        return Err(e);
                    }

                    error!(error = %e, "parallel load attempt failed");
                    let now = Instant::now();
                    if now.duration_since(last_restart) > self.cluster_retry.window {
                        // a fresh window resets the budget, counting this
                        // failure as its first retry
                        last_restart = now;
                        retries = 1;
                        continue;
                    }
                    if retries >= self.cluster_retry.max_retries {
                        return Err(Error::ClusterRetriesExhausted {
                            source: Box::new(e),
                        });
                    }
                    warn!("compute cluster probably disconnected, rebuilding and retrying");
                    retries += 1;
                }
            }
        }
    }

    /// One attempt against a freshly connected cluster. Queues are rebuilt
    /// from the pointer, so batches committed by a previous attempt are not
    /// re-processed.
    async fn parallel_load_attempt(
        &self,
        cluster: Arc<dyn ComputeCluster>,
        checkpoint_range: Option<&CheckpointRange>,
    ) -> Result<Vec<WorkerContext>> {
        let (worker_status, queues) = self.load_queues_to_process(checkpoint_range).await?;

        let mut loaders = Vec::new();
        for (worker_name, queue) in queues.into_worker_queues() {
            if queue.is_empty() {
                continue;
            }
            let ctx = WorkerContext::new(
                &worker_name,
                &self.job_id,
                worker_status.get(&worker_name).cloned(),
                Arc::clone(&self.config),
            );
            loaders.push(ParallelLoader::new(
                ctx,
                queue,
                Arc::clone(&self.warehouse),
                Arc::clone(&self.pointer),
                Arc::clone(&cluster),
                Arc::clone(&self.staging_store),
                self.config.pointer_size,
                self.config.load_table_timeout,
            ));
        }

        await_workers(loaders.into_iter().map(|loader| loader.run())).await
    }

    /// Dedupe every worker's raw table into its deduped table,
    /// concurrently.
    async fn dedupe_worker_tables(&self, workers: &[WorkerContext]) -> Result<()> {
        let total = workers.len();
        let mut tasks: FuturesUnordered<_> = workers
            .iter()
            .map(|worker| {
                let transform = Arc::clone(&self.transform);
                let model = self.config.dedupe_model.clone();
                let destination = worker.deduped_table();
                let params = TransformParams {
                    time_partitioning: self.config.time_partitioning(),
                    unique_column: Some(self.config.dedupe_unique_column.clone()),
                    order_column: Some(self.config.dedupe_order_column.clone()),
                    partition_column_name: self.config.partition_column_name.clone(),
                    partition_column_transform: self.config.partition_column_transform.clone(),
                    raw_table: Some(worker.raw_table()),
                    timeout: self.config.transform_timeout,
                    ..Default::default()
                };
                let worker_name = worker.name.clone();
                async move {
                    info!(worker = %worker_name, "deduplicating the raw table");
                    transform
                        .transform(&model, &destination, params)
                        .await
                        .map_err(|source| Error::TransformModel {
                            model,
                            destination: destination.to_string(),
                            source,
                        })
                }
            })
            .collect();

        let mut first_error = None;
        let mut completed = 0usize;
        while let Some(result) = tasks.next().await {
            match result {
                Ok(()) => {
                    completed += 1;
                    info!(completed, total, "dedupe progress");
                }
                Err(e) => {
                    error!(error = %e, "dedupe failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Merge all workers' deduped tables into the destination.
    async fn merge_worker_tables(&self, workers: &[WorkerContext]) -> Result<()> {
        let destination = self.config.destination_table();
        info!(destination = %destination, "merging worker tables into the destination");

        let params = TransformParams {
            update_strategy: Some(UpdateStrategy::Merge),
            time_partitioning: self.config.time_partitioning(),
            unique_column: Some(self.config.dedupe_unique_column.clone()),
            order_column: Some(self.config.dedupe_order_column.clone()),
            partition_column_name: self.config.partition_column_name.clone(),
            partition_column_transform: self.config.partition_column_transform.clone(),
            workers: workers.iter().map(|w| w.deduped_table()).collect(),
            timeout: self.config.transform_timeout,
            ..Default::default()
        };

        self.transform
            .transform(&self.config.merge_workers_model, &destination, params)
            .await
            .map_err(|source| Error::TransformModel {
                model: self.config.merge_workers_model.clone(),
                destination: destination.to_string(),
                source,
            })
    }

    /// Drop the per-worker working tables of this run. A table that never
    /// came into existence (e.g. a worker whose dequeue budget was zero) is
    /// not an error.
    async fn clean_working_tables(&self, workers: &[WorkerContext]) -> Result<()> {
        for worker in workers {
            info!(worker = %worker.name, "deleting working tables");
            for table in [worker.raw_table(), worker.deduped_table()] {
                match self.warehouse.delete_table(&table).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == WarehouseErrorKind::NotFound => {}
                    Err(e) => return Err(e).context(WarehouseSnafu),
                }
            }
        }
        Ok(())
    }
}

/// Await all worker futures as they complete. In-flight workers always
/// quiesce before the first error is surfaced, so no worker is cancelled
/// mid-flush.
async fn await_workers(
    loaders: impl Iterator<Item = impl std::future::Future<Output = Result<WorkerContext>>>,
) -> Result<Vec<WorkerContext>> {
    let mut tasks: FuturesUnordered<_> = loaders.collect();
    let mut workers = Vec::new();
    let mut first_error = None;

    while let Some(result) = tasks.next().await {
        match result {
            Ok(ctx) => {
                info!(worker = %ctx.name, "worker completed data load");
                workers.push(ctx);
            }
            Err(e) => {
                error!(error = %e, "worker failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            // deterministic order for the downstream stages
            workers.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(workers)
        }
    }
}
