//! Static configuration of one ingested source.

use data_types::TableReference;
use schema::WarehouseField;
use std::time::Duration;
use warehouse::{ClusterSpec, TimePartitioning};

/// Everything the engine needs to know about one source.
///
/// Assembling this struct (from files, environment, a control plane) is the
/// embedder's business; the engine treats it as immutable for the lifetime
/// of a run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Name of the ingested source, the second path segment of its objects.
    pub source_name: String,
    /// Bucket the upstream emitter writes into.
    pub source_bucket_name: String,
    /// First path segment of source objects within the bucket.
    pub source_goldsky_dir: String,

    /// Bucket for run-scoped staging files of the parallel loader.
    pub destination_bucket_name: String,
    /// Path prefix of staging files within the staging bucket.
    pub working_destination_preload_path: String,

    /// Cloud project all datasets live in.
    pub project_id: String,
    /// Dataset of the final merged table.
    pub destination_dataset_name: String,
    /// Dataset of raw/deduped/pointer working tables.
    pub working_destination_dataset_name: String,
    /// Name of the final merged table; worker table names derive from it.
    pub destination_table_name: String,

    /// Source files loaded per atomic pointer advance.
    pub pointer_size: usize,
    /// Per-worker dequeue budget per run.
    pub max_objects_to_load: usize,
    /// Timeout of one bulk load.
    pub load_table_timeout: Duration,
    /// Timeout of one transform invocation.
    pub transform_timeout: Duration,

    /// Transform model that dedupes one worker's raw table.
    pub dedupe_model: String,
    /// Transform model that merges all workers into the destination.
    pub merge_workers_model: String,
    /// Column identifying a row across the whole stream.
    pub dedupe_unique_column: String,
    /// Column whose greatest value wins among rows with equal unique column.
    pub dedupe_order_column: String,

    /// Partition column of produced tables, if any.
    pub partition_column_name: Option<String>,
    /// Partition granularity, e.g. `DAY`.
    pub partition_column_type: Option<String>,
    /// SQL expression applied to the partition column.
    pub partition_column_transform: Option<String>,

    /// Pre-built warehouse fields replacing inferred ones, matched by name.
    /// Schema inference only runs at all when this is non-empty.
    pub schema_overrides: Vec<WarehouseField>,

    /// Use the distributed compute cluster backend instead of direct loads.
    pub cluster_is_enabled: bool,
    /// Memory request of the cluster scheduler.
    pub cluster_scheduler_memory: String,
    /// Memory request of each cluster worker.
    pub cluster_worker_memory: String,
    /// Container image the cluster runs.
    pub cluster_image: String,

    /// Newest source files kept per worker by the retention job.
    pub retention_files: usize,
}

impl IngestConfig {
    /// Object prefix all source files live under.
    pub fn source_prefix(&self) -> String {
        format!("{}/{}", self.source_goldsky_dir, self.source_name)
    }

    /// URI of a source object, as the warehouse bulk load wants it.
    pub fn source_uri(&self, blob_name: &str) -> String {
        format!("gs://{}/{}", self.source_bucket_name, blob_name)
    }

    /// Path of one run-scoped staging object within the staging bucket.
    pub fn staging_path(&self, job_id: &str, worker: &str, filename: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.working_destination_preload_path, job_id, worker, filename
        )
    }

    /// Prefix of all staging objects of one worker and run.
    pub fn staging_prefix(&self, job_id: &str, worker: &str) -> String {
        format!(
            "{}/{}/{}",
            self.working_destination_preload_path, job_id, worker
        )
    }

    /// URI of one staging object.
    pub fn staging_uri(&self, job_id: &str, worker: &str, filename: &str) -> String {
        format!(
            "gs://{}/{}",
            self.destination_bucket_name,
            self.staging_path(job_id, worker, filename)
        )
    }

    /// Wildcard URI matching all staged files of one worker and run.
    pub fn staging_wildcard_uri(&self, job_id: &str, worker: &str) -> String {
        self.staging_uri(job_id, worker, "table_*.parquet")
    }

    /// The long-lived raw table of `worker`.
    pub fn raw_table(&self, worker: &str) -> TableReference {
        TableReference::new(
            &self.project_id,
            &self.working_destination_dataset_name,
            format!("{}_{}", self.destination_table_name, worker),
        )
    }

    /// The per-run deduped table of `worker`.
    pub fn deduped_table(&self, worker: &str) -> TableReference {
        TableReference::new(
            &self.project_id,
            &self.working_destination_dataset_name,
            format!("{}_deduped_{}", self.destination_table_name, worker),
        )
    }

    /// The ephemeral per-run load target of `worker`, merged into the raw
    /// table and dropped.
    pub fn ephemeral_table(&self, worker: &str, job_id: &str) -> TableReference {
        TableReference::new(
            &self.project_id,
            &self.working_destination_dataset_name,
            format!("{}_{}_{}", self.destination_table_name, worker, job_id),
        )
    }

    /// The final merged destination table.
    pub fn destination_table(&self) -> TableReference {
        TableReference::new(
            &self.project_id,
            &self.destination_dataset_name,
            &self.destination_table_name,
        )
    }

    /// The pointer table; a non-empty `suffix` (e.g. a backfill label)
    /// isolates progress from the primary pointer.
    pub fn pointer_table(&self, suffix: &str) -> TableReference {
        let suffix = if suffix.is_empty() || suffix.starts_with('_') {
            suffix.to_string()
        } else {
            format!("_{suffix}")
        };
        TableReference::new(
            &self.project_id,
            &self.working_destination_dataset_name,
            format!("{}_pointer_state{}", self.destination_table_name, suffix),
        )
    }

    /// Time partitioning of produced tables, when configured.
    pub fn time_partitioning(&self) -> Option<TimePartitioning> {
        let column = self.partition_column_name.clone()?;
        Some(TimePartitioning {
            column,
            partition_type: self
                .partition_column_type
                .clone()
                .unwrap_or_else(|| "DAY".to_string()),
        })
    }

    /// Sizing of the compute cluster for one run.
    pub fn cluster_spec(&self, job_id: &str) -> ClusterSpec {
        ClusterSpec {
            name: format!("{}-{}", self.source_name.replace('_', "-"), job_id),
            scheduler_memory: self.cluster_scheduler_memory.clone(),
            worker_memory: self.cluster_worker_memory.clone(),
            image: self.cluster_image.clone(),
        }
    }
}
