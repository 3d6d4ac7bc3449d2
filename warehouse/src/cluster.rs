//! The optional distributed compute cluster used by the parallel loader.

use async_trait::async_trait;
use object_store::path::Path;
use std::fmt::Debug;
use std::sync::Arc;

/// Cluster interaction error.
///
/// The parallel loader treats every cluster error as a possible disconnect
/// and rebuilds the cluster within its retry budget, so there is no
/// transient/fatal split here.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The cluster went away or could not be reached.
    #[error("cluster disconnected: {message}")]
    Disconnected {
        /// Backend-provided detail.
        message: String,
    },

    /// A rewrite task itself failed on a cluster worker.
    #[error("rewrite task failed: {source}")]
    Task {
        /// Underlying task failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ClusterError {
    /// Wrap a task-side failure.
    pub fn task(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Task { source: e.into() }
    }
}

/// One per-file rewrite: read the source Parquet file and write a copy with
/// a leading `_checkpoint` column holding the batch counter of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteTask {
    /// Source object within the source bucket.
    pub source: Path,
    /// Destination object within the staging bucket.
    pub destination: Path,
    /// Value for the added `_checkpoint` column.
    pub checkpoint: i64,
}

/// Sizing of a cluster to be provisioned for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    /// Cluster name, unique per run.
    pub name: String,
    /// Memory request/limit of the scheduler.
    pub scheduler_memory: String,
    /// Memory request/limit of each worker.
    pub worker_memory: String,
    /// Container image the cluster runs.
    pub image: String,
}

/// A connected compute cluster.
///
/// Task submission is safe from concurrent callers; results are awaited per
/// submitted task.
#[async_trait]
pub trait ComputeCluster: Debug + Send + Sync + 'static {
    /// Execute one rewrite task remotely.
    async fn rewrite(&self, task: RewriteTask) -> Result<(), ClusterError>;

    /// Tear the cluster down. Infallible; a cluster that is already gone is
    /// torn down by definition.
    async fn close(&self);

    /// Return type (like `"local"` or `"kube"`) of this cluster.
    fn type_name(&self) -> &'static str;
}

/// Provisions clusters.
///
/// The parallel loader calls `connect` once per retry round, so a provider
/// must hand out a fresh, healthy cluster every time.
#[async_trait]
pub trait ClusterProvider: Debug + Send + Sync + 'static {
    /// Provision and connect a cluster sized per `spec`.
    async fn connect(&self, spec: &ClusterSpec) -> Result<Arc<dyn ComputeCluster>, ClusterError>;
}
