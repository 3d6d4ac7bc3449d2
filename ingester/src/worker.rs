//! Per-worker naming and table plumbing shared by both loader backends.

use crate::config::IngestConfig;
use data_types::{Checkpoint, TableReference};
use object_store::path::Path;
use std::sync::Arc;

/// One logical worker of one run: its name, the run id, and where its
/// tables and staging files live.
///
/// A context exclusively owns its queue and staging tables for the duration
/// of the run; the loaders wrap it with the backend-specific machinery.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Worker id as parsed from object names.
    pub name: String,
    /// Run id (minute-precision timestamp).
    pub job_id: String,
    /// Checkpoint the pointer held when the run started, if any.
    pub latest_checkpoint: Option<Checkpoint>,

    config: Arc<IngestConfig>,
}

impl WorkerContext {
    /// Create a context.
    pub fn new(
        name: impl Into<String>,
        job_id: impl Into<String>,
        latest_checkpoint: Option<Checkpoint>,
        config: Arc<IngestConfig>,
    ) -> Self {
        Self {
            name: name.into(),
            job_id: job_id.into(),
            latest_checkpoint,
            config,
        }
    }

    /// The worker's long-lived raw table.
    pub fn raw_table(&self) -> TableReference {
        self.config.raw_table(&self.name)
    }

    /// The worker's deduped table.
    pub fn deduped_table(&self) -> TableReference {
        self.config.deduped_table(&self.name)
    }

    /// The worker's ephemeral per-run load target.
    pub fn ephemeral_table(&self) -> TableReference {
        self.config.ephemeral_table(&self.name, &self.job_id)
    }

    /// URI of a source object.
    pub fn source_uri(&self, blob_name: &str) -> String {
        self.config.source_uri(blob_name)
    }

    /// Object-store path of one staged file of this worker and run.
    pub fn staging_path(&self, filename: &str) -> Path {
        Path::from(self.config.staging_path(&self.job_id, &self.name, filename))
    }

    /// Object-store prefix of all staged files of this worker and run.
    pub fn staging_prefix(&self) -> Path {
        Path::from(self.config.staging_prefix(&self.job_id, &self.name))
    }

    /// Wildcard URI matching all staged files of this worker and run.
    pub fn staging_wildcard_uri(&self) -> String {
        self.config.staging_wildcard_uri(&self.job_id, &self.name)
    }
}
