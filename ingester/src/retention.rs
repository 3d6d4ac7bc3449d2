//! Retention: garbage-collect source objects that every worker has long
//! since ingested.
//!
//! A separate, non-ingesting job. It never touches warehouse state: the
//! deletion horizon is the minimum committed checkpoint across all workers,
//! so only objects that are durably represented in the warehouse are
//! eligible.

use crate::discovery;
use crate::error::{DeleteSourceSnafu, PointerSnafu, Result};
use crate::pipeline::Pipeline;
use data_types::CheckpointRange;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use object_store::path::Path;
use object_store::ObjectStore;
use observability_deps::tracing::info;
use pointer_store::PointerStore;
use snafu::ResultExt;
use std::collections::BTreeMap;

/// Objects examined per retention run.
const MAX_OBJECTS_TO_SCAN: usize = 100_000;

/// Source objects deleted per batch.
const DELETE_BATCH_SIZE: usize = 1000;

impl Pipeline {
    /// Delete ingested source objects, keeping the most recent
    /// `retention_files` per worker.
    pub async fn clean_up(&self) -> Result<()> {
        let worker_status = self.pointer().read_all().await.context(PointerSnafu)?;
        let horizon = match worker_status.values().min().cloned() {
            Some(horizon) => horizon,
            None => {
                info!("no pointer rows, nothing to clean");
                return Ok(());
            }
        };
        info!(horizon = %horizon, "cleaning source objects below the fleet-wide checkpoint");

        // fresh listing on purpose: a cached one could hide objects another
        // run ingested since
        let blobs = discovery::list_source_blobs(self.store(), self.config()).await?;
        let queues = discovery::build_queues(
            &blobs,
            &BTreeMap::new(),
            Some(&CheckpointRange::bounded_above(horizon)),
            MAX_OBJECTS_TO_SCAN,
        );

        for (worker, mut queue) in queues.into_worker_queues() {
            let deletable = queue.len().saturating_sub(self.config().retention_files);
            if deletable == 0 {
                info!(worker = %worker, "nothing to clean");
                continue;
            }
            info!(worker = %worker, files = deletable, "cleaning files");

            let mut blob_names = Vec::with_capacity(deletable);
            for _ in 0..deletable {
                match queue.dequeue() {
                    Some(item) => blob_names.push(item.blob_name),
                    None => break,
                }
            }
            if let Some(last) = blob_names.last() {
                info!(worker = %worker, up_to = %last, "deleting objects");
            }

            batch_delete(self.store(), &blob_names, DELETE_BATCH_SIZE).await?;
        }
        Ok(())
    }
}

/// Delete `blob_names` in batches of `batch_size` concurrent calls.
async fn batch_delete(
    store: &dyn ObjectStore,
    blob_names: &[String],
    batch_size: usize,
) -> Result<()> {
    for chunk in blob_names.chunks(batch_size.max(1)) {
        let mut deletes: FuturesUnordered<_> = chunk
            .iter()
            .map(|name| async move {
                store
                    .delete(&Path::from(name.as_str()))
                    .await
                    .context(DeleteSourceSnafu { blob: name.clone() })
            })
            .collect();
        while let Some(result) = deletes.next().await {
            result?;
        }
    }
    Ok(())
}
