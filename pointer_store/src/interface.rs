//! Trait of the pointer store.

use async_trait::async_trait;
use data_types::{Checkpoint, TableReference};
use snafu::Snafu;
use std::collections::BTreeMap;
use std::fmt::Debug;
use warehouse::WarehouseError;

/// Pointer store error.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("creating pointer table {table} failed: {source}"))]
    Ensure {
        table: String,
        source: WarehouseError,
    },

    #[snafu(display("reading pointer table {table} failed: {source}"))]
    Read {
        table: String,
        source: WarehouseError,
    },

    #[snafu(display(
        "pointer commit for worker {worker} failed after {attempts} attempts: {source}"
    ))]
    Commit {
        worker: String,
        attempts: usize,
        source: WarehouseError,
    },
}

/// Pointer store result.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Durable mapping `worker → last committed checkpoint`.
///
/// The absence of a row means the worker never advanced; a present row is
/// the exclusive lower bound for the worker's next run.
#[async_trait]
pub trait PointerStore: Debug + Send + Sync + 'static {
    /// Create the backing table if it is missing; no-op otherwise.
    async fn ensure(&self) -> Result<()>;

    /// Read all rows. A missing table reads as the empty mapping.
    async fn read_all(&self) -> Result<BTreeMap<String, Checkpoint>>;

    /// Atomically replace the worker's row with `checkpoint`.
    async fn commit(&self, worker: &str, checkpoint: &Checkpoint) -> Result<()>;

    /// Atomically append all rows of `staging` into `raw` AND replace the
    /// worker's row with `checkpoint`, as one transaction.
    ///
    /// This is the second phase of the parallel loader's two-phase commit:
    /// either the staged rows land in the raw table and the pointer covers
    /// them, or neither happens.
    async fn commit_with_merge(
        &self,
        worker: &str,
        checkpoint: &Checkpoint,
        staging: &TableReference,
        raw: &TableReference,
    ) -> Result<()>;

    /// The backing table.
    fn table(&self) -> &TableReference;
}
