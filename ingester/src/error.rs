//! Ingestion errors.

use snafu::Snafu;
use warehouse::{ClusterError, WarehouseError};

/// Ingestion error.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("listing source objects failed: {source}"))]
    ListSource { source: object_store::Error },

    #[snafu(display("downloading sample object {blob} failed: {source}"))]
    DownloadSample {
        blob: String,
        source: object_store::Error,
    },

    #[snafu(display("reading parquet schema of {blob} failed: {source}"))]
    SampleSchema {
        blob: String,
        source: parquet::errors::ParquetError,
    },

    #[snafu(display("mapping source schema to warehouse schema failed: {source}"))]
    MapSchema { source: schema::Error },

    #[snafu(display("no source object available to sample a schema from"))]
    NoSampleBlob,

    #[snafu(display(
        "worker {worker}: load into {table} failed after {attempts} attempts: {source}"
    ))]
    LoadExhausted {
        worker: String,
        table: String,
        attempts: usize,
        source: WarehouseError,
    },

    #[snafu(display("worker {worker}: load into {table} failed: {source}"))]
    Load {
        worker: String,
        table: String,
        source: WarehouseError,
    },

    #[snafu(display("pointer store failure: {source}"))]
    Pointer { source: pointer_store::Error },

    #[snafu(display("warehouse failure: {source}"))]
    Warehouse { source: WarehouseError },

    #[snafu(display("transform model {model} into {destination} failed: {source}"))]
    TransformModel {
        model: String,
        destination: String,
        source: WarehouseError,
    },

    #[snafu(display("worker {worker}: rewrite of {source_object} failed: {source}"))]
    Rewrite {
        worker: String,
        source_object: String,
        source: ClusterError,
    },

    #[snafu(display("connecting the compute cluster failed: {source}"))]
    ClusterConnect { source: ClusterError },

    #[snafu(display("compute cluster retries exhausted: {source}"))]
    ClusterRetriesExhausted { source: Box<Error> },

    #[snafu(display("parallel loading is enabled but no cluster provider was configured"))]
    NoClusterProvider,

    #[snafu(display("deleting staged objects under {prefix} failed: {source}"))]
    CleanStaging {
        prefix: String,
        source: object_store::Error,
    },

    #[snafu(display("deleting source object {blob} failed: {source}"))]
    DeleteSource {
        blob: String,
        source: object_store::Error,
    },
}

/// Ingestion result.
pub type Result<T, E = Error> = std::result::Result<T, E>;
