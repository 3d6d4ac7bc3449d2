//! Incremental ingestion of CDC Parquet micro-batches into a managed cloud
//! warehouse.
//!
//! The upstream emitter continually drops immutable Parquet files into an
//! object-store prefix, named by `(timestamp, job_id, worker, checkpoint)`.
//! Each run of the [`Pipeline`]:
//!
//! 1. discovers new files and partitions them into per-worker queues,
//! 2. loads each worker's files into a worker-scoped raw table, advancing a
//!    durable pointer per committed batch,
//! 3. dedupes every raw table into a partitioned per-worker table,
//! 4. merges all deduped tables into the single destination table, and
//! 5. drops the per-worker working tables.
//!
//! Pointer commits are transactional, so a crashed run leaves the warehouse
//! consistent and the next run resumes strictly above the pointer.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod config;
mod direct;
mod discovery;
mod error;
mod parallel;
mod pipeline;
mod retention;
mod schema_inference;
mod worker;

pub use config::IngestConfig;
pub use direct::DirectLoader;
pub use error::{Error, Result};
pub use parallel::{ClusterRetryConfig, ParallelLoader};
pub use pipeline::Pipeline;
pub use worker::WorkerContext;
