//! Shared data types for the CDC ingestion engine: progress checkpoints,
//! per-worker work queues, source object names and warehouse table
//! references.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod checkpoint;
mod queue;
mod source_path;
mod table;

pub use checkpoint::*;
pub use queue::*;
pub use source_path::*;
pub use table::*;
