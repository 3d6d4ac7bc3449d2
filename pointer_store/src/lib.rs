//! The durable pointer table: one row per worker recording the highest
//! checkpoint whose files are fully loaded into that worker's raw table.
//!
//! Commits are the linchpin of crash safety. Every mutation is a single
//! DELETE-then-INSERT transaction, serialized through a process-local lock
//! on top of the warehouse transaction (the warehouse does not guarantee
//! per-row-key mutual exclusion across concurrent scripts, so both layers
//! are needed). After any commit there is exactly one row for the worker.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod interface;
mod mem;
mod sql;

pub use interface::*;
pub use mem::*;
pub use sql::*;
