//! Capability seams towards the systems this engine drives but does not
//! own: the destination warehouse, the templated-SQL transform layer and
//! the optional distributed compute cluster.
//!
//! Production deployments bind these traits to the real cloud clients; the
//! [`mock`] module provides in-memory implementations rich enough to run
//! the whole pipeline in tests, and [`local`] provides an in-process
//! compute cluster that performs real Parquet rewrites against an object
//! store.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod cluster;
pub mod core;
pub mod local;
pub mod mock;

pub use crate::core::*;
pub use cluster::*;
