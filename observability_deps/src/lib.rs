//! Crate that pins the version of `tracing` used by every workspace member so
//! that log and span events all flow through one subscriber registry.
//!
//! Import the macros through this re-export rather than depending on
//! `tracing` directly:
//!
//! ```
//! use observability_deps::tracing::info;
//! info!("something happened");
//! ```
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
