//! Parsing of source object names into checkpoints.

use crate::Checkpoint;
use regex::Regex;

/// A source object whose name matched the upstream naming scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlob {
    /// Worker id encoded in the object name.
    pub worker: String,
    /// Checkpoint encoded in the object name.
    pub checkpoint: Checkpoint,
    /// Full object name within the source bucket.
    pub blob_name: String,
}

/// Parser for object names below `{source_dir}/{source_name}/`.
///
/// The upstream emitter drops immutable Parquet files named
/// `{timestamp}-{job_id}-{worker}-{checkpoint}.parquet` where `job_id` is a
/// canonical UUID. Parsing is pure; names that do not match are rejected
/// with `None` and expected to be skipped silently by callers.
#[derive(Debug)]
pub struct SourcePathParser {
    re: Regex,
}

impl SourcePathParser {
    /// Build a parser for the given source directory and name.
    pub fn new(source_dir: &str, source_name: &str) -> Self {
        let pattern = format!(
            r"^{}/{}/(?P<timestamp>\d+)-(?P<job_id>[0-9a-f]{{8}}-[0-9a-f]{{4}}-[0-9a-f]{{4}}-[0-9a-f]{{4}}-[0-9a-f]{{12}})-(?P<worker>\d+)-(?P<checkpoint>\d+)\.parquet$",
            regex::escape(source_dir),
            regex::escape(source_name),
        );
        Self {
            re: Regex::new(&pattern).expect("object name pattern must compile"),
        }
    }

    /// Parse one object name. Non-matching names yield `None`.
    pub fn parse(&self, blob_name: &str) -> Option<SourceBlob> {
        let captures = self.re.captures(blob_name)?;

        // Oversized digit runs overflow i64 and are treated as non-matching.
        let timestamp: i64 = captures["timestamp"].parse().ok()?;
        let worker_checkpoint: i64 = captures["checkpoint"].parse().ok()?;
        let job_id = captures["job_id"].to_string();
        let worker = captures["worker"].to_string();

        Some(SourceBlob {
            worker,
            checkpoint: Checkpoint::new(timestamp, job_id, worker_checkpoint),
            blob_name: blob_name.to_string(),
        })
    }
}
