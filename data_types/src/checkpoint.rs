//! Progress markers for the upstream CDC stream.

use std::fmt;

/// Totally ordered progress marker of one worker's stream.
///
/// The upstream emitter restarts under a fresh `(timestamp, job_id)` pair
/// whenever its pipeline is re-deployed; `worker_checkpoint` counts
/// micro-batches within one incarnation. The derived ordering is
/// lexicographic in field declaration order, which sorts every batch of a
/// newer incarnation after all batches of an older one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checkpoint {
    /// Deploy timestamp of the upstream pipeline incarnation.
    pub timestamp: i64,
    /// UUID of the upstream pipeline incarnation.
    pub job_id: String,
    /// Batch counter within the incarnation.
    pub worker_checkpoint: i64,
}

impl Checkpoint {
    /// Create a checkpoint.
    pub fn new(timestamp: i64, job_id: impl Into<String>, worker_checkpoint: i64) -> Self {
        Self {
            timestamp,
            job_id: job_id.into(),
            worker_checkpoint,
        }
    }

    /// The smallest possible checkpoint; compares `<=` to every other one.
    pub fn minimum() -> Self {
        Self::new(0, "", 0)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.timestamp, self.job_id, self.worker_checkpoint
        )
    }
}

/// Half-open checkpoint interval `[start, end)`.
///
/// `end = None` means unbounded above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRange {
    start: Checkpoint,
    end: Option<Checkpoint>,
}

impl CheckpointRange {
    /// Create a range; a missing `start` defaults to [`Checkpoint::minimum`].
    pub fn new(start: Option<Checkpoint>, end: Option<Checkpoint>) -> Self {
        Self {
            start: start.unwrap_or_else(Checkpoint::minimum),
            end,
        }
    }

    /// Range covering everything strictly below `end`.
    pub fn bounded_above(end: Checkpoint) -> Self {
        Self::new(None, Some(end))
    }

    /// Whether `checkpoint` falls into this range.
    pub fn in_range(&self, checkpoint: &Checkpoint) -> bool {
        if checkpoint < &self.start {
            return false;
        }
        match &self.end {
            Some(end) => checkpoint < end,
            None => true,
        }
    }

    /// Inclusive lower bound.
    pub fn start(&self) -> &Checkpoint {
        &self.start
    }

    /// Exclusive upper bound, if any.
    pub fn end(&self) -> Option<&Checkpoint> {
        self.end.as_ref()
    }
}
