//! Warehouse client and transform layer traits.

use async_trait::async_trait;
use data_types::TableReference;
use schema::WarehouseField;
use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

/// Generic boxed error type for warehouse interactions.
///
/// The dynamic boxing keeps backend error types (HTTP clients, auth stacks)
/// out of the engine; the kind tag is what retry and resume logic dispatch
/// on.
#[derive(Debug)]
pub struct WarehouseError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: WarehouseErrorKind,
}

impl WarehouseError {
    /// Wrap an error with an explicit kind.
    pub fn new(
        kind: WarehouseErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// Server-side trouble (5xx, rate limits); safe to retry.
    pub fn transient(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(WarehouseErrorKind::TransientServer, e)
    }

    /// Request was wrong (bad request, permission denied); retrying cannot
    /// help.
    pub fn client(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(WarehouseErrorKind::Client, e)
    }

    /// Addressed dataset or table does not exist.
    pub fn not_found(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(WarehouseErrorKind::NotFound, e)
    }

    /// Anything the backend could not classify.
    pub fn unknown(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(WarehouseErrorKind::Unknown, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> WarehouseErrorKind {
        self.kind
    }

    /// Returns the inner error.
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for WarehouseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WarehouseError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for WarehouseError {}

impl From<String> for WarehouseError {
    fn from(e: String) -> Self {
        Self {
            inner: e.into(),
            kind: WarehouseErrorKind::Unknown,
        }
    }
}

impl From<&'static str> for WarehouseError {
    fn from(e: &'static str) -> Self {
        Self {
            inner: e.into(),
            kind: WarehouseErrorKind::Unknown,
        }
    }
}

/// Classification of warehouse errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WarehouseErrorKind {
    /// Server-side error; the operation may succeed when retried.
    TransientServer,

    /// The request itself was rejected; never retried.
    Client,

    /// The addressed dataset/table is missing. Usually not an error at all
    /// but the "first run" signal that makes the engine create it.
    NotFound,

    /// Unclassified failure.
    Unknown,
}

/// How a bulk load treats pre-existing table contents.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadMode {
    /// Append to the table, creating it when missing.
    Append,
    /// Replace the table contents, creating it when missing.
    Overwrite,
}

/// One row of the durable pointer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerRow {
    /// Worker id.
    pub worker: String,
    /// Deploy timestamp of the committed checkpoint.
    pub timestamp: i64,
    /// Upstream job UUID of the committed checkpoint.
    pub job_id: String,
    /// Committed batch counter.
    pub checkpoint: i64,
}

/// Client capabilities of the destination warehouse.
///
/// Mirrors what the managed service offers: dataset/table management, bulk
/// loads straight from object-store URIs, and multi-statement SQL scripts
/// executed synchronously.
#[async_trait]
pub trait Warehouse: Debug + Send + Sync + 'static {
    /// Create `dataset` if it does not exist yet; no-op otherwise.
    async fn ensure_dataset(&self, dataset: &str) -> Result<(), WarehouseError>;

    /// Whether `table` currently exists.
    async fn table_exists(&self, table: &TableReference) -> Result<bool, WarehouseError>;

    /// Bulk-load Parquet files addressed by `uris` (which may contain
    /// wildcards) into `table`.
    ///
    /// Without an explicit `fields` list the backend autodetects the schema
    /// from the files.
    async fn load_from_uris(
        &self,
        uris: &[String],
        table: &TableReference,
        fields: Option<&[WarehouseField]>,
        mode: LoadMode,
        timeout: Duration,
    ) -> Result<(), WarehouseError>;

    /// Run a (possibly multi-statement, possibly transactional) SQL script
    /// and wait for it to finish.
    async fn query_and_wait(&self, sql: &str, timeout: Duration) -> Result<(), WarehouseError>;

    /// Read all rows of a pointer table.
    ///
    /// A missing table yields a [`WarehouseErrorKind::NotFound`] error, not
    /// an empty result; callers decide whether that is fatal.
    async fn query_pointer_rows(
        &self,
        table: &TableReference,
        timeout: Duration,
    ) -> Result<Vec<PointerRow>, WarehouseError>;

    /// Drop `table`.
    async fn delete_table(&self, table: &TableReference) -> Result<(), WarehouseError>;

    /// Return type (like `"mock"` or `"bigquery"`) of this client.
    fn type_name(&self) -> &'static str;
}

/// How the transform layer writes its result into the destination.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Rebuild the destination from scratch.
    Replace,
    /// Append the transformed rows.
    Append,
    /// `MERGE INTO` keyed on the unique column.
    Merge,
}

/// Time partitioning of a produced table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimePartitioning {
    /// Partition column.
    pub column: String,
    /// Partition granularity, e.g. `DAY`.
    pub partition_type: String,
}

/// Parameters handed to a transform model.
///
/// Which subset a model reads is the model's business; unknown parameters
/// are ignored, exactly like the keyword arguments of the templated-SQL
/// layer this mirrors.
#[derive(Debug, Clone, Default)]
pub struct TransformParams {
    /// Write strategy for the destination.
    pub update_strategy: Option<UpdateStrategy>,
    /// Optional time partitioning of the destination.
    pub time_partitioning: Option<TimePartitioning>,
    /// Column whose values identify a row.
    pub unique_column: Option<String>,
    /// Column that breaks ties between rows with equal unique column; the
    /// greater value wins.
    pub order_column: Option<String>,
    /// Partition column name forwarded to the model.
    pub partition_column_name: Option<String>,
    /// SQL expression applied to the partition column.
    pub partition_column_transform: Option<String>,
    /// Source table for per-worker models.
    pub raw_table: Option<TableReference>,
    /// Per-worker input tables for models merging across workers.
    pub workers: Vec<TableReference>,
    /// Statement timeout.
    pub timeout: Duration,
}

/// The external templated-SQL transform layer.
///
/// `transform` renders `model` against `destination` and runs it to
/// completion; it is idempotent by contract.
#[async_trait]
pub trait Transform: Debug + Send + Sync + 'static {
    /// Run `model`, materializing its result into `destination`.
    async fn transform(
        &self,
        model: &str,
        destination: &TableReference,
        params: TransformParams,
    ) -> Result<(), WarehouseError>;
}
