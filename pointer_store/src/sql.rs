//! SQL-backed pointer store.

use crate::interface::{CommitSnafu, EnsureSnafu, PointerStore, ReadSnafu, Result};
use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig, RetryError};
use data_types::{Checkpoint, TableReference};
use observability_deps::tracing::{debug, info};
use snafu::{IntoError, ResultExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use warehouse::{Warehouse, WarehouseErrorKind};

/// [`PointerStore`] running DELETE-then-INSERT transactions against the
/// warehouse.
#[derive(Debug)]
pub struct SqlPointerStore {
    warehouse: Arc<dyn Warehouse>,
    table: TableReference,
    timeout: Duration,

    /// Serializes pointer mutations within this process. Held across the
    /// warehouse round trip, hence a tokio lock.
    commit_lock: tokio::sync::Mutex<()>,

    backoff_config: BackoffConfig,
}

impl SqlPointerStore {
    /// Create a store over `table`.
    pub fn new(warehouse: Arc<dyn Warehouse>, table: TableReference, timeout: Duration) -> Self {
        Self {
            warehouse,
            table,
            timeout,
            commit_lock: tokio::sync::Mutex::new(()),
            backoff_config: BackoffConfig {
                retries: 3,
                min_wait: Duration::from_secs(1),
                jitter: true,
            },
        }
    }

    /// Replace the commit retry policy, mainly to drop waits in tests.
    pub fn with_backoff_config(mut self, config: BackoffConfig) -> Self {
        self.backoff_config = config;
        self
    }

    /// The DELETE + INSERT statement pair shared by both commit shapes.
    fn commit_statements(&self, worker: &str, checkpoint: &Checkpoint) -> String {
        format!(
            "DELETE FROM `{table}` WHERE worker = '{worker}';\n\
             INSERT INTO `{table}` (worker, job_id, timestamp, checkpoint)\n\
             VALUES ('{worker}', '{job_id}', {timestamp}, {worker_checkpoint});",
            table = self.table,
            job_id = checkpoint.job_id,
            timestamp = checkpoint.timestamp,
            worker_checkpoint = checkpoint.worker_checkpoint,
        )
    }

    /// Run `sql` under the process-local lock, retrying contention with a
    /// jittered backoff.
    async fn run_commit(&self, worker: &str, sql: &str) -> Result<()> {
        let mut backoff = Backoff::new(&self.backoff_config);
        backoff
            .retry_all_errors("pointer commit", || async {
                let _guard = self.commit_lock.lock().await;
                self.warehouse.query_and_wait(sql, self.timeout).await
            })
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { attempts, source } => CommitSnafu { worker, attempts }.into_error(source),
                RetryError::Fatal { source } => CommitSnafu {
                    worker,
                    attempts: 1usize,
                }
                .into_error(source),
            })
    }
}

#[async_trait]
impl PointerStore for SqlPointerStore {
    async fn ensure(&self) -> Result<()> {
        let exists = self
            .warehouse
            .table_exists(&self.table)
            .await
            .context(EnsureSnafu {
                table: self.table.to_string(),
            })?;
        if exists {
            return Ok(());
        }

        info!(table = %self.table, "creating pointer table");
        let sql = format!(
            "CREATE TABLE `{}` (worker STRING, timestamp INT64, job_id STRING, checkpoint INT64);",
            self.table
        );
        self.warehouse
            .query_and_wait(&sql, self.timeout)
            .await
            .context(EnsureSnafu {
                table: self.table.to_string(),
            })
    }

    async fn read_all(&self) -> Result<BTreeMap<String, Checkpoint>> {
        let rows = match self
            .warehouse
            .query_pointer_rows(&self.table, self.timeout)
            .await
        {
            Ok(rows) => rows,
            Err(e) if e.kind() == WarehouseErrorKind::NotFound => {
                info!(table = %self.table, "no pointer table yet, all workers start fresh");
                return Ok(BTreeMap::new());
            }
            Err(e) => {
                return Err(ReadSnafu {
                    table: self.table.to_string(),
                }
                .into_error(e))
            }
        };

        let mut status = BTreeMap::new();
        for row in rows {
            info!(
                worker = %row.worker,
                timestamp = row.timestamp,
                job_id = %row.job_id,
                checkpoint = row.checkpoint,
                "last committed checkpoint",
            );
            status.insert(
                row.worker,
                Checkpoint::new(row.timestamp, row.job_id, row.checkpoint),
            );
        }
        Ok(status)
    }

    async fn commit(&self, worker: &str, checkpoint: &Checkpoint) -> Result<()> {
        let sql = format!(
            "BEGIN TRANSACTION;\n{}\nCOMMIT TRANSACTION;",
            self.commit_statements(worker, checkpoint)
        );
        debug!(worker, %checkpoint, "committing pointer");
        self.run_commit(worker, &sql).await
    }

    async fn commit_with_merge(
        &self,
        worker: &str,
        checkpoint: &Checkpoint,
        staging: &TableReference,
        raw: &TableReference,
    ) -> Result<()> {
        let sql = format!(
            "BEGIN TRANSACTION;\n\
             INSERT INTO `{raw}`\nSELECT * FROM `{staging}`;\n{}\n\
             COMMIT TRANSACTION;",
            self.commit_statements(worker, checkpoint),
        );
        debug!(worker, %checkpoint, %staging, "committing pointer with staged rows");
        self.run_commit(worker, &sql).await
    }

    fn table(&self) -> &TableReference {
        &self.table
    }
}
