//! Source and destination endpoints
//!
//! The pump talks to the two sides of a transfer through these traits:
//! - [`Source`]: runs limit probes and batch scans
//! - [`Destination`]: owns the staging lifecycle and opens transactions
//! - [`DestinationTransaction`]: bulk loads and set-based reconciles inside
//!   one batch's transaction
//!
//! [`SqlEndpoint`] implements all of them over a [`Connection`]; the in-memory
//! engine in [`crate::memory`] implements them for tests.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::catalog::{Catalog, TableDescriptor, TableName};
use crate::connection::{Connection, ConnectionConfig, IsolationLevel, LoadOptions, Transaction};
use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::fetch::{BatchScan, LimitProbe};
use crate::strategy::{ApplyOutcome, ReconcileMode, StagingArea, StepEffect, WritePlan};
use crate::types::{Batch, KeyTuple, Row};

/// Read side of a transfer
#[async_trait]
pub trait Source: Catalog {
    /// SQL dialect the fetch queries are rendered in
    fn dialect(&self) -> Arc<dyn SqlDialect>;

    /// Identity of the engine instance, used to name and place staging
    fn instance(&self) -> &str;

    /// Key tuple of the last row of the next batch, or `None` when the range
    /// is exhausted
    async fn probe_limit(&self, probe: &LimitProbe) -> Result<Option<KeyTuple>>;

    /// Every row of one batch, in key order
    async fn fetch_batch(&self, scan: &BatchScan) -> Result<Batch>;
}

/// Write side of a transfer
#[async_trait]
pub trait Destination: Catalog {
    /// SQL dialect of the destination
    fn dialect(&self) -> Arc<dyn SqlDialect>;

    /// Identity of the engine instance
    fn instance(&self) -> &str;

    /// Drop any stale staging table and create an empty one
    async fn create_staging(&self, staging: &StagingArea) -> Result<()>;

    /// Drop the staging table
    async fn drop_staging(&self, staging: &StagingArea) -> Result<()>;

    /// Open the transaction one batch is applied in
    async fn begin(&self) -> Result<Box<dyn DestinationTransaction>>;
}

/// One batch's destination transaction
#[async_trait]
pub trait DestinationTransaction: Send {
    /// Insert `rows` into `table`, returning the number inserted
    async fn bulk_load(
        &mut self,
        table: &TableName,
        columns: &[String],
        rows: &[Row],
        options: LoadOptions,
    ) -> Result<u64>;

    /// Reconcile the staging table into the destination and empty it
    async fn reconcile(&mut self, plan: &WritePlan, mode: ReconcileMode) -> Result<ApplyOutcome>;

    /// Make the batch durable. On failure the transaction stays open for
    /// [`DestinationTransaction::rollback`].
    async fn commit(&mut self) -> Result<()>;

    /// Discard the batch
    async fn rollback(&mut self) -> Result<()>;
}

/// Endpoint backed by a SQL connection
pub struct SqlEndpoint {
    conn: Arc<dyn Connection>,
    dialect: Arc<dyn SqlDialect>,
    catalog: Arc<dyn Catalog>,
    instance: String,
    isolation: Option<IsolationLevel>,
}

impl std::fmt::Debug for SqlEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlEndpoint")
            .field("dialect", &self.dialect.name())
            .field("instance", &self.instance)
            .field("isolation", &self.isolation)
            .finish()
    }
}

impl SqlEndpoint {
    /// Assemble an endpoint from its parts
    pub fn new(
        conn: Arc<dyn Connection>,
        dialect: Arc<dyn SqlDialect>,
        catalog: Arc<dyn Catalog>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            dialect,
            catalog,
            instance: instance.into(),
            isolation: None,
        }
    }

    /// Isolation level of destination transactions
    pub fn with_isolation(mut self, isolation: Option<IsolationLevel>) -> Self {
        self.isolation = isolation;
        self
    }

    /// Connect to the backend named by the URL scheme
    #[allow(unreachable_patterns)]
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        use crate::connection::DatabaseType;

        let database = config.database_type()?;
        let conn = crate::connection::connect(config).await?;
        let catalog: Arc<dyn Catalog> = match database {
            #[cfg(feature = "sqlserver")]
            DatabaseType::SqlServer => {
                Arc::new(crate::sqlserver::SqlServerCatalog::new(Arc::clone(&conn)))
            }
            #[cfg(feature = "postgres")]
            DatabaseType::PostgreSQL => {
                Arc::new(crate::postgres::PgCatalog::new(Arc::clone(&conn)))
            }
            other => {
                return Err(crate::error::Error::unsupported(format!(
                    "{} support is not compiled in",
                    other
                )))
            }
        };
        Ok(Self::new(conn, database.dialect(), catalog, config.instance_key())
            .with_isolation(config.isolation))
    }

    /// Underlying connection
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }
}

#[async_trait]
impl Catalog for SqlEndpoint {
    async fn describe_table(&self, table: &TableName) -> Result<TableDescriptor> {
        self.catalog.describe_table(table).await
    }
}

#[async_trait]
impl Source for SqlEndpoint {
    fn dialect(&self) -> Arc<dyn SqlDialect> {
        Arc::clone(&self.dialect)
    }

    fn instance(&self) -> &str {
        &self.instance
    }

    async fn probe_limit(&self, probe: &LimitProbe) -> Result<Option<KeyTuple>> {
        match self.conn.query_one(&probe.sql, &probe.params).await? {
            Some(row) => Ok(Some(KeyTuple::from_row(&row, &probe.key_columns)?)),
            None => Ok(None),
        }
    }

    async fn fetch_batch(&self, scan: &BatchScan) -> Result<Batch> {
        let rows = self.conn.query(&scan.sql, &scan.params).await?;
        Ok(Batch::new(
            scan.partition,
            scan.projection.output_columns(),
            rows,
            scan.upper.clone(),
            scan.is_final,
        ))
    }
}

#[async_trait]
impl Destination for SqlEndpoint {
    fn dialect(&self) -> Arc<dyn SqlDialect> {
        Arc::clone(&self.dialect)
    }

    fn instance(&self) -> &str {
        &self.instance
    }

    // Staging DDL is session state and must not run inside a procedure call
    async fn create_staging(&self, staging: &StagingArea) -> Result<()> {
        for sql in staging.create_statements(self.dialect.as_ref()) {
            debug!(sql = %sql, "staging");
            self.conn.execute_script(&sql).await?;
        }
        Ok(())
    }

    async fn drop_staging(&self, staging: &StagingArea) -> Result<()> {
        self.conn
            .execute_script(&staging.drop_statement(self.dialect.as_ref()))
            .await
    }

    async fn begin(&self) -> Result<Box<dyn DestinationTransaction>> {
        let tx = match self.isolation {
            Some(level) => self.conn.begin_with_isolation(level).await?,
            None => self.conn.begin().await?,
        };
        Ok(Box::new(SqlDestinationTransaction {
            tx,
            dialect: Arc::clone(&self.dialect),
        }))
    }
}

struct SqlDestinationTransaction {
    tx: Box<dyn Transaction>,
    dialect: Arc<dyn SqlDialect>,
}

impl SqlDestinationTransaction {
    async fn insert_chunks(
        &self,
        table: &TableName,
        columns: &[String],
        rows: &[Row],
        keep_identity: bool,
    ) -> Result<u64> {
        let width = columns.len().max(1);
        let per_statement = (self.dialect.max_params() / width)
            .min(self.dialect.max_rows_per_insert())
            .max(1);

        let mut inserted = 0;
        for chunk in rows.chunks(per_statement) {
            let sql = self
                .dialect
                .insert_values_sql(table, columns, chunk.len(), keep_identity);
            let params: Vec<_> = chunk
                .iter()
                .flat_map(|row| row.values().iter().cloned())
                .collect();
            inserted += self.tx.execute(&sql, &params).await?;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl DestinationTransaction for SqlDestinationTransaction {
    async fn bulk_load(
        &mut self,
        table: &TableName,
        columns: &[String],
        rows: &[Row],
        options: LoadOptions,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        if let Some(loaded) = self.tx.bulk_insert(table, columns, rows, options).await? {
            return Ok(loaded);
        }
        debug!(table = %table, rows = rows.len(), "bulk protocol unavailable, inserting");
        self.insert_chunks(table, columns, rows, options.keep_identity)
            .await
    }

    async fn reconcile(&mut self, plan: &WritePlan, mode: ReconcileMode) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        for statement in plan.reconcile_statements(self.dialect.as_ref(), mode)? {
            let affected = self.tx.execute(&statement.sql, &[]).await?;
            match statement.effect {
                StepEffect::Deleted => outcome.deleted += affected,
                StepEffect::Inserted => outcome.inserted += affected,
                StepEffect::Uncounted => {}
            }
        }
        Ok(outcome)
    }

    async fn commit(&mut self) -> Result<()> {
        self.tx.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.tx.rollback().await
    }
}
