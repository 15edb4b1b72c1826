//! In-memory engine
//!
//! [`MemoryDatabase`] implements [`Catalog`], [`Source`] and [`Destination`]
//! over tables held in memory. Probes and scans evaluate the same
//! [`Predicate`](crate::predicate::Predicate) tree the SQL renderer prints.
//! Transactions are copy-on-write: touched tables are cloned on first write
//! and swapped in on commit.
//!
//! Failures can be injected into commits, rollbacks and probes to exercise
//! the pump's error paths.
//!
//! Load expressions, related-table joins and extra filters are SQL fragments
//! and are rejected as unsupported.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::catalog::{
    Catalog, ColumnDescriptor, PartitionInfo, PartitionScheme, TableDescriptor, TableName,
};
use crate::connection::LoadOptions;
use crate::dialect::{SqlDialect, SqlServerDialect};
use crate::endpoint::{Destination, DestinationTransaction, Source};
use crate::error::{Error, Result};
use crate::fetch::{BatchScan, LimitProbe};
use crate::predicate::Predicate;
use crate::strategy::{ApplyOutcome, ReconcileMode, StagingArea, WritePlan};
use crate::types::{Batch, KeyTuple, Row, Value};

/// Maps a partitioning column value to a 1-based partition number
pub type Partitioner = Arc<dyn Fn(&Value) -> u32 + Send + Sync>;

/// Builds the error an injected failure returns
pub type Fault = fn() -> Error;

#[derive(Clone)]
struct MemoryTable {
    descriptor: TableDescriptor,
    key: Vec<String>,
    rows: BTreeMap<KeyTuple, Row>,
    partitioning: Option<(PartitionScheme, Partitioner)>,
}

impl MemoryTable {
    fn new(descriptor: TableDescriptor) -> Result<Self> {
        let key: Vec<String> = descriptor
            .key_columns()
            .into_iter()
            .map(|c| c.name)
            .collect();
        if key.is_empty() {
            return Err(Error::config(format!(
                "memory table {} needs a unique key",
                descriptor.name
            )));
        }
        Ok(Self {
            descriptor,
            key,
            rows: BTreeMap::new(),
            partitioning: None,
        })
    }

    fn column_names(&self) -> Vec<String> {
        self.descriptor
            .columns
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Store `row`, filling absent columns with NULL
    fn insert(&mut self, row: &Row) -> Result<()> {
        let columns = self.column_names();
        let values = columns
            .iter()
            .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
            .collect();
        let stored = Row::new(columns, values);
        let key = stored.key(&self.key)?;
        if self.rows.contains_key(&key) {
            return Err(Error::constraint(
                format!("PK_{}", self.descriptor.name.name),
                format!("duplicate key {} in {}", key, self.descriptor.name),
            ));
        }
        self.rows.insert(key, stored);
        Ok(())
    }

    fn check_identity(&self, columns: &[String], keep_identity: bool) -> Result<()> {
        if keep_identity {
            return Ok(());
        }
        match self
            .descriptor
            .columns
            .iter()
            .find(|c| c.identity && columns.iter().any(|n| n.eq_ignore_ascii_case(&c.name)))
        {
            Some(c) => Err(Error::query(format!(
                "cannot insert explicit value for identity column '{}' in {}",
                c.name, self.descriptor.name
            ))),
            None => Ok(()),
        }
    }

    fn partition_of(&self, row: &Row) -> u32 {
        match &self.partitioning {
            Some((scheme, f)) => f(row.get_by_name(&scheme.column).unwrap_or(&Value::Null)),
            None => 1,
        }
    }

    /// Rows matching `predicate`, in `key_columns` order
    fn select(
        &self,
        predicate: &Predicate,
        params: &[Value],
        key_columns: &[String],
    ) -> Result<Vec<(KeyTuple, &Row)>> {
        let mut matched = Vec::new();
        for row in self.rows.values() {
            let key = row.key(key_columns)?;
            if predicate.evaluate(key.values(), params, Some(self.partition_of(row))) {
                matched.push((key, row));
            }
        }
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matched)
    }

    fn describe(&self) -> TableDescriptor {
        let mut descriptor = self.descriptor.clone();
        match &self.partitioning {
            Some((scheme, _)) => {
                let mut counts: BTreeMap<u32, u64> = BTreeMap::new();
                for row in self.rows.values() {
                    *counts.entry(self.partition_of(row)).or_default() += 1;
                }
                let partitions = counts
                    .into_iter()
                    .map(|(number, row_count)| PartitionInfo { number, row_count })
                    .collect();
                descriptor.partitioning = Some(scheme.clone());
                descriptor.partitions = partitions;
            }
            None => {
                descriptor.partitioning = None;
                descriptor.partitions = vec![PartitionInfo {
                    number: 1,
                    row_count: self.rows.len() as u64,
                }];
            }
        }
        descriptor
    }
}

#[derive(Default)]
struct Faults {
    commits: u64,
    probes: u64,
    commit: Option<(u64, Fault)>,
    rollback: Option<Fault>,
    probe: Option<(u64, Fault)>,
}

struct Inner {
    instance: String,
    tables: RwLock<HashMap<String, MemoryTable>>,
    faults: Mutex<Faults>,
}

/// Tables held in memory, shared by clones
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("instance", &self.inner.instance)
            .field("tables", &self.table_names())
            .finish()
    }
}

impl MemoryDatabase {
    /// Create an empty database; `instance` identifies it for staging
    /// placement
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                instance: instance.into(),
                tables: RwLock::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
            }),
        }
    }

    /// Create a table; its key columns become the unique key
    pub fn create_table(&self, descriptor: TableDescriptor) -> Result<()> {
        let table = MemoryTable::new(descriptor)?;
        self.inner
            .tables
            .write()
            .insert(table.descriptor.name.key(), table);
        Ok(())
    }

    /// Create a table partitioned by `partitioner` applied to `column`
    pub fn create_partitioned_table<F>(
        &self,
        descriptor: TableDescriptor,
        function: impl Into<String>,
        column: impl Into<String>,
        partitioner: F,
    ) -> Result<()>
    where
        F: Fn(&Value) -> u32 + Send + Sync + 'static,
    {
        let column = column.into();
        descriptor.require_column(&column)?;
        let mut table = MemoryTable::new(descriptor)?;
        let partitioner: Partitioner = Arc::new(partitioner);
        table.partitioning = Some((
            PartitionScheme {
                function: function.into(),
                column,
            },
            partitioner,
        ));
        self.inner
            .tables
            .write()
            .insert(table.descriptor.name.key(), table);
        Ok(())
    }

    /// Insert rows outside any transaction
    pub fn insert_rows<I>(&self, table: &TableName, rows: I) -> Result<u64>
    where
        I: IntoIterator<Item = Row>,
    {
        let mut tables = self.inner.tables.write();
        let t = tables.get_mut(&table.key()).ok_or_else(|| not_found(table))?;
        let mut inserted = 0;
        for row in rows {
            t.insert(&row)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// All rows of a table in unique-key order
    pub fn rows(&self, table: &TableName) -> Result<Vec<Row>> {
        let tables = self.inner.tables.read();
        let t = tables.get(&table.key()).ok_or_else(|| not_found(table))?;
        Ok(t.rows.values().cloned().collect())
    }

    /// Number of rows in a table
    pub fn row_count(&self, table: &TableName) -> Result<usize> {
        let tables = self.inner.tables.read();
        let t = tables.get(&table.key()).ok_or_else(|| not_found(table))?;
        Ok(t.rows.len())
    }

    /// Names of all tables, sorted
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .tables
            .read()
            .values()
            .map(|t| t.descriptor.name.to_string())
            .collect();
        names.sort();
        names
    }

    /// Fail the `n`-th commit (1-based, counted over the database lifetime)
    pub fn fail_commit_number(&self, n: u64, fault: Fault) {
        self.inner.faults.lock().commit = Some((n, fault));
    }

    /// Fail every rollback
    pub fn fail_rollback(&self, fault: Fault) {
        self.inner.faults.lock().rollback = Some(fault);
    }

    /// Fail the `n`-th limit probe (1-based)
    pub fn fail_probe_number(&self, n: u64, fault: Fault) {
        self.inner.faults.lock().probe = Some((n, fault));
    }

    /// Remove injected failures and reset attempt counts
    pub fn clear_faults(&self) {
        *self.inner.faults.lock() = Faults::default();
    }

    /// Commits attempted so far
    pub fn commit_attempts(&self) -> u64 {
        self.inner.faults.lock().commits
    }

    fn table_snapshot(&self, table: &TableName) -> Result<MemoryTable> {
        self.inner
            .tables
            .read()
            .get(&table.key())
            .cloned()
            .ok_or_else(|| not_found(table))
    }
}

fn not_found(table: &TableName) -> Error {
    Error::TableNotFound {
        table: table.to_string(),
    }
}

#[async_trait]
impl Catalog for MemoryDatabase {
    async fn describe_table(&self, table: &TableName) -> Result<TableDescriptor> {
        let tables = self.inner.tables.read();
        let t = tables.get(&table.key()).ok_or_else(|| not_found(table))?;
        Ok(t.describe())
    }
}

#[async_trait]
impl Source for MemoryDatabase {
    fn dialect(&self) -> Arc<dyn SqlDialect> {
        Arc::new(SqlServerDialect)
    }

    fn instance(&self) -> &str {
        &self.inner.instance
    }

    async fn probe_limit(&self, probe: &LimitProbe) -> Result<Option<KeyTuple>> {
        {
            let mut faults = self.inner.faults.lock();
            faults.probes += 1;
            if let Some((n, fault)) = faults.probe {
                if n == faults.probes {
                    return Err(fault());
                }
            }
        }
        if probe.filter.is_some() {
            return Err(Error::unsupported("memory engine cannot apply SQL filters"));
        }

        let tables = self.inner.tables.read();
        let t = tables
            .get(&probe.table.key())
            .ok_or_else(|| not_found(&probe.table))?;
        let matched = t.select(&probe.predicate, &probe.params, &probe.key_columns)?;
        Ok(matched
            .into_iter()
            .take(probe.batch_size as usize)
            .last()
            .map(|(key, _)| key))
    }

    async fn fetch_batch(&self, scan: &BatchScan) -> Result<Batch> {
        if scan.filter.is_some() {
            return Err(Error::unsupported("memory engine cannot apply SQL filters"));
        }
        if scan.projection.join().is_some()
            || scan
                .projection
                .projected()
                .iter()
                .any(|c| c.expression.is_some())
        {
            return Err(Error::unsupported(
                "memory engine cannot evaluate load expressions or joins",
            ));
        }

        let columns = scan.projection.output_columns();
        let tables = self.inner.tables.read();
        let t = tables
            .get(&scan.table.key())
            .ok_or_else(|| not_found(&scan.table))?;
        let rows = t
            .select(&scan.predicate, &scan.params, &scan.key_columns)?
            .into_iter()
            .map(|(_, row)| row.project(&columns))
            .collect::<Result<Vec<_>>>()?;

        Ok(Batch::new(
            scan.partition,
            columns,
            rows,
            scan.upper.clone(),
            scan.is_final,
        ))
    }
}

#[async_trait]
impl Destination for MemoryDatabase {
    fn dialect(&self) -> Arc<dyn SqlDialect> {
        Arc::new(SqlServerDialect)
    }

    fn instance(&self) -> &str {
        &self.inner.instance
    }

    async fn create_staging(&self, staging: &StagingArea) -> Result<()> {
        let like = self.table_snapshot(&staging.like)?;
        let columns = staging
            .columns
            .iter()
            .map(|name| {
                let mut column = like.descriptor.require_column(name)?.clone();
                column.identity = false;
                column.key_ordinal = staging
                    .key_columns
                    .iter()
                    .position(|k| k.eq_ignore_ascii_case(name))
                    .map(|p| p as u32 + 1);
                Ok(column)
            })
            .collect::<Result<Vec<ColumnDescriptor>>>()?;

        let table = MemoryTable::new(TableDescriptor::new(staging.table.clone(), columns))?;
        self.inner
            .tables
            .write()
            .insert(staging.table.key(), table);
        Ok(())
    }

    async fn drop_staging(&self, staging: &StagingArea) -> Result<()> {
        self.inner.tables.write().remove(&staging.table.key());
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn DestinationTransaction>> {
        Ok(Box::new(MemoryTransaction {
            db: self.clone(),
            working: HashMap::new(),
        }))
    }
}

/// Copy-on-write transaction over a [`MemoryDatabase`]
pub struct MemoryTransaction {
    db: MemoryDatabase,
    working: HashMap<String, MemoryTable>,
}

impl MemoryTransaction {
    fn table_mut(&mut self, table: &TableName) -> Result<&mut MemoryTable> {
        let key = table.key();
        if !self.working.contains_key(&key) {
            let snapshot = self.db.table_snapshot(table)?;
            self.working.insert(key.clone(), snapshot);
        }
        self.working
            .get_mut(&key)
            .ok_or_else(|| Error::internal(format!("lost working copy of {}", table)))
    }
}

#[async_trait]
impl DestinationTransaction for MemoryTransaction {
    async fn bulk_load(
        &mut self,
        table: &TableName,
        columns: &[String],
        rows: &[Row],
        options: LoadOptions,
    ) -> Result<u64> {
        let t = self.table_mut(table)?;
        t.check_identity(columns, options.keep_identity)?;
        for row in rows {
            t.insert(&row.project(columns)?)?;
        }
        Ok(rows.len() as u64)
    }

    async fn reconcile(&mut self, plan: &WritePlan, mode: ReconcileMode) -> Result<ApplyOutcome> {
        let staging_name = &plan
            .staging
            .as_ref()
            .ok_or_else(|| {
                Error::internal(format!("no staging area prepared for {}", plan.destination))
            })?
            .table;

        let mut staged: BTreeMap<KeyTuple, Row> = BTreeMap::new();
        for row in std::mem::take(&mut self.table_mut(staging_name)?.rows).into_values() {
            staged.insert(row.key(&plan.merge_keys)?, row);
        }

        let destination = self.table_mut(&plan.destination)?;
        let mut outcome = ApplyOutcome::default();
        let mut matched: BTreeSet<KeyTuple> = BTreeSet::new();
        let mut removed: Vec<KeyTuple> = Vec::new();
        for (stored_key, row) in &destination.rows {
            let merge_key = row.key(&plan.merge_keys)?;
            let Some(staged_row) = staged.get(&merge_key) else {
                continue;
            };
            let replace = match mode {
                ReconcileMode::Replace {
                    only_changed: false,
                } => true,
                ReconcileMode::Replace { only_changed: true } => {
                    plan.compare_columns.iter().any(|c| {
                        let left = row.get_by_name(&c.name).unwrap_or(&Value::Null);
                        let right = staged_row.get_by_name(&c.name).unwrap_or(&Value::Null);
                        left.total_cmp(right).is_ne()
                    })
                }
                ReconcileMode::FillGaps => false,
            };
            if replace {
                removed.push(stored_key.clone());
            } else {
                matched.insert(merge_key);
            }
        }
        for key in removed {
            destination.rows.remove(&key);
            outcome.deleted += 1;
        }
        for key in &matched {
            staged.remove(key);
        }
        if mode == ReconcileMode::FillGaps {
            outcome.deleted += matched.len() as u64;
        }

        destination.check_identity(&plan.columns, plan.has_identity)?;
        for row in staged.values() {
            destination.insert(&row.project(&plan.columns)?)?;
            outcome.inserted += 1;
        }
        Ok(outcome)
    }

    async fn commit(&mut self) -> Result<()> {
        {
            let mut faults = self.db.inner.faults.lock();
            faults.commits += 1;
            if let Some((n, fault)) = faults.commit {
                if n == faults.commits {
                    return Err(fault());
                }
            }
        }
        let mut tables = self.db.inner.tables.write();
        for (key, table) in self.working.drain() {
            // A staging table dropped meanwhile stays dropped
            if tables.contains_key(&key) {
                tables.insert(key, table);
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(fault) = self.db.inner.faults.lock().rollback {
            return Err(fault());
        }
        self.working.clear();
        Ok(())
    }
}
