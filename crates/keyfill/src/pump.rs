//! Backfill pump
//!
//! The control loop of one table transfer:
//!
//! ```text
//! Init -> per partition: ProbeLimit -> FetchBatch -> [empty => next partition]
//!      -> StageAndReconcile -> Commit | Rollback -> Checkpoint -> loop
//!      -> TransferDone (staging dropped)
//! ```
//!
//! The loop is sequential. The cursor only advances after a successful
//! commit, so a failed run can be re-invoked from its last checkpoint.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::boundary::KeyBoundary;
use crate::catalog::{PartitionInfo, TableDescriptor, TableName};
use crate::checkpoint::{Checkpoint, CheckpointSink, TracingCheckpointSink};
use crate::endpoint::{Destination, Source};
use crate::error::{Error, Result, TransferFailure};
use crate::fetch::{FetchQueryBuilder, Projection, RelatedJoin};
use crate::security::{sanitize_identifier, validate_sql_identifier, MAX_STAGING_NAME_LEN};
use crate::strategy::{ApplyOutcome, CompareColumn, StagingArea, TransferStrategy, WritePlan};
use crate::types::{Batch, KeyTuple};

/// Default rows per batch
pub const DEFAULT_BATCH_SIZE: u32 = 10_000;

/// Cumulative counters of one transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCounters {
    /// Rows read from the source
    pub rows_fetched: u64,
    /// Rows inserted into the destination
    pub rows_inserted: u64,
    /// Destination rows replaced, or staged rows skipped by gap fill
    pub rows_deleted: u64,
    /// Committed batches
    pub batches_completed: u64,
    /// Partitions iterated to exhaustion
    pub partitions_completed: u64,
}

/// Counters shared with progress observers
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicTransferCounters {
    pub rows_fetched: AtomicU64,
    pub rows_inserted: AtomicU64,
    pub rows_deleted: AtomicU64,
    pub batches_completed: AtomicU64,
    pub partitions_completed: AtomicU64,
}

impl AtomicTransferCounters {
    /// Record a committed batch
    pub fn record_batch(&self, fetched: u64, outcome: ApplyOutcome) {
        self.rows_fetched.fetch_add(fetched, Ordering::Relaxed);
        self.rows_inserted
            .fetch_add(outcome.inserted, Ordering::Relaxed);
        self.rows_deleted.fetch_add(outcome.deleted, Ordering::Relaxed);
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an exhausted partition
    pub fn record_partition(&self) {
        self.partitions_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter
    pub fn reset(&self) {
        self.rows_fetched.store(0, Ordering::Relaxed);
        self.rows_inserted.store(0, Ordering::Relaxed);
        self.rows_deleted.store(0, Ordering::Relaxed);
        self.batches_completed.store(0, Ordering::Relaxed);
        self.partitions_completed.store(0, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> TransferCounters {
        TransferCounters {
            rows_fetched: self.rows_fetched.load(Ordering::Relaxed),
            rows_inserted: self.rows_inserted.load(Ordering::Relaxed),
            rows_deleted: self.rows_deleted.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            partitions_completed: self.partitions_completed.load(Ordering::Relaxed),
        }
    }
}

/// What to transfer and how
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    /// Source table
    pub source_table: TableName,
    /// Destination table
    pub destination_table: TableName,
    /// Columns to copy; all copyable source columns when `None`
    pub copy_columns: Option<Vec<String>>,
    /// Fetch key; the source's unique key when `None`
    pub key_columns: Option<Vec<String>>,
    /// Match key for staging strategies; the destination's unique key when
    /// `None`
    pub merge_key_columns: Option<Vec<String>>,
    /// Rows per batch
    pub batch_size: u32,
    /// Write strategy
    pub strategy: TransferStrategy,
    /// Inclusive lower bound
    pub start_keys: Option<KeyTuple>,
    /// Inclusive upper bound
    pub end_keys: Option<KeyTuple>,
    /// Resume strictly after this checkpoint
    pub restart: Option<Checkpoint>,
    /// Scope fetches to one partition at a time when the source supports it
    pub partition_scoping: bool,
    /// Extra condition applied to every probe and scan
    pub filter: Option<String>,
    /// Destination columns loaded from an expression instead of a copy
    pub expressions: Vec<(String, String)>,
    /// Related table joined into every scan
    pub join: Option<RelatedJoin>,
    /// Prefix of the staging table name
    pub session_name: String,
    /// Schema of persistent staging tables
    pub work_schema: String,
}

impl BackfillRequest {
    /// Transfer every row of `source_table` into `destination_table`
    pub fn new(source_table: TableName, destination_table: TableName) -> Self {
        Self {
            source_table,
            destination_table,
            copy_columns: None,
            key_columns: None,
            merge_key_columns: None,
            batch_size: DEFAULT_BATCH_SIZE,
            strategy: TransferStrategy::default(),
            start_keys: None,
            end_keys: None,
            restart: None,
            partition_scoping: true,
            filter: None,
            expressions: Vec::new(),
            join: None,
            session_name: "keyfill".into(),
            work_schema: "keyfill".into(),
        }
    }

    /// Set the copied columns
    pub fn with_copy_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.copy_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Set the fetch key
    pub fn with_key_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Set the merge key
    pub fn with_merge_key_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.merge_key_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Set rows per batch
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the write strategy
    pub fn with_strategy(mut self, strategy: TransferStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the inclusive lower bound
    pub fn with_start_keys(mut self, keys: KeyTuple) -> Self {
        self.start_keys = Some(keys);
        self
    }

    /// Set the inclusive upper bound
    pub fn with_end_keys(mut self, keys: KeyTuple) -> Self {
        self.end_keys = Some(keys);
        self
    }

    /// Resume after a checkpoint
    pub fn with_restart(mut self, checkpoint: Option<Checkpoint>) -> Self {
        self.restart = checkpoint;
        self
    }

    /// Allow or forbid partition-scoped fetches
    pub fn with_partition_scoping(mut self, enabled: bool) -> Self {
        self.partition_scoping = enabled;
        self
    }

    /// Set the extra filter
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Load `column` from `expression`
    pub fn with_expression(
        mut self,
        column: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        self.expressions.push((column.into(), expression.into()));
        self
    }

    /// Join a related table
    pub fn with_join(mut self, join: RelatedJoin) -> Self {
        self.join = Some(join);
        self
    }

    /// Set the staging name prefix
    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    /// Set the schema of persistent staging tables
    pub fn with_work_schema(mut self, schema: impl Into<String>) -> Self {
        self.work_schema = schema.into();
        self
    }
}

/// Everything resolved before the first batch
#[derive(Debug)]
pub struct TransferPlan {
    /// Fetch query builder for the source
    pub fetch: FetchQueryBuilder,
    /// Starting boundary, before any partition is entered
    pub boundary: KeyBoundary,
    /// Partitions to iterate, ascending
    pub partitions: Vec<PartitionInfo>,
    /// How batches are written
    pub write: WritePlan,
}

/// Runs table transfers between one source and one destination
pub struct BackfillPump {
    source: Arc<dyn Source>,
    destination: Arc<dyn Destination>,
    sink: Arc<dyn CheckpointSink>,
    cancel: CancellationToken,
    counters: Arc<AtomicTransferCounters>,
}

impl BackfillPump {
    /// Create a pump logging checkpoints through `tracing`
    pub fn new(source: Arc<dyn Source>, destination: Arc<dyn Destination>) -> Self {
        Self {
            source,
            destination,
            sink: Arc::new(TracingCheckpointSink),
            cancel: CancellationToken::new(),
            counters: Arc::new(AtomicTransferCounters::default()),
        }
    }

    /// Deliver checkpoints to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Stop at the next batch boundary once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Live counters of the running transfer
    pub fn counters(&self) -> Arc<AtomicTransferCounters> {
        Arc::clone(&self.counters)
    }

    /// Run a transfer to completion or failure
    pub async fn run(
        &self,
        request: &BackfillRequest,
    ) -> std::result::Result<TransferCounters, TransferFailure> {
        self.counters.reset();
        let started = Instant::now();

        let plan = match self.plan(request).await {
            Ok(plan) => plan,
            Err(error) => return Err(self.failure(error, None)),
        };
        if let Some(staging) = &plan.write.staging {
            if let Err(error) = self.destination.create_staging(staging).await {
                self.drop_staging(staging).await;
                return Err(self.failure(error, None));
            }
        }

        let mut last_checkpoint = None;
        let result = self.transfer(request, &plan, &mut last_checkpoint).await;

        if let Some(staging) = &plan.write.staging {
            self.drop_staging(staging).await;
        }

        match result {
            Ok(()) => {
                let counters = self.counters.snapshot();
                info!(
                    source = %request.source_table,
                    destination = %request.destination_table,
                    rows_fetched = counters.rows_fetched,
                    rows_inserted = counters.rows_inserted,
                    rows_deleted = counters.rows_deleted,
                    batches = counters.batches_completed,
                    partitions = counters.partitions_completed,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "transfer complete"
                );
                Ok(counters)
            }
            Err(error) => Err(self.failure(error, last_checkpoint)),
        }
    }

    /// Resolve columns, keys, partitions and staging without touching either
    /// table
    pub async fn plan(&self, request: &BackfillRequest) -> Result<TransferPlan> {
        validate_sql_identifier(&request.session_name)?;
        validate_sql_identifier(&request.work_schema)?;

        let source = self.source.describe_table(&request.source_table).await?;
        let destination = self
            .destination
            .describe_table(&request.destination_table)
            .await?;

        let key_columns = match &request.key_columns {
            Some(keys) => keys.clone(),
            None => names(self.source.list_key_columns(&source.name).await?),
        };
        if key_columns.is_empty() {
            return Err(Error::config(format!(
                "no key columns given and {} has no unique key",
                source.name
            )));
        }

        let projection = resolve_projection(request, &source, &destination)?;
        let output_columns = projection.output_columns();

        let mut fetch = FetchQueryBuilder::new(
            self.source.dialect(),
            &source,
            &key_columns,
            projection,
            request.batch_size,
        )?;
        if let Some(filter) = &request.filter {
            fetch = fetch.with_filter(filter.clone())?;
        }

        let scoped = request.partition_scoping && fetch.supports_partition_scoping();
        let mut boundary =
            KeyBoundary::new(fetch.key_columns().to_vec())?.with_partition_scoping(scoped);
        if let Some(end) = &request.end_keys {
            boundary = boundary.with_end(end.clone())?;
        }
        if let Some(start) = &request.start_keys {
            boundary = boundary.with_start(start.clone())?;
        }
        if let Some(restart) = &request.restart {
            boundary = boundary.with_restart(restart.clone())?;
        }

        let partitions = if scoped {
            self.source
                .list_partitions(&source.name)
                .await?
                .into_iter()
                .filter(|p| p.row_count > 0)
                .collect()
        } else {
            vec![PartitionInfo {
                number: 1,
                row_count: source.row_count(),
            }]
        };

        let write = self
            .write_plan(request, &source, &destination, output_columns)
            .await?;

        let partition_count = partitions.len();
        let rows: u64 = partitions.iter().map(|p| p.row_count).sum();
        info!(
            source = %source.name,
            destination = %destination.name,
            strategy = %request.strategy,
            batch_size = request.batch_size,
            key = %fetch.key_columns().join(", "),
            partition_scoped = scoped,
            partitions = partition_count,
            rows,
            staging = ?write.staging.as_ref().map(|s| s.table.to_string()),
            restart = ?request.restart.as_ref().map(|c| c.to_string()),
            "starting transfer"
        );

        Ok(TransferPlan {
            fetch,
            boundary,
            partitions,
            write,
        })
    }

    async fn write_plan(
        &self,
        request: &BackfillRequest,
        source: &TableDescriptor,
        destination: &TableDescriptor,
        columns: Vec<String>,
    ) -> Result<WritePlan> {
        let has_identity = self
            .destination
            .has_surrogate_identity(&destination.name)
            .await?
            && columns.iter().any(|c| {
                destination
                    .column(c)
                    .is_some_and(|d| d.identity)
            });
        let full_row = covers_insertable_columns(destination, &columns);

        if !request.strategy.uses_staging() {
            return Ok(WritePlan {
                destination: destination.name.clone(),
                columns,
                merge_keys: Vec::new(),
                compare_columns: Vec::new(),
                has_identity,
                full_row,
                staging: None,
            });
        }

        let merge_keys = match &request.merge_key_columns {
            Some(keys) => keys.clone(),
            None => names(self.destination.list_key_columns(&destination.name).await?),
        };
        if merge_keys.is_empty() {
            return Err(Error::config(format!(
                "{} strategy needs merge key columns and {} has no unique key",
                request.strategy, destination.name
            )));
        }
        let missing: Vec<&str> = merge_keys
            .iter()
            .filter(|k| !contains(&columns, k))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "merge key columns not among the copied columns: {}",
                missing.join(", ")
            )));
        }

        let compare_columns = columns
            .iter()
            .filter(|c| !contains(&merge_keys, c))
            .filter_map(|c| destination.column(c))
            .filter(|d| d.is_comparable())
            .map(|d| CompareColumn {
                name: d.name.clone(),
                format: d.traits.compare_format.filter(|_| !d.traits.comparable),
            })
            .collect();

        let temporary = self.source.instance() == self.destination.instance();
        let base = sanitize_identifier(
            &[
                &request.session_name,
                self.source.instance(),
                source.name.schema.as_deref().unwrap_or(""),
                &source.name.name,
            ],
            MAX_STAGING_NAME_LEN,
        );
        let staging = StagingArea {
            table: self
                .destination
                .dialect()
                .staging_table(&base, temporary, &request.work_schema),
            temporary,
            like: destination.name.clone(),
            columns: columns.clone(),
            key_columns: merge_keys.clone(),
        };

        Ok(WritePlan {
            destination: destination.name.clone(),
            columns,
            merge_keys,
            compare_columns,
            has_identity,
            full_row,
            staging: Some(staging),
        })
    }

    async fn transfer(
        &self,
        request: &BackfillRequest,
        plan: &TransferPlan,
        last_checkpoint: &mut Option<Checkpoint>,
    ) -> Result<()> {
        for info in &plan.partitions {
            let Some(mut boundary) = plan.boundary.enter_partition(info.number) else {
                debug!(partition = info.number, "partition completed before restart");
                continue;
            };

            let mut loop_number = 0u64;
            loop {
                if self.cancel.is_cancelled() {
                    warn!(partition = info.number, "transfer cancelled");
                    return Err(Error::Cancelled);
                }
                loop_number += 1;

                let probe = plan.fetch.limit_probe(&boundary)?;
                let Some(limit) = self.source.probe_limit(&probe).await? else {
                    break;
                };
                let (upper, is_final) = boundary.clamp_limit(limit);
                let scan = plan.fetch.batch_scan(&boundary, &upper, is_final)?;
                let batch = self.source.fetch_batch(&scan).await?;
                if batch.is_empty() {
                    break;
                }

                let outcome = self.apply(request.strategy, &batch, &plan.write).await?;
                self.counters.record_batch(batch.len() as u64, outcome);
                let counters = self.counters.snapshot();

                let checkpoint = boundary.checkpoint(batch.upper());
                debug!(
                    partition = info.number,
                    loop_number,
                    from = ?boundary.cursor(),
                    to = %batch.upper(),
                    fetched = batch.len(),
                    inserted = outcome.inserted,
                    deleted = outcome.deleted,
                    total_fetched = counters.rows_fetched,
                    "batch committed"
                );
                if let Err(e) = self
                    .sink
                    .on_batch_committed(checkpoint.partition, &checkpoint.keys, &counters)
                    .await
                {
                    warn!(error = %e, checkpoint = %checkpoint, "checkpoint sink failed");
                }
                *last_checkpoint = Some(checkpoint);

                boundary = boundary.advance(batch.upper().clone());
                if batch.is_final() {
                    break;
                }
            }
            self.counters.record_partition();
        }
        Ok(())
    }

    async fn apply(
        &self,
        strategy: TransferStrategy,
        batch: &Batch,
        plan: &WritePlan,
    ) -> Result<ApplyOutcome> {
        let mut tx = self.destination.begin().await?;
        let result = match strategy.apply(batch, tx.as_mut(), plan).await {
            Ok(outcome) => tx.commit().await.map(|()| outcome),
            Err(e) => Err(e),
        };
        let cause = match result {
            Ok(outcome) => return Ok(outcome),
            Err(cause) => cause,
        };

        error!(
            partition = batch.partition(),
            upper = %batch.upper(),
            error = %cause,
            "batch failed, rolling back"
        );
        match tx.rollback().await {
            Ok(()) => Err(cause),
            Err(rollback) => Err(Error::rollback_failed(cause, rollback)),
        }
    }

    async fn drop_staging(&self, staging: &StagingArea) {
        if let Err(e) = self.destination.drop_staging(staging).await {
            warn!(staging = %staging.table, error = %e, "failed to drop staging table");
        }
    }

    fn failure(&self, error: Error, last_checkpoint: Option<Checkpoint>) -> TransferFailure {
        TransferFailure {
            error,
            counters: self.counters.snapshot(),
            last_checkpoint,
        }
    }
}

/// Run one transfer with a tracing checkpoint sink unless `sink` is given
pub async fn run_backfill(
    source: Arc<dyn Source>,
    destination: Arc<dyn Destination>,
    request: &BackfillRequest,
    sink: Option<Arc<dyn CheckpointSink>>,
) -> std::result::Result<TransferCounters, TransferFailure> {
    let mut pump = BackfillPump::new(source, destination);
    if let Some(sink) = sink {
        pump = pump.with_sink(sink);
    }
    pump.run(request).await
}

/// Check copy columns against both tables and build the scan projection.
///
/// Every problem is collected into one configuration error.
fn resolve_projection(
    request: &BackfillRequest,
    source: &TableDescriptor,
    destination: &TableDescriptor,
) -> Result<Projection> {
    let expression_columns: HashSet<String> = request
        .expressions
        .iter()
        .map(|(c, _)| c.to_lowercase())
        .collect();
    let copy: Vec<String> = match &request.copy_columns {
        Some(columns) => columns.clone(),
        None => source
            .copyable_columns()
            .into_iter()
            .map(|c| c.name.clone())
            .filter(|c| !expression_columns.contains(&c.to_lowercase()))
            .collect(),
    };

    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    for column in &copy {
        if !seen.insert(column.to_lowercase()) {
            problems.push(format!("'{}' is listed more than once", column));
            continue;
        }
        if expression_columns.contains(&column.to_lowercase()) {
            continue;
        }
        match source.column(column) {
            None => problems.push(format!("'{}' does not exist in {}", column, source.name)),
            Some(c) if !c.is_copyable() => problems.push(format!(
                "'{}' ({}) in {} cannot be copied",
                column, c.data_type, source.name
            )),
            Some(_) => {}
        }
    }

    let mut written: Vec<&str> = copy.iter().map(String::as_str).collect();
    for (column, _) in &request.expressions {
        if !copy.iter().any(|c| c.eq_ignore_ascii_case(column)) {
            written.push(column);
        }
    }
    if let Some(join) = &request.join {
        written.extend(join.columns.iter().map(String::as_str));
    }
    for column in written {
        match destination.column(column) {
            None => problems.push(format!(
                "'{}' does not exist in {}",
                column, destination.name
            )),
            Some(c) if !c.is_copyable() => problems.push(format!(
                "'{}' ({}) in {} cannot be written",
                column, c.data_type, destination.name
            )),
            Some(_) => {}
        }
    }
    if copy.is_empty() && request.expressions.is_empty() {
        problems.push(format!("{} has no copyable columns", source.name));
    }

    if !problems.is_empty() {
        return Err(Error::config(format!(
            "invalid copy columns: {}",
            problems.join("; ")
        )));
    }

    let mut projection = Projection::columns(copy);
    for (column, expression) in &request.expressions {
        projection = projection.with_expression(column.clone(), expression.clone());
    }
    if let Some(join) = &request.join {
        projection = projection.with_join(join.clone());
    }
    Ok(projection)
}

fn names(columns: Vec<crate::catalog::ColumnDescriptor>) -> Vec<String> {
    columns.into_iter().map(|c| c.name).collect()
}

fn contains(columns: &[String], name: &str) -> bool {
    columns.iter().any(|c| c.eq_ignore_ascii_case(name))
}

/// Whether `columns` list every non-identity writable column of `table`, in
/// table order
fn covers_insertable_columns(table: &TableDescriptor, columns: &[String]) -> bool {
    let insertable: Vec<&str> = table
        .columns
        .iter()
        .filter(|c| !c.identity && c.is_copyable())
        .map(|c| c.name.as_str())
        .collect();
    insertable.len() == columns.len()
        && insertable
            .iter()
            .zip(columns)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
}
