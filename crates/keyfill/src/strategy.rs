//! Transfer strategies
//!
//! A [`TransferStrategy`] decides how a fetched batch is written to the
//! destination inside the batch's transaction:
//!
//! - **BulkAppend** inserts straight into the destination
//! - **ReconcilingMerge** stages the batch, deletes destination rows whose
//!   merge key matches a staged row (optionally only rows that differ), and
//!   inserts the staged rows
//! - **GapFill** stages the batch, discards staged rows whose merge key
//!   already exists in the destination, and inserts the rest
//!
//! The set-based steps are described by a [`WritePlan`] and rendered to SQL by
//! [`WritePlan::reconcile_statements`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::catalog::TableName;
use crate::connection::LoadOptions;
use crate::dialect::{SqlDialect, DESTINATION_ALIAS, SOURCE_ALIAS};
use crate::endpoint::DestinationTransaction;
use crate::error::{Error, Result};
use crate::types::Batch;

/// How a fetched batch is written to the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferStrategy {
    /// Insert directly; the destination range is assumed empty
    #[default]
    BulkAppend,
    /// Replace destination rows with the staged batch
    ReconcilingMerge {
        /// Only replace rows whose non-key columns differ
        #[serde(default)]
        only_changed: bool,
    },
    /// Insert only the staged rows missing from the destination
    GapFill,
}

impl TransferStrategy {
    /// Whether batches pass through a staging table
    pub const fn uses_staging(&self) -> bool {
        !matches!(self, Self::BulkAppend)
    }

    /// Whether re-applying a batch after a failed commit leaves the
    /// destination unchanged
    pub const fn is_idempotent(&self) -> bool {
        self.uses_staging()
    }

    /// Write `batch` inside `tx`
    pub async fn apply(
        &self,
        batch: &Batch,
        tx: &mut dyn DestinationTransaction,
        plan: &WritePlan,
    ) -> Result<ApplyOutcome> {
        match self {
            Self::BulkAppend => {
                let inserted = tx
                    .bulk_load(
                        &plan.destination,
                        batch.columns(),
                        batch.rows(),
                        plan.load_options(),
                    )
                    .await?;
                Ok(ApplyOutcome {
                    inserted,
                    deleted: 0,
                })
            }
            Self::ReconcilingMerge { only_changed } => {
                let mode = ReconcileMode::Replace {
                    only_changed: *only_changed,
                };
                stage_and_reconcile(batch, tx, plan, mode).await
            }
            Self::GapFill => stage_and_reconcile(batch, tx, plan, ReconcileMode::FillGaps).await,
        }
    }
}

impl fmt::Display for TransferStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BulkAppend => write!(f, "bulk-append"),
            Self::ReconcilingMerge {
                only_changed: false,
            } => write!(f, "reconciling-merge"),
            Self::ReconcilingMerge { only_changed: true } => {
                write!(f, "reconciling-merge (changed rows only)")
            }
            Self::GapFill => write!(f, "gap-fill"),
        }
    }
}

async fn stage_and_reconcile(
    batch: &Batch,
    tx: &mut dyn DestinationTransaction,
    plan: &WritePlan,
    mode: ReconcileMode,
) -> Result<ApplyOutcome> {
    let staging = plan.staging.as_ref().ok_or_else(|| {
        Error::internal(format!("no staging area prepared for {}", plan.destination))
    })?;
    tx.bulk_load(
        &staging.table,
        batch.columns(),
        batch.rows(),
        LoadOptions::STAGING,
    )
    .await?;
    tx.reconcile(plan, mode).await
}

/// Rows affected by one applied batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Rows inserted into the destination
    pub inserted: u64,
    /// Destination rows replaced (merge) or staged rows skipped (gap fill)
    pub deleted: u64,
}

/// Direction of the set-based match step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Destination rows matching a staged row are deleted, then every staged
    /// row is inserted
    Replace {
        /// Leave matching rows that are identical in place
        only_changed: bool,
    },
    /// Staged rows matching a destination row are discarded, then the rest
    /// are inserted
    FillGaps,
}

/// Destination-side table holding one batch before reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingArea {
    /// Staging table
    pub table: TableName,
    /// Lives in session-temporary storage
    pub temporary: bool,
    /// Table whose column definitions the staging table copies
    pub like: TableName,
    /// Staged columns, in batch order
    pub columns: Vec<String>,
    /// Unique key of the staging table
    pub key_columns: Vec<String>,
}

impl StagingArea {
    /// Statements dropping any stale copy and creating the staging table
    pub fn create_statements(&self, dialect: &dyn SqlDialect) -> Vec<String> {
        let mut statements = vec![dialect.drop_table_if_exists_sql(&self.table)];
        statements.extend(dialect.create_staging_sql(
            &self.table,
            self.temporary,
            &self.like,
            &self.columns,
            &self.key_columns,
        ));
        statements
    }

    /// Statement dropping the staging table
    pub fn drop_statement(&self, dialect: &dyn SqlDialect) -> String {
        dialect.drop_table_if_exists_sql(&self.table)
    }
}

/// Non-key column compared when detecting changed rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareColumn {
    /// Column name
    pub name: String,
    /// Conversion applied to both sides before comparison
    pub format: Option<&'static str>,
}

impl CompareColumn {
    fn expr(&self, dialect: &dyn SqlDialect, alias: &str) -> String {
        let column = dialect.column_ref(alias, &self.name);
        match self.format {
            Some(format) => format.replace("{}", &column),
            None => column,
        }
    }
}

/// What a reconcile statement's affected-row count means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEffect {
    /// Counts towards `ApplyOutcome::deleted`
    Deleted,
    /// Counts towards `ApplyOutcome::inserted`
    Inserted,
    /// Not reported
    Uncounted,
}

/// One rendered reconcile statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileStatement {
    /// SQL text, without parameters
    pub sql: String,
    /// Meaning of its row count
    pub effect: StepEffect,
}

impl ReconcileStatement {
    fn new(sql: String, effect: StepEffect) -> Self {
        Self { sql, effect }
    }
}

/// Everything needed to write batches of one transfer
#[derive(Debug, Clone)]
pub struct WritePlan {
    /// Destination table
    pub destination: TableName,
    /// Written columns, in batch order
    pub columns: Vec<String>,
    /// Destination key used to match staged rows
    pub merge_keys: Vec<String>,
    /// Non-key columns compared for change detection
    pub compare_columns: Vec<CompareColumn>,
    /// Destination has a surrogate identity receiving explicit values
    pub has_identity: bool,
    /// `columns` are exactly the destination's insertable columns in table
    /// order, so rows can go through the backend's bulk protocol
    pub full_row: bool,
    /// Staging area, for strategies that stage
    pub staging: Option<StagingArea>,
}

impl WritePlan {
    /// How batches are loaded straight into the destination
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            keep_identity: self.has_identity,
            full_row: self.full_row,
        }
    }

    /// Render the statements reconciling the staging table into the
    /// destination, ending with the staging table emptied
    pub fn reconcile_statements(
        &self,
        dialect: &dyn SqlDialect,
        mode: ReconcileMode,
    ) -> Result<Vec<ReconcileStatement>> {
        let staging = self.staging.as_ref().ok_or_else(|| {
            Error::internal(format!("no staging area prepared for {}", self.destination))
        })?;
        if self.merge_keys.is_empty() {
            return Err(Error::config(format!(
                "no merge key columns for {}",
                self.destination
            )));
        }

        let key_match = self
            .merge_keys
            .iter()
            .map(|k| {
                format!(
                    "{} = {}",
                    dialect.column_ref(DESTINATION_ALIAS, k),
                    dialect.column_ref(SOURCE_ALIAS, k)
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ");

        let mut statements = Vec::new();
        match mode {
            ReconcileMode::Replace { only_changed } => {
                let replace_condition = if only_changed {
                    self.rows_differ(dialect)
                        .map(|differ| format!("{} AND {}", key_match, differ))
                } else {
                    Some(key_match.clone())
                };
                // Without comparable non-key columns no matched row can differ
                if let Some(condition) = replace_condition {
                    statements.push(ReconcileStatement::new(
                        dialect.delete_joined_sql(
                            &self.destination,
                            DESTINATION_ALIAS,
                            &staging.table,
                            SOURCE_ALIAS,
                            &condition,
                        ),
                        StepEffect::Deleted,
                    ));
                }
                if only_changed {
                    statements.push(ReconcileStatement::new(
                        dialect.delete_joined_sql(
                            &staging.table,
                            SOURCE_ALIAS,
                            &self.destination,
                            DESTINATION_ALIAS,
                            &key_match,
                        ),
                        StepEffect::Uncounted,
                    ));
                }
            }
            ReconcileMode::FillGaps => {
                statements.push(ReconcileStatement::new(
                    dialect.delete_joined_sql(
                        &staging.table,
                        SOURCE_ALIAS,
                        &self.destination,
                        DESTINATION_ALIAS,
                        &key_match,
                    ),
                    StepEffect::Deleted,
                ));
            }
        }

        statements.push(ReconcileStatement::new(
            dialect.insert_select_sql(
                &self.destination,
                &self.columns,
                &staging.table,
                SOURCE_ALIAS,
                self.has_identity,
            ),
            StepEffect::Inserted,
        ));
        statements.push(ReconcileStatement::new(
            dialect.truncate_sql(&staging.table),
            StepEffect::Uncounted,
        ));
        Ok(statements)
    }

    fn rows_differ(&self, dialect: &dyn SqlDialect) -> Option<String> {
        if self.compare_columns.is_empty() {
            return None;
        }
        let left: Vec<String> = self
            .compare_columns
            .iter()
            .map(|c| c.expr(dialect, DESTINATION_ALIAS))
            .collect();
        let right: Vec<String> = self
            .compare_columns
            .iter()
            .map(|c| c.expr(dialect, SOURCE_ALIAS))
            .collect();
        Some(dialect.rows_differ_sql(&left, &right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{PostgresDialect, SqlServerDialect};

    fn plan(has_identity: bool) -> WritePlan {
        let destination = TableName::new(Some("dbo"), "orders");
        WritePlan {
            destination: destination.clone(),
            columns: vec!["id".into(), "note".into()],
            merge_keys: vec!["id".into()],
            compare_columns: vec![CompareColumn {
                name: "note".into(),
                format: Some("CONVERT(NVARCHAR(MAX), {})"),
            }],
            has_identity,
            full_row: true,
            staging: Some(StagingArea {
                table: TableName::new(None, "#stg"),
                temporary: true,
                like: destination,
                columns: vec!["id".into(), "note".into()],
                key_columns: vec!["id".into()],
            }),
        }
    }

    fn sql(statements: &[ReconcileStatement]) -> Vec<&str> {
        statements.iter().map(|s| s.sql.as_str()).collect()
    }

    #[test]
    fn test_replace_statements() {
        let statements = plan(false)
            .reconcile_statements(
                &SqlServerDialect,
                ReconcileMode::Replace {
                    only_changed: false,
                },
            )
            .unwrap();
        assert_eq!(
            sql(&statements),
            vec![
                "DELETE [DST] FROM [dbo].[orders] [DST] INNER JOIN [#stg] [SRC] ON [DST].[id] = [SRC].[id]",
                "INSERT INTO [dbo].[orders] ([id], [note]) SELECT [SRC].[id], [SRC].[note] FROM [#stg] [SRC]",
                "TRUNCATE TABLE [#stg]",
            ]
        );
        assert_eq!(statements[0].effect, StepEffect::Deleted);
        assert_eq!(statements[1].effect, StepEffect::Inserted);
        assert_eq!(statements[2].effect, StepEffect::Uncounted);
    }

    #[test]
    fn test_only_changed_compares_converted_columns() {
        let statements = plan(false)
            .reconcile_statements(&SqlServerDialect, ReconcileMode::Replace { only_changed: true })
            .unwrap();
        assert_eq!(statements.len(), 4);
        assert!(statements[0].sql.ends_with(
            "ON [DST].[id] = [SRC].[id] AND NOT EXISTS (SELECT CONVERT(NVARCHAR(MAX), [DST].[note]) \
             INTERSECT SELECT CONVERT(NVARCHAR(MAX), [SRC].[note]))"
        ));
        assert_eq!(
            statements[1].sql,
            "DELETE [SRC] FROM [#stg] [SRC] INNER JOIN [dbo].[orders] [DST] ON [DST].[id] = [SRC].[id]"
        );
        assert_eq!(statements[1].effect, StepEffect::Uncounted);
    }

    #[test]
    fn test_only_changed_without_compare_columns() {
        let mut p = plan(false);
        p.compare_columns.clear();
        let statements = p
            .reconcile_statements(&SqlServerDialect, ReconcileMode::Replace { only_changed: true })
            .unwrap();
        assert!(statements.iter().all(|s| s.effect != StepEffect::Deleted));
        assert!(statements[0].sql.starts_with("DELETE [SRC] FROM [#stg]"));
    }

    #[test]
    fn test_fill_gaps_statements() {
        let statements = plan(false)
            .reconcile_statements(&PostgresDialect, ReconcileMode::FillGaps)
            .unwrap();
        assert_eq!(
            statements[0].sql,
            "DELETE FROM \"#stg\" AS \"SRC\" USING \"dbo\".\"orders\" AS \"DST\" WHERE \"DST\".\"id\" = \"SRC\".\"id\""
        );
        assert_eq!(statements[0].effect, StepEffect::Deleted);
        assert_eq!(statements.len(), 3);
    }

    #[test]
    fn test_identity_insert_wraps_insert() {
        let statements = plan(true)
            .reconcile_statements(&SqlServerDialect, ReconcileMode::FillGaps)
            .unwrap();
        assert_eq!(statements.len(), 3);
        assert_eq!(
            statements[1].sql,
            "SET IDENTITY_INSERT [dbo].[orders] ON; \
             INSERT INTO [dbo].[orders] ([id], [note]) SELECT [SRC].[id], [SRC].[note] FROM [#stg] [SRC]; \
             SET IDENTITY_INSERT [dbo].[orders] OFF"
        );
        assert_eq!(statements[1].effect, StepEffect::Inserted);
        assert!(plan(true).load_options().keep_identity);

        let pg = plan(true)
            .reconcile_statements(&PostgresDialect, ReconcileMode::FillGaps)
            .unwrap();
        assert!(pg[1].sql.contains("OVERRIDING SYSTEM VALUE"));
    }

    #[test]
    fn test_missing_staging_is_internal_error() {
        let mut p = plan(false);
        p.staging = None;
        let err = p
            .reconcile_statements(&SqlServerDialect, ReconcileMode::FillGaps)
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[test]
    fn test_staging_create_statements() {
        let staging = plan(false).staging.unwrap();
        let statements = staging.create_statements(&SqlServerDialect);
        assert_eq!(statements[0], "DROP TABLE IF EXISTS [#stg]");
        assert!(statements[1].starts_with("SELECT [id], [note] INTO [#stg] FROM [dbo].[orders]"));
        assert_eq!(
            statements[2],
            "CREATE UNIQUE CLUSTERED INDEX [UCI_stg] ON [#stg] ([id])"
        );
        assert_eq!(staging.drop_statement(&SqlServerDialect), statements[0]);
    }

    #[test]
    fn test_strategy_flags() {
        assert!(!TransferStrategy::BulkAppend.uses_staging());
        assert!(!TransferStrategy::BulkAppend.is_idempotent());
        assert!(TransferStrategy::GapFill.is_idempotent());
        assert!(TransferStrategy::ReconcilingMerge { only_changed: true }.uses_staging());
        assert_eq!(TransferStrategy::default(), TransferStrategy::BulkAppend);
    }

    #[test]
    fn test_strategy_serde() {
        let s: TransferStrategy =
            serde_json::from_str(r#"{"type":"reconciling_merge","only_changed":true}"#).unwrap();
        assert_eq!(s, TransferStrategy::ReconcilingMerge { only_changed: true });
        let s: TransferStrategy = serde_json::from_str(r#"{"type":"gap_fill"}"#).unwrap();
        assert_eq!(s, TransferStrategy::GapFill);
    }
}
