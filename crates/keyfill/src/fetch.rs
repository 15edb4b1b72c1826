//! Fetch query construction
//!
//! Given a [`KeyBoundary`], [`FetchQueryBuilder`] produces the two queries a
//! pump iteration runs against the source:
//!
//! 1. a [`LimitProbe`] selecting only key columns that returns the key of the
//!    Nth row (or the last row) after the cursor, and
//! 2. a [`BatchScan`] selecting the full projection for every row in
//!    `(cursor, limit]`, ordered by key.
//!
//! Both share one WHERE construction: partition scoping, the lower bound from
//! the cursor, the inclusive end keys, and an optional configured filter.

use std::sync::Arc;

use crate::boundary::KeyBoundary;
use crate::catalog::{ColumnDescriptor, TableDescriptor, TableName};
use crate::dialect::{
    JoinSpec, SelectColumn, SelectSpec, SqlDialect, LIMIT_ALIAS, RELATED_ALIAS, SOURCE_ALIAS,
};
use crate::error::{Error, Result};
use crate::predicate::Predicate;
use crate::security::validate_sql_fragment;
use crate::types::{KeyTuple, Value};

/// One output column of a batch scan
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedColumn {
    /// Output (destination) column name
    pub name: String,
    /// Load expression over the source row; `None` copies the source column
    /// of the same name
    pub expression: Option<String>,
}

/// Left join of a related table providing extra output columns
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedJoin {
    /// Related table
    pub table: TableName,
    /// `(source column, related column)` equality pairs
    pub join_columns: Vec<(String, String)>,
    /// Related-table columns copied into the output
    pub columns: Vec<String>,
}

/// Output columns of a batch scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    columns: Vec<ProjectedColumn>,
    join: Option<RelatedJoin>,
}

impl Projection {
    /// Copy the named source columns
    pub fn columns<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: names
                .into_iter()
                .map(|n| ProjectedColumn {
                    name: n.into(),
                    expression: None,
                })
                .collect(),
            join: None,
        }
    }

    /// Load `name` from `expression` instead of copying it
    pub fn with_expression(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        let name = name.into();
        let expression = Some(expression.into());
        match self
            .columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(&name))
        {
            Some(col) => col.expression = expression,
            None => self.columns.push(ProjectedColumn { name, expression }),
        }
        self
    }

    /// Join a related table
    pub fn with_join(mut self, join: RelatedJoin) -> Self {
        self.join = Some(join);
        self
    }

    /// Projected source columns
    pub fn projected(&self) -> &[ProjectedColumn] {
        &self.columns
    }

    /// Related-table join, if any
    pub fn join(&self) -> Option<&RelatedJoin> {
        self.join.as_ref()
    }

    /// Output column names in row order
    pub fn output_columns(&self) -> Vec<String> {
        let mut names: Vec<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        if let Some(join) = &self.join {
            names.extend(join.columns.iter().cloned());
        }
        names
    }
}

/// Query returning the key tuple of the last row of the next batch
#[derive(Debug, Clone)]
pub struct LimitProbe {
    /// Rendered SQL
    pub sql: String,
    /// Bound parameters, in placeholder order
    pub params: Vec<Value>,
    /// Range predicate over key columns, indexed like `params`
    pub predicate: Predicate,
    /// Source table
    pub table: TableName,
    /// Key columns, most significant first
    pub key_columns: Arc<[String]>,
    /// Partition the probe is scoped to
    pub partition: Option<u32>,
    /// Rows per batch
    pub batch_size: u32,
    /// Configured extra filter
    pub filter: Option<String>,
}

/// Query returning every row of one batch
#[derive(Debug, Clone)]
pub struct BatchScan {
    /// Rendered SQL
    pub sql: String,
    /// Bound parameters, in placeholder order
    pub params: Vec<Value>,
    /// Range predicate over key columns, indexed like `params`
    pub predicate: Predicate,
    /// Source table
    pub table: TableName,
    /// Key columns, most significant first
    pub key_columns: Arc<[String]>,
    /// Partition the scan is scoped to, or the synthetic partition
    pub partition: u32,
    /// Whether the partition is scoped in the predicate
    pub partition_scoped: bool,
    /// Output columns
    pub projection: Projection,
    /// Inclusive upper bound
    pub upper: KeyTuple,
    /// Last batch of the partition
    pub is_final: bool,
    /// Configured extra filter
    pub filter: Option<String>,
}

/// Builds limit probes and batch scans for one source table
pub struct FetchQueryBuilder {
    dialect: Arc<dyn SqlDialect>,
    table: TableName,
    key_names: Arc<[String]>,
    key_exprs: Vec<String>,
    limit_order: Vec<String>,
    projection: Projection,
    partition_expr: Option<String>,
    filter: Option<String>,
    batch_size: u32,
}

impl std::fmt::Debug for FetchQueryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchQueryBuilder")
            .field("dialect", &self.dialect.name())
            .field("table", &self.table)
            .field("key_columns", &self.key_names)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl FetchQueryBuilder {
    /// Create a builder.
    ///
    /// Fails when there are no key columns, a key column is missing or not
    /// comparable, a projected column is missing or not copyable, or the
    /// batch size is zero.
    pub fn new(
        dialect: Arc<dyn SqlDialect>,
        source: &TableDescriptor,
        key_columns: &[String],
        projection: Projection,
        batch_size: u32,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch size must be greater than zero"));
        }
        if key_columns.is_empty() {
            return Err(Error::config("at least one key column is required"));
        }

        let keys = key_columns
            .iter()
            .map(|name| {
                let col = source.require_column(name)?;
                if !col.is_comparable() {
                    return Err(Error::schema(format!(
                        "key column '{}' of type {} cannot be compared",
                        col.name, col.data_type
                    )));
                }
                Ok(col.clone())
            })
            .collect::<Result<Vec<ColumnDescriptor>>>()?;

        for col in projection.projected() {
            match &col.expression {
                Some(expr) => validate_sql_fragment("load expression", expr)?,
                None => {
                    let desc = source.require_column(&col.name)?;
                    if !desc.is_copyable() {
                        return Err(Error::schema(format!(
                            "column '{}' of type {} cannot be copied",
                            desc.name, desc.data_type
                        )));
                    }
                }
            }
        }
        if let Some(join) = projection.join() {
            if join.join_columns.is_empty() {
                return Err(Error::config(format!(
                    "join with {} has no join columns",
                    join.table
                )));
            }
            for (src, _) in &join.join_columns {
                source.require_column(src)?;
            }
        }

        let key_exprs = keys
            .iter()
            .map(|k| k.compare_expr(&dialect.column_ref(SOURCE_ALIAS, &k.name)))
            .collect();
        let limit_order = keys
            .iter()
            .map(|k| k.compare_expr(&dialect.column_ref(LIMIT_ALIAS, &k.name)))
            .collect();

        let partition_expr = match &source.partitioning {
            Some(scheme) if source.is_partitioning_column(&keys[0].name) => Some(
                dialect.partition_expr(scheme, &dialect.column_ref(SOURCE_ALIAS, &keys[0].name))?,
            ),
            _ => None,
        };

        Ok(Self {
            dialect,
            table: source.name.clone(),
            key_names: keys.into_iter().map(|k| k.name).collect(),
            key_exprs,
            limit_order,
            projection,
            partition_expr,
            filter: None,
            batch_size,
        })
    }

    /// Apply an extra filter to every probe and scan
    pub fn with_filter(mut self, filter: impl Into<String>) -> Result<Self> {
        let filter = filter.into();
        validate_sql_fragment("filter", &filter)?;
        self.filter = Some(filter);
        Ok(self)
    }

    /// Whether the source supports partition-scoped fetches on this key
    pub fn supports_partition_scoping(&self) -> bool {
        self.partition_expr.is_some()
    }

    /// Key column names
    pub fn key_columns(&self) -> &[String] {
        &self.key_names
    }

    /// Rows per batch
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Probe for the key of the last row of the next batch
    pub fn limit_probe(&self, boundary: &KeyBoundary) -> Result<LimitProbe> {
        let (predicate, params) = self.range_predicate(boundary, None)?;
        let inner = SelectSpec {
            columns: self
                .key_names
                .iter()
                .map(|k| SelectColumn {
                    expr: self.dialect.column_ref(SOURCE_ALIAS, k),
                    alias: k.clone(),
                })
                .collect(),
            table: self.table.clone(),
            alias: SOURCE_ALIAS.to_string(),
            join: None,
            where_clause: self.where_clause(&predicate)?,
            order_by: self.key_exprs.clone(),
            limit: Some(u64::from(self.batch_size)),
        };

        Ok(LimitProbe {
            sql: self
                .dialect
                .build_limit_probe(&inner, &self.key_names, &self.limit_order),
            params,
            predicate,
            table: self.table.clone(),
            key_columns: Arc::clone(&self.key_names),
            partition: boundary
                .is_partition_scoped()
                .then_some(boundary.partition()),
            batch_size: self.batch_size,
            filter: self.filter.clone(),
        })
    }

    /// Scan every row in `(cursor, upper]`
    pub fn batch_scan(
        &self,
        boundary: &KeyBoundary,
        upper: &KeyTuple,
        is_final: bool,
    ) -> Result<BatchScan> {
        let (predicate, params) = self.range_predicate(boundary, Some(upper))?;

        let mut columns: Vec<SelectColumn> = self
            .projection
            .projected()
            .iter()
            .map(|c| SelectColumn {
                expr: c
                    .expression
                    .clone()
                    .unwrap_or_else(|| self.dialect.column_ref(SOURCE_ALIAS, &c.name)),
                alias: c.name.clone(),
            })
            .collect();

        let join = self.projection.join().map(|j| {
            columns.extend(j.columns.iter().map(|c| SelectColumn {
                expr: self.dialect.column_ref(RELATED_ALIAS, c),
                alias: c.clone(),
            }));
            JoinSpec {
                table: j.table.clone(),
                alias: RELATED_ALIAS.to_string(),
                on: j
                    .join_columns
                    .iter()
                    .map(|(s, r)| {
                        format!(
                            "{} = {}",
                            self.dialect.column_ref(SOURCE_ALIAS, s),
                            self.dialect.column_ref(RELATED_ALIAS, r)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" AND "),
            }
        });

        let spec = SelectSpec {
            columns,
            table: self.table.clone(),
            alias: SOURCE_ALIAS.to_string(),
            join,
            where_clause: self.where_clause(&predicate)?,
            order_by: self.key_exprs.clone(),
            limit: None,
        };

        Ok(BatchScan {
            sql: self.dialect.build_select(&spec),
            params,
            predicate,
            table: self.table.clone(),
            key_columns: Arc::clone(&self.key_names),
            partition: boundary.partition(),
            partition_scoped: boundary.is_partition_scoped(),
            projection: self.projection.clone(),
            upper: upper.clone(),
            is_final,
            filter: self.filter.clone(),
        })
    }

    fn range_predicate(
        &self,
        boundary: &KeyBoundary,
        upper: Option<&KeyTuple>,
    ) -> Result<(Predicate, Vec<Value>)> {
        let mut parts = Vec::new();
        let mut params = Vec::new();

        if boundary.is_partition_scoped() {
            if self.partition_expr.is_none() {
                return Err(Error::config(format!(
                    "partition scoping requires '{}' to be the partitioning column of {}",
                    self.key_names[0], self.table
                )));
            }
            parts.push(Predicate::Partition {
                param: params.len(),
            });
            params.push(partition_param(boundary.partition())?);
        }

        if let Some((p, values)) = boundary.lower_bound(params.len()) {
            parts.push(p);
            params.extend(values);
        }
        if let Some((p, values)) = boundary.end_bound(params.len()) {
            parts.push(p);
            params.extend(values);
        }
        if let Some(upper) = upper {
            let (p, values) = KeyBoundary::upper_bound(upper, params.len());
            parts.push(p);
            params.extend(values);
        }

        Ok((Predicate::and(parts), params))
    }

    fn where_clause(&self, predicate: &Predicate) -> Result<Option<String>> {
        let range = if predicate.is_always_true() {
            None
        } else {
            Some(predicate.render(
                &self.key_exprs,
                self.partition_expr.as_deref(),
                self.dialect.as_ref(),
            )?)
        };
        Ok(match (range, &self.filter) {
            (Some(r), Some(f)) => Some(format!("{} AND ({})", r, f)),
            (Some(r), None) => Some(r),
            (None, Some(f)) => Some(format!("({})", f)),
            (None, None) => None,
        })
    }
}

fn partition_param(partition: u32) -> Result<Value> {
    i32::try_from(partition)
        .map(Value::Int32)
        .map_err(|_| Error::config(format!("partition number {} out of range", partition)))
}
