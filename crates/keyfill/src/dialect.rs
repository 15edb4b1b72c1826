//! SQL dialect abstraction for keyfill
//!
//! Renders the statements a transfer issues: keyset probes and scans, staging
//! table lifecycle, multi-row inserts, and the set-based reconcile steps.
//! PostgreSQL SELECTs are built with sea-query; SQL Server has no sea-query
//! backend and is rendered by hand.

use sea_query::{Alias, Expr, IntoIden, JoinType, Order, PostgresQueryBuilder, Query, TableRef};
use std::sync::Arc;

use crate::catalog::{PartitionScheme, TableName, TypeTraits};
use crate::error::{Error, Result};

/// Alias of the source table in fetch queries and of the staging table in
/// reconcile statements
pub const SOURCE_ALIAS: &str = "SRC";
/// Alias of the destination table in reconcile statements
pub const DESTINATION_ALIAS: &str = "DST";
/// Alias of the related table joined into a batch scan
pub const RELATED_ALIAS: &str = "REL";
/// Alias of the derived table wrapped by a limit probe
pub const LIMIT_ALIAS: &str = "LIM";

/// One projected expression
#[derive(Debug, Clone, PartialEq)]
pub struct SelectColumn {
    /// Rendered SQL expression
    pub expr: String,
    /// Output column name
    pub alias: String,
}

/// Left join of a related table
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    /// Joined table
    pub table: TableName,
    /// Alias of the joined table
    pub alias: String,
    /// Rendered join condition
    pub on: String,
}

/// Dialect-neutral SELECT description
#[derive(Debug, Clone, PartialEq)]
pub struct SelectSpec {
    /// Projection
    pub columns: Vec<SelectColumn>,
    /// Table read from
    pub table: TableName,
    /// Alias of `table`
    pub alias: String,
    /// Optional related-table join
    pub join: Option<JoinSpec>,
    /// Rendered WHERE clause
    pub where_clause: Option<String>,
    /// Ascending ORDER BY expressions
    pub order_by: Vec<String>,
    /// Row limit
    pub limit: Option<u64>,
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a 1-based parameter (e.g., $1, @p1)
    fn placeholder(&self, index: usize) -> String;

    /// Quoted, schema-qualified table reference
    fn qualified_table(&self, table: &TableName) -> String {
        match &table.schema {
            Some(s) => format!(
                "{}.{}",
                self.quote_identifier(s),
                self.quote_identifier(&table.name)
            ),
            None => self.quote_identifier(&table.name),
        }
    }

    /// `alias.column`, both quoted
    fn column_ref(&self, alias: &str, column: &str) -> String {
        format!(
            "{}.{}",
            self.quote_identifier(alias),
            self.quote_identifier(column)
        )
    }

    /// Comparison and copy behaviour of a vendor type name
    fn type_traits(&self, data_type: &str) -> TypeTraits;

    /// Maximum bind parameters per statement
    fn max_params(&self) -> usize;

    /// Maximum rows in one multi-row VALUES list
    fn max_rows_per_insert(&self) -> usize;

    /// Expression yielding the partition number of `column_expr`
    fn partition_expr(&self, scheme: &PartitionScheme, column_expr: &str) -> Result<String>;

    /// Render a SELECT
    fn build_select(&self, select: &SelectSpec) -> String;

    /// Wrap `inner` (ordered ascending by key, limited to N rows) so that
    /// only the last row's key columns come back.
    ///
    /// `key_order` are the key comparison expressions over the
    /// [`LIMIT_ALIAS`] columns, the same ones `inner` orders by.
    fn build_limit_probe(
        &self,
        inner: &SelectSpec,
        key_aliases: &[String],
        key_order: &[String],
    ) -> String;

    /// Multi-row INSERT with placeholders numbered from 1.
    ///
    /// With `keep_identity` the returned text is one batch that also enables
    /// explicit identity values for its own duration.
    fn insert_values_sql(
        &self,
        table: &TableName,
        columns: &[String],
        rows: usize,
        keep_identity: bool,
    ) -> String;

    /// INSERT ... SELECT of `columns` from `source` aliased `source_alias`
    fn insert_select_sql(
        &self,
        target: &TableName,
        columns: &[String],
        source: &TableName,
        source_alias: &str,
        keep_identity: bool,
    ) -> String;

    /// Table name for a staging area
    fn staging_table(&self, base_name: &str, temporary: bool, work_schema: &str) -> TableName;

    /// Statements creating an empty staging table shaped like `columns` of
    /// `like`, with a unique index on `key_columns`
    fn create_staging_sql(
        &self,
        staging: &TableName,
        temporary: bool,
        like: &TableName,
        columns: &[String],
        key_columns: &[String],
    ) -> Vec<String>;

    /// DROP TABLE IF EXISTS
    fn drop_table_if_exists_sql(&self, table: &TableName) -> String {
        format!("DROP TABLE IF EXISTS {}", self.qualified_table(table))
    }

    /// Empty a table
    fn truncate_sql(&self, table: &TableName) -> String {
        format!("TRUNCATE TABLE {}", self.qualified_table(table))
    }

    /// Delete rows of `target` that have a match in `other` under `condition`
    fn delete_joined_sql(
        &self,
        target: &TableName,
        target_alias: &str,
        other: &TableName,
        other_alias: &str,
        condition: &str,
    ) -> String;

    /// Null-safe "these two rows differ" over paired expressions
    fn rows_differ_sql(&self, left: &[String], right: &[String]) -> String;
}

fn sea_table_ref(table: &TableName) -> TableRef {
    match &table.schema {
        Some(s) => TableRef::SchemaTable(
            Alias::new(s).into_iden(),
            Alias::new(&table.name).into_iden(),
        ),
        None => TableRef::Table(Alias::new(&table.name).into_iden()),
    }
}

fn pg_select(spec: &SelectSpec) -> sea_query::SelectStatement {
    let mut stmt = Query::select();
    for col in &spec.columns {
        stmt.expr_as(Expr::cust(col.expr.clone()), Alias::new(&col.alias));
    }
    stmt.from_as(sea_table_ref(&spec.table), Alias::new(&spec.alias));
    if let Some(join) = &spec.join {
        stmt.join_as(
            JoinType::LeftJoin,
            sea_table_ref(&join.table),
            Alias::new(&join.alias),
            Expr::cust(join.on.clone()),
        );
    }
    if let Some(w) = &spec.where_clause {
        stmt.and_where(Expr::cust(w.clone()));
    }
    for expr in &spec.order_by {
        stmt.order_by_expr(Expr::cust(expr.clone()), Order::Asc);
    }
    if let Some(l) = spec.limit {
        stmt.limit(l);
    }
    stmt
}

// ===========================================================================
// PostgreSQL
// ===========================================================================

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn type_traits(&self, data_type: &str) -> TypeTraits {
        match data_type.to_lowercase().as_str() {
            "json" | "xml" => TypeTraits::converted("({})::text"),
            _ => TypeTraits::PLAIN,
        }
    }

    fn max_params(&self) -> usize {
        65_535
    }

    fn max_rows_per_insert(&self) -> usize {
        5_000
    }

    fn partition_expr(&self, _scheme: &PartitionScheme, _column_expr: &str) -> Result<String> {
        Err(Error::unsupported(
            "partition-scoped fetches are not supported on PostgreSQL",
        ))
    }

    fn build_select(&self, select: &SelectSpec) -> String {
        pg_select(select).to_string(PostgresQueryBuilder)
    }

    fn build_limit_probe(
        &self,
        inner: &SelectSpec,
        key_aliases: &[String],
        key_order: &[String],
    ) -> String {
        let mut outer = Query::select();
        for key in key_aliases {
            outer.column(Alias::new(key));
        }
        outer.from_subquery(pg_select(inner), Alias::new(LIMIT_ALIAS));
        for expr in key_order {
            outer.order_by_expr(Expr::cust(expr.clone()), Order::Desc);
        }
        outer.limit(1);
        outer.to_string(PostgresQueryBuilder)
    }

    fn insert_values_sql(
        &self,
        table: &TableName,
        columns: &[String],
        rows: usize,
        keep_identity: bool,
    ) -> String {
        let tuples = values_tuples(self, columns.len(), rows);
        format!(
            "INSERT INTO {} ({}){} VALUES {}",
            self.qualified_table(table),
            quoted_list(self, columns),
            if keep_identity {
                " OVERRIDING SYSTEM VALUE"
            } else {
                ""
            },
            tuples
        )
    }

    fn insert_select_sql(
        &self,
        target: &TableName,
        columns: &[String],
        source: &TableName,
        source_alias: &str,
        keep_identity: bool,
    ) -> String {
        format!(
            "INSERT INTO {} ({}){} SELECT {} FROM {} AS {}",
            self.qualified_table(target),
            quoted_list(self, columns),
            if keep_identity {
                " OVERRIDING SYSTEM VALUE"
            } else {
                ""
            },
            aliased_list(self, source_alias, columns),
            self.qualified_table(source),
            self.quote_identifier(source_alias)
        )
    }

    fn staging_table(&self, base_name: &str, temporary: bool, work_schema: &str) -> TableName {
        if temporary {
            TableName::new(None, base_name)
        } else {
            TableName::new(Some(work_schema), base_name)
        }
    }

    fn create_staging_sql(
        &self,
        staging: &TableName,
        temporary: bool,
        like: &TableName,
        columns: &[String],
        key_columns: &[String],
    ) -> Vec<String> {
        vec![
            format!(
                "CREATE {}TABLE {} AS SELECT {} FROM {} WITH NO DATA",
                if temporary { "TEMP " } else { "" },
                self.qualified_table(staging),
                quoted_list(self, columns),
                self.qualified_table(like)
            ),
            format!(
                "CREATE UNIQUE INDEX {} ON {} ({})",
                self.quote_identifier(&format!("{}_key", staging.name)),
                self.qualified_table(staging),
                quoted_list(self, key_columns)
            ),
        ]
    }

    fn delete_joined_sql(
        &self,
        target: &TableName,
        target_alias: &str,
        other: &TableName,
        other_alias: &str,
        condition: &str,
    ) -> String {
        format!(
            "DELETE FROM {} AS {} USING {} AS {} WHERE {}",
            self.qualified_table(target),
            self.quote_identifier(target_alias),
            self.qualified_table(other),
            self.quote_identifier(other_alias),
            condition
        )
    }

    fn rows_differ_sql(&self, left: &[String], right: &[String]) -> String {
        format!(
            "ROW({}) IS DISTINCT FROM ROW({})",
            left.join(", "),
            right.join(", ")
        )
    }
}

// ===========================================================================
// SQL Server: hand-written SQL, sea-query has no T-SQL backend
// ===========================================================================

/// SQL Server dialect
#[derive(Debug, Clone, Default)]
pub struct SqlServerDialect;

impl SqlServerDialect {
    /// Bracket `insert` with IDENTITY_INSERT switches in the same batch.
    ///
    /// Parameterized statements run inside `sp_executesql`, where a SET
    /// issued by an earlier call is no longer in effect.
    fn with_identity_insert(
        &self,
        table: &TableName,
        insert: String,
        keep_identity: bool,
    ) -> String {
        if !keep_identity {
            return insert;
        }
        let table = self.qualified_table(table);
        format!("SET IDENTITY_INSERT {table} ON; {insert}; SET IDENTITY_INSERT {table} OFF")
    }
}

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@p{}", index)
    }

    fn type_traits(&self, data_type: &str) -> TypeTraits {
        match data_type.to_lowercase().as_str() {
            "timestamp" | "rowversion" => TypeTraits::NEVER_COPIED,
            "text" => TypeTraits::converted("CONVERT(VARCHAR(MAX), {})"),
            "ntext" | "xml" => TypeTraits::converted("CONVERT(NVARCHAR(MAX), {})"),
            "image" | "geography" | "geometry" => {
                TypeTraits::converted("CONVERT(VARBINARY(MAX), {})")
            }
            _ => TypeTraits::PLAIN,
        }
    }

    fn max_params(&self) -> usize {
        2_100 - 1
    }

    fn max_rows_per_insert(&self) -> usize {
        1_000
    }

    fn partition_expr(&self, scheme: &PartitionScheme, column_expr: &str) -> Result<String> {
        Ok(format!(
            "$PARTITION.{}({})",
            self.quote_identifier(&scheme.function),
            column_expr
        ))
    }

    fn build_select(&self, select: &SelectSpec) -> String {
        let cols: Vec<_> = select
            .columns
            .iter()
            .map(|c| format!("{} AS {}", c.expr, self.quote_identifier(&c.alias)))
            .collect();

        let mut sql = String::from("SELECT ");
        if let Some(l) = select.limit {
            sql.push_str(&format!("TOP ({}) ", l));
        }
        sql.push_str(&format!(
            "{} FROM {} {}",
            cols.join(", "),
            self.qualified_table(&select.table),
            self.quote_identifier(&select.alias)
        ));

        if let Some(join) = &select.join {
            sql.push_str(&format!(
                " LEFT JOIN {} {} ON {}",
                self.qualified_table(&join.table),
                self.quote_identifier(&join.alias),
                join.on
            ));
        }

        if let Some(w) = &select.where_clause {
            sql.push_str(&format!(" WHERE {}", w));
        }

        if !select.order_by.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", select.order_by.join(", ")));
        }
        sql
    }

    fn build_limit_probe(
        &self,
        inner: &SelectSpec,
        key_aliases: &[String],
        key_order: &[String],
    ) -> String {
        let keys = quoted_list(self, key_aliases);
        let order: Vec<_> = key_order.iter().map(|e| format!("{} DESC", e)).collect();
        format!(
            "SELECT TOP (1) {} FROM ({}) {} ORDER BY {}",
            keys,
            self.build_select(inner),
            self.quote_identifier(LIMIT_ALIAS),
            order.join(", ")
        )
    }

    fn insert_values_sql(
        &self,
        table: &TableName,
        columns: &[String],
        rows: usize,
        keep_identity: bool,
    ) -> String {
        let insert = format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.qualified_table(table),
            quoted_list(self, columns),
            values_tuples(self, columns.len(), rows)
        );
        self.with_identity_insert(table, insert, keep_identity)
    }

    fn insert_select_sql(
        &self,
        target: &TableName,
        columns: &[String],
        source: &TableName,
        source_alias: &str,
        keep_identity: bool,
    ) -> String {
        let insert = format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} {}",
            self.qualified_table(target),
            quoted_list(self, columns),
            aliased_list(self, source_alias, columns),
            self.qualified_table(source),
            self.quote_identifier(source_alias)
        );
        self.with_identity_insert(target, insert, keep_identity)
    }

    fn staging_table(&self, base_name: &str, temporary: bool, work_schema: &str) -> TableName {
        if temporary {
            TableName::new(None, format!("#{}", base_name))
        } else {
            TableName::new(Some(work_schema), base_name)
        }
    }

    fn create_staging_sql(
        &self,
        staging: &TableName,
        _temporary: bool,
        like: &TableName,
        columns: &[String],
        key_columns: &[String],
    ) -> Vec<String> {
        let cols = quoted_list(self, columns);
        let like = self.qualified_table(like);
        let index = format!("UCI_{}", staging.name.trim_start_matches('#'));
        vec![
            // UNION ALL drops the IDENTITY property from the copied column
            format!(
                "SELECT {cols} INTO {} FROM {like} WHERE 1 = 0 UNION ALL SELECT {cols} FROM {like} WHERE 1 = 0",
                self.qualified_table(staging)
            ),
            format!(
                "CREATE UNIQUE CLUSTERED INDEX {} ON {} ({})",
                self.quote_identifier(&index),
                self.qualified_table(staging),
                quoted_list(self, key_columns)
            ),
        ]
    }

    fn delete_joined_sql(
        &self,
        target: &TableName,
        target_alias: &str,
        other: &TableName,
        other_alias: &str,
        condition: &str,
    ) -> String {
        format!(
            "DELETE {ta} FROM {} {ta} INNER JOIN {} {} ON {}",
            self.qualified_table(target),
            self.qualified_table(other),
            self.quote_identifier(other_alias),
            condition,
            ta = self.quote_identifier(target_alias)
        )
    }

    fn rows_differ_sql(&self, left: &[String], right: &[String]) -> String {
        format!(
            "NOT EXISTS (SELECT {} INTERSECT SELECT {})",
            left.join(", "),
            right.join(", ")
        )
    }
}

fn quoted_list(dialect: &dyn SqlDialect, names: &[String]) -> String {
    names
        .iter()
        .map(|n| dialect.quote_identifier(n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn aliased_list(dialect: &dyn SqlDialect, alias: &str, names: &[String]) -> String {
    names
        .iter()
        .map(|n| dialect.column_ref(alias, n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn values_tuples(dialect: &dyn SqlDialect, width: usize, rows: usize) -> String {
    (0..rows)
        .map(|r| {
            let params: Vec<_> = (1..=width)
                .map(|c| dialect.placeholder(r * width + c))
                .collect();
            format!("({})", params.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Get a dialect instance by database type name
pub fn dialect_for(name: &str) -> Result<Arc<dyn SqlDialect>> {
    match name.to_lowercase().as_str() {
        "postgres" | "postgresql" => Ok(Arc::new(PostgresDialect)),
        "sqlserver" | "mssql" => Ok(Arc::new(SqlServerDialect)),
        other => Err(Error::unsupported(format!("no SQL dialect for '{}'", other))),
    }
}
