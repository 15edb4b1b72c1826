//! PostgreSQL backend
//!
//! Provides:
//! - [`PgConnection`]: a pipelined tokio-postgres client, loading batches
//!   with binary `COPY`
//! - [`PgCatalog`]: columns, identity and unique-key ordinals from
//!   `pg_catalog`
//!
//! PostgreSQL tables are iterated as a single partition.

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use crate::catalog::{Catalog, ColumnDescriptor, PartitionInfo, TableDescriptor, TableName};
use crate::connection::{with_timeout, Connection, ConnectionConfig, LoadOptions, Transaction};
use crate::dialect::{PostgresDialect, SqlDialect};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Parameter encoded against the type the server inferred for its
/// placeholder, so an `Int64` cursor value binds to an `integer` key column.
#[derive(Debug)]
struct PgParam(Value);

type EncodeResult = std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>>;

fn encode_int(n: i64, ty: &Type, out: &mut BytesMut) -> EncodeResult {
    match *ty {
        Type::INT2 => i16::try_from(n)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(n)?.to_sql(ty, out),
        Type::NUMERIC => rust_decimal::Decimal::from(n).to_sql(ty, out),
        Type::FLOAT8 => (n as f64).to_sql(ty, out),
        _ => n.to_sql(ty, out),
    }
}

impl ToSql for PgParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> EncodeResult {
        match &self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int16(n) => encode_int(i64::from(*n), ty, out),
            Value::Int32(n) => encode_int(i64::from(*n), ty, out),
            Value::Int64(n) => encode_int(*n, ty, out),
            Value::Float32(n) if *ty == Type::FLOAT8 => f64::from(*n).to_sql(ty, out),
            Value::Float32(n) => n.to_sql(ty, out),
            Value::Float64(n) if *ty == Type::FLOAT4 => (*n as f32).to_sql(ty, out),
            Value::Float64(n) => n.to_sql(ty, out),
            Value::Decimal(d) => d.to_sql(ty, out),
            Value::String(s) => s.to_sql(ty, out),
            Value::Bytes(b) => b.to_sql(ty, out),
            Value::Date(d) => d.to_sql(ty, out),
            Value::Time(t) => t.to_sql(ty, out),
            Value::DateTime(dt) => dt.to_sql(ty, out),
            Value::DateTimeTz(dt) => dt.to_sql(ty, out),
            Value::Uuid(u) => u.to_sql(ty, out),
            Value::Json(j) => j.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn pg_params(params: &[Value]) -> Vec<PgParam> {
    params.iter().cloned().map(PgParam).collect()
}

fn param_refs(params: &[PgParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();
    Row::new(columns, values)
}

fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    let value = match *pg_type {
        Type::BOOL => get(row, idx).map(Value::Bool),
        Type::INT2 => get(row, idx).map(Value::Int16),
        Type::INT4 => get(row, idx).map(Value::Int32),
        Type::INT8 => get(row, idx).map(Value::Int64),
        Type::FLOAT4 => get(row, idx).map(Value::Float32),
        Type::FLOAT8 => get(row, idx).map(Value::Float64),
        Type::NUMERIC => get(row, idx).map(Value::Decimal),
        Type::BYTEA => get(row, idx).map(Value::Bytes),
        Type::DATE => get(row, idx).map(Value::Date),
        Type::TIME => get(row, idx).map(Value::Time),
        Type::TIMESTAMP => get(row, idx).map(Value::DateTime),
        Type::TIMESTAMPTZ => get(row, idx).map(Value::DateTimeTz),
        Type::UUID => get(row, idx).map(Value::Uuid),
        Type::JSON | Type::JSONB => get(row, idx).map(Value::Json),
        _ => get(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

/// Classify a tokio-postgres error by SQLSTATE
fn map_error(err: tokio_postgres::Error, sql: &str) -> Error {
    if err.is_closed() {
        return Error::connection_with_source("connection closed", err);
    }
    let Some(state) = err.code() else {
        return Error::query_with_sql(err.to_string(), sql);
    };
    let code = state.code();
    let message = err
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| err.to_string());

    if code == "40P01" {
        Error::Deadlock
    } else if code.starts_with("23") {
        let constraint = err
            .as_db_error()
            .and_then(|db| db.constraint())
            .unwrap_or(code)
            .to_string();
        Error::constraint(constraint, message)
    } else if code.starts_with("22") {
        Error::type_conversion(message)
    } else if code.starts_with("28") {
        Error::Authentication { message }
    } else if code.starts_with("08") {
        Error::connection_with_source(message, err)
    } else {
        Error::query_with_sql(format!("{} ({})", message, code), sql)
    }
}

async fn run_query(
    client: &tokio_postgres::Client,
    timeout: Option<Duration>,
    sql: &str,
    params: &[Value],
) -> Result<Vec<Row>> {
    let params = pg_params(params);
    let refs = param_refs(&params);
    let rows = with_timeout(timeout, "query", async {
        client.query(sql, &refs).await.map_err(|e| map_error(e, sql))
    })
    .await?;
    Ok(rows.iter().map(pg_row_to_row).collect())
}

async fn run_execute(
    client: &tokio_postgres::Client,
    timeout: Option<Duration>,
    sql: &str,
    params: &[Value],
) -> Result<u64> {
    let params = pg_params(params);
    let refs = param_refs(&params);
    with_timeout(timeout, "statement", async {
        client.execute(sql, &refs).await.map_err(|e| map_error(e, sql))
    })
    .await
}

async fn run_script(
    client: &tokio_postgres::Client,
    timeout: Option<Duration>,
    sql: &str,
) -> Result<()> {
    with_timeout(timeout, "batch", async {
        client.batch_execute(sql).await.map_err(|e| map_error(e, sql))
    })
    .await
}

fn copy_columns(dialect: &PostgresDialect, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| dialect.quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Binary `COPY ... FROM STDIN` of `rows`. Column types come from a
/// zero-row prepared select so values encode as the table expects.
async fn copy_rows(
    client: &tokio_postgres::Client,
    timeout: Option<Duration>,
    table: &TableName,
    columns: &[String],
    rows: &[Row],
) -> Result<u64> {
    let dialect = PostgresDialect;
    let target = dialect.qualified_table(table);
    let column_list = copy_columns(&dialect, columns);
    let shape_sql = format!("SELECT {} FROM {} LIMIT 0", column_list, target);
    let copy_sql = format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT binary)",
        target, column_list
    );

    with_timeout(timeout, "copy", async {
        let shape = client
            .prepare(&shape_sql)
            .await
            .map_err(|e| map_error(e, &shape_sql))?;
        let types: Vec<Type> = shape.columns().iter().map(|c| c.type_().clone()).collect();

        let sink = client
            .copy_in(copy_sql.as_str())
            .await
            .map_err(|e| map_error(e, &copy_sql))?;
        let mut writer = std::pin::pin!(BinaryCopyInWriter::new(sink, &types));
        for row in rows {
            let params = pg_params(row.values());
            writer
                .as_mut()
                .write(&param_refs(&params))
                .await
                .map_err(|e| map_error(e, &copy_sql))?;
        }
        writer
            .as_mut()
            .finish()
            .await
            .map_err(|e| map_error(e, &copy_sql))
    })
    .await
}

/// PostgreSQL connection
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    query_timeout: Option<Duration>,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("closed", &self.client.is_closed())
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl PgConnection {
    /// Connect without TLS. The connection task runs on the current runtime.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::config(format!("invalid PostgreSQL URL: {}", e)))?;
        pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "PostgreSQL connection terminated");
            }
        });

        Ok(Self {
            client: Arc::new(client),
            query_timeout: config.query_timeout(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        run_query(&self.client, self.query_timeout, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        run_execute(&self.client, self.query_timeout, sql, params).await
    }

    async fn execute_script(&self, sql: &str) -> Result<()> {
        self.ensure_open()?;
        run_script(&self.client, self.query_timeout, sql).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| Error::Transaction {
                message: format!("failed to begin transaction: {}", e),
                source: Some(Box::new(e)),
            })?;
        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
            query_timeout: self.query_timeout,
            finished: AtomicBool::new(false),
        }))
    }
}

/// PostgreSQL transaction.
///
/// A failed `COMMIT` leaves the session in an aborted transaction, which
/// `rollback` still ends.
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
    query_timeout: Option<Duration>,
    finished: AtomicBool,
}

impl PgTransaction {
    async fn end(&self, statement: &str) -> Result<()> {
        self.client
            .batch_execute(statement)
            .await
            .map_err(|e| Error::Transaction {
                message: format!("{} failed: {}", statement, e),
                source: Some(Box::new(e)),
            })?;
        self.finished.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        run_query(&self.client, self.query_timeout, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        run_execute(&self.client, self.query_timeout, sql, params).await
    }

    async fn execute_script(&self, sql: &str) -> Result<()> {
        run_script(&self.client, self.query_timeout, sql).await
    }

    /// `COPY` takes any column subset and writes identity values as given
    async fn bulk_insert(
        &self,
        table: &TableName,
        columns: &[String],
        rows: &[Row],
        _options: LoadOptions,
    ) -> Result<Option<u64>> {
        if rows.is_empty() {
            return Ok(Some(0));
        }
        copy_rows(&self.client, self.query_timeout, table, columns, rows)
            .await
            .map(Some)
    }

    async fn commit(&self) -> Result<()> {
        if self.finished.load(Ordering::Relaxed) {
            return Err(Error::transaction("transaction already finished"));
        }
        self.end("COMMIT").await
    }

    async fn rollback(&self) -> Result<()> {
        if self.finished.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.end("ROLLBACK").await
    }
}

const COLUMNS_SQL: &str = "\
WITH key_index AS (
    SELECT i.indkey::int2[] AS keys
    FROM pg_index i
    WHERE i.indrelid = to_regclass($1) AND i.indisunique
    ORDER BY i.indisprimary DESC, i.indexrelid
    LIMIT 1
)
SELECT a.attname::text AS column_name,
       format_type(a.atttypid, a.atttypmod) AS data_type,
       NOT a.attnotnull AS is_nullable,
       a.attidentity <> '' AS is_identity,
       a.attgenerated <> '' AS is_computed,
       array_position((SELECT keys FROM key_index), a.attnum) AS key_ordinal
FROM pg_attribute a
WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum";

const ROW_COUNT_SQL: &str = "\
SELECT GREATEST(c.reltuples, 0)::bigint AS row_count
FROM pg_class c
WHERE c.oid = to_regclass($1)";

/// Catalog over `pg_catalog`
pub struct PgCatalog {
    conn: Arc<dyn Connection>,
    dialect: PostgresDialect,
}

impl PgCatalog {
    /// Create a catalog reading through `conn`
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            conn,
            dialect: PostgresDialect,
        }
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn describe_table(&self, table: &TableName) -> Result<TableDescriptor> {
        let relation = [Value::String(self.dialect.qualified_table(table))];
        let rows = self.conn.query(COLUMNS_SQL, &relation).await?;
        if rows.is_empty() {
            return Err(Error::TableNotFound {
                table: table.to_string(),
            });
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = row
                .get_by_name("column_name")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::schema("catalog row is missing 'column_name'"))?;
            let data_type = row
                .get_by_name("data_type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let flag = |column: &str| {
                row.get_by_name(column)
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            };

            let mut column = ColumnDescriptor::new(name, data_type)
                .with_traits(self.dialect.type_traits(data_type));
            column.nullable = flag("is_nullable");
            column.identity = flag("is_identity");
            column.computed = flag("is_computed");
            column.key_ordinal = row
                .get_by_name("key_ordinal")
                .and_then(Value::as_i64)
                .and_then(|n| u32::try_from(n).ok());
            columns.push(column);
        }

        let row_count = self
            .conn
            .query_one(ROW_COUNT_SQL, &relation)
            .await?
            .and_then(|row| row.get_by_name("row_count").and_then(Value::as_i64))
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(0);

        let mut descriptor = TableDescriptor::new(table.clone(), columns);
        descriptor.partitions = vec![PartitionInfo {
            number: 1,
            row_count,
        }];
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: Value, ty: &Type) -> Option<Vec<u8>> {
        let mut buf = BytesMut::new();
        match PgParam(value).to_sql(ty, &mut buf).unwrap() {
            IsNull::Yes => None,
            IsNull::No => Some(buf.to_vec()),
        }
    }

    #[test]
    fn test_param_accepts_any_type() {
        assert!(<PgParam as ToSql>::accepts(&Type::TEXT));
        assert!(<PgParam as ToSql>::accepts(&Type::INT4));
    }

    #[test]
    fn test_null_param_is_untyped() {
        assert_eq!(encode(Value::Null, &Type::TEXT), None);
        assert_eq!(encode(Value::Null, &Type::INT8), None);
    }

    #[test]
    fn test_int64_narrows_to_column_type() {
        assert_eq!(encode(Value::Int64(7), &Type::INT4), Some(vec![0, 0, 0, 7]));
        assert_eq!(encode(Value::Int64(7), &Type::INT2), Some(vec![0, 7]));
        assert_eq!(
            encode(Value::Int32(1), &Type::INT8),
            Some(vec![0, 0, 0, 0, 0, 0, 0, 1])
        );
    }

    #[test]
    fn test_int_out_of_range_fails() {
        let mut buf = BytesMut::new();
        assert!(PgParam(Value::Int64(i64::MAX))
            .to_sql(&Type::INT4, &mut buf)
            .is_err());
    }

    #[test]
    fn test_copy_columns_are_quoted() {
        assert_eq!(
            copy_columns(&PostgresDialect, &["id".to_string(), "Note".to_string()]),
            "\"id\", \"Note\""
        );
    }

    #[test]
    fn test_catalog_queries_resolve_relation() {
        assert!(COLUMNS_SQL.contains("to_regclass($1)"));
        assert!(ROW_COUNT_SQL.contains("to_regclass($1)"));
    }
}
