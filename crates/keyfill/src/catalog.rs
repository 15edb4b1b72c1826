//! Table and column descriptions consumed by the transfer engine
//!
//! Provides:
//! - [`TableName`]: schema-qualified table reference
//! - [`ColumnDescriptor`]: per-column key ordinal, comparability, copyability
//! - [`TableDescriptor`]: columns plus physical partitioning
//! - [`Catalog`]: read-only introspection, implemented per backend

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Schema-qualified table reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    /// Schema; `None` means the connection's default schema
    pub schema: Option<String>,
    /// Table name
    pub name: String,
}

impl TableName {
    /// Create a table name
    pub fn new(schema: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.into(),
        }
    }

    /// Parse `table`, `schema.table`, `[schema].[table]` or `"schema"."table"`
    pub fn parse(input: &str) -> Result<Self> {
        let parts = split_qualified(input.trim());
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new(None, name.clone())),
            [schema, name] if !schema.is_empty() && !name.is_empty() => {
                Ok(Self::new(Some(schema), name.clone()))
            }
            _ => Err(Error::config(format!("invalid table name '{}'", input))),
        }
    }

    /// Lower-cased `schema.table`, for map keys and comparisons
    pub fn key(&self) -> String {
        self.to_string().to_lowercase()
    }
}

fn split_qualified(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut closing: Option<char> = None;
    for ch in input.chars() {
        match (closing, ch) {
            (Some(close), c) if c == close => closing = None,
            (Some(_), c) => current.push(c),
            (None, '[') => closing = Some(']'),
            (None, '"') => closing = Some('"'),
            (None, '.') => parts.push(std::mem::take(&mut current)),
            (None, c) => current.push(c),
        }
    }
    parts.push(current);
    parts
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(s) => write!(f, "{}.{}", s, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// How a column type behaves in comparisons and copies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeTraits {
    /// Values may be written to the destination
    pub copyable: bool,
    /// Values may be compared directly in a predicate
    pub comparable: bool,
    /// Conversion applied before comparison when not directly comparable
    pub compare_format: Option<&'static str>,
}

impl TypeTraits {
    /// Ordinary scalar type
    pub const PLAIN: TypeTraits = TypeTraits {
        copyable: true,
        comparable: true,
        compare_format: None,
    };

    /// Large-object type that compares only after conversion
    pub const fn converted(format: &'static str) -> Self {
        Self {
            copyable: true,
            comparable: false,
            compare_format: Some(format),
        }
    }

    /// Engine-maintained pseudo-column that must never be written
    pub const NEVER_COPIED: TypeTraits = TypeTraits {
        copyable: false,
        comparable: false,
        compare_format: None,
    };
}

impl Default for TypeTraits {
    fn default() -> Self {
        Self::PLAIN
    }
}

/// One column as described by the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Vendor type name
    pub data_type: String,
    /// Whether the column accepts NULL
    pub nullable: bool,
    /// 1-based position in the table's unique key, if part of it
    pub key_ordinal: Option<u32>,
    /// Engine-generated surrogate identity
    pub identity: bool,
    /// Computed column; never written
    pub computed: bool,
    /// Comparison and copy behaviour of the type
    pub traits: TypeTraits,
}

impl ColumnDescriptor {
    /// Create a nullable, non-key, plain column
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            key_ordinal: None,
            identity: false,
            computed: false,
            traits: TypeTraits::PLAIN,
        }
    }

    /// Mark as the `ordinal`-th key column (1-based)
    pub fn with_key_ordinal(mut self, ordinal: u32) -> Self {
        self.key_ordinal = Some(ordinal);
        self.nullable = false;
        self
    }

    /// Set type traits
    pub fn with_traits(mut self, traits: TypeTraits) -> Self {
        self.traits = traits;
        self
    }

    /// Mark as identity column
    pub fn with_identity(mut self) -> Self {
        self.identity = true;
        self
    }

    /// Mark as computed column
    pub fn with_computed(mut self) -> Self {
        self.computed = true;
        self
    }

    /// Whether the column participates in the table's unique key
    #[inline]
    pub fn in_unique_key(&self) -> bool {
        self.key_ordinal.is_some()
    }

    /// Whether the column's values may be written
    #[inline]
    pub fn is_copyable(&self) -> bool {
        self.traits.copyable && !self.computed
    }

    /// Whether the column can appear in a key or change-detection predicate
    #[inline]
    pub fn is_comparable(&self) -> bool {
        self.traits.comparable || self.traits.compare_format.is_some()
    }

    /// Wrap `expr` in the conversion the type needs before comparison
    pub fn compare_expr(&self, expr: &str) -> String {
        match self.traits.compare_format {
            Some(format) if !self.traits.comparable => format.replace("{}", expr),
            _ => expr.to_string(),
        }
    }
}

/// Physical partitioning of a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionScheme {
    /// Partition function name
    pub function: String,
    /// Column the function is applied to
    pub column: String,
}

/// One non-empty partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    /// 1-based partition number
    pub number: u32,
    /// Row count reported by the engine (may be an estimate)
    pub row_count: u64,
}

/// Table as described by the catalog
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    /// Table reference
    pub name: TableName,
    /// Columns in ordinal order
    pub columns: Vec<ColumnDescriptor>,
    /// Partitioning, if the table is partitioned
    pub partitioning: Option<PartitionScheme>,
    /// Non-empty partitions in ascending order. Empty means unknown.
    pub partitions: Vec<PartitionInfo>,
}

impl TableDescriptor {
    /// Create an unpartitioned table descriptor
    pub fn new(name: TableName, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            name,
            columns,
            partitioning: None,
            partitions: Vec::new(),
        }
    }

    /// Set partitioning scheme and partition list
    pub fn with_partitioning(
        mut self,
        scheme: PartitionScheme,
        partitions: Vec<PartitionInfo>,
    ) -> Self {
        self.partitioning = Some(scheme);
        self.partitions = partitions;
        self
    }

    /// Get column by name (case-insensitive)
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Get column by name or fail with `ColumnNotFound`
    pub fn require_column(&self, name: &str) -> Result<&ColumnDescriptor> {
        self.column(name).ok_or_else(|| Error::ColumnNotFound {
            table: self.name.to_string(),
            column: name.to_string(),
        })
    }

    /// Unique-key columns ordered by key ordinal
    pub fn key_columns(&self) -> Vec<ColumnDescriptor> {
        let mut keys: Vec<_> = self
            .columns
            .iter()
            .filter(|c| c.in_unique_key())
            .cloned()
            .collect();
        keys.sort_by_key(|c| c.key_ordinal);
        keys
    }

    /// Columns whose values can be transferred
    pub fn copyable_columns(&self) -> Vec<&ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_copyable()).collect()
    }

    /// Partitions in ascending order; a single synthetic partition 1 when
    /// the table is not partitioned
    pub fn partition_list(&self) -> Vec<PartitionInfo> {
        if self.partitions.is_empty() {
            return vec![PartitionInfo {
                number: 1,
                row_count: 0,
            }];
        }
        let mut partitions = self.partitions.clone();
        partitions.sort_by_key(|p| p.number);
        partitions
    }

    /// Whether `column` is the physical partitioning column
    pub fn is_partitioning_column(&self, column: &str) -> bool {
        self.partitioning
            .as_ref()
            .is_some_and(|p| p.column.eq_ignore_ascii_case(column))
    }

    /// Whether any column is a surrogate identity
    pub fn has_identity(&self) -> bool {
        self.columns.iter().any(|c| c.identity)
    }

    /// Sum of partition row counts
    pub fn row_count(&self) -> u64 {
        self.partitions.iter().map(|p| p.row_count).sum()
    }
}

/// Read-only catalog introspection
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Describe a table; fails with `TableNotFound` if it does not exist
    async fn describe_table(&self, table: &TableName) -> Result<TableDescriptor>;

    /// Key columns ordered by key ordinal
    async fn list_key_columns(&self, table: &TableName) -> Result<Vec<ColumnDescriptor>> {
        Ok(self.describe_table(table).await?.key_columns())
    }

    /// Non-empty partitions ascending, or a single synthetic partition
    async fn list_partitions(&self, table: &TableName) -> Result<Vec<PartitionInfo>> {
        Ok(self.describe_table(table).await?.partition_list())
    }

    /// Whether the table has an engine-generated identity column
    async fn has_surrogate_identity(&self, table: &TableName) -> Result<bool> {
        Ok(self.describe_table(table).await?.has_identity())
    }
}
