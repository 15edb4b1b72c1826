//! # keyfill
//!
//! Keyset-pagination batch backfill between relational tables.
//!
//! keyfill copies tables too large for a single statement in bounded batches,
//! walking the table in composite-key order. Every batch is applied to the
//! destination in its own transaction, and a checkpoint is emitted after each
//! commit so an interrupted job can resume exactly where it stopped.
//!
//! ## Features
//!
//! - **Composite-key ranges**: lexicographic range predicates over any number
//!   of key columns, with optional start/end tuples
//! - **Partition-scoped iteration**: one physical partition at a time when the
//!   leading key column is the partitioning column
//! - **Transfer strategies**: bulk append, reconciling merge (optionally only
//!   changed rows) and gap fill, via a transaction-scoped staging table
//! - **Restartable**: resume strictly after the last committed checkpoint
//! - **Backends**: SQL Server (tiberius) and PostgreSQL (tokio-postgres), plus
//!   an in-memory engine for tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use keyfill::prelude::*;
//!
//! let source = Arc::new(SqlEndpoint::connect(&ConnectionConfig::new(src_url)).await?);
//! let destination = Arc::new(SqlEndpoint::connect(&ConnectionConfig::new(dst_url)).await?);
//!
//! let request = BackfillRequest::new(TableName::parse("dbo.orders")?, TableName::parse("dbo.orders")?)
//!     .with_batch_size(50_000)
//!     .with_strategy(TransferStrategy::ReconcilingMerge { only_changed: true });
//!
//! let counters = BackfillPump::new(source, destination)
//!     .run(&request)
//!     .await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlserver` - SQL Server support via tiberius
//! - `postgres` - PostgreSQL support via tokio-postgres

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod boundary;
pub mod catalog;
pub mod checkpoint;
pub mod connection;
pub mod dialect;
pub mod endpoint;
pub mod error;
pub mod fetch;
pub mod memory;
pub mod predicate;
pub mod pump;
pub mod security;
pub mod strategy;
pub mod types;

// Backend implementations (conditionally compiled)
#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlserver")]
pub mod sqlserver;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result, TransferFailure};

    // Value and type system
    pub use crate::types::{Batch, KeyTuple, Row, Value};

    // Catalog
    pub use crate::catalog::{
        Catalog, ColumnDescriptor, PartitionInfo, PartitionScheme, TableDescriptor, TableName,
        TypeTraits,
    };

    // Connection traits and config
    pub use crate::connection::{
        connect, Connection, ConnectionConfig, DatabaseType, IsolationLevel, LoadOptions,
        Transaction,
    };

    // Dialect types
    pub use crate::dialect::{dialect_for, PostgresDialect, SqlDialect, SqlServerDialect};

    // Key ranges and fetch queries
    pub use crate::boundary::{Cursor, KeyBoundary};
    pub use crate::fetch::{
        BatchScan, FetchQueryBuilder, LimitProbe, ProjectedColumn, Projection, RelatedJoin,
    };
    pub use crate::predicate::{lexicographic, Bound, CompareOp, Predicate};

    // Endpoints and strategies
    pub use crate::endpoint::{Destination, DestinationTransaction, Source, SqlEndpoint};
    pub use crate::memory::MemoryDatabase;
    pub use crate::strategy::{
        ApplyOutcome, CompareColumn, ReconcileMode, StagingArea, TransferStrategy, WritePlan,
    };

    // Pump and checkpoints
    pub use crate::checkpoint::{
        Checkpoint, CheckpointSink, MemoryCheckpointSink, TracingCheckpointSink,
    };
    pub use crate::pump::{
        run_backfill, AtomicTransferCounters, BackfillPump, BackfillRequest, TransferCounters,
        TransferPlan,
    };
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::Value;
