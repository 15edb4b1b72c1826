//! End-to-end transfers through the in-memory engine

use async_trait::async_trait;
use keyfill::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn orders() -> TableName {
    TableName::new(Some("dbo"), "orders")
}

fn orders_table() -> TableDescriptor {
    TableDescriptor::new(
        orders(),
        vec![
            ColumnDescriptor::new("id", "int").with_key_ordinal(1),
            ColumnDescriptor::new("amount", "int"),
            ColumnDescriptor::new("note", "varchar"),
        ],
    )
}

fn order(id: i32, note: &str) -> Row {
    Row::new(
        vec!["id".into(), "amount".into(), "note".into()],
        vec![
            Value::Int32(id),
            Value::Int32(id * 10),
            Value::String(note.into()),
        ],
    )
}

fn key(values: &[i32]) -> KeyTuple {
    values.iter().map(|v| Value::Int32(*v)).collect()
}

/// Source with `rows` orders and an empty destination on another instance
fn databases(rows: i32) -> (MemoryDatabase, MemoryDatabase) {
    let src = MemoryDatabase::new("src");
    let dst = MemoryDatabase::new("dst");
    src.create_table(orders_table()).unwrap();
    dst.create_table(orders_table()).unwrap();
    src.insert_rows(&orders(), (1..=rows).map(|i| order(i, "fresh")))
        .unwrap();
    (src, dst)
}

fn pump(src: &MemoryDatabase, dst: &MemoryDatabase) -> BackfillPump {
    BackfillPump::new(Arc::new(src.clone()), Arc::new(dst.clone()))
}

fn request(batch_size: u32) -> BackfillRequest {
    BackfillRequest::new(orders(), orders()).with_batch_size(batch_size)
}

fn ids(db: &MemoryDatabase) -> Vec<i64> {
    db.rows(&orders())
        .unwrap()
        .iter()
        .filter_map(|r| r.get_by_name("id").and_then(Value::as_i64))
        .collect()
}

fn note_of(db: &MemoryDatabase, id: i64) -> Option<String> {
    db.rows(&orders())
        .unwrap()
        .into_iter()
        .find(|r| r.get_by_name("id").and_then(Value::as_i64) == Some(id))
        .and_then(|r| r.get_by_name("note").and_then(Value::as_str).map(str::to_string))
}

/// Cancels a token once `after` checkpoints were seen
struct CancellingSink {
    token: CancellationToken,
    after: usize,
    seen: Mutex<usize>,
}

#[async_trait]
impl CheckpointSink for CancellingSink {
    async fn on_batch_committed(
        &self,
        _partition: u32,
        _last_key: &KeyTuple,
        _counters: &TransferCounters,
    ) -> keyfill::Result<()> {
        let mut seen = self.seen.lock();
        *seen += 1;
        if *seen >= self.after {
            self.token.cancel();
        }
        Ok(())
    }
}

/// Always fails
struct BrokenSink;

#[async_trait]
impl CheckpointSink for BrokenSink {
    async fn on_batch_committed(
        &self,
        _partition: u32,
        _last_key: &KeyTuple,
        _counters: &TransferCounters,
    ) -> keyfill::Result<()> {
        Err(Error::connection("checkpoint store unavailable"))
    }
}

/// Records the destination's table names at every checkpoint
struct TableListingSink {
    db: MemoryDatabase,
    listings: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl CheckpointSink for TableListingSink {
    async fn on_batch_committed(
        &self,
        _partition: u32,
        _last_key: &KeyTuple,
        _counters: &TransferCounters,
    ) -> keyfill::Result<()> {
        self.listings.lock().push(self.db.table_names());
        Ok(())
    }
}

// ==================== Bulk Append Tests ====================

#[tokio::test]
async fn test_bulk_append_ten_batches() {
    let (src, dst) = databases(10_000);
    let sink = Arc::new(MemoryCheckpointSink::new());

    let counters = pump(&src, &dst)
        .with_sink(sink.clone())
        .run(&request(1000))
        .await
        .unwrap();

    assert_eq!(counters.rows_fetched, 10_000);
    assert_eq!(counters.rows_inserted, 10_000);
    assert_eq!(counters.rows_deleted, 0);
    assert_eq!(counters.batches_completed, 10);
    assert_eq!(counters.partitions_completed, 1);

    assert_eq!(sink.len(), 10);
    let checkpoints = sink.checkpoints();
    assert_eq!(checkpoints[0], Checkpoint::new(1, key(&[1000])));
    assert_eq!(checkpoints[9], Checkpoint::new(1, key(&[10_000])));

    assert_eq!(dst.row_count(&orders()).unwrap(), 10_000);
    assert_eq!(dst.rows(&orders()).unwrap(), src.rows(&orders()).unwrap());
}

#[tokio::test]
async fn test_partial_last_batch() {
    let (src, dst) = databases(25);
    let sink = Arc::new(MemoryCheckpointSink::new());

    let counters = pump(&src, &dst)
        .with_sink(sink.clone())
        .run(&request(10))
        .await
        .unwrap();

    assert_eq!(counters.batches_completed, 3);
    assert_eq!(
        sink.checkpoints()
            .into_iter()
            .map(|c| c.keys)
            .collect::<Vec<_>>(),
        vec![key(&[10]), key(&[20]), key(&[25])]
    );
    let (_, last_counters) = sink.last().unwrap();
    assert_eq!(last_counters.rows_fetched, 25);
}

#[tokio::test]
async fn test_empty_source_completes() {
    let (src, dst) = databases(0);

    let counters = pump(&src, &dst).run(&request(100)).await.unwrap();

    assert_eq!(counters.batches_completed, 0);
    assert_eq!(counters.rows_fetched, 0);
    assert_eq!(counters.partitions_completed, 1);
    assert_eq!(dst.row_count(&orders()).unwrap(), 0);
}

#[tokio::test]
async fn test_bulk_append_into_identity_column() {
    let src = MemoryDatabase::new("src");
    let dst = MemoryDatabase::new("dst");
    src.create_table(orders_table()).unwrap();
    dst.create_table(TableDescriptor::new(
        orders(),
        vec![
            ColumnDescriptor::new("id", "int")
                .with_key_ordinal(1)
                .with_identity(),
            ColumnDescriptor::new("amount", "int"),
            ColumnDescriptor::new("note", "varchar"),
        ],
    ))
    .unwrap();
    src.insert_rows(&orders(), (1..=30).map(|i| order(i, "x")))
        .unwrap();

    let counters = pump(&src, &dst).run(&request(7)).await.unwrap();

    assert_eq!(counters.rows_inserted, 30);
    assert_eq!(ids(&dst), (1..=30).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_run_backfill_helper() {
    let (src, dst) = databases(42);
    let sink: Arc<dyn CheckpointSink> = Arc::new(MemoryCheckpointSink::new());

    let counters = run_backfill(
        Arc::new(src.clone()),
        Arc::new(dst.clone()),
        &request(10),
        Some(sink),
    )
    .await
    .unwrap();

    assert_eq!(counters.rows_inserted, 42);
    assert_eq!(counters.batches_completed, 5);
}

// ==================== Key Range Tests ====================

#[tokio::test]
async fn test_start_and_end_keys_are_inclusive() {
    let (src, dst) = databases(10_000);
    let sink = Arc::new(MemoryCheckpointSink::new());
    let req = request(1000)
        .with_start_keys(key(&[2501]))
        .with_end_keys(key(&[7500]));

    let counters = pump(&src, &dst)
        .with_sink(sink.clone())
        .run(&req)
        .await
        .unwrap();

    assert_eq!(counters.rows_fetched, 5000);
    assert_eq!(counters.batches_completed, 5);
    assert_eq!(ids(&dst), (2501..=7500).collect::<Vec<i64>>());
    assert_eq!(sink.last().unwrap().0, Checkpoint::new(1, key(&[7500])));
}

#[tokio::test]
async fn test_end_keys_clamp_last_batch() {
    let (src, dst) = databases(10_000);
    let req = request(1000)
        .with_start_keys(key(&[2501]))
        .with_end_keys(key(&[7450]));

    let counters = pump(&src, &dst).run(&req).await.unwrap();

    assert_eq!(counters.rows_fetched, 4950);
    assert_eq!(counters.batches_completed, 5);
    assert_eq!(ids(&dst).last(), Some(&7450));
}

#[tokio::test]
async fn test_composite_key_with_prefix_start() {
    let table = TableName::new(Some("dbo"), "sales");
    let descriptor = TableDescriptor::new(
        table.clone(),
        vec![
            ColumnDescriptor::new("region", "int").with_key_ordinal(1),
            ColumnDescriptor::new("id", "int").with_key_ordinal(2),
            ColumnDescriptor::new("total", "decimal"),
        ],
    );
    let src = MemoryDatabase::new("src");
    let dst = MemoryDatabase::new("dst");
    src.create_table(descriptor.clone()).unwrap();
    dst.create_table(descriptor).unwrap();
    let rows = (1..=3).flat_map(|region| {
        (1..=50).map(move |id| {
            Row::new(
                vec!["region".into(), "id".into(), "total".into()],
                vec![Value::Int32(region), Value::Int32(id), Value::Null],
            )
        })
    });
    src.insert_rows(&table, rows).unwrap();

    let sink = Arc::new(MemoryCheckpointSink::new());
    let req = BackfillRequest::new(table.clone(), table.clone())
        .with_batch_size(20)
        .with_start_keys(key(&[2]));
    let counters = pump(&src, &dst)
        .with_sink(sink.clone())
        .run(&req)
        .await
        .unwrap();

    assert_eq!(counters.rows_fetched, 100);
    assert_eq!(counters.batches_completed, 5);
    assert_eq!(sink.checkpoints()[0].keys, key(&[2, 20]));
    assert_eq!(sink.last().unwrap().0.keys, key(&[3, 50]));
    assert_eq!(dst.row_count(&table).unwrap(), 100);
}

// ==================== Partition Tests ====================

fn partitioned_databases(rows: i32) -> (MemoryDatabase, MemoryDatabase) {
    let src = MemoryDatabase::new("src");
    let dst = MemoryDatabase::new("dst");
    src.create_partitioned_table(orders_table(), "pf_parity", "id", |v| {
        if v.as_i64().unwrap_or(0) % 2 == 1 {
            1
        } else {
            2
        }
    })
    .unwrap();
    dst.create_table(orders_table()).unwrap();
    src.insert_rows(&orders(), (1..=rows).map(|i| order(i, "fresh")))
        .unwrap();
    (src, dst)
}

#[tokio::test]
async fn test_batches_never_span_partitions() {
    let (src, dst) = partitioned_databases(100);
    let sink = Arc::new(MemoryCheckpointSink::new());

    let counters = pump(&src, &dst)
        .with_sink(sink.clone())
        .run(&request(10))
        .await
        .unwrap();

    assert_eq!(counters.partitions_completed, 2);
    assert_eq!(counters.batches_completed, 10);
    let checkpoints = sink.checkpoints();
    let partitions: Vec<u32> = checkpoints.iter().map(|c| c.partition).collect();
    assert_eq!(partitions, vec![1, 1, 1, 1, 1, 2, 2, 2, 2, 2]);
    assert_eq!(checkpoints[0].keys, key(&[19]));
    assert_eq!(checkpoints[4].keys, key(&[99]));
    assert_eq!(checkpoints[5].keys, key(&[20]));
    assert_eq!(checkpoints[9].keys, key(&[100]));
    assert_eq!(dst.row_count(&orders()).unwrap(), 100);
}

#[tokio::test]
async fn test_unscoped_partitioned_source() {
    let (src, dst) = partitioned_databases(100);
    let sink = Arc::new(MemoryCheckpointSink::new());

    let counters = pump(&src, &dst)
        .with_sink(sink.clone())
        .run(&request(10).with_partition_scoping(false))
        .await
        .unwrap();

    assert_eq!(counters.partitions_completed, 1);
    assert_eq!(counters.batches_completed, 10);
    assert!(sink.checkpoints().iter().all(|c| c.partition == 1));
    assert_eq!(sink.checkpoints()[0].keys, key(&[10]));
}

#[tokio::test]
async fn test_restart_skips_completed_partitions() {
    let (src, dst) = partitioned_databases(100);
    let req = request(10).with_restart(Some(Checkpoint::new(2, key(&[50]))));

    let counters = pump(&src, &dst).run(&req).await.unwrap();

    assert_eq!(counters.rows_fetched, 25);
    assert_eq!(ids(&dst), (52..=100).step_by(2).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_plan_detects_partition_scoping() {
    let (src, dst) = partitioned_databases(10);

    let plan = pump(&src, &dst).plan(&request(3)).await.unwrap();

    assert!(plan.boundary.is_partition_scoped());
    assert!(plan.fetch.supports_partition_scoping());
    assert_eq!(
        plan.partitions,
        vec![
            PartitionInfo {
                number: 1,
                row_count: 5
            },
            PartitionInfo {
                number: 2,
                row_count: 5
            },
        ]
    );
    assert!(plan.write.staging.is_none());
    assert_eq!(plan.write.columns, vec!["id", "amount", "note"]);
}

// ==================== Merge Tests ====================

#[tokio::test]
async fn test_merge_replaces_stale_rows() {
    let (src, dst) = databases(10_000);
    dst.insert_rows(&orders(), (5001..=10_000).map(|i| order(i, "stale")))
        .unwrap();

    let req = request(1000).with_strategy(TransferStrategy::ReconcilingMerge {
        only_changed: false,
    });
    let counters = pump(&src, &dst).run(&req).await.unwrap();

    assert_eq!(counters.rows_fetched, 10_000);
    assert_eq!(counters.rows_inserted, 10_000);
    assert_eq!(counters.rows_deleted, 5000);
    assert_eq!(dst.row_count(&orders()).unwrap(), 10_000);
    assert_eq!(note_of(&dst, 7777).as_deref(), Some("fresh"));
    assert_eq!(dst.table_names(), vec!["dbo.orders".to_string()]);
}

#[tokio::test]
async fn test_merge_only_changed_keeps_identical_rows() {
    let (src, dst) = databases(100);
    dst.insert_rows(
        &orders(),
        (51..=100).map(|i| order(i, if i % 2 == 0 { "stale" } else { "fresh" })),
    )
    .unwrap();

    let req = request(10).with_strategy(TransferStrategy::ReconcilingMerge { only_changed: true });
    let counters = pump(&src, &dst).run(&req).await.unwrap();

    assert_eq!(counters.rows_deleted, 25);
    assert_eq!(counters.rows_inserted, 75);
    assert_eq!(dst.row_count(&orders()).unwrap(), 100);
    assert!((1..=100).all(|i| note_of(&dst, i).as_deref() == Some("fresh")));
}

#[tokio::test]
async fn test_merge_is_idempotent() {
    let (src, dst) = databases(200);
    let req = request(50).with_strategy(TransferStrategy::ReconcilingMerge {
        only_changed: false,
    });

    pump(&src, &dst).run(&req).await.unwrap();
    let second = pump(&src, &dst).run(&req).await.unwrap();

    assert_eq!(second.rows_deleted, 200);
    assert_eq!(second.rows_inserted, 200);
    assert_eq!(dst.rows(&orders()).unwrap(), src.rows(&orders()).unwrap());
}

#[tokio::test]
async fn test_staging_is_temporary_on_same_instance() {
    let src = MemoryDatabase::new("shared");
    let dst = MemoryDatabase::new("shared");
    src.create_table(orders_table()).unwrap();
    dst.create_table(orders_table()).unwrap();
    src.insert_rows(&orders(), (1..=30).map(|i| order(i, "x")))
        .unwrap();

    let sink = Arc::new(TableListingSink {
        db: dst.clone(),
        listings: Mutex::new(Vec::new()),
    });
    let req = request(10).with_strategy(TransferStrategy::ReconcilingMerge {
        only_changed: false,
    });
    pump(&src, &dst)
        .with_sink(sink.clone())
        .run(&req)
        .await
        .unwrap();

    let listings = sink.listings.lock();
    assert_eq!(listings.len(), 3);
    assert!(listings[0]
        .iter()
        .any(|name| name.starts_with("#keyfill_shared")));
    assert!(!dst.table_names().iter().any(|name| name.starts_with('#')));
}

#[tokio::test]
async fn test_staging_is_persistent_across_instances() {
    let (src, dst) = databases(10);
    let req = request(5)
        .with_strategy(TransferStrategy::GapFill)
        .with_work_schema("etl");

    let plan = pump(&src, &dst).plan(&req).await.unwrap();
    let staging = plan.write.staging.expect("gap fill stages batches");

    assert!(!staging.temporary);
    assert_eq!(staging.table.schema.as_deref(), Some("etl"));
    assert!(staging.table.name.starts_with("keyfill_src"));
    assert_eq!(staging.key_columns, vec!["id"]);
}

// ==================== Gap Fill Tests ====================

#[tokio::test]
async fn test_gap_fill_keeps_existing_rows() {
    let (src, dst) = databases(100);
    dst.insert_rows(
        &orders(),
        (1..=100).filter(|i| i % 2 == 0).map(|i| order(i, "existing")),
    )
    .unwrap();

    let req = request(10).with_strategy(TransferStrategy::GapFill);
    let counters = pump(&src, &dst).run(&req).await.unwrap();

    assert_eq!(counters.rows_fetched, 100);
    assert_eq!(counters.rows_inserted, 50);
    assert_eq!(counters.rows_deleted, 50);
    assert_eq!(dst.row_count(&orders()).unwrap(), 100);
    assert_eq!(note_of(&dst, 2).as_deref(), Some("existing"));
    assert_eq!(note_of(&dst, 3).as_deref(), Some("fresh"));
}

// ==================== Failure Tests ====================

#[tokio::test]
async fn test_commit_failure_keeps_last_checkpoint() {
    let (src, dst) = databases(10_000);
    dst.fail_commit_number(4, || Error::timeout("commit timed out"));

    let failure = pump(&src, &dst).run(&request(1000)).await.unwrap_err();

    assert!(matches!(failure.error, Error::Timeout { .. }));
    assert!(failure.is_retriable());
    assert_eq!(failure.counters.batches_completed, 3);
    assert_eq!(
        failure.last_checkpoint,
        Some(Checkpoint::new(1, key(&[3000])))
    );
    assert_eq!(dst.row_count(&orders()).unwrap(), 3000);
}

#[tokio::test]
async fn test_resume_after_failure_is_exact() {
    let (src, dst) = databases(10_000);
    dst.fail_commit_number(4, || Error::timeout("commit timed out"));

    let failure = pump(&src, &dst).run(&request(1000)).await.unwrap_err();
    dst.clear_faults();

    let resumed = pump(&src, &dst)
        .run(&request(1000).with_restart(failure.last_checkpoint))
        .await
        .unwrap();

    assert_eq!(resumed.batches_completed, 7);
    assert_eq!(resumed.rows_inserted, 7000);
    assert_eq!(ids(&dst), (1..=10_000).collect::<Vec<i64>>());
}

/// Run `req` uninterrupted on one copy of the databases, and on another copy
/// fail commit `fail_at`, then resume from the reported checkpoint. Returns
/// both destinations.
async fn interrupted_and_clean(
    seed: impl Fn(&MemoryDatabase),
    req: BackfillRequest,
    fail_at: u64,
) -> (MemoryDatabase, MemoryDatabase, Option<Checkpoint>) {
    let (src, clean) = databases(100);
    seed(&clean);
    pump(&src, &clean).run(&req).await.unwrap();

    let (src, dst) = databases(100);
    seed(&dst);
    dst.fail_commit_number(fail_at, || Error::timeout("commit timed out"));
    let failure = pump(&src, &dst).run(&req).await.unwrap_err();
    dst.clear_faults();
    let restart = failure.last_checkpoint.clone();
    pump(&src, &dst)
        .run(&req.clone().with_restart(failure.last_checkpoint))
        .await
        .unwrap();

    (clean, dst, restart)
}

#[tokio::test]
async fn test_merge_resume_matches_uninterrupted_run() {
    let stale = |db: &MemoryDatabase| {
        db.insert_rows(&orders(), (41..=100).map(|i| order(i, "stale")))
            .unwrap();
    };
    let req = request(10).with_strategy(TransferStrategy::ReconcilingMerge {
        only_changed: false,
    });

    let (clean, resumed, restart) = interrupted_and_clean(stale, req, 4).await;

    assert_eq!(restart, Some(Checkpoint::new(1, key(&[30]))));
    assert_eq!(resumed.rows(&orders()).unwrap(), clean.rows(&orders()).unwrap());
    assert!((1..=100).all(|i| note_of(&resumed, i).as_deref() == Some("fresh")));
    assert_eq!(resumed.table_names(), vec!["dbo.orders".to_string()]);
}

#[tokio::test]
async fn test_gap_fill_resume_matches_uninterrupted_run() {
    let existing = |db: &MemoryDatabase| {
        db.insert_rows(
            &orders(),
            (1..=100).filter(|i| i % 3 == 0).map(|i| order(i, "existing")),
        )
        .unwrap();
    };
    let req = request(10).with_strategy(TransferStrategy::GapFill);

    let (clean, resumed, restart) = interrupted_and_clean(existing, req, 6).await;

    assert_eq!(restart, Some(Checkpoint::new(1, key(&[50]))));
    assert_eq!(resumed.rows(&orders()).unwrap(), clean.rows(&orders()).unwrap());
    assert_eq!(ids(&resumed), (1..=100).collect::<Vec<i64>>());
    assert_eq!(note_of(&resumed, 99).as_deref(), Some("existing"));
    assert_eq!(note_of(&resumed, 98).as_deref(), Some("fresh"));
}

#[tokio::test]
async fn test_restart_past_last_partition_transfers_nothing() {
    let (src, dst) = partitioned_databases(20);
    let sink = Arc::new(MemoryCheckpointSink::new());
    let req = request(5).with_restart(Some(Checkpoint::new(3, key(&[1]))));

    let counters = pump(&src, &dst)
        .with_sink(sink.clone())
        .run(&req)
        .await
        .unwrap();

    assert_eq!(counters.batches_completed, 0);
    assert_eq!(counters.rows_fetched, 0);
    assert!(sink.checkpoints().is_empty());
    assert_eq!(dst.row_count(&orders()).unwrap(), 0);
}

#[tokio::test]
async fn test_checkpoints_increase_across_partitions() {
    let (src, dst) = partitioned_databases(95);
    let sink = Arc::new(MemoryCheckpointSink::new());

    pump(&src, &dst)
        .with_sink(sink.clone())
        .run(&request(7))
        .await
        .unwrap();

    let positions: Vec<(u32, KeyTuple)> = sink
        .checkpoints()
        .into_iter()
        .map(|c| (c.partition, c.keys))
        .collect();
    assert_eq!(positions.len(), 14);
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(positions.last(), Some(&(2, key(&[94]))));
}

#[tokio::test]
async fn test_rollback_failure_reports_both_errors() {
    let (src, dst) = databases(100);
    dst.fail_commit_number(1, || Error::timeout("commit timed out"));
    dst.fail_rollback(|| Error::connection("session lost"));

    let failure = pump(&src, &dst).run(&request(10)).await.unwrap_err();

    match &failure.error {
        Error::RollbackFailed { cause, rollback } => {
            assert!(matches!(**cause, Error::Timeout { .. }));
            assert!(matches!(**rollback, Error::Connection { .. }));
        }
        other => panic!("expected rollback failure, got {other}"),
    }
    assert!(!failure.is_retriable());
    assert_eq!(failure.last_checkpoint, None);
}

#[tokio::test]
async fn test_probe_failure_stops_before_write() {
    let (src, dst) = databases(100);
    src.fail_probe_number(3, || Error::Deadlock);

    let failure = pump(&src, &dst).run(&request(10)).await.unwrap_err();

    assert!(matches!(failure.error, Error::Deadlock));
    assert_eq!(failure.counters.batches_completed, 2);
    assert_eq!(dst.row_count(&orders()).unwrap(), 20);
}

#[tokio::test]
async fn test_staging_dropped_after_failure() {
    let (src, dst) = databases(100);
    dst.fail_commit_number(2, || Error::timeout("commit timed out"));
    let req = request(10).with_strategy(TransferStrategy::GapFill);

    let failure = pump(&src, &dst).run(&req).await.unwrap_err();

    assert_eq!(failure.counters.batches_completed, 1);
    assert_eq!(dst.table_names(), vec!["dbo.orders".to_string()]);
}

#[tokio::test]
async fn test_duplicate_key_aborts_bulk_append() {
    let (src, dst) = databases(20);
    dst.insert_rows(&orders(), [order(15, "already here")])
        .unwrap();

    let failure = pump(&src, &dst).run(&request(10)).await.unwrap_err();

    assert!(matches!(failure.error, Error::Constraint { .. }));
    assert_eq!(failure.counters.batches_completed, 1);
    assert_eq!(dst.row_count(&orders()).unwrap(), 11);
}

#[tokio::test]
async fn test_checkpoint_sink_failure_is_not_fatal() {
    let (src, dst) = databases(30);

    let counters = pump(&src, &dst)
        .with_sink(Arc::new(BrokenSink))
        .run(&request(10))
        .await
        .unwrap();

    assert_eq!(counters.batches_completed, 3);
}

// ==================== Cancellation Tests ====================

#[tokio::test]
async fn test_cancelled_before_start() {
    let (src, dst) = databases(100);
    let token = CancellationToken::new();
    token.cancel();

    let failure = pump(&src, &dst)
        .with_cancellation(token)
        .run(&request(10))
        .await
        .unwrap_err();

    assert!(matches!(failure.error, Error::Cancelled));
    assert_eq!(failure.counters.batches_completed, 0);
    assert_eq!(dst.row_count(&orders()).unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_at_batch_boundary() {
    let (src, dst) = databases(100);
    let token = CancellationToken::new();
    let sink = Arc::new(CancellingSink {
        token: token.clone(),
        after: 2,
        seen: Mutex::new(0),
    });

    let failure = pump(&src, &dst)
        .with_sink(sink)
        .with_cancellation(token)
        .run(&request(10))
        .await
        .unwrap_err();

    assert!(matches!(failure.error, Error::Cancelled));
    assert_eq!(failure.counters.batches_completed, 2);
    assert_eq!(
        failure.last_checkpoint,
        Some(Checkpoint::new(1, key(&[20])))
    );
    assert_eq!(dst.row_count(&orders()).unwrap(), 20);
}

// ==================== Configuration Tests ====================

#[tokio::test]
async fn test_invalid_copy_columns_fail_before_any_write() {
    let (src, dst) = databases(10);
    let req = request(5).with_copy_columns(["id", "missing"]);

    let failure = pump(&src, &dst).run(&req).await.unwrap_err();

    assert!(matches!(failure.error, Error::Configuration { .. }));
    assert!(failure
        .error
        .to_string()
        .contains("'missing' does not exist in dbo.orders"));
    assert_eq!(failure.counters, TransferCounters::default());
    assert_eq!(dst.row_count(&orders()).unwrap(), 0);
}

#[tokio::test]
async fn test_copy_subset_of_columns() {
    let (src, dst) = databases(10);
    let req = request(5).with_copy_columns(["id", "note"]);

    pump(&src, &dst).run(&req).await.unwrap();

    let row = &dst.rows(&orders()).unwrap()[0];
    assert_eq!(row.get_by_name("note"), Some(&Value::String("fresh".into())));
    assert_eq!(row.get_by_name("amount"), Some(&Value::Null));
}

#[tokio::test]
async fn test_missing_source_table() {
    let (src, dst) = databases(0);
    let req = BackfillRequest::new(TableName::new(Some("dbo"), "nope"), orders());

    let failure = pump(&src, &dst).run(&req).await.unwrap_err();

    assert!(matches!(failure.error, Error::TableNotFound { .. }));
}

#[tokio::test]
async fn test_merge_needs_merge_key_in_copy_columns() {
    let (src, dst) = databases(10);
    let req = request(5)
        .with_copy_columns(["amount", "note"])
        .with_key_columns(["id"])
        .with_strategy(TransferStrategy::GapFill);

    let err = pump(&src, &dst).plan(&req).await.unwrap_err();

    assert!(matches!(err, Error::Configuration { .. }));
    assert!(err.to_string().contains("merge key columns"));
}

#[tokio::test]
async fn test_filter_is_rejected_by_memory_engine() {
    let (src, dst) = databases(10);
    let req = request(5).with_filter("[SRC].[amount] > 0");

    let failure = pump(&src, &dst).run(&req).await.unwrap_err();

    assert!(matches!(failure.error, Error::Unsupported { .. }));
}

#[tokio::test]
async fn test_live_counters_follow_progress() {
    let (src, dst) = databases(30);
    let pump = pump(&src, &dst);
    let live = pump.counters();

    pump.run(&request(10)).await.unwrap();

    assert_eq!(live.snapshot().batches_completed, 3);
}
