//! Tests for composite-key range queries across dialects

use keyfill::prelude::*;
use std::sync::Arc;

fn sales() -> TableDescriptor {
    TableDescriptor::new(
        TableName::new(Some("sales"), "lines"),
        vec![
            ColumnDescriptor::new("region", "int").with_key_ordinal(1),
            ColumnDescriptor::new("order_id", "bigint").with_key_ordinal(2),
            ColumnDescriptor::new("qty", "int"),
        ],
    )
}

fn keys() -> Vec<String> {
    vec!["region".to_string(), "order_id".to_string()]
}

fn builder(dialect: Arc<dyn SqlDialect>) -> FetchQueryBuilder {
    FetchQueryBuilder::new(
        dialect,
        &sales(),
        &keys(),
        Projection::columns(["region", "order_id", "qty"]),
        500,
    )
    .unwrap()
}

fn tuple(region: i32, order: i64) -> KeyTuple {
    KeyTuple::new(vec![Value::Int32(region), Value::Int64(order)])
}

// ==================== First Fetch Tests ====================

#[test]
fn test_first_fetch_includes_start_keys() {
    let boundary = KeyBoundary::new(keys())
        .unwrap()
        .with_start(tuple(3, 100))
        .unwrap()
        .enter_partition(1)
        .unwrap();
    assert!(boundary.is_first_fetch());

    let probe = builder(Arc::new(SqlServerDialect)).limit_probe(&boundary).unwrap();

    assert!(probe.sql.contains(
        "WHERE (([SRC].[region] > @p1) OR ([SRC].[region] = @p1 AND [SRC].[order_id] >= @p2))"
    ));
    assert_eq!(probe.params, vec![Value::Int32(3), Value::Int64(100)]);
}

#[test]
fn test_following_fetch_excludes_cursor() {
    let boundary = KeyBoundary::new(keys())
        .unwrap()
        .with_start(tuple(3, 100))
        .unwrap()
        .enter_partition(1)
        .unwrap()
        .advance(tuple(3, 600));
    assert!(!boundary.is_first_fetch());

    let probe = builder(Arc::new(SqlServerDialect)).limit_probe(&boundary).unwrap();

    assert!(probe
        .sql
        .contains("([SRC].[region] = @p1 AND [SRC].[order_id] > @p2)"));
    assert_eq!(probe.params, vec![Value::Int32(3), Value::Int64(600)]);
}

#[test]
fn test_restart_excludes_checkpoint() {
    let boundary = KeyBoundary::new(keys())
        .unwrap()
        .with_start(tuple(1, 1))
        .unwrap()
        .with_restart(Checkpoint::new(1, tuple(2, 42)))
        .unwrap()
        .enter_partition(1)
        .unwrap();

    assert_eq!(boundary.cursor(), &Cursor::After(tuple(2, 42)));
    assert!(!boundary.admits(&tuple(2, 42)));
    assert!(boundary.admits(&tuple(2, 43)));
}

// ==================== Parameter Order Tests ====================

#[test]
fn test_scan_parameters_follow_lower_end_upper() {
    let boundary = KeyBoundary::new(keys())
        .unwrap()
        .with_start(tuple(1, 0))
        .unwrap()
        .with_end(tuple(9, 0))
        .unwrap()
        .enter_partition(1)
        .unwrap();

    let scan = builder(Arc::new(SqlServerDialect))
        .batch_scan(&boundary, &tuple(2, 500), false)
        .unwrap();

    assert_eq!(
        scan.params,
        vec![
            Value::Int32(1),
            Value::Int64(0),
            Value::Int32(9),
            Value::Int64(0),
            Value::Int32(2),
            Value::Int64(500),
        ]
    );
    assert!(scan
        .sql
        .contains("([SRC].[region] = @p3 AND [SRC].[order_id] <= @p4)"));
    assert!(scan
        .sql
        .contains("([SRC].[region] = @p5 AND [SRC].[order_id] <= @p6)"));
    assert!(scan.sql.ends_with("ORDER BY [SRC].[region], [SRC].[order_id]"));
    assert!(!scan.is_final);
}

#[test]
fn test_prefix_end_keys_bound_leading_column() {
    let boundary = KeyBoundary::new(keys())
        .unwrap()
        .with_end(KeyTuple::new(vec![Value::Int32(4)]))
        .unwrap()
        .enter_partition(1)
        .unwrap();

    let probe = builder(Arc::new(SqlServerDialect)).limit_probe(&boundary).unwrap();

    assert!(probe.sql.contains("WHERE [SRC].[region] <= @p1"));
    assert_eq!(probe.params, vec![Value::Int32(4)]);
    assert!(boundary.admits(&tuple(4, i64::MAX)));
    assert!(!boundary.admits(&tuple(5, 0)));
}

#[test]
fn test_clamp_against_end_keys() {
    let boundary = KeyBoundary::new(keys())
        .unwrap()
        .with_end(tuple(5, 10))
        .unwrap();

    assert_eq!(boundary.clamp_limit(tuple(4, 99)), (tuple(4, 99), false));
    assert_eq!(boundary.clamp_limit(tuple(5, 10)), (tuple(5, 10), true));
    assert_eq!(boundary.clamp_limit(tuple(6, 0)), (tuple(5, 10), true));
}

#[test]
fn test_start_after_end_rejected() {
    let err = KeyBoundary::new(keys())
        .unwrap()
        .with_end(tuple(1, 0))
        .unwrap()
        .with_start(tuple(2, 0))
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[test]
fn test_too_many_key_values_rejected() {
    let err = KeyBoundary::new(keys())
        .unwrap()
        .with_start(KeyTuple::new(vec![
            Value::Int32(1),
            Value::Int64(2),
            Value::Int32(3),
        ]))
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

// ==================== PostgreSQL Tests ====================

#[test]
fn test_postgres_composite_scan() {
    let boundary = KeyBoundary::new(keys())
        .unwrap()
        .enter_partition(1)
        .unwrap()
        .advance(tuple(7, 70));

    let scan = builder(Arc::new(PostgresDialect))
        .batch_scan(&boundary, &tuple(8, 5), true)
        .unwrap();

    assert!(scan.sql.contains(
        "((\"SRC\".\"region\" > $1) OR (\"SRC\".\"region\" = $1 AND \"SRC\".\"order_id\" > $2))"
    ));
    assert!(scan.sql.contains(
        "((\"SRC\".\"region\" < $3) OR (\"SRC\".\"region\" = $3 AND \"SRC\".\"order_id\" <= $4))"
    ));
    assert!(scan.sql.contains("\"sales\".\"lines\" AS \"SRC\""));
    assert_eq!(scan.params.len(), 4);
    assert!(scan.is_final);
}

#[test]
fn test_postgres_probe_limits_batch() {
    let boundary = KeyBoundary::new(keys())
        .unwrap()
        .enter_partition(1)
        .unwrap();

    let probe = builder(Arc::new(PostgresDialect)).limit_probe(&boundary).unwrap();

    assert!(probe.sql.contains("LIMIT 500"));
    assert!(probe
        .sql
        .contains("ORDER BY \"LIM\".\"region\" DESC, \"LIM\".\"order_id\" DESC"));
    assert!(probe.sql.ends_with("LIMIT 1"));
    assert!(probe.params.is_empty());
}

// ==================== Partition Tests ====================

#[test]
fn test_partition_parameter_comes_first() {
    let partitioned = sales().with_partitioning(
        PartitionScheme {
            function: "pf_region".into(),
            column: "region".into(),
        },
        vec![
            PartitionInfo {
                number: 1,
                row_count: 10,
            },
            PartitionInfo {
                number: 3,
                row_count: 4,
            },
        ],
    );
    let fetch = FetchQueryBuilder::new(
        Arc::new(SqlServerDialect),
        &partitioned,
        &keys(),
        Projection::columns(["region", "order_id"]),
        100,
    )
    .unwrap();
    let boundary = KeyBoundary::new(keys())
        .unwrap()
        .with_partition_scoping(true)
        .with_restart(Checkpoint::new(3, tuple(3, 9)))
        .unwrap();

    assert!(boundary.enter_partition(1).is_none());
    let inside = boundary.enter_partition(3).unwrap();
    let scan = fetch.batch_scan(&inside, &tuple(3, 20), false).unwrap();

    assert!(scan
        .sql
        .contains("WHERE $PARTITION.[pf_region]([SRC].[region]) = @p1 AND"));
    assert_eq!(scan.params[0], Value::Int32(3));
    assert_eq!(scan.params.len(), 5);
    assert_eq!(scan.partition, 3);
}
