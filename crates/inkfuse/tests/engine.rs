//! End-to-end engine scenarios.
//!
//! Every query here is executed through the public relational-operator
//! builder API and checked as a multiset of rendered rows, across
//! execution modes and thread counts.

use std::sync::Arc;

use inkfuse::{
    AggDescription, AggOpCode, AggregationOp, BaseColumn, CollectingSink, ComputeOp,
    ExecutionMode, ExprNode, ExpressionOp, FilterOp, JoinOp, JoinType, PipelineDag, PrintOp,
    QueryExecutor, RelAlgOp, Relation, StringColumn, TableScanOp, Value,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;

const ALL_MODES: [ExecutionMode; 4] = [
    ExecutionMode::Interpreted,
    ExecutionMode::Fused,
    ExecutionMode::Hybrid,
    ExecutionMode::Rof,
];

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Build and run one query, returning the sorted result rows.
fn run_query(
    mode: ExecutionMode,
    threads: usize,
    build: impl FnOnce(&PipelineDag, Arc<CollectingSink>) -> RelAlgOp,
) -> Vec<Vec<String>> {
    init_tracing();
    let mut dag = PipelineDag::new();
    let sink = Arc::new(CollectingSink::new());
    let root = build(&dag, Arc::clone(&sink));
    QueryExecutor::new(mode, threads)
        .run_tree(&root, &mut dag)
        .unwrap();
    let mut rows = sink.take();
    rows.sort();
    rows
}

fn shuffled(values: Vec<u64>, seed: u64) -> Vec<u64> {
    let mut values = values;
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    values.shuffle(&mut rng);
    values
}

// ── S1: scan + expression + filter ─────────────────────────────────────────

fn scan_expr_filter_tree(dag: &PipelineDag, sink: Arc<CollectingSink>, rows: u64) -> RelAlgOp {
    let mut rel = Relation::new("t");
    rel.attach_filled("c", BaseColumn::U8((0..rows).map(|k| k % 500).collect()))
        .unwrap();
    let scan = TableScanOp::new(dag.ius(), Arc::new(rel), &["c"], "t").unwrap();
    let c = scan.output_ius()[0];
    // SELECT c + 7 FROM t WHERE c + 7 = 503
    let nodes = vec![
        ExprNode::IuRef(c),
        ExprNode::Const(Value::U8(7)),
        ExprNode::Compute {
            op: ComputeOp::Arith(inkfuse::ArithOp::Add),
            children: vec![0, 1],
        },
        ExprNode::Const(Value::U8(503)),
        ExprNode::Compute {
            op: ComputeOp::Arith(inkfuse::ArithOp::Eq),
            children: vec![2, 3],
        },
    ];
    let expr = ExpressionOp::new(
        dag.ius(),
        Box::new(RelAlgOp::TableScan(scan)),
        "expr",
        nodes,
        vec![2, 4],
    )
    .unwrap();
    let shifted = expr.output_ius()[0];
    let pred = expr.output_ius()[1];
    let filter = FilterOp::new(
        dag.ius(),
        Box::new(RelAlgOp::Expression(expr)),
        "filter",
        vec![shifted],
        pred,
    )
    .unwrap();
    let out = filter.output_ius()[0];
    let print = PrintOp::new(
        Box::new(RelAlgOp::Filter(filter)),
        vec![out],
        vec!["c7".into()],
        "print",
        None,
        sink,
    )
    .unwrap();
    RelAlgOp::Print(print)
}

#[test]
fn scan_expression_filter_finds_every_matching_row() {
    // c + 7 == 503 holds for c ≡ 496 (mod 500): 1000 hits in 500k rows.
    let rows = run_query(ExecutionMode::Hybrid, 4, |dag, sink| {
        scan_expr_filter_tree(dag, sink, 500_000)
    });
    assert_eq!(rows.len(), 1000);
    assert!(rows.iter().all(|row| row == &["503".to_string()]));
}

#[test]
fn scan_expression_filter_is_mode_and_thread_invariant() {
    let baseline = run_query(ExecutionMode::Interpreted, 1, |dag, sink| {
        scan_expr_filter_tree(dag, sink, 100_000)
    });
    assert_eq!(baseline.len(), 200);
    for mode in ALL_MODES {
        for threads in [1, 4] {
            let rows = run_query(mode, threads, |dag, sink| {
                scan_expr_filter_tree(dag, sink, 100_000)
            });
            assert_eq!(rows, baseline, "{mode:?} with {threads} threads diverged");
        }
    }
}

// ── S2: grouped aggregation ────────────────────────────────────────────────

fn group_by_tree(dag: &PipelineDag, sink: Arc<CollectingSink>, groups: u64) -> RelAlgOp {
    let repeats = 20_u64;
    let total = (groups * repeats) as usize;
    let mut col_1 = Vec::with_capacity(total);
    for _ in 0..repeats {
        col_1.extend(0..groups);
    }
    let mut rel = Relation::new("t");
    rel.attach_filled("col_1", BaseColumn::U8(col_1)).unwrap();
    rel.attach_filled("col_2", BaseColumn::I8(vec![7; total]))
        .unwrap();
    rel.attach_filled("col_3", BaseColumn::I4(vec![3; total]))
        .unwrap();
    let scan =
        TableScanOp::new(dag.ius(), Arc::new(rel), &["col_1", "col_2", "col_3"], "t").unwrap();
    let outs = scan.output_ius().to_vec();
    // SELECT col_1, sum(col_2), sum(col_3), count(col_2) GROUP BY col_1
    let agg = AggregationOp::new(
        dag.ius(),
        Box::new(RelAlgOp::TableScan(scan)),
        "agg",
        vec![outs[0]],
        vec![
            AggDescription {
                iu: outs[1],
                op: AggOpCode::Sum,
                distinct: false,
            },
            AggDescription {
                iu: outs[2],
                op: AggOpCode::Sum,
                distinct: false,
            },
            AggDescription {
                iu: outs[1],
                op: AggOpCode::Count,
                distinct: false,
            },
        ],
    )
    .unwrap();
    let agg_outs = agg.output_ius().to_vec();
    let print = PrintOp::new(
        Box::new(RelAlgOp::Aggregation(agg)),
        agg_outs,
        vec!["col_1".into(), "sum_2".into(), "sum_3".into(), "count".into()],
        "print",
        None,
        sink,
    )
    .unwrap();
    RelAlgOp::Print(print)
}

#[test]
fn group_by_produces_exact_aggregates() {
    let groups = 10_000_u64;
    let rows = run_query(ExecutionMode::Hybrid, 4, |dag, sink| {
        group_by_tree(dag, sink, groups)
    });
    assert_eq!(rows.len(), groups as usize);
    let mut seen = vec![false; groups as usize];
    for row in &rows {
        let key: usize = row[0].parse().unwrap();
        assert!(!seen[key], "group {key} appeared twice");
        seen[key] = true;
        assert_eq!(row[1], "140");
        assert_eq!(row[2], "60");
        assert_eq!(row[3], "20");
    }
    assert!(seen.iter().all(|s| *s));
}

#[test]
fn group_by_is_mode_and_thread_invariant() {
    let baseline = run_query(ExecutionMode::Interpreted, 1, |dag, sink| {
        group_by_tree(dag, sink, 2_000)
    });
    assert_eq!(baseline.len(), 2_000);
    for mode in ALL_MODES {
        for threads in [1, 4, 8] {
            let rows = run_query(mode, threads, |dag, sink| group_by_tree(dag, sink, 2_000));
            assert_eq!(rows, baseline, "{mode:?} with {threads} threads diverged");
        }
    }
}

// ── S3: primary-key inner join ─────────────────────────────────────────────

fn pk_join_tree(
    dag: &PipelineDag,
    sink: Arc<CollectingSink>,
    build_rows: u64,
    probe_universe: u64,
) -> RelAlgOp {
    let mut left = Relation::new("l");
    left.attach_filled("c1", BaseColumn::U8(shuffled((0..build_rows).collect(), 1)))
        .unwrap();
    left.attach_filled("c2", BaseColumn::U8(vec![3; build_rows as usize]))
        .unwrap();
    let mut right = Relation::new("r");
    let probe_keys: Vec<u64> = (0..2 * probe_universe).map(|i| i % probe_universe).collect();
    right
        .attach_filled("c1", BaseColumn::U8(shuffled(probe_keys, 2)))
        .unwrap();
    right
        .attach_filled("c2", BaseColumn::U8(vec![7; 2 * probe_universe as usize]))
        .unwrap();

    let lscan = TableScanOp::new(dag.ius(), Arc::new(left), &["c1", "c2"], "l").unwrap();
    let rscan = TableScanOp::new(dag.ius(), Arc::new(right), &["c1", "c2"], "r").unwrap();
    let louts = lscan.output_ius().to_vec();
    let routs = rscan.output_ius().to_vec();
    let join = JoinOp::new(
        dag.ius(),
        Box::new(RelAlgOp::TableScan(lscan)),
        Box::new(RelAlgOp::TableScan(rscan)),
        "join",
        vec![louts[0]],
        vec![louts[1]],
        vec![routs[0]],
        vec![routs[1]],
        JoinType::Inner,
        true,
    )
    .unwrap();
    let join_outs = join.output_ius().to_vec();
    let print = PrintOp::new(
        Box::new(RelAlgOp::Join(join)),
        join_outs,
        vec!["l_c1".into(), "l_c2".into(), "r_c1".into(), "r_c2".into()],
        "print",
        None,
        sink,
    )
    .unwrap();
    RelAlgOp::Print(print)
}

#[test]
fn pk_join_matches_every_existing_probe_key() {
    let build_rows = 50_000_u64;
    let probe_universe = 100_000_u64;
    let rows = run_query(ExecutionMode::Hybrid, 4, |dag, sink| {
        pk_join_tree(dag, sink, build_rows, probe_universe)
    });
    // Every probe key below build_rows exists and is probed twice.
    assert_eq!(rows.len(), 2 * build_rows as usize);
    let mut hits = vec![0_u32; build_rows as usize];
    for row in &rows {
        let l_c1: u64 = row[0].parse().unwrap();
        let r_c1: u64 = row[2].parse().unwrap();
        assert_eq!(l_c1, r_c1);
        assert!(l_c1 < build_rows);
        assert_eq!(row[1], "3");
        assert_eq!(row[3], "7");
        hits[l_c1 as usize] += 1;
    }
    assert!(hits.iter().all(|h| *h == 2));
}

#[test]
fn pk_join_is_mode_and_thread_invariant() {
    let baseline = run_query(ExecutionMode::Interpreted, 1, |dag, sink| {
        pk_join_tree(dag, sink, 5_000, 10_000)
    });
    assert_eq!(baseline.len(), 10_000);
    for mode in ALL_MODES {
        for threads in [1, 4] {
            let rows = run_query(mode, threads, |dag, sink| {
                pk_join_tree(dag, sink, 5_000, 10_000)
            });
            assert_eq!(rows, baseline, "{mode:?} with {threads} threads diverged");
        }
    }
}

// ── S5: left semi join over strings with slot disabling ────────────────────

fn semi_join_tree(dag: &PipelineDag, sink: Arc<CollectingSink>) -> RelAlgOp {
    let mut left = Relation::new("l");
    let mut lkeys = StringColumn::new();
    for key in ["alpha", "beta", "gamma"] {
        lkeys.push(key);
    }
    left.attach_filled("key", BaseColumn::String(lkeys)).unwrap();
    let mut right = Relation::new("r");
    let mut rkeys = StringColumn::new();
    for key in ["alpha", "alpha", "beta", "delta"] {
        rkeys.push(key);
    }
    right.attach_filled("key", BaseColumn::String(rkeys)).unwrap();

    let lscan = TableScanOp::new(dag.ius(), Arc::new(left), &["key"], "l").unwrap();
    let rscan = TableScanOp::new(dag.ius(), Arc::new(right), &["key"], "r").unwrap();
    let lkey = lscan.output_ius()[0];
    let rkey = rscan.output_ius()[0];
    let join = JoinOp::new(
        dag.ius(),
        Box::new(RelAlgOp::TableScan(lscan)),
        Box::new(RelAlgOp::TableScan(rscan)),
        "semi",
        vec![lkey],
        vec![],
        vec![rkey],
        vec![],
        JoinType::LeftSemi,
        true,
    )
    .unwrap();
    let outs = join.output_ius().to_vec();
    let print = PrintOp::new(
        Box::new(RelAlgOp::Join(join)),
        outs,
        vec!["key".into()],
        "print",
        None,
        sink,
    )
    .unwrap();
    RelAlgOp::Print(print)
}

#[test]
fn left_semi_join_serves_each_build_row_once() {
    for mode in ALL_MODES {
        let rows = run_query(mode, 2, semi_join_tree);
        // "alpha" matches once (the second probe hits a disabled slot),
        // "beta" once, "delta" never.
        assert_eq!(
            rows,
            vec![vec!["alpha".to_string()], vec!["beta".to_string()]],
            "{mode:?} diverged"
        );
    }
}

// ── Print limit and ingest ─────────────────────────────────────────────────

#[test]
fn row_limit_closes_the_pipeline_early() {
    let rows = run_query(ExecutionMode::Interpreted, 4, |dag, sink| {
        let mut rel = Relation::new("t");
        rel.attach_filled("c", BaseColumn::U8((0..1_000_000).collect()))
            .unwrap();
        let scan = TableScanOp::new(dag.ius(), Arc::new(rel), &["c"], "t").unwrap();
        let outs = scan.output_ius().to_vec();
        let print = PrintOp::new(
            Box::new(RelAlgOp::TableScan(scan)),
            outs,
            vec!["c".into()],
            "print",
            Some(5),
            sink,
        )
        .unwrap();
        RelAlgOp::Print(print)
    });
    assert_eq!(rows.len(), 5);
}

#[test]
fn ingested_text_rows_scan_back_through_the_engine() {
    let rows = run_query(ExecutionMode::Hybrid, 2, |dag, sink| {
        let mut rel = Relation::new("orders");
        rel.attach_column("id", &inkfuse::Type::UnsignedInt(8)).unwrap();
        rel.attach_column("shipped", &inkfuse::Type::Date).unwrap();
        rel.attach_column("comment", &inkfuse::Type::char_ptr())
            .unwrap();
        rel.load_rows("1|1970-02-01|first order|\n2|1970-01-02|second|\n")
            .unwrap();
        let scan =
            TableScanOp::new(dag.ius(), Arc::new(rel), &["id", "shipped", "comment"], "o")
                .unwrap();
        let outs = scan.output_ius().to_vec();
        let print = PrintOp::new(
            Box::new(RelAlgOp::TableScan(scan)),
            outs,
            vec!["id".into(), "shipped".into(), "comment".into()],
            "print",
            None,
            sink,
        )
        .unwrap();
        RelAlgOp::Print(print)
    });
    assert_eq!(
        rows,
        vec![
            vec!["1".to_string(), "1970-02-01".to_string(), "first order".to_string()],
            vec!["2".to_string(), "1970-01-02".to_string(), "second".to_string()],
        ]
    );
}
