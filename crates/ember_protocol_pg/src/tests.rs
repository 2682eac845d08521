use std::sync::Arc;

use ember_cluster::sharding::shard_for_key;
use ember_cluster::{LinkFault, LocalCluster};
use ember_common::config::SessionConfig;
use ember_common::datum::Datum;
use ember_common::types::{SessionId, ShardId};

use crate::codec::{BackendMessage, BatchBindMessage, BindMessage, FrontendMessage, RawValue};
use crate::handler::{Backend, Flow};
use crate::light_proxy::FastPathDecision;
use crate::session::Session;
use crate::txn_bracket::BlockState;

const INT4: i32 = 23;
const TEXT: i32 = 25;

fn setup_backend(shards: u64) -> Backend {
    setup_backend_with(shards, SessionConfig::default())
}

fn setup_backend_with(shards: u64, config: SessionConfig) -> Backend {
    let cluster = LocalCluster::with_shards(shards);
    let session = Session::new(SessionId(1), 42, cluster.txn_manager.clone(), config);
    Backend::new(cluster, session)
}

fn setup_table(backend: &mut Backend, keys: &[i32]) {
    query(backend, "CREATE TABLE t (k INT PRIMARY KEY, v INT)");
    for k in keys {
        let out = query(backend, &format!("INSERT INTO t VALUES ({k}, 0)"));
        assert_eq!(tags(&out), vec!["INSERT 0 1"]);
    }
}

fn query(backend: &mut Backend, sql: &str) -> Vec<BackendMessage> {
    backend.run_messages([FrontendMessage::Query(sql.into())])
}

fn parse(name: &str, sql: &str, types: &[i32]) -> FrontendMessage {
    FrontendMessage::Parse {
        name: name.into(),
        query: sql.into(),
        param_types: types.to_vec(),
    }
}

fn text(v: &str) -> RawValue {
    Some(v.as_bytes().to_vec())
}

fn bind(portal: &str, stmt: &str, params: &[&str]) -> FrontendMessage {
    FrontendMessage::Bind(BindMessage {
        portal: portal.into(),
        statement: stmt.into(),
        param_values: params.iter().map(|p| text(p)).collect(),
        ..BindMessage::default()
    })
}

fn execute(portal: &str, max_rows: i32) -> FrontendMessage {
    FrontendMessage::Execute {
        portal: portal.into(),
        max_rows,
    }
}

fn data_rows(msgs: &[BackendMessage]) -> Vec<Vec<Option<String>>> {
    msgs.iter()
        .filter_map(|m| match m {
            BackendMessage::DataRow { values } => Some(
                values
                    .iter()
                    .map(|v| v.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

fn tags(msgs: &[BackendMessage]) -> Vec<String> {
    msgs.iter()
        .filter_map(|m| match m {
            BackendMessage::CommandComplete { tag } => Some(tag.clone()),
            _ => None,
        })
        .collect()
}

fn error_codes(msgs: &[BackendMessage]) -> Vec<String> {
    msgs.iter()
        .filter_map(|m| match m {
            BackendMessage::ErrorResponse { code, .. } => Some(code.clone()),
            _ => None,
        })
        .collect()
}

fn ready_status(msgs: &[BackendMessage]) -> Option<u8> {
    msgs.iter().rev().find_map(|m| match m {
        BackendMessage::ReadyForQuery { txn_status } => Some(*txn_status),
        _ => None,
    })
}

/// First keys in 1.. that land on each of the given shards.
fn keys_on(backend: &Backend, shard: ShardId, n: usize) -> Vec<i32> {
    (1..10_000)
        .filter(|k| shard_for_key(&Datum::Int32(*k), &backend.cluster.shard_map) == shard)
        .take(n)
        .collect()
}

#[test]
fn test_unnamed_select_one() {
    let mut b = setup_backend(2);
    let out = b.run_messages([
        parse("", "SELECT 1", &[]),
        bind("", "", &[]),
        execute("", 0),
        FrontendMessage::Sync,
    ]);
    assert_eq!(out[0], BackendMessage::ParseComplete);
    assert_eq!(out[1], BackendMessage::BindComplete);
    assert_eq!(data_rows(&out), vec![vec![Some("1".to_string())]]);
    assert_eq!(tags(&out), vec!["SELECT 1"]);
    assert_eq!(ready_status(&out), Some(b'I'));
    assert!(
        !out.iter().any(|m| matches!(m, BackendMessage::RowDescription { .. })),
        "Execute does not describe"
    );
}

#[test]
fn test_no_ready_for_query_mid_sequence() {
    let mut b = setup_backend(2);
    let out = b.run_messages([parse("", "SELECT 1", &[]), bind("", "", &[]), execute("", 0)]);
    assert_eq!(ready_status(&out), None);
    let out = b.run_messages([FrontendMessage::Sync]);
    assert_eq!(out, vec![BackendMessage::ReadyForQuery { txn_status: b'I' }]);
}

#[test]
fn test_simple_query_multiple_statements() {
    let mut b = setup_backend(2);
    setup_table(&mut b, &[1, 2, 3]);
    let out = query(&mut b, "UPDATE t SET v = 7 WHERE k = 2; SELECT v FROM t WHERE k = 2");
    assert_eq!(tags(&out), vec!["UPDATE 1", "SELECT 1"]);
    assert_eq!(data_rows(&out), vec![vec![Some("7".to_string())]]);
    assert!(matches!(out[1], BackendMessage::RowDescription { .. }));
    assert_eq!(ready_status(&out), Some(b'I'));
}

#[test]
fn test_empty_query() {
    let mut b = setup_backend(1);
    let out = query(&mut b, "  ");
    assert_eq!(
        out,
        vec![
            BackendMessage::EmptyQueryResponse,
            BackendMessage::ReadyForQuery { txn_status: b'I' }
        ]
    );

    let out = b.run_messages([parse("", "", &[]), bind("", "", &[]), execute("", 0), FrontendMessage::Sync]);
    assert!(out.contains(&BackendMessage::EmptyQueryResponse));
    assert!(error_codes(&out).is_empty());
}

#[test]
fn test_batch_update_one_dispatch_per_shard() {
    let mut b = setup_backend(2);
    let mut keys = keys_on(&b, ShardId(0), 2);
    keys.extend(keys_on(&b, ShardId(1), 1));
    setup_table(&mut b, &keys);

    let out = b.run_messages([parse("s1", "UPDATE t SET v = $1 WHERE k = $2", &[INT4, INT4])]);
    assert_eq!(out, vec![BackendMessage::ParseComplete]);

    let before = b.cluster.transport.total_dispatches();
    let batch = BatchBindMessage {
        statement: "s1".into(),
        param_sets: keys.iter().map(|k| vec![text("9"), text(&k.to_string())]).collect(),
        ..BatchBindMessage::default()
    };
    let out = b.run_messages([FrontendMessage::BatchBindExecute(batch), FrontendMessage::Sync]);
    assert_eq!(b.cluster.transport.total_dispatches() - before, 2);
    assert_eq!(tags(&out), vec!["UPDATE 3"]);
    assert_eq!(out[0], BackendMessage::BindComplete);
    assert_eq!(ready_status(&out), Some(b'I'));

    let out = query(&mut b, "SELECT k FROM t WHERE v = 9");
    assert_eq!(data_rows(&out).len(), 3);
}

#[test]
fn test_batch_without_fast_path_runs_sequentially() {
    let config = SessionConfig {
        enable_batch_fast_path: false,
        ..SessionConfig::default()
    };
    let mut b = setup_backend_with(2, config);
    setup_table(&mut b, &[]);
    b.run_messages([parse("ins", "INSERT INTO t VALUES ($1, $2)", &[])]);
    let batch = BatchBindMessage {
        statement: "ins".into(),
        param_sets: (1..=4).map(|k| vec![text(&k.to_string()), text("1")]).collect(),
        describe: Some((b'P', String::new())),
        ..BatchBindMessage::default()
    };
    let out = b.run_messages([FrontendMessage::BatchBindExecute(batch), FrontendMessage::Sync]);
    assert_eq!(tags(&out), vec!["INSERT 0 4"]);
    assert!(out.contains(&BackendMessage::NoData));
}

#[test]
fn test_batch_rejects_row_limit() {
    let mut b = setup_backend(1);
    b.run_messages([parse("s", "SELECT 1", &[])]);
    let batch = BatchBindMessage {
        statement: "s".into(),
        param_sets: vec![vec![]],
        max_rows: 5,
        ..BatchBindMessage::default()
    };
    let out = b.run_messages([FrontendMessage::BatchBindExecute(batch), FrontendMessage::Sync]);
    assert_eq!(error_codes(&out), vec!["08P01"]);
}

#[test]
fn test_batch_of_transaction_control_runs_one_by_one() {
    let mut b = setup_backend(1);
    b.run_messages([parse("sp", "SAVEPOINT a", &[])]);
    query(&mut b, "BEGIN");
    let batch = BatchBindMessage {
        statement: "sp".into(),
        param_sets: vec![vec![], vec![]],
        ..BatchBindMessage::default()
    };
    let out = b.run_messages([FrontendMessage::BatchBindExecute(batch), FrontendMessage::Sync]);
    assert_eq!(tags(&out), vec!["SAVEPOINT", "SAVEPOINT"]);
    assert_eq!(
        out.iter()
            .filter(|m| **m == BackendMessage::BindComplete)
            .count(),
        2
    );
    assert_eq!(ready_status(&out), Some(b'T'));
}

#[test]
fn test_batch_one_by_one_reuses_named_portal() {
    let mut b = setup_backend(1);
    b.run_messages([parse("e", "", &[]), parse("sp", "SAVEPOINT a", &[])]);
    let batch = BatchBindMessage {
        statement: "e".into(),
        portal: "p".into(),
        execute_portal: "p".into(),
        param_sets: vec![vec![], vec![]],
        ..BatchBindMessage::default()
    };
    let out = b.run_messages([FrontendMessage::BatchBindExecute(batch), FrontendMessage::Sync]);
    assert!(error_codes(&out).is_empty(), "{out:?}");
    assert_eq!(
        out.iter()
            .filter(|m| **m == BackendMessage::EmptyQueryResponse)
            .count(),
        2
    );

    query(&mut b, "BEGIN");
    let batch = BatchBindMessage {
        statement: "sp".into(),
        portal: "q".into(),
        execute_portal: "q".into(),
        param_sets: vec![vec![], vec![], vec![]],
        ..BatchBindMessage::default()
    };
    let out = b.run_messages([FrontendMessage::BatchBindExecute(batch), FrontendMessage::Sync]);
    assert!(error_codes(&out).is_empty(), "{out:?}");
    assert_eq!(tags(&out), vec!["SAVEPOINT", "SAVEPOINT", "SAVEPOINT"]);
    assert_eq!(ready_status(&out), Some(b'T'));
}

#[test]
fn test_bind_unknown_statement_opens_no_transaction() {
    let mut b = setup_backend(1);
    let out = b.run_messages([bind("", "nope", &[])]);
    assert_eq!(error_codes(&out), vec!["26000"]);
    assert_eq!(b.session.bracket.state(), BlockState::Default);
    assert!(!b.session.transaction_open());
    assert!(b.session.resources.is_empty());
    assert!(b.session.protocol.skip_till_sync);
}

#[test]
fn test_skip_till_sync() {
    let mut b = setup_backend(1);
    let out = b.run_messages([
        parse("", "SELECT * FROM missing", &[]),
        bind("", "", &[]),
        FrontendMessage::Describe {
            kind: b'P',
            name: String::new(),
        },
        execute("", 0),
        parse("", "SELECT 1", &[]),
        FrontendMessage::Sync,
    ]);
    assert_eq!(out.len(), 2, "{out:?}");
    assert_eq!(error_codes(&out), vec!["42P01"]);
    assert_eq!(out[1], BackendMessage::ReadyForQuery { txn_status: b'I' });
    assert!(!b.session.protocol.skip_till_sync);

    let out = b.run_messages([parse("", "SELECT 1", &[]), FrontendMessage::Sync]);
    assert_eq!(
        out,
        vec![
            BackendMessage::ParseComplete,
            BackendMessage::ReadyForQuery { txn_status: b'I' }
        ]
    );
}

#[test]
fn test_simple_query_error_does_not_skip() {
    let mut b = setup_backend(1);
    let out = query(&mut b, "SELEC 1");
    assert_eq!(error_codes(&out), vec!["42601"]);
    assert_eq!(ready_status(&out), Some(b'I'));
    assert!(!b.session.protocol.skip_till_sync);
}

#[test]
fn test_failed_block_accepts_only_exit() {
    let mut b = setup_backend(2);
    assert_eq!(ready_status(&query(&mut b, "BEGIN")), Some(b'T'));
    let out = query(&mut b, "SELECT * FROM missing");
    assert_eq!(ready_status(&out), Some(b'E'));

    let out = query(&mut b, "SELECT 1");
    assert_eq!(error_codes(&out), vec!["25P02"]);
    assert_eq!(ready_status(&out), Some(b'E'));

    let out = b.run_messages([parse("", "SELECT 1", &[]), FrontendMessage::Sync]);
    assert_eq!(error_codes(&out), vec!["25P02"]);

    let out = query(&mut b, "COMMIT");
    assert_eq!(tags(&out), vec!["ROLLBACK"]);
    assert_eq!(ready_status(&out), Some(b'I'));
}

#[test]
fn test_rollback_to_savepoint_recovers_block() {
    let mut b = setup_backend(2);
    setup_table(&mut b, &[]);
    query(&mut b, "BEGIN");
    query(&mut b, "INSERT INTO t VALUES (1, 1)");
    query(&mut b, "SAVEPOINT a");
    query(&mut b, "INSERT INTO t VALUES (2, 2)");
    let out = query(&mut b, "INSERT INTO nowhere VALUES (3)");
    assert_eq!(ready_status(&out), Some(b'E'));
    let out = query(&mut b, "ROLLBACK TO SAVEPOINT a");
    assert_eq!(ready_status(&out), Some(b'T'));
    assert_eq!(tags(&query(&mut b, "COMMIT")), vec!["COMMIT"]);

    let out = query(&mut b, "SELECT k FROM t");
    assert_eq!(data_rows(&out), vec![vec![Some("1".to_string())]]);
}

#[test]
fn test_commit_outside_block_warns() {
    let mut b = setup_backend(1);
    let out = query(&mut b, "COMMIT");
    assert!(matches!(
        &out[0],
        BackendMessage::NoticeResponse { code, .. } if code == "25P01"
    ));
    assert_eq!(tags(&out), vec!["COMMIT"]);
}

#[test]
fn test_portal_suspends_and_resumes() {
    let mut b = setup_backend(2);
    setup_table(&mut b, &[1, 2, 3]);
    let out = b.run_messages([parse("", "SELECT k FROM t", &[]), bind("c", "", &[]), execute("c", 2)]);
    assert_eq!(data_rows(&out).len(), 2);
    assert_eq!(out.last(), Some(&BackendMessage::PortalSuspended));

    let out = b.run_messages([execute("c", 0), FrontendMessage::Sync]);
    assert_eq!(data_rows(&out).len(), 1);
    assert_eq!(tags(&out), vec!["SELECT 1"]);
    assert!(b.session.portals.is_empty(), "portals end with the transaction");
}

#[test]
fn test_unnamed_portal_rebind() {
    let mut b = setup_backend(2);
    setup_table(&mut b, &[1, 2]);
    let out = b.run_messages([
        parse("s", "SELECT v FROM t WHERE k = $1", &[]),
        bind("", "s", &["1"]),
        bind("", "s", &["2"]),
        execute("", 0),
        FrontendMessage::Sync,
    ]);
    assert!(error_codes(&out).is_empty(), "{out:?}");
    assert_eq!(data_rows(&out).len(), 1);

    let out = b.run_messages([bind("p", "s", &["1"]), bind("p", "s", &["2"]), FrontendMessage::Sync]);
    assert_eq!(error_codes(&out), vec!["42P03"]);
}

#[test]
fn test_named_statement_lifecycle() {
    let mut b = setup_backend(1);
    let out = b.run_messages([
        parse("s1", "SELECT 1", &[]),
        parse("s1", "SELECT 2", &[]),
        FrontendMessage::Sync,
    ]);
    assert_eq!(error_codes(&out), vec!["42P05"]);

    let out = b.run_messages([parse("s1", "", &[]), FrontendMessage::Sync]);
    assert_eq!(out[0], BackendMessage::ParseComplete);

    let out = b.run_messages([
        bind("held", "s1", &[]),
        FrontendMessage::Close {
            kind: b'S',
            name: "s1".into(),
        },
        parse("s1", "SELECT 2", &[]),
        bind("", "s1", &[]),
        execute("", 0),
        execute("held", 0),
        FrontendMessage::Sync,
    ]);
    assert!(error_codes(&out).is_empty(), "{out:?}");
    assert_eq!(
        data_rows(&out),
        vec![vec![Some("2".to_string())], vec![Some("1".to_string())]]
    );
}

#[test]
fn test_close_asymmetry() {
    let mut b = setup_backend(1);
    let out = b.run_messages([
        FrontendMessage::Close {
            kind: b'P',
            name: "never".into(),
        },
        FrontendMessage::Sync,
    ]);
    assert_eq!(out[0], BackendMessage::CloseComplete);

    let out = b.run_messages([
        FrontendMessage::Close {
            kind: b'S',
            name: "never".into(),
        },
        FrontendMessage::Sync,
    ]);
    assert_eq!(error_codes(&out), vec!["26000"]);
}

#[test]
fn test_param_count_mismatch_is_protocol_violation() {
    let mut b = setup_backend(1);
    setup_table(&mut b, &[]);
    b.run_messages([parse("s", "SELECT v FROM t WHERE k = $1", &[]), FrontendMessage::Sync]);
    for supplied in [vec![], vec!["1", "2"]] {
        let out = b.run_messages([bind("", "s", &supplied), FrontendMessage::Sync]);
        assert_eq!(error_codes(&out), vec!["08P01"]);
    }
}

#[test]
fn test_parameter_reference_beyond_limit() {
    let mut b = setup_backend(1);
    let out = b.run_messages([parse("", "SELECT $4000000000", &[]), FrontendMessage::Sync]);
    assert_eq!(error_codes(&out), vec!["42P02"]);
    assert_eq!(ready_status(&out), Some(b'I'));
}

#[test]
fn test_describe_statement_and_portal() {
    let mut b = setup_backend(1);
    setup_table(&mut b, &[]);
    let out = b.run_messages([
        parse("s", "SELECT v FROM t WHERE k = $1", &[]),
        FrontendMessage::Describe {
            kind: b'S',
            name: "s".into(),
        },
        parse("u", "DELETE FROM t WHERE k = $1", &[]),
        FrontendMessage::Describe {
            kind: b'S',
            name: "u".into(),
        },
        FrontendMessage::Describe {
            kind: b'X',
            name: "u".into(),
        },
        FrontendMessage::Sync,
    ]);
    assert_eq!(out[1], BackendMessage::ParameterDescription { type_oids: vec![INT4] });
    match &out[2] {
        BackendMessage::RowDescription { fields } => {
            assert_eq!(fields.len(), 1);
            assert_eq!(fields[0].name, "v");
            assert_eq!(fields[0].type_oid, INT4);
        }
        other => panic!("expected RowDescription, got {other:?}"),
    }
    assert_eq!(out[5], BackendMessage::NoData);
    assert_eq!(error_codes(&out), vec!["08P01"]);
}

#[test]
fn test_light_proxy_single_dispatch() {
    let mut b = setup_backend(4);
    setup_table(&mut b, &[5]);
    b.run_messages([parse("s", "SELECT v FROM t WHERE k = $1", &[]), FrontendMessage::Sync]);

    let before = b.cluster.transport.total_dispatches();
    let out = b.run_messages([bind("", "s", &["5"]), execute("", 0), FrontendMessage::Sync]);
    assert_eq!(b.cluster.transport.total_dispatches() - before, 1);
    assert_eq!(data_rows(&out), vec![vec![Some("0".to_string())]]);
    assert_eq!(tags(&out), vec!["SELECT 1"]);
}

#[test]
fn test_indeterminate_key_takes_full_path_once() {
    let mut b = setup_backend(4);
    setup_table(&mut b, &[5]);
    b.run_messages([parse("s", "SELECT v FROM t WHERE k = $1", &[TEXT]), FrontendMessage::Sync]);

    let out = b.run_messages([bind("", "s", &["abc"]), execute("", 0), FrontendMessage::Sync]);
    assert_eq!(out[0], BackendMessage::BindComplete);
    assert_eq!(error_codes(&out), vec!["22P02"], "full path coerces the key");
    let stmt = b.session.statements.get("s").unwrap();
    assert!(matches!(
        stmt.cached_plan().decision,
        FastPathDecision::Keyed { param: 1, .. }
    ));

    let before = b.cluster.transport.total_dispatches();
    let out = b.run_messages([bind("", "s", &["5"]), execute("", 0), FrontendMessage::Sync]);
    assert_eq!(b.cluster.transport.total_dispatches() - before, 1);
    assert_eq!(data_rows(&out), vec![vec![Some("0".to_string())]]);
}

#[test]
fn test_light_proxy_falls_back_when_link_unavailable() {
    let mut b = setup_backend(2);
    setup_table(&mut b, &[5]);
    let shard = shard_for_key(&Datum::Int32(5), &b.cluster.shard_map);
    b.run_messages([parse("s", "UPDATE t SET v = $2 WHERE k = $1", &[]), FrontendMessage::Sync]);

    b.cluster.transport.faults().arm(shard, LinkFault::BeforeSend);
    let out = b.run_messages([bind("", "s", &["5", "8"]), execute("", 0), FrontendMessage::Sync]);
    assert!(error_codes(&out).is_empty(), "{out:?}");
    assert_eq!(tags(&out), vec!["UPDATE 1"]);
    assert_eq!(b.cluster.transport.faults().faults_fired(), 1);

    let out = query(&mut b, "SELECT v FROM t WHERE k = 5");
    assert_eq!(data_rows(&out), vec![vec![Some("8".to_string())]]);
}

#[test]
fn test_light_proxy_after_send_failure_is_an_error() {
    let mut b = setup_backend(2);
    setup_table(&mut b, &[5]);
    let shard = shard_for_key(&Datum::Int32(5), &b.cluster.shard_map);
    b.run_messages([parse("s", "UPDATE t SET v = $2 WHERE k = $1", &[]), FrontendMessage::Sync]);

    b.cluster.transport.faults().arm(shard, LinkFault::AfterSend);
    let out = b.run_messages([bind("", "s", &["5", "8"]), execute("", 0), FrontendMessage::Sync]);
    assert_eq!(error_codes(&out), vec!["08006"]);
    assert_eq!(b.cluster.transport.links_in_use(), 0);

    let out = query(&mut b, "SELECT v FROM t WHERE k = 5");
    assert_eq!(data_rows(&out), vec![vec![Some("0".to_string())]], "implicit txn rolled back");
}

#[test]
fn test_replan_after_ddl_between_executions() {
    let mut b = setup_backend(2);
    setup_table(&mut b, &[1]);
    b.run_messages([parse("s", "SELECT v FROM t WHERE k = $1", &[]), FrontendMessage::Sync]);
    query(&mut b, "DROP TABLE t");
    query(&mut b, "CREATE TABLE t (k INT PRIMARY KEY, v INT)");
    query(&mut b, "INSERT INTO t VALUES (1, 4)");

    let out = b.run_messages([bind("", "s", &["1"]), execute("", 0), FrontendMessage::Sync]);
    assert_eq!(data_rows(&out), vec![vec![Some("4".to_string())]]);
}

#[test]
fn test_idle_cancel_is_discarded() {
    let mut b = setup_backend(1);
    b.session.interrupts.request_cancel();
    let out = query(&mut b, "SELECT 1");
    assert!(error_codes(&out).is_empty());
    assert_eq!(tags(&out), vec!["SELECT 1"]);
}

#[test]
fn test_cancel_deferred_while_skipping() {
    let mut b = setup_backend(1);
    b.run_messages([parse("", "SELECT * FROM missing", &[])]);
    assert!(b.session.protocol.skip_till_sync);

    b.session.interrupts.request_cancel();
    let out = b.run_messages([bind("", "", &[])]);
    assert!(out.is_empty());
    assert!(b.session.interrupts.cancel_pending());

    b.run_messages([FrontendMessage::Sync]);
    let out = query(&mut b, "SELECT 1");
    assert!(error_codes(&out).is_empty());
    assert!(!b.session.interrupts.cancel_pending());
}

#[test]
fn test_terminate_request_is_fatal() {
    let mut b = setup_backend(1);
    b.session.interrupts.request_terminate();
    assert_eq!(b.handle_message(FrontendMessage::Query("SELECT 1".into())), Flow::Terminate);
    let out = b.take_output();
    assert!(matches!(
        &out[..],
        [BackendMessage::ErrorResponse { severity, code, .. }] if severity == "FATAL" && code == "57P01"
    ));
}

#[test]
fn test_extended_transaction_control_clears_portals() {
    let mut b = setup_backend(2);
    setup_table(&mut b, &[1, 2]);
    let out = b.run_messages([
        parse("begin", "BEGIN", &[]),
        parse("commit", "COMMIT", &[]),
        parse("sel", "SELECT k FROM t", &[]),
        bind("", "begin", &[]),
        execute("", 0),
        bind("c", "sel", &[]),
        execute("c", 1),
        FrontendMessage::Sync,
    ]);
    assert_eq!(ready_status(&out), Some(b'T'));
    assert!(b.session.portals.exists("c"));

    let out = b.run_messages([bind("", "commit", &[]), execute("", 0), FrontendMessage::Sync]);
    assert_eq!(tags(&out), vec!["COMMIT"]);
    assert_eq!(ready_status(&out), Some(b'I'));
    assert!(!b.session.portals.exists("c"));
}

#[test]
fn test_terminate_message() {
    let mut b = setup_backend(1);
    query(&mut b, "BEGIN");
    assert_eq!(b.handle_message(FrontendMessage::Terminate), Flow::Terminate);
    assert!(!b.session.transaction_open());
}

#[test]
fn test_dropped_session_rolls_back_open_block() {
    let cluster = LocalCluster::with_shards(2);
    let session = Session::new(SessionId(3), 1, cluster.txn_manager.clone(), SessionConfig::default());
    let mut b = Backend::new(Arc::clone(&cluster), session);
    setup_table(&mut b, &[]);
    query(&mut b, "BEGIN");
    assert_eq!(tags(&query(&mut b, "INSERT INTO t VALUES (5, 1)")), vec!["INSERT 0 1"]);
    drop(b);

    let session = Session::new(SessionId(4), 2, cluster.txn_manager.clone(), SessionConfig::default());
    let mut other = Backend::new(Arc::clone(&cluster), session);
    let out = query(&mut other, "SELECT k FROM t WHERE k = 5");
    assert!(data_rows(&out).is_empty(), "{out:?}");
    assert_eq!(tags(&out), vec!["SELECT 0"]);
}

#[test]
fn test_recovery_releases_resources() {
    let cluster = LocalCluster::new(2, ember_cluster::AdmissionControl::new(1, 0));
    let session = Session::new(SessionId(7), 1, cluster.txn_manager.clone(), SessionConfig::default());
    let mut b = Backend::new(Arc::clone(&cluster), session);
    for _ in 0..3 {
        let out = b.run_messages([parse("", "SELECT * FROM missing", &[]), FrontendMessage::Sync]);
        assert_eq!(error_codes(&out), vec!["42P01"]);
        assert_eq!(cluster.admission.inflight_statements(), 0);
    }
    let out = query(&mut b, "SELECT 1");
    assert_eq!(tags(&out), vec!["SELECT 1"]);
}
