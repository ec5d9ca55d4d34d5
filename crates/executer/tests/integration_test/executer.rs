use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlbatch_executer::*;
use tokio_util::sync::CancellationToken;

use crate::support::{MockConnector, MockSession, SERVER_EPOCH_MILLIS, SERVER_TIME};

fn no_vars() -> HashMap<String, String> {
    HashMap::new()
}

fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn write_then_read_batch() {
    let (session, recorder) = MockSession::new();
    let mut executer = Executer::with_session(Box::new(session));

    let selects = Arc::new(Mutex::new(Vec::new()));
    let seen = selects.clone();
    executer.set_select_observer(move |stmt: &str, columns: &[String], rows: &[Vec<String>]| {
        seen.lock()
            .unwrap()
            .push((stmt.to_string(), columns.to_vec(), rows.to_vec()));
    });

    let result = executer
        .execute(
            &CancellationToken::new(),
            "UPDATE t SET a=1;\nSELECT * FROM t;",
            &no_vars(),
        )
        .await
        .unwrap();

    assert_eq!(result.outcomes.len(), 2);
    match &result.outcomes[0] {
        ExecutionOutcome::Write(w) => {
            assert_eq!(w.statement, "UPDATE t SET a=1");
            assert_eq!(w.rows_affected, 1);
            assert_eq!(w.last_insert_id, 42);
        }
        other => panic!("expected write, got {other:?}"),
    }
    let read = result.outcomes[1].as_read().expect("second outcome is a read");
    assert_eq!(read.columns, vec!["id", "name"]);
    // NULL comes back as the empty string.
    assert_eq!(read.rows, vec![vec!["1", "alice"], vec!["2", ""]]);

    let selects = selects.lock().unwrap();
    assert_eq!(selects.len(), 1);
    assert_eq!(selects[0].0, "SELECT * FROM t");
    assert_eq!(selects[0].2, read.rows);

    assert_eq!(
        recorder.sent(),
        vec!["UPDATE t SET a=1", "SELECT * FROM t", DEFAULT_TIME_CHECK_QUERY]
    );
    // Wall clock as the session reports it; the epoch comes from the server, not from the wall clock.
    assert_eq!(result.last_execute_time, parse_server_time(SERVER_TIME).unwrap());
    assert_eq!(result.last_execute_unix_milli, SERVER_EPOCH_MILLIS);
    assert_eq!(executer.last_execute_time().await, Some(result.last_execute_time));
    assert_eq!(executer.last_execute_unix_milli().await, Some(SERVER_EPOCH_MILLIS));
}

#[tokio::test]
async fn templates_render_before_splitting() {
    let (session, recorder) = MockSession::new();
    let executer = Executer::with_session(Box::new(session));

    let script = r#"{% for i in range(3) %}INSERT INTO t VALUES ({{ i }}, '{{ must_var("name") }}');{% endfor %}"#;
    let result = executer
        .execute(&CancellationToken::new(), script, &vars(&[("name", "bob")]))
        .await
        .unwrap();

    assert_eq!(result.outcomes.len(), 3);
    assert_eq!(
        recorder.execs(),
        vec![
            "INSERT INTO t VALUES (0, 'bob')",
            "INSERT INTO t VALUES (1, 'bob')",
            "INSERT INTO t VALUES (2, 'bob')",
        ]
    );
}

#[tokio::test]
async fn blank_statements_are_skipped() {
    let (session, recorder) = MockSession::new();
    let executer = Executer::with_session(Box::new(session));

    let result = executer
        .execute(&CancellationToken::new(), ";;\n  ;DELETE FROM t;\n", &no_vars())
        .await
        .unwrap();

    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(recorder.execs(), vec!["DELETE FROM t"]);
}

#[tokio::test]
async fn cancel_between_statements_stops_the_batch() {
    let (session, recorder) = MockSession::new();
    let mut executer = Executer::with_session(Box::new(session));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    executer.set_execute_observer(move |_: &str, _: u64, _: u64| trigger.cancel());

    let err = executer
        .execute(
            &cancel,
            "INSERT INTO t VALUES (1); INSERT INTO t VALUES (2); INSERT INTO t VALUES (3);",
            &no_vars(),
        )
        .await
        .unwrap_err();

    assert!(err.is_cancelled(), "{err:?}");
    assert_eq!(recorder.execs(), vec!["INSERT INTO t VALUES (1)"]);
    // No time check after a cancelled batch.
    assert!(recorder.queries().is_empty());
    assert_eq!(executer.last_execute_time().await, None);
}

#[tokio::test]
async fn cancel_after_last_statement_keeps_the_batch() {
    let (session, recorder) = MockSession::new();
    let mut executer = Executer::with_session(Box::new(session));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    executer.set_execute_observer(move |stmt: &str, _: u64, _: u64| {
        if stmt.starts_with("DELETE") {
            trigger.cancel();
        }
    });

    let result = executer
        .execute(&cancel, "INSERT INTO t VALUES (1);\nDELETE FROM t;\n", &no_vars())
        .await
        .unwrap();

    assert!(cancel.is_cancelled());
    assert_eq!(result.outcomes.len(), 2);
    assert_eq!(recorder.queries(), vec![DEFAULT_TIME_CHECK_QUERY]);
    assert_eq!(result.last_execute_unix_milli, SERVER_EPOCH_MILLIS);
    assert_eq!(executer.last_execute_time().await, Some(result.last_execute_time));
}

#[tokio::test]
async fn cancel_interrupts_running_statement() {
    let (mut session, recorder) = MockSession::new();
    session.delay = Duration::from_secs(30);
    let executer = Executer::with_session(Box::new(session));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        executer.execute(&cancel, "UPDATE big SET a=1; DELETE FROM t;", &no_vars()),
    )
    .await
    .expect("cancel should not wait for the statement")
    .unwrap_err();

    assert!(err.is_cancelled(), "{err:?}");
    assert_eq!(recorder.sent(), vec!["UPDATE big SET a=1"]);
    assert!(recorder.execs().is_empty());
}

#[tokio::test]
async fn garbage_epoch_fails_the_time_check() {
    let (mut session, _) = MockSession::new();
    session.server_epoch = Some("soon".into());
    let executer = Executer::with_session(Box::new(session));

    let err = executer
        .execute(&CancellationToken::new(), "DELETE FROM t;", &no_vars())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("scan db epoch"), "{err}");
}

#[tokio::test]
async fn already_cancelled_runs_nothing() {
    let (session, recorder) = MockSession::new();
    let executer = Executer::with_session(Box::new(session));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = executer.execute(&cancel, "DELETE FROM t;", &no_vars()).await.unwrap_err();
    assert!(matches!(err, BatchError::Cancelled));
    assert!(recorder.sent().is_empty());
}

#[tokio::test]
async fn template_error_executes_nothing() {
    let (session, recorder) = MockSession::new();
    let executer = Executer::with_session(Box::new(session));

    let err = executer
        .execute(
            &CancellationToken::new(),
            r#"DELETE FROM t; SELECT '{{ must_var("missing") }}';"#,
            &no_vars(),
        )
        .await
        .unwrap_err();

    match err {
        BatchError::Template(TemplateError::MissingVariable(key)) => assert_eq!(key, "missing"),
        other => panic!("expected missing variable, got {other:?}"),
    }
    assert!(recorder.sent().is_empty());
}

#[tokio::test]
async fn failed_statement_names_the_statement() {
    let (mut session, recorder) = MockSession::new();
    session.fail_on = Some("bogus".into());
    let executer = Executer::with_session(Box::new(session));

    let err = executer
        .execute(
            &CancellationToken::new(),
            "DELETE FROM t; UPDATE bogus SET a=1; DELETE FROM u;",
            &no_vars(),
        )
        .await
        .unwrap_err();

    match &err {
        BatchError::StatementExecution { statement, .. } => assert_eq!(statement, "UPDATE bogus SET a=1"),
        other => panic!("expected statement failure, got {other:?}"),
    }
    assert!(err.to_string().contains("UPDATE bogus SET a=1"));
    // The first statement stays applied, the third never runs.
    assert_eq!(recorder.execs(), vec!["DELETE FROM t", "UPDATE bogus SET a=1"]);
}

#[tokio::test]
async fn time_check_failure_fails_the_batch() {
    let (mut session, recorder) = MockSession::new();
    session.time_check_fails = true;
    let executer = Executer::with_session(Box::new(session));

    let err = executer
        .execute(&CancellationToken::new(), "DELETE FROM t;", &no_vars())
        .await
        .unwrap_err();

    assert!(matches!(err, BatchError::TimeCheck(_)), "{err:?}");
    assert_eq!(recorder.execs(), vec!["DELETE FROM t"]);
    assert_eq!(executer.last_execute_time().await, None);
}

#[tokio::test]
async fn time_check_without_rows_or_with_garbage_fails() {
    let (mut session, _) = MockSession::new();
    session.server_time = None;
    let executer = Executer::with_session(Box::new(session));
    let err = executer
        .execute(&CancellationToken::new(), "DELETE FROM t;", &no_vars())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("returned no value"), "{err}");

    let (mut session, _) = MockSession::new();
    session.server_time = Some("not a time".into());
    let executer = Executer::with_session(Box::new(session));
    let err = executer
        .execute(&CancellationToken::new(), "DELETE FROM t;", &no_vars())
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::TimeCheck(_)), "{err:?}");
}

#[tokio::test]
async fn custom_time_check_query() {
    let (session, recorder) = MockSession::new();
    let mut executer = Executer::with_session(Box::new(session));
    executer.set_time_check_query("SELECT CURRENT_TIMESTAMP");

    let result = executer
        .execute(&CancellationToken::new(), "DELETE FROM t;", &no_vars())
        .await
        .unwrap();

    assert_eq!(recorder.queries(), vec!["SELECT CURRENT_TIMESTAMP"]);
    // Without an epoch column the wall clock is read as UTC.
    assert_eq!(
        result.last_execute_unix_milli,
        result.last_execute_time.and_utc().timestamp_millis()
    );
}

#[tokio::test]
async fn classifier_override_routes_statements() {
    let (session, recorder) = MockSession::new();
    let mut executer = Executer::with_session(Box::new(session));
    executer.set_classifier(|stmt: &str| stmt.starts_with("CALL"));

    let result = executer
        .execute(&CancellationToken::new(), "CALL report(); SELECT 1;", &no_vars())
        .await
        .unwrap();

    assert!(result.outcomes[0].as_read().is_some());
    assert!(result.outcomes[1].as_read().is_none());
    assert_eq!(recorder.execs(), vec!["SELECT 1"]);
}

#[tokio::test]
async fn reads_without_observer_still_query() {
    let (session, recorder) = MockSession::new();
    let executer = Executer::with_session(Box::new(session));

    let result = executer
        .execute(&CancellationToken::new(), "show tables", &no_vars())
        .await
        .unwrap();

    assert_eq!(result.reads().count(), 1);
    assert!(recorder.execs().is_empty());
    assert_eq!(recorder.queries()[0], "show tables");
}

#[tokio::test]
async fn table_observer_receives_rendered_table() {
    let (session, _) = MockSession::new();
    let mut executer = Executer::with_session(Box::new(session));

    let tables = Arc::new(Mutex::new(Vec::new()));
    let sink = tables.clone();
    executer.set_select_observer(TableSelectObserver::new(move |_: &str, table: &str| {
        sink.lock().unwrap().push(table.to_string());
    }));

    executer
        .execute(&CancellationToken::new(), "SELECT id, name FROM users", &no_vars())
        .await
        .unwrap();

    let tables = tables.lock().unwrap();
    assert_eq!(tables.len(), 1);
    assert!(tables[0].ends_with("2 rows in set"), "{}", tables[0]);
}

#[tokio::test]
async fn execute_reader_reads_whole_input() {
    let (session, recorder) = MockSession::new();
    let executer = Executer::with_session(Box::new(session));

    let input: &[u8] = b"DELETE FROM t;\nDELETE FROM u;\n";
    executer
        .execute_reader(&CancellationToken::new(), input, &no_vars())
        .await
        .unwrap();

    assert_eq!(recorder.execs(), vec!["DELETE FROM t", "DELETE FROM u"]);
}

#[tokio::test]
async fn execute_reader_maps_io_errors() {
    let (session, recorder) = MockSession::new();
    let executer = Executer::with_session(Box::new(session));

    // Invalid UTF-8 fails read_to_string.
    let input: &[u8] = &[0xff, 0xfe, b';'];
    let err = executer
        .execute_reader(&CancellationToken::new(), input, &no_vars())
        .await
        .unwrap_err();

    assert!(matches!(err, BatchError::Scan(_)), "{err:?}");
    assert!(recorder.sent().is_empty());
}

#[tokio::test]
async fn close_is_idempotent() {
    let (session, recorder) = MockSession::new();
    let executer = Executer::with_session(Box::new(session));

    executer.close().await.unwrap();
    executer.close().await.unwrap();
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);

    let err = executer
        .execute(&CancellationToken::new(), "DELETE FROM t;", &no_vars())
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::Closed));
}

#[tokio::test]
async fn concurrent_batches_are_serialized() {
    let (mut session, recorder) = MockSession::new();
    session.delay = Duration::from_millis(20);
    let executer = Arc::new(Executer::with_session(Box::new(session)));

    let handles: Vec<_> = (0..3)
        .map(|n| {
            let executer = executer.clone();
            tokio::spawn(async move {
                let script = format!("INSERT INTO t VALUES ({n}); INSERT INTO t VALUES ({n});");
                executer
                    .execute(&CancellationToken::new(), &script, &HashMap::new())
                    .await
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
    // Each batch's statements stay adjacent.
    let execs = recorder.execs();
    assert_eq!(execs.len(), 6);
    for pair in execs.chunks(2) {
        assert_eq!(pair[0], pair[1]);
    }
}

#[tokio::test]
async fn connect_refused_maps_to_connect_error() {
    let connector = MockConnector {
        refuse: true,
        ..MockConnector::default()
    };
    let err = match Executer::open_with(&connector, "root@127.0.0.1:3306/app").await {
        Ok(_) => panic!("expected connect failure"),
        Err(e) => e,
    };
    assert!(matches!(err, BatchError::Connect(_)), "{err:?}");
    assert_eq!(connector.opened.lock().unwrap().as_slice(), ["root@127.0.0.1:3306/app"]);
}
