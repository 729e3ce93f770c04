use std::sync::Arc;

use pretty_assertions::assert_eq;
use switchy_sqlite::{BatchCommand, DatabaseError, DynValue};

mod common;

use common::{count, registry, registry_with_users};

const UPSERT_NETWORTH: &str = "INSERT INTO User (id, name, age, networth) VALUES (1, 'Ada', 36, 0) \
     ON CONFLICT(id) DO UPDATE SET networth = networth + 1000";

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn async_transactions_run_in_submission_order() {
    let (registry, _dir) = registry_with_users("db.sqlite");

    let pending = (0..20)
        .map(|_| {
            registry.transaction_async("db.sqlite", |tx| {
                tx.execute(UPSERT_NETWORTH, &[])?;
                let result = tx.execute("SELECT networth FROM User WHERE id = 1", &[])?;
                Ok(result.rows[0]
                    .get_dyn("networth")
                    .and_then(|x| x.as_f64())
                    .unwrap_or_default())
            })
        })
        .collect::<Vec<_>>();

    let mut networths = vec![];
    for x in pending {
        networths.push(x.await.unwrap());
    }

    assert_eq!(
        networths,
        (0..20).map(|i| f64::from(i) * 1000.0).collect::<Vec<_>>()
    );
}

#[test_log::test(tokio::test)]
async fn async_execute_resolves_like_sync_execute() {
    let (registry, _dir) = registry_with_users("db.sqlite");

    let inserted = registry
        .execute_async(
            "db.sqlite",
            "INSERT INTO User (id, name, age, networth) VALUES (?, ?, ?, ?)",
            vec![
                DynValue::from(7),
                DynValue::from("Ada"),
                DynValue::from(36),
                DynValue::from(2.5),
            ],
        )
        .await
        .unwrap();

    assert_eq!(inserted.rows_affected, 1);
    // `User.id` is not a rowid alias, so the insert id is the implicit rowid.
    assert_eq!(inserted.insert_id, Some(1));

    let err = registry
        .execute_async("db.sqlite", "SELECT * FROM nope", vec![])
        .await
        .unwrap_err();
    assert_eq!(err.sql_message(), Some("no such table: nope"));
}

#[test_log::test(tokio::test)]
async fn async_batch_is_atomic() {
    let (registry, _dir) = registry_with_users("db.sqlite");

    let result = registry
        .execute_batch_async(
            "db.sqlite",
            vec![
                BatchCommand::new("INSERT INTO User (id, name, age, networth) VALUES (?, ?, ?, ?)")
                    .with_param_sets(vec![
                        vec![
                            DynValue::from(1),
                            DynValue::from("a"),
                            DynValue::from(1),
                            DynValue::from(0),
                        ],
                        vec![
                            DynValue::from(2),
                            DynValue::from("b"),
                            DynValue::from(2),
                            DynValue::from(0),
                        ],
                    ]),
            ],
        )
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 2);

    let err = registry
        .execute_batch_async(
            "db.sqlite",
            vec![
                BatchCommand::new("DELETE FROM User"),
                BatchCommand::new("INSERT INTO missing VALUES (1)"),
            ],
        )
        .await
        .unwrap_err();
    assert_eq!(err.sql_message(), Some("no such table: missing"));
    assert_eq!(count(&registry, "db.sqlite", "User"), 2);
}

#[test_log::test(tokio::test)]
async fn async_transaction_error_rolls_back() {
    let (registry, _dir) = registry_with_users("db.sqlite");

    let err = registry
        .transaction_async::<(), _>("db.sqlite", |tx| {
            tx.execute(
                "INSERT INTO User (id, name, age, networth) VALUES (1, 'Ada', 36, 0)",
                &[],
            )?;
            Err(DatabaseError::callback("abort"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "abort");
    assert_eq!(count(&registry, "db.sqlite", "User"), 0);
}

#[test_log::test]
fn blocking_callers_can_wait_on_async_work() {
    let (registry, _dir) = registry();
    registry.open_in_memory("mem").unwrap();

    let result = registry.execute_async("mem", "SELECT 1 AS one", vec![]).wait().unwrap();

    assert_eq!(result.rows[0].get_dyn("one"), Some(DynValue::from(1)));
}

#[test_log::test]
fn connections_progress_in_parallel_from_many_threads() {
    let (registry, _dir) = registry();
    for name in ["a", "b", "c"] {
        registry.open_in_memory(name).unwrap();
        registry
            .execute(name, "CREATE TABLE hits (n INTEGER)", &[])
            .unwrap();
    }

    let threads = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..50 {
                    if i % 2 == 0 {
                        registry
                            .execute(name, "INSERT INTO hits VALUES (?)", &[DynValue::from(i)])
                            .unwrap();
                    } else {
                        registry
                            .execute_async(name, "INSERT INTO hits VALUES (?)", vec![DynValue::from(i)])
                            .wait()
                            .unwrap();
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for thread in threads {
        thread.join().unwrap();
    }

    for name in ["a", "b", "c"] {
        assert_eq!(count(&registry, name, "hits"), 50);
    }
}

#[test_log::test]
fn async_body_waiting_on_its_own_connection_is_invalid_state() {
    let (registry, _dir) = registry();
    registry.open_in_memory("mem").unwrap();
    registry.open_in_memory("other").unwrap();

    let inner = Arc::clone(&registry);
    let err = registry
        .transaction_async("mem", move |_tx| {
            inner
                .transaction_async("mem", |tx| tx.execute("SELECT 1", &[]))
                .wait()
        })
        .wait()
        .unwrap_err();
    assert!(matches!(err, DatabaseError::InvalidState(_)), "unexpected error: {err}");

    let inner = Arc::clone(&registry);
    let result = registry
        .transaction_async("mem", move |_tx| {
            inner.execute_async("other", "SELECT 2 AS two", vec![]).wait()
        })
        .wait()
        .unwrap();
    assert_eq!(result.rows[0].get_dyn("two"), Some(DynValue::from(2)));
}

#[test_log::test]
fn reopening_while_a_close_waits_gets_a_fresh_connection() {
    let (registry, _dir) = registry();
    registry.open_in_memory("mem").unwrap();
    registry
        .execute("mem", "CREATE TABLE hits (n INTEGER)", &[])
        .unwrap();

    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let in_flight = registry.transaction_async("mem", move |tx| {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        tx.execute("INSERT INTO hits VALUES (1)", &[])
    });
    started_rx.recv().unwrap();

    let closer = {
        let registry = Arc::clone(&registry);
        std::thread::spawn(move || registry.close("mem"))
    };
    while registry.is_open("mem") {
        std::thread::yield_now();
    }

    registry.open_in_memory("mem").unwrap();
    release_tx.send(()).unwrap();

    assert_eq!(in_flight.wait().unwrap().rows_affected, 1);
    closer.join().unwrap().unwrap();

    assert!(registry.is_open("mem"));
    let err = registry
        .execute("mem", "SELECT * FROM hits", &[])
        .unwrap_err();
    assert!(
        err.sql_message()
            .is_some_and(|x| x.starts_with("no such table: hits")),
        "unexpected error: {err}"
    );
}
