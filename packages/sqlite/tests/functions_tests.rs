use std::sync::Arc;

use pretty_assertions::assert_eq;
use switchy_sqlite::{AggregateSpec, DatabaseError, DynValue, FunctionFlags, FunctionKind, Registry};

mod common;

use common::registry;

fn number(value: &DynValue) -> f64 {
    value.as_f64().unwrap_or_default()
}

fn sum_step(acc: DynValue, args: &[DynValue]) -> Result<DynValue, DatabaseError> {
    Ok(DynValue::from(number(&acc) + number(&args[0])))
}

fn scores(registry: &Registry) {
    registry.open_in_memory("mem").unwrap();
    registry
        .execute("mem", "CREATE TABLE scores (player TEXT, points INTEGER)", &[])
        .unwrap();

    for (player, points) in [("a", 1), ("a", 2), ("b", 10), ("b", 20), ("b", 30)] {
        registry
            .execute(
                "mem",
                "INSERT INTO scores VALUES (?, ?)",
                &[DynValue::from(player), DynValue::from(points)],
            )
            .unwrap();
    }
}

fn column(registry: &Registry, sql: &str, column: &str) -> Vec<DynValue> {
    registry
        .execute("mem", sql, &[])
        .unwrap()
        .rows
        .iter()
        .map(|x| x.get_dyn(column).unwrap())
        .collect()
}

#[test_log::test]
fn aggregate_without_start_seeds_each_group_with_zero() {
    let (registry, _dir) = registry();
    scores(&registry);

    registry
        .register_aggregate("mem", "my_sum", 1, FunctionFlags::default(), AggregateSpec::new(sum_step))
        .unwrap();

    assert_eq!(
        column(
            &registry,
            "SELECT my_sum(points) AS total FROM scores GROUP BY player ORDER BY player",
            "total"
        ),
        vec![DynValue::from(3), DynValue::from(60)]
    );
}

#[test_log::test]
fn result_post_processor_applies_on_top_of_the_accumulation() {
    let (registry, _dir) = registry();
    scores(&registry);

    registry
        .register_aggregate(
            "mem",
            "sum_plus_one",
            1,
            FunctionFlags::default(),
            AggregateSpec::new(sum_step).with_result(|acc| Ok(DynValue::from(number(&acc) + 1.0))),
        )
        .unwrap();

    assert_eq!(
        column(
            &registry,
            "SELECT sum_plus_one(points) AS total FROM scores GROUP BY player ORDER BY player",
            "total"
        ),
        vec![DynValue::from(4), DynValue::from(61)]
    );
}

#[test_log::test]
fn start_value_is_cloned_per_group() {
    let (registry, _dir) = registry();
    scores(&registry);

    registry
        .register_aggregate(
            "mem",
            "from_hundred",
            1,
            FunctionFlags::default(),
            AggregateSpec::new(sum_step).with_start(100),
        )
        .unwrap();

    assert_eq!(
        column(
            &registry,
            "SELECT from_hundred(points) AS total FROM scores GROUP BY player ORDER BY player",
            "total"
        ),
        vec![DynValue::from(103), DynValue::from(160)]
    );
}

#[test_log::test]
fn inverse_installs_a_window_function() {
    let (registry, _dir) = registry();
    scores(&registry);

    let kind = registry
        .register_aggregate(
            "mem",
            "moving_sum",
            1,
            FunctionFlags::deterministic(),
            AggregateSpec::new(sum_step)
                .with_inverse(|acc, args| Ok(DynValue::from(number(&acc) - number(&args[0])))),
        )
        .unwrap();

    assert_eq!(kind, FunctionKind::Window);
    assert_eq!(
        column(
            &registry,
            "SELECT moving_sum(points) OVER (ORDER BY rowid ROWS BETWEEN 1 PRECEDING AND CURRENT ROW) AS s \
             FROM scores ORDER BY rowid",
            "s"
        ),
        vec![
            DynValue::from(1),
            DynValue::from(3),
            DynValue::from(12),
            DynValue::from(30),
            DynValue::from(50),
        ]
    );
}

#[test_log::test]
fn scalar_errors_surface_as_statement_errors() {
    let (registry, _dir) = registry();
    registry.open_in_memory("mem").unwrap();

    registry
        .register_function("mem", "must_be_positive", 1, FunctionFlags::default(), |args| {
            match number(&args[0]) {
                x if x > 0.0 => Ok(DynValue::from(x)),
                x => Err(DatabaseError::callback(format!("{x} is not positive"))),
            }
        })
        .unwrap();

    assert_eq!(
        column(&registry, "SELECT must_be_positive(2) AS v", "v"),
        vec![DynValue::from(2)]
    );

    let err = registry
        .execute("mem", "SELECT must_be_positive(-1)", &[])
        .unwrap_err();
    assert_eq!(err.sql_message(), Some("-1 is not positive"));
}

#[test_log::test]
fn bad_arity_is_rejected_before_touching_the_connection() {
    let (registry, _dir) = registry();

    assert!(matches!(
        registry.register_function("missing", "f", 128, FunctionFlags::default(), |_| {
            Ok(DynValue::Null)
        }),
        Err(DatabaseError::InvalidArgument(_))
    ));
    assert!(matches!(
        registry.register_function("missing", "f", 1, FunctionFlags::default(), |_| {
            Ok(DynValue::Null)
        }),
        Err(DatabaseError::NotFound(_))
    ));
}

#[test_log::test]
fn callable_reentering_its_own_connection_gets_invalid_state() {
    let (registry, _dir) = registry();
    registry.open_in_memory("mem").unwrap();
    registry.open_in_memory("other").unwrap();

    let weak = Arc::downgrade(&registry);
    registry
        .register_function("mem", "lookup", 1, FunctionFlags::default(), move |args| {
            let registry = weak
                .upgrade()
                .ok_or_else(|| DatabaseError::callback("registry is gone"))?;
            let target = args[0].as_str().unwrap_or_default().to_string();
            let result = registry.execute(&target, "SELECT 42 AS answer", &[])?;
            Ok(result.rows[0].get_dyn("answer").unwrap_or(DynValue::Null))
        })
        .unwrap();

    assert_eq!(
        column(&registry, "SELECT lookup('other') AS v", "v"),
        vec![DynValue::from(42)]
    );

    let err = registry
        .execute("mem", "SELECT lookup('mem')", &[])
        .unwrap_err();
    assert!(
        err.to_string().contains("already in use by this thread"),
        "unexpected error: {err}"
    );

    // Same guard applies when the statement runs on a worker thread.
    let err = registry
        .execute_async("mem", "SELECT lookup('mem')", vec![])
        .wait()
        .unwrap_err();
    assert!(
        err.to_string().contains("already in use by this thread"),
        "unexpected error: {err}"
    );
}

#[test_log::test]
fn functions_disappear_with_their_connection() {
    let (registry, _dir) = registry();
    registry.open_in_memory("mem").unwrap();
    registry
        .register_function("mem", "one", 0, FunctionFlags::default(), |_| Ok(DynValue::from(1)))
        .unwrap();

    assert_eq!(registry.functions("mem").unwrap().len(), 1);

    registry.close("mem").unwrap();
    registry.open_in_memory("mem").unwrap();

    assert!(registry.functions("mem").unwrap().is_empty());
    let err = registry.execute("mem", "SELECT one()", &[]).unwrap_err();
    assert!(
        err.sql_message()
            .is_some_and(|x| x.starts_with("no such function: one")),
        "unexpected error: {err}"
    );
}

#[test_log::test]
fn callable_waiting_on_its_own_connection_gets_invalid_state() {
    let (registry, _dir) = registry();
    registry.open_in_memory("mem").unwrap();
    registry.open_in_memory("other").unwrap();

    let weak = Arc::downgrade(&registry);
    registry
        .register_function("mem", "queued_lookup", 1, FunctionFlags::default(), move |args| {
            let registry = weak
                .upgrade()
                .ok_or_else(|| DatabaseError::callback("registry is gone"))?;
            let target = args[0].as_str().unwrap_or_default().to_string();
            let result = registry
                .execute_async(&target, "SELECT 42 AS answer", vec![])
                .wait()?;
            Ok(result.rows[0].get_dyn("answer").unwrap_or(DynValue::Null))
        })
        .unwrap();

    assert_eq!(
        column(&registry, "SELECT queued_lookup('other') AS v", "v"),
        vec![DynValue::from(42)]
    );

    let err = registry
        .execute("mem", "SELECT queued_lookup('mem')", &[])
        .unwrap_err();
    assert!(
        err.to_string().contains("already in use by this thread"),
        "unexpected error: {err}"
    );

    let err = registry
        .execute_async("mem", "SELECT queued_lookup('mem')", vec![])
        .wait()
        .unwrap_err();
    assert!(
        err.to_string().contains("already in use by this thread"),
        "unexpected error: {err}"
    );
}
