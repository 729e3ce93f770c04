//! Walks through the `switchy_sqlite` registry: opening a database, running
//! statements, explicit and queued transactions, batches and a custom
//! aggregate.
//!
//! Run with `RUST_LOG=switchy_sqlite=debug` to see the registry's logging.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::Arc;

use switchy_sqlite::{
    AggregateSpec, BatchCommand, DatabaseError, DynValue, FunctionFlags, Registry,
};

const DB: &str = "basic_usage.sqlite";

/// # Errors
///
/// * If configuration from the environment is invalid
/// * If any database operation fails
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();

    let registry = Arc::new(Registry::from_env()?);
    log::info!("Using base directory {}", registry.config().base_dir.display());

    registry.open(DB, None)?;
    registry.execute(DB, "DROP TABLE IF EXISTS User", &[])?;
    registry.execute(
        DB,
        "CREATE TABLE User (id INT PRIMARY KEY, name TEXT, age INT, networth REAL) STRICT",
        &[],
    )?;

    let inserted = registry.execute(
        DB,
        "INSERT INTO User (id, name, age, networth) VALUES (?, ?, ?, ?)",
        &[
            DynValue::from(1),
            DynValue::from("Ada"),
            DynValue::from(36),
            DynValue::from(1_000.5),
        ],
    )?;
    println!(
        "Inserted {} row(s), id {:?}",
        inserted.rows_affected, inserted.insert_id
    );

    let rejected = registry.transaction(DB, |tx| {
        tx.execute(
            "INSERT INTO User (id, name) VALUES (?, ?)",
            &[DynValue::from("two"), DynValue::from("Grace")],
        )
    });
    if let Err(e) = rejected {
        println!("Rejected by STRICT table: {e}");
    }

    let batch = registry
        .execute_batch_async(
            DB,
            vec![
                BatchCommand::new("INSERT INTO User (id, name, age, networth) VALUES (?, ?, ?, ?)")
                    .with_param_sets(vec![
                        vec![
                            DynValue::from(2),
                            DynValue::from("Grace"),
                            DynValue::from(45),
                            DynValue::from(250),
                        ],
                        vec![
                            DynValue::from(3),
                            DynValue::from("Linus"),
                            DynValue::from(28),
                            DynValue::from(75.25),
                        ],
                    ]),
            ],
        )
        .await?;
    println!("Batch inserted {} row(s)", batch.rows_affected);

    let raises = (0..3)
        .map(|_| {
            registry.transaction_async(DB, |tx| {
                tx.execute("UPDATE User SET networth = networth + 1000 WHERE id = 1", &[])?;
                let result = tx.execute("SELECT networth FROM User WHERE id = 1", &[])?;
                result
                    .first()
                    .and_then(|x| x.get_dyn("networth"))
                    .ok_or_else(|| DatabaseError::NotFound("User 1".to_string()))
            })
        })
        .collect::<Vec<_>>();
    for raise in raises {
        println!("Networth after raise: {:?}", raise.await?);
    }

    registry.register_aggregate(
        DB,
        "total_plus_one",
        1,
        FunctionFlags::deterministic(),
        AggregateSpec::new(|acc, args| {
            Ok(DynValue::from(
                acc.as_f64().unwrap_or_default() + args[0].as_f64().unwrap_or_default(),
            ))
        })
        .with_result(|acc| Ok(DynValue::from(acc.as_f64().unwrap_or_default() + 1.0))),
    )?;

    let total = registry.execute(DB, "SELECT total_plus_one(age) AS total FROM User", &[])?;
    println!("{}", format_rows(&total.rows));

    registry.close(DB)?;
    registry.delete(DB, None)?;

    Ok(())
}

fn format_rows(rows: &[switchy_sqlite::ResultRow]) -> String {
    rows.iter()
        .map(|row| {
            row.iter()
                .map(|(name, value)| format!("{name}={value:?}"))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
