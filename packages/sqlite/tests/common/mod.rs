use std::sync::Arc;

use switchy_sqlite::{Config, Registry};
use tempfile::TempDir;

#[allow(unused)]
pub const CREATE_USER_TABLE: &str =
    "CREATE TABLE User (id INT PRIMARY KEY, name TEXT, age INT, networth REAL) STRICT";

/// Registry rooted in a fresh temporary directory. The directory lives as long
/// as the returned guard.
#[allow(unused)]
pub fn registry() -> (Arc<Registry>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(Config::default().with_base_dir(dir.path()).with_workers(4)).unwrap();

    (Arc::new(registry), dir)
}

/// Registry with `name` open and the `User` table created.
#[allow(unused)]
pub fn registry_with_users(name: &str) -> (Arc<Registry>, TempDir) {
    let (registry, dir) = registry();
    registry.open(name, None).unwrap();
    registry.execute(name, CREATE_USER_TABLE, &[]).unwrap();

    (registry, dir)
}

#[allow(unused)]
pub fn count(registry: &Registry, name: &str, table: &str) -> i64 {
    let result = registry
        .execute(name, &format!("SELECT COUNT(*) AS n FROM {table}"), &[])
        .unwrap();

    result.rows[0].get_dyn("n").and_then(|x| x.as_i64()).unwrap()
}
