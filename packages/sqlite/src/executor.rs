//! Single-statement execution against a `rusqlite` connection.

use rusqlite::{Connection, Rows, Statement};
use serde::{Serialize, Serializer, ser::SerializeMap as _};

use crate::{
    DatabaseError,
    value::{DynValue, SqlValue},
};

/// One result row. Column order is projection order; a duplicated column name
/// keeps its first position and takes the last value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultRow {
    columns: Vec<(String, SqlValue)>,
}

impl ResultRow {
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column_name)
            .map(|(_, value)| value)
    }

    /// Column value converted into a [`DynValue`].
    #[must_use]
    pub fn get_dyn(&self, column_name: &str) -> Option<DynValue> {
        self.get(column_name).cloned().map(Into::into)
    }

    pub fn insert(&mut self, column_name: impl Into<String>, value: SqlValue) {
        let column_name = column_name.into();
        if let Some(existing) = self.columns.iter_mut().find(|(name, _)| *name == column_name) {
            existing.1 = value;
        } else {
            self.columns.push((column_name, value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl Serialize for ResultRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    pub name: String,
    pub index: usize,
    /// Declared type from the table definition; empty for expressions.
    pub declared_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub rows_affected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<i64>,
    pub rows: Vec<ResultRow>,
    pub column_metadata: Vec<ColumnMetadata>,
}

impl OperationResult {
    /// First row, if any.
    #[must_use]
    pub fn first(&self) -> Option<&ResultRow> {
        self.rows.first()
    }
}

/// Runs one statement with positional parameters and materializes its rows.
///
/// # Errors
///
/// * If `sql` is empty
/// * If the number of parameters does not match the statement's placeholders
/// * If the engine fails to prepare or step the statement
pub fn execute(
    connection: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<OperationResult, DatabaseError> {
    if sql.trim().is_empty() {
        return Err(DatabaseError::InvalidArgument(
            "SQL statement is empty".to_string(),
        ));
    }

    log::trace!("execute: query:\n'{sql}'\nparams: {params:?}");

    let mut stmt = connection.prepare(sql)?;
    bind_params(&mut stmt, params)?;

    let column_metadata = column_metadata(&stmt);
    let column_names: Vec<String> = stmt.column_names().iter().map(|&s| s.to_string()).collect();

    let before = connection.total_changes();
    let rows = to_rows(&column_names, stmt.raw_query())?;
    let rows_affected = rows_affected_since(connection, before);

    let insert_id = Some(connection.last_insert_rowid()).filter(|id| rows_affected > 0 && *id != 0);

    Ok(OperationResult {
        rows_affected,
        insert_id,
        rows,
        column_metadata,
    })
}

/// Binds `params` positionally to an already prepared statement.
///
/// # Errors
///
/// * If the number of parameters does not match the statement's placeholders
/// * If the engine rejects a bound value
pub(crate) fn bind_params(
    stmt: &mut Statement<'_>,
    params: &[SqlValue],
) -> Result<(), DatabaseError> {
    let expected = stmt.parameter_count();

    if expected != params.len() {
        return Err(DatabaseError::ParamMismatch {
            expected,
            provided: params.len(),
        });
    }

    for (i, value) in params.iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, value)?;
    }

    Ok(())
}

/// Steps a bound statement to completion, discarding any rows, and reports
/// how many rows it modified.
pub(crate) fn step_to_completion(
    connection: &Connection,
    stmt: &mut Statement<'_>,
) -> Result<u64, DatabaseError> {
    let before = connection.total_changes();
    let mut rows = stmt.raw_query();
    while rows.next()?.is_some() {}
    drop(rows);

    Ok(rows_affected_since(connection, before))
}

fn column_metadata(stmt: &Statement<'_>) -> Vec<ColumnMetadata> {
    stmt.columns()
        .iter()
        .enumerate()
        .map(|(index, column)| ColumnMetadata {
            name: column.name().to_string(),
            index,
            declared_type: column.decl_type().unwrap_or_default().to_string(),
        })
        .collect()
}

fn to_rows(column_names: &[String], mut rows: Rows<'_>) -> Result<Vec<ResultRow>, DatabaseError> {
    let mut results = vec![];

    while let Some(row) = rows.next()? {
        let mut result = ResultRow::default();
        for (i, name) in column_names.iter().enumerate() {
            result.insert(name.as_str(), row.get_ref(i)?.into());
        }
        results.push(result);
    }

    log::trace!(
        "Got {} row{}",
        results.len(),
        if results.len() == 1 { "" } else { "s" }
    );

    Ok(results)
}

/// `sqlite3_changes` keeps the count of the last DML statement, even after a
/// statement that modified nothing, so it is only trusted when the total
/// change counter actually moved.
fn rows_affected_since(connection: &Connection, before: u64) -> u64 {
    if connection.total_changes() == before {
        0
    } else {
        connection.changes()
    }
}
