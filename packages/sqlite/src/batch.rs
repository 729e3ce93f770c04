//! Atomic execution of many statements.

use rusqlite::Connection;
use serde::Serialize;

use crate::{
    DatabaseError,
    executor::{bind_params, step_to_completion},
    value::{DynValue, to_sql_params},
};

/// Parameters for one batch command: a single parameter set, or many sets to
/// run the same statement once per set.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchParams {
    Single(Vec<DynValue>),
    Many(Vec<Vec<DynValue>>),
}

impl Default for BatchParams {
    fn default() -> Self {
        Self::Single(vec![])
    }
}

impl BatchParams {
    /// Interprets a parameter list whose first element is itself a list as a
    /// list of parameter sets.
    #[must_use]
    pub fn from_dyn(params: Vec<DynValue>) -> Self {
        if matches!(params.first(), Some(DynValue::List(_))) {
            Self::Many(
                params
                    .into_iter()
                    .map(|x| match x {
                        DynValue::List(set) => set,
                        other => vec![other],
                    })
                    .collect(),
            )
        } else {
            Self::Single(params)
        }
    }

    fn sets(&self) -> Vec<&[DynValue]> {
        match self {
            Self::Single(set) => vec![set.as_slice()],
            Self::Many(sets) => sets.iter().map(Vec::as_slice).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchCommand {
    pub sql: String,
    pub params: BatchParams,
}

impl BatchCommand {
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: BatchParams::default(),
        }
    }

    /// Builds a command from a loosely typed parameter value: `Null` means no
    /// parameters, a list is read with [`BatchParams::from_dyn`] and any other
    /// value is a single parameter.
    #[must_use]
    pub fn from_dyn(sql: impl Into<String>, params: DynValue) -> Self {
        let params = match params {
            DynValue::Null => BatchParams::default(),
            DynValue::List(list) => BatchParams::from_dyn(list),
            other => BatchParams::Single(vec![other]),
        };

        Self {
            sql: sql.into(),
            params,
        }
    }

    #[must_use]
    pub fn with_params(mut self, params: Vec<DynValue>) -> Self {
        self.params = BatchParams::from_dyn(params);
        self
    }

    #[must_use]
    pub fn with_param_sets(mut self, sets: Vec<Vec<DynValue>>) -> Self {
        self.params = BatchParams::Many(sets);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub rows_affected: u64,
}

/// Runs every command inside one exclusive transaction.
///
/// Either every command is applied or none is.
///
/// # Errors
///
/// * The first statement failure, after rolling back
/// * [`DatabaseError::RollbackFailed`] if the rollback fails too
pub fn execute_batch(
    connection: &Connection,
    commands: &[BatchCommand],
) -> Result<BatchResult, DatabaseError> {
    if commands.is_empty() {
        return Ok(BatchResult::default());
    }

    log::trace!("execute_batch: {} command(s)", commands.len());

    connection.execute_batch("BEGIN EXCLUSIVE TRANSACTION")?;

    match run_commands(connection, commands) {
        Ok(rows_affected) => {
            if let Err(e) = connection.execute_batch("COMMIT") {
                log::error!("execute_batch: commit failed: {e}");
                return Err(rollback(connection, e.into()));
            }
            Ok(BatchResult { rows_affected })
        }
        Err(e) => {
            log::debug!("execute_batch: rolling back: {e}");
            Err(rollback(connection, e))
        }
    }
}

fn run_commands(connection: &Connection, commands: &[BatchCommand]) -> Result<u64, DatabaseError> {
    let mut rows_affected = 0;

    for command in commands {
        let mut stmt = connection.prepare(&command.sql)?;

        for set in command.params.sets() {
            log::trace!("execute_batch: query:\n'{}'\nparams: {set:?}", command.sql);
            bind_params(&mut stmt, &to_sql_params(set))?;
            rows_affected += step_to_completion(connection, &mut stmt)?;
        }
    }

    Ok(rows_affected)
}

/// Rolls back and hands back `cause`, or a combined error if the rollback
/// itself fails.
fn rollback(connection: &Connection, cause: DatabaseError) -> DatabaseError {
    if connection.is_autocommit() {
        return cause;
    }

    match connection.execute_batch("ROLLBACK") {
        Ok(()) => cause,
        Err(e) => DatabaseError::RollbackFailed {
            source: Box::new(cause),
            rollback: DatabaseError::from(e).to_string(),
        },
    }
}
