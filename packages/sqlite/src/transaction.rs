//! Explicit transactions with automatic commit or rollback.

use std::panic::AssertUnwindSafe;

use rusqlite::Connection;

use crate::{
    DatabaseError,
    dispatcher::panic_message,
    executor::{self, OperationResult},
    value::{DynValue, to_sql_params},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// Handle passed to a transaction body.
///
/// Once the transaction is committed or rolled back every further call fails
/// with [`DatabaseError::TransactionClosed`].
#[derive(Debug)]
pub struct Transaction<'conn> {
    connection: &'conn Connection,
    state: TransactionState,
}

impl<'conn> Transaction<'conn> {
    /// Starts a deferred transaction on `connection`.
    ///
    /// # Errors
    ///
    /// * If the engine rejects `BEGIN`, for example because a transaction is
    ///   already open on this connection
    pub fn begin(connection: &'conn Connection) -> Result<Self, DatabaseError> {
        log::trace!("begin");
        connection.execute_batch("BEGIN TRANSACTION")?;

        Ok(Self {
            connection,
            state: TransactionState::Active,
        })
    }

    #[must_use]
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    /// # Errors
    ///
    /// * [`DatabaseError::TransactionClosed`] if the transaction has ended
    /// * If the statement fails
    pub fn execute(
        &mut self,
        sql: &str,
        params: &[DynValue],
    ) -> Result<OperationResult, DatabaseError> {
        self.ensure_active()?;
        executor::execute(self.connection, sql, &to_sql_params(params))
    }

    /// # Errors
    ///
    /// * [`DatabaseError::TransactionClosed`] if the transaction has ended
    /// * If the engine fails to commit; the transaction stays active
    pub fn commit(&mut self) -> Result<(), DatabaseError> {
        self.ensure_active()?;
        log::trace!("commit");

        self.connection.execute_batch("COMMIT")?;
        self.state = TransactionState::Committed;

        Ok(())
    }

    /// # Errors
    ///
    /// * [`DatabaseError::TransactionClosed`] if the transaction has ended
    /// * If the engine fails to roll back
    pub fn rollback(&mut self) -> Result<(), DatabaseError> {
        self.ensure_active()?;
        log::trace!("rollback");

        // Some errors (e.g. SQLITE_FULL) make the engine end the transaction on its own.
        if self.connection.is_autocommit() {
            log::debug!("rollback: transaction was already ended by the engine");
            self.state = TransactionState::RolledBack;
            return Ok(());
        }

        let result = self.connection.execute_batch("ROLLBACK");
        self.state = TransactionState::RolledBack;

        Ok(result?)
    }

    fn ensure_active(&self) -> Result<(), DatabaseError> {
        if self.state == TransactionState::Active {
            Ok(())
        } else {
            Err(DatabaseError::TransactionClosed)
        }
    }
}

/// Runs `body` inside a transaction.
///
/// Unless the body ends the transaction itself, it is committed when the body
/// returns `Ok` and rolled back when it returns `Err` or panics.
///
/// # Errors
///
/// * If the transaction can't be started
/// * The body's own error, after rolling back
/// * [`DatabaseError::Callback`] if the body panics
/// * [`DatabaseError::RollbackFailed`] if the body failed and the rollback did too
/// * If the final commit fails
pub fn run_transaction<T>(
    connection: &Connection,
    body: impl FnOnce(&mut Transaction<'_>) -> Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    let mut tx = Transaction::begin(connection)?;

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| body(&mut tx)))
        .unwrap_or_else(|panic| Err(DatabaseError::callback(panic_message(&*panic))));

    if tx.state() != TransactionState::Active {
        return outcome;
    }

    match outcome {
        Ok(value) => {
            if let Err(e) = tx.commit() {
                log::error!("run_transaction: commit failed: {e}");
                if let Err(rollback) = tx.rollback() {
                    log::error!("run_transaction: rollback after failed commit failed: {rollback}");
                }
                return Err(e);
            }
            Ok(value)
        }
        Err(e) => {
            log::debug!("run_transaction: rolling back: {e}");
            match tx.rollback() {
                Ok(()) => Err(e),
                Err(rollback) => Err(DatabaseError::RollbackFailed {
                    source: Box::new(e),
                    rollback: rollback.to_string(),
                }),
            }
        }
    }
}
