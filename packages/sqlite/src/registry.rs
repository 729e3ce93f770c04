//! Named connections and the operations run against them.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    ffi::OsString,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use rusqlite::Connection;

use crate::{
    DatabaseError,
    batch::{self, BatchCommand, BatchResult},
    config::Config,
    dispatcher::{Dispatcher, Lane, Pending},
    executor::{self, OperationResult},
    functions::{self, AggregateSpec, FunctionFlags, FunctionKind},
    transaction::{Transaction, run_transaction},
    value::{DynValue, SqlValue, to_sql_params},
};

const COMPANION_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

thread_local! {
    /// Connections the current thread holds exclusively right now.
    static RESERVED: RefCell<BTreeSet<String>> = const { RefCell::new(BTreeSet::new()) };
}

/// Marks a connection as held by the current thread until dropped.
struct Reservation {
    name: String,
}

impl Reservation {
    fn acquire(name: &str) -> Result<Self, DatabaseError> {
        if !RESERVED.with_borrow_mut(|x| x.insert(name.to_string())) {
            return Err(in_use(name));
        }

        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Fails when the current thread already holds `name`. Work queued for a
    /// held connection could never start while this thread waits on it.
    fn ensure_free(name: &str) -> Result<(), DatabaseError> {
        if RESERVED.with_borrow(|x| x.contains(name)) {
            return Err(in_use(name));
        }
        Ok(())
    }
}

fn in_use(name: &str) -> DatabaseError {
    DatabaseError::InvalidState(format!(
        "Connection '{name}' is already in use by this thread"
    ))
}

impl Drop for Reservation {
    fn drop(&mut self) {
        RESERVED.with_borrow_mut(|x| x.remove(&self.name));
    }
}

/// One open connection together with its work queue and bookkeeping.
pub struct ConnectionHandle {
    name: String,
    path: Option<PathBuf>,
    connection: Mutex<Option<Connection>>,
    lane: Arc<Lane>,
    attached: Mutex<BTreeMap<String, PathBuf>>,
    functions: Mutex<BTreeMap<(String, i32), FunctionKind>>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("lane", &self.lane)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    fn new(name: &str, path: Option<PathBuf>, connection: Connection) -> Self {
        Self {
            name: name.to_string(),
            path,
            connection: Mutex::new(Some(connection)),
            lane: Arc::new(Lane::default()),
            attached: Mutex::new(BTreeMap::new()),
            functions: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database file, or `None` for an in-memory database.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Asynchronous work waiting for this connection.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.lane.queued()
    }

    /// Runs `f` with exclusive use of the connection.
    ///
    /// Fails fast with [`DatabaseError::InvalidState`] instead of deadlocking
    /// when the current thread already holds this connection.
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let _reservation = Reservation::acquire(&self.name)?;
        let guard = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let connection = guard
            .as_ref()
            .ok_or_else(|| DatabaseError::NotFound(self.name.clone()))?;

        f(connection)
    }

    /// Takes the native connection out of the handle, waiting for in-flight
    /// work to finish first.
    fn take(&self) -> Result<Option<Connection>, DatabaseError> {
        let _reservation = Reservation::acquire(&self.name)?;
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        Ok(connection)
    }

    fn record_function(&self, name: &str, arity: i32, kind: FunctionKind) {
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((name.to_string(), arity), kind);
    }
}

/// Owner of every named connection and of the worker pool serving them.
///
/// Dropping the registry drains queued work and closes every connection.
pub struct Registry {
    config: Config,
    connections: RwLock<BTreeMap<String, Arc<ConnectionHandle>>>,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("names", &self.names())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl Registry {
    /// # Errors
    ///
    /// * If the worker threads fail to spawn
    pub fn new(config: Config) -> Result<Self, DatabaseError> {
        let dispatcher = Dispatcher::new(config.workers)?;

        Ok(Self {
            config,
            connections: RwLock::new(BTreeMap::new()),
            dispatcher,
        })
    }

    /// Registry configured from the `SWITCHY_SQLITE_*` environment variables.
    ///
    /// # Errors
    ///
    /// * If an environment override is invalid
    /// * If the worker threads fail to spawn
    pub fn from_env() -> Result<Self, DatabaseError> {
        Self::new(Config::from_env()?)
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if no connection is open under `name`
    pub fn connection(&self, name: &str) -> Result<Arc<ConnectionHandle>, DatabaseError> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound(name.to_string()))
    }

    #[must_use]
    pub fn is_open(&self, name: &str) -> bool {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Opens `base_dir/[location/]name`, creating the file and any missing
    /// directories. Opening a name that is already open does nothing.
    ///
    /// # Errors
    ///
    /// * If `name` is empty
    /// * If the directory can't be created
    /// * If the engine fails to open the file
    pub fn open(&self, name: &str, location: Option<&str>) -> Result<(), DatabaseError> {
        check_name(name)?;

        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if connections.contains_key(name) {
            log::debug!("open: '{name}' is already open");
            return Ok(());
        }

        let path = self.config.resolve(name, location);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        log::debug!("open: name={name} path={}", path.display());

        let connection = Connection::open(&path)?;
        self.init_connection(&connection)?;

        connections.insert(
            name.to_string(),
            Arc::new(ConnectionHandle::new(name, Some(path), connection)),
        );

        Ok(())
    }

    /// Opens a private in-memory database under `name`.
    ///
    /// # Errors
    ///
    /// * If `name` is empty
    /// * If the engine fails to open the database
    pub fn open_in_memory(&self, name: &str) -> Result<(), DatabaseError> {
        check_name(name)?;

        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if connections.contains_key(name) {
            log::debug!("open_in_memory: '{name}' is already open");
            return Ok(());
        }

        log::debug!("open_in_memory: name={name}");

        let connection = Connection::open_in_memory()?;
        self.init_connection(&connection)?;

        connections.insert(
            name.to_string(),
            Arc::new(ConnectionHandle::new(name, None, connection)),
        );

        Ok(())
    }

    fn init_connection(&self, connection: &Connection) -> Result<(), DatabaseError> {
        connection.busy_timeout(self.config.busy_timeout.unwrap_or(Duration::ZERO))?;
        Ok(())
    }

    /// Closes the connection once in-flight work on it has finished. Work
    /// still queued for it fails with [`DatabaseError::NotFound`].
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if no connection is open under `name`
    /// * [`DatabaseError::InvalidState`] if called while this thread holds
    ///   the connection
    pub fn close(&self, name: &str) -> Result<(), DatabaseError> {
        Reservation::ensure_free(name)?;

        // Forget the name first so a concurrent `open` starts a fresh
        // connection instead of reusing the one being closed.
        let handle = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| DatabaseError::NotFound(name.to_string()))?;

        let Some(connection) = handle.take()? else {
            return Err(DatabaseError::NotFound(name.to_string()));
        };

        log::debug!("close: name={name}");
        close_connection(name, connection);

        Ok(())
    }

    /// Deletes a closed database file and its journal companions.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::InvalidState`] if the database is still open
    /// * [`DatabaseError::NotFound`] if the file does not exist
    /// * If a file can't be removed
    pub fn delete(&self, name: &str, location: Option<&str>) -> Result<(), DatabaseError> {
        check_name(name)?;

        if self.is_open(name) {
            return Err(DatabaseError::InvalidState(format!(
                "Connection '{name}' is open; close it before deleting"
            )));
        }

        let path = self.config.resolve(name, location);
        if !path.is_file() {
            return Err(DatabaseError::NotFound(path.display().to_string()));
        }

        log::debug!("delete: path={}", path.display());
        std::fs::remove_file(&path)?;

        for suffix in COMPANION_SUFFIXES {
            let mut companion = OsString::from(path.as_os_str());
            companion.push(suffix);
            let companion = PathBuf::from(companion);

            if companion.is_file() {
                log::debug!("delete: removing companion {}", companion.display());
                std::fs::remove_file(&companion)?;
            }
        }

        Ok(())
    }

    /// Attaches `base_dir/[location/]database` to the `name` connection under
    /// `alias`.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if `name` is not open
    /// * If the engine rejects the attachment, e.g. the alias is taken
    pub fn attach(
        &self,
        name: &str,
        database: &str,
        alias: &str,
        location: Option<&str>,
    ) -> Result<(), DatabaseError> {
        check_name(database)?;
        let handle = self.connection(name)?;

        let path = self.config.resolve(database, location);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        log::debug!(
            "attach: name={name} alias={alias} path={}",
            path.display()
        );

        handle.with_connection(|connection| {
            executor::execute(
                connection,
                "ATTACH DATABASE ?1 AS ?2",
                &[
                    SqlValue::Text(path.to_string_lossy().into_owned()),
                    SqlValue::Text(alias.to_string()),
                ],
            )
        })?;

        handle
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias.to_string(), path);

        Ok(())
    }

    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if `name` is not open, or `alias` is not
    ///   attached to it
    /// * If the engine refuses to detach, e.g. the alias is in use
    pub fn detach(&self, name: &str, alias: &str) -> Result<(), DatabaseError> {
        let handle = self.connection(name)?;

        log::debug!("detach: name={name} alias={alias}");

        let result = handle.with_connection(|connection| {
            executor::execute(
                connection,
                "DETACH DATABASE ?1",
                &[SqlValue::Text(alias.to_string())],
            )
        });

        let mut attached = handle
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match result {
            Ok(_) => {
                attached.remove(alias);
                Ok(())
            }
            Err(DatabaseError::Sql { .. }) if !attached.contains_key(alias) => {
                Err(DatabaseError::NotFound(alias.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Aliases attached through [`Registry::attach`] with their files.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if `name` is not open
    pub fn attached(&self, name: &str) -> Result<Vec<(String, PathBuf)>, DatabaseError> {
        let handle = self.connection(name)?;
        let attached = handle
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        Ok(attached
            .iter()
            .map(|(alias, path)| (alias.clone(), path.clone()))
            .collect())
    }

    /// Runs one statement on the calling thread.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if `name` is not open
    /// * [`DatabaseError::InvalidState`] if this thread already holds the
    ///   connection
    /// * Any statement error, see [`executor::execute`]
    pub fn execute(
        &self,
        name: &str,
        sql: &str,
        params: &[DynValue],
    ) -> Result<OperationResult, DatabaseError> {
        let handle = self.connection(name)?;
        let params = to_sql_params(params);

        handle.with_connection(|connection| executor::execute(connection, sql, &params))
    }

    /// Queues one statement behind earlier work on the same connection.
    pub fn execute_async(
        &self,
        name: &str,
        sql: impl Into<String>,
        params: Vec<DynValue>,
    ) -> Pending<OperationResult> {
        let sql = sql.into();
        let params = to_sql_params(&params);

        self.submit(name, move |connection| {
            executor::execute(connection, &sql, &params)
        })
    }

    /// Runs every command atomically on the calling thread.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if `name` is not open
    /// * The first failing command's error, after rolling back
    pub fn execute_batch(
        &self,
        name: &str,
        commands: &[BatchCommand],
    ) -> Result<BatchResult, DatabaseError> {
        let handle = self.connection(name)?;

        handle.with_connection(|connection| batch::execute_batch(connection, commands))
    }

    pub fn execute_batch_async(
        &self,
        name: &str,
        commands: Vec<BatchCommand>,
    ) -> Pending<BatchResult> {
        self.submit(name, move |connection| {
            batch::execute_batch(connection, &commands)
        })
    }

    /// Runs `body` in a transaction on the calling thread. The connection is
    /// held for the whole body.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if `name` is not open
    /// * [`DatabaseError::InvalidState`] if this thread already holds the
    ///   connection
    /// * Anything [`run_transaction`] reports
    pub fn transaction<T>(
        &self,
        name: &str,
        body: impl FnOnce(&mut Transaction<'_>) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let handle = self.connection(name)?;

        handle.with_connection(|connection| run_transaction(connection, body))
    }

    /// Queues a whole transaction as one unit of work on the connection.
    pub fn transaction_async<T, F>(&self, name: &str, body: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Transaction<'_>) -> Result<T, DatabaseError> + Send + 'static,
    {
        self.submit(name, move |connection| run_transaction(connection, body))
    }

    /// Installs a scalar SQL function on the `name` connection.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if `name` is not open
    /// * [`DatabaseError::InvalidArgument`] for an empty name or bad arity
    /// * If the engine rejects the registration
    pub fn register_function(
        &self,
        name: &str,
        function_name: &str,
        arity: i32,
        flags: FunctionFlags,
        callable: impl Fn(&[DynValue]) -> Result<DynValue, DatabaseError> + Send + Sync + 'static,
    ) -> Result<(), DatabaseError> {
        functions::validate(function_name, arity)?;
        let handle = self.connection(name)?;

        handle.with_connection(|connection| {
            functions::register_scalar(connection, function_name, arity, flags, Arc::new(callable))
        })?;
        handle.record_function(function_name, arity, FunctionKind::Scalar);

        Ok(())
    }

    /// Installs an aggregate on the `name` connection, or a window function
    /// when `spec.inverse` is set.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if `name` is not open
    /// * [`DatabaseError::InvalidArgument`] for an empty name or bad arity
    /// * If the engine rejects the registration
    pub fn register_aggregate(
        &self,
        name: &str,
        function_name: &str,
        arity: i32,
        flags: FunctionFlags,
        spec: AggregateSpec,
    ) -> Result<FunctionKind, DatabaseError> {
        functions::validate(function_name, arity)?;
        let handle = self.connection(name)?;

        let kind = handle.with_connection(|connection| {
            functions::register_aggregate(connection, function_name, arity, flags, spec)
        })?;
        handle.record_function(function_name, arity, kind);

        Ok(kind)
    }

    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if `name` is not open or the function was
    ///   never registered through this registry
    pub fn unregister_function(
        &self,
        name: &str,
        function_name: &str,
        arity: i32,
    ) -> Result<(), DatabaseError> {
        let handle = self.connection(name)?;
        let key = (function_name.to_string(), arity);

        let known = handle
            .functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key);
        if !known {
            return Err(DatabaseError::NotFound(format!("{function_name}/{arity}")));
        }

        handle.with_connection(|connection| functions::unregister(connection, function_name, arity))?;
        handle
            .functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);

        Ok(())
    }

    /// Functions installed on `name` as `(function name, arity, kind)`.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if `name` is not open
    pub fn functions(&self, name: &str) -> Result<Vec<(String, i32, FunctionKind)>, DatabaseError> {
        let handle = self.connection(name)?;
        let functions = handle
            .functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        Ok(functions
            .iter()
            .map(|((function_name, arity), kind)| (function_name.clone(), *arity, *kind))
            .collect())
    }

    /// Drains queued work, stops the workers and closes every connection.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();

        let handles = std::mem::take(
            &mut *self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for (name, handle) in handles {
            match handle.take() {
                Ok(Some(connection)) => close_connection(&name, connection),
                Ok(None) => {}
                Err(e) => log::warn!("shutdown: leaving '{name}' open: {e}"),
            }
        }
    }

    fn submit<T, F>(&self, name: &str, work: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DatabaseError> + Send + 'static,
    {
        let handle = match Reservation::ensure_free(name).and_then(|()| self.connection(name)) {
            Ok(handle) => handle,
            Err(e) => return Pending::ready(Err(e)),
        };
        let lane = Arc::clone(&handle.lane);

        self.dispatcher
            .submit(&lane, move || handle.with_connection(work))
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_name(name: &str) -> Result<(), DatabaseError> {
    if name.trim().is_empty() {
        return Err(DatabaseError::InvalidArgument(
            "Database name is empty".to_string(),
        ));
    }
    Ok(())
}

fn close_connection(name: &str, connection: Connection) {
    if let Err((_, e)) = connection.close() {
        log::error!("Failed to close '{name}': {e}");
    }
}
