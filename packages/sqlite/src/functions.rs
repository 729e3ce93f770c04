//! User-defined scalar, aggregate and window functions.
//!
//! Callables receive their arguments as [`DynValue`]s and return one. Errors
//! returned by a callable, and panics inside it, abort the statement that
//! invoked it with the callable's message.

use std::{panic::AssertUnwindSafe, sync::Arc};

use rusqlite::{
    Connection,
    functions::{Aggregate, Context, FunctionFlags as SqliteFunctionFlags, WindowAggregate},
};

use crate::{
    DatabaseError,
    dispatcher::panic_message,
    value::{DynValue, SqlValue},
};

/// Largest argument count the engine accepts for a function.
pub const MAX_ARITY: i32 = 127;

pub type ScalarFn = Arc<dyn Fn(&[DynValue]) -> Result<DynValue, DatabaseError> + Send + Sync>;
pub type StepFn =
    Arc<dyn Fn(DynValue, &[DynValue]) -> Result<DynValue, DatabaseError> + Send + Sync>;
pub type ResultFn = Arc<dyn Fn(DynValue) -> Result<DynValue, DatabaseError> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct FunctionFlags {
    /// Same inputs always produce the same output
    pub deterministic: bool,
    /// Only callable from top-level SQL, not from views or triggers
    pub direct_only: bool,
    pub innocuous: bool,
    pub subtype: bool,
}

impl FunctionFlags {
    #[must_use]
    pub const fn deterministic() -> Self {
        Self {
            deterministic: true,
            direct_only: false,
            innocuous: false,
            subtype: false,
        }
    }
}

impl From<FunctionFlags> for SqliteFunctionFlags {
    fn from(value: FunctionFlags) -> Self {
        let mut flags = Self::SQLITE_UTF8;

        if value.deterministic {
            flags |= Self::SQLITE_DETERMINISTIC;
        }
        if value.direct_only {
            flags |= Self::SQLITE_DIRECTONLY;
        }
        if value.innocuous {
            flags |= Self::SQLITE_INNOCUOUS;
        }
        if value.subtype {
            flags |= Self::SQLITE_SUBTYPE;
        }

        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FunctionKind {
    Scalar,
    Aggregate,
    Window,
}

/// Initial accumulator of an aggregate.
#[derive(Clone)]
pub enum AggregateStart {
    /// Cloned for every group
    Value(DynValue),
    /// Called once per group
    Factory(Arc<dyn Fn() -> DynValue + Send + Sync>),
}

impl Default for AggregateStart {
    fn default() -> Self {
        Self::Value(DynValue::Number(0.0))
    }
}

impl std::fmt::Debug for AggregateStart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

impl AggregateStart {
    fn make(&self) -> DynValue {
        match self {
            Self::Value(value) => value.clone(),
            Self::Factory(factory) => factory(),
        }
    }
}

/// Callables making up an aggregate function.
///
/// `step` folds one row's arguments into the accumulator. `result` maps the
/// final accumulator to the returned value. When `inverse` is set the function
/// is also usable as a window function with a sliding frame.
#[derive(Clone)]
pub struct AggregateSpec {
    pub start: AggregateStart,
    pub step: StepFn,
    pub inverse: Option<StepFn>,
    pub result: Option<ResultFn>,
}

impl std::fmt::Debug for AggregateSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateSpec")
            .field("start", &self.start)
            .field("inverse", &self.inverse.is_some())
            .field("result", &self.result.is_some())
            .finish_non_exhaustive()
    }
}

impl AggregateSpec {
    pub fn new(
        step: impl Fn(DynValue, &[DynValue]) -> Result<DynValue, DatabaseError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            start: AggregateStart::default(),
            step: Arc::new(step),
            inverse: None,
            result: None,
        }
    }

    #[must_use]
    pub fn with_start(mut self, start: impl Into<DynValue>) -> Self {
        self.start = AggregateStart::Value(start.into());
        self
    }

    #[must_use]
    pub fn with_start_factory(mut self, factory: impl Fn() -> DynValue + Send + Sync + 'static) -> Self {
        self.start = AggregateStart::Factory(Arc::new(factory));
        self
    }

    #[must_use]
    pub fn with_inverse(
        mut self,
        inverse: impl Fn(DynValue, &[DynValue]) -> Result<DynValue, DatabaseError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.inverse = Some(Arc::new(inverse));
        self
    }

    #[must_use]
    pub fn with_result(
        mut self,
        result: impl Fn(DynValue) -> Result<DynValue, DatabaseError> + Send + Sync + 'static,
    ) -> Self {
        self.result = Some(Arc::new(result));
        self
    }

    #[must_use]
    pub const fn kind(&self) -> FunctionKind {
        if self.inverse.is_some() {
            FunctionKind::Window
        } else {
            FunctionKind::Aggregate
        }
    }

    fn finish(&self, accumulator: DynValue) -> Result<DynValue, DatabaseError> {
        match &self.result {
            Some(result) => guarded(|| result(accumulator)),
            None => Ok(accumulator),
        }
    }
}

/// Checks a function name and argument count before registration.
///
/// # Errors
///
/// * If `name` is empty
/// * If `arity` is outside `-1..=127`
pub fn validate(name: &str, arity: i32) -> Result<(), DatabaseError> {
    if name.trim().is_empty() {
        return Err(DatabaseError::InvalidArgument(
            "Function name is empty".to_string(),
        ));
    }

    if !(-1..=MAX_ARITY).contains(&arity) {
        return Err(DatabaseError::InvalidArgument(format!(
            "Function '{name}' arity {arity} is outside -1..={MAX_ARITY}"
        )));
    }

    Ok(())
}

/// Installs a scalar function. An arity of `-1` accepts any argument count.
///
/// # Errors
///
/// * If the name or arity is invalid
/// * If the engine rejects the registration
pub fn register_scalar(
    connection: &Connection,
    name: &str,
    arity: i32,
    flags: FunctionFlags,
    callable: ScalarFn,
) -> Result<(), DatabaseError> {
    validate(name, arity)?;
    log::debug!("register_scalar: name={name} arity={arity} flags={flags:?}");

    let callable = AssertUnwindSafe(callable);

    connection.create_scalar_function(name, arity, flags.into(), move |ctx| {
        let callable = &callable;
        let args = arguments(ctx);
        guarded(|| (callable.0)(&args))
            .map(SqlValue::from)
            .map_err(user_error)
    })?;

    Ok(())
}

/// Installs an aggregate, or a window function when `spec.inverse` is set.
///
/// # Errors
///
/// * If the name or arity is invalid
/// * If the engine rejects the registration
pub fn register_aggregate(
    connection: &Connection,
    name: &str,
    arity: i32,
    flags: FunctionFlags,
    spec: AggregateSpec,
) -> Result<FunctionKind, DatabaseError> {
    validate(name, arity)?;

    let kind = spec.kind();
    log::debug!("register_aggregate: name={name} arity={arity} kind={kind:?} flags={flags:?}");

    let aggregator = Aggregator {
        spec: AssertUnwindSafe(spec),
    };

    match kind {
        FunctionKind::Window => {
            connection.create_window_function(name, arity, flags.into(), aggregator)?;
        }
        FunctionKind::Aggregate | FunctionKind::Scalar => {
            connection.create_aggregate_function(name, arity, flags.into(), aggregator)?;
        }
    }

    Ok(kind)
}

/// Removes a previously installed function, whatever its kind.
///
/// # Errors
///
/// * If the engine rejects the removal
pub fn unregister(connection: &Connection, name: &str, arity: i32) -> Result<(), DatabaseError> {
    log::debug!("unregister: name={name} arity={arity}");
    connection.remove_function(name, arity)?;
    Ok(())
}

struct Aggregator {
    spec: AssertUnwindSafe<AggregateSpec>,
}

impl Aggregator {
    fn fold(&self, step: &StepFn, ctx: &Context<'_>, acc: &mut DynValue) -> rusqlite::Result<()> {
        let args = arguments(ctx);
        let current = std::mem::replace(acc, DynValue::Null);
        *acc = guarded(|| step(current, &args)).map_err(user_error)?;
        Ok(())
    }
}

impl Aggregate<DynValue, SqlValue> for Aggregator {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<DynValue> {
        Ok(self.spec.start.make())
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut DynValue) -> rusqlite::Result<()> {
        self.fold(&self.spec.step, ctx, acc)
    }

    fn finalize(
        &self,
        _ctx: &mut Context<'_>,
        acc: Option<DynValue>,
    ) -> rusqlite::Result<SqlValue> {
        let accumulator = acc.unwrap_or_else(|| self.spec.start.make());
        self.spec
            .finish(accumulator)
            .map(SqlValue::from)
            .map_err(user_error)
    }
}

impl WindowAggregate<DynValue, SqlValue> for Aggregator {
    fn value(&self, acc: Option<&mut DynValue>) -> rusqlite::Result<SqlValue> {
        let accumulator = acc.map_or_else(|| self.spec.start.make(), |x| x.clone());
        self.spec
            .finish(accumulator)
            .map(SqlValue::from)
            .map_err(user_error)
    }

    fn inverse(&self, ctx: &mut Context<'_>, acc: &mut DynValue) -> rusqlite::Result<()> {
        match &self.spec.inverse {
            Some(inverse) => self.fold(inverse, ctx, acc),
            None => Ok(()),
        }
    }
}

fn arguments(ctx: &Context<'_>) -> Vec<DynValue> {
    (0..ctx.len())
        .map(|i| SqlValue::from(ctx.get_raw(i)).into())
        .collect()
}

/// Runs a user callable, turning a panic into a [`DatabaseError::Callback`].
fn guarded<T>(f: impl FnOnce() -> Result<T, DatabaseError>) -> Result<T, DatabaseError> {
    std::panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|panic| Err(DatabaseError::callback(panic_message(&*panic))))
}

fn user_error(error: DatabaseError) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(error))
}
