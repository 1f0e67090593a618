//! Single database connection with statement caching and busy retry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cursor::ResultCursor;
use crate::engine::{
    DatabaseLocation, EngineResult, OpenFlags, RawHandle, RawStatement,
};
use crate::error::{DispatchError, Result};
use crate::value::SqlValue;

/// Interval between busy-retry attempts.
const BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Default wall-clock budget for lock-contention retries.
pub const DEFAULT_BUSY_DURATION: Duration = Duration::from_secs(2);

/// One exclusive handle to a database.
///
/// All methods take `&self`; the handle, flags, and statement cache live
/// behind interior mutability. A `Connection` is `Send` but not `Sync`: it may
/// move between threads (onto a queue worker, in and out of a pool) but must
/// never be used from two threads concurrently. Route shared use through a
/// [`SerialQueue`](crate::SerialQueue) or [`ConnectionPool`](crate::ConnectionPool).
pub struct Connection {
    location: DatabaseLocation,
    flags: OpenFlags,
    state: RefCell<ConnState>,
}

struct ConnState {
    handle: Option<RawHandle>,
    in_transaction: bool,
    cache_enabled: bool,
    cache: HashMap<String, StatementHandle>,
    max_busy_duration: Duration,
    timestamp_format: Option<String>,
    last_error: Option<(i32, String)>,
    last_insert_rowid: i64,
    changes: u64,
}

/// A compiled statement checked out of (or destined for) the cache.
pub(crate) struct StatementHandle {
    pub(crate) stmt: RawStatement,
}

impl Connection {
    /// Create a closed connection. [`open`](Self::open) acquires the handle.
    #[must_use]
    pub fn new(location: impl Into<DatabaseLocation>) -> Self {
        Self::with_flags(location, OpenFlags::default())
    }

    #[must_use]
    pub fn with_flags(location: impl Into<DatabaseLocation>, flags: OpenFlags) -> Self {
        Self {
            location: location.into(),
            flags,
            state: RefCell::new(ConnState {
                handle: None,
                in_transaction: false,
                cache_enabled: true,
                cache: HashMap::new(),
                max_busy_duration: DEFAULT_BUSY_DURATION,
                timestamp_format: None,
                last_error: None,
                last_insert_rowid: 0,
                changes: 0,
            }),
        }
    }

    #[must_use]
    pub fn location(&self) -> &DatabaseLocation {
        &self.location
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.borrow().handle.is_some()
    }

    /// Acquire the engine handle. A no-op when already open; re-opening after
    /// [`close`](Self::close) acquires a fresh handle.
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.handle.is_some() {
            return Ok(());
        }
        match RawHandle::open(&self.location.as_engine_path(), self.flags) {
            Ok(handle) => {
                state.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                state.last_error = Some((err.code, err.message.clone()));
                Err(DispatchError::open(err))
            }
        }
    }

    /// Release the engine handle, finalizing every cached statement first.
    ///
    /// Idempotent. When the engine reports outstanding resources (a cursor
    /// still holds a statement), the error is returned but the handle is
    /// still released best-effort; live cursors observe the closed state and
    /// fail with `Misuse` from then on.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.cache.clear();
        state.in_transaction = false;
        let Some(handle) = state.handle.take() else {
            return Ok(());
        };
        handle.close().map_err(|err| {
            state.last_error = Some((err.code, err.message.clone()));
            DispatchError::ConnectionError(format!(
                "close reported outstanding resources: {err}"
            ))
        })
    }

    // ---- configuration ----

    /// Wall-clock budget for retrying operations that hit lock contention.
    pub fn set_max_busy_duration(&self, duration: Duration) {
        self.state.borrow_mut().max_busy_duration = duration;
    }

    #[must_use]
    pub fn max_busy_duration(&self) -> Duration {
        self.state.borrow().max_busy_duration
    }

    /// Enable or disable statement caching. Disabling clears the cache.
    pub fn set_statement_cache_enabled(&self, enabled: bool) {
        let mut state = self.state.borrow_mut();
        state.cache_enabled = enabled;
        if !enabled {
            state.cache.clear();
        }
    }

    #[must_use]
    pub fn statement_cache_enabled(&self) -> bool {
        self.state.borrow().cache_enabled
    }

    /// Finalize every cached statement.
    pub fn clear_statement_cache(&self) {
        self.state.borrow_mut().cache.clear();
    }

    #[must_use]
    pub fn cached_statement_count(&self) -> usize {
        self.state.borrow().cache.len()
    }

    /// chrono format string used when binding and reading [`SqlValue::Timestamp`].
    /// Without one, timestamps bind as an epoch REAL (seconds).
    pub fn set_timestamp_format(&self, format: Option<String>) {
        self.state.borrow_mut().timestamp_format = format;
    }

    #[must_use]
    pub fn timestamp_format(&self) -> Option<String> {
        self.state.borrow().timestamp_format.clone()
    }

    // ---- introspection ----

    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.state.borrow().in_transaction
    }

    /// Code and message of the most recent failed operation.
    #[must_use]
    pub fn last_error(&self) -> Option<(i32, String)> {
        self.state.borrow().last_error.clone()
    }

    /// Rowid of the most recent successful insert through this connection.
    #[must_use]
    pub fn last_insert_rowid(&self) -> i64 {
        self.state.borrow().last_insert_rowid
    }

    /// Rows changed by the most recent successful update through this connection.
    #[must_use]
    pub fn changes(&self) -> u64 {
        self.state.borrow().changes
    }

    // ---- execution ----

    /// Execute a DML/DDL statement with positional parameters, returning the
    /// number of rows changed.
    pub fn execute_update(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.run_update(sql, Binding::Positional(params))
    }

    /// Like [`execute_update`](Self::execute_update) with `:name` placeholders
    /// bound from a map (keys without the prefix character).
    pub fn execute_update_named(
        &self,
        sql: &str,
        params: &HashMap<String, SqlValue>,
    ) -> Result<u64> {
        self.run_update(sql, Binding::Named(params))
    }

    /// Execute a query, returning a cursor positioned before the first row.
    pub fn execute_query<'conn>(
        &'conn self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<ResultCursor<'conn>> {
        self.run_query(sql, Binding::Positional(params))
    }

    /// Named-placeholder variant of [`execute_query`](Self::execute_query).
    pub fn execute_query_named<'conn>(
        &'conn self,
        sql: &str,
        params: &HashMap<String, SqlValue>,
    ) -> Result<ResultCursor<'conn>> {
        self.run_query(sql, Binding::Named(params))
    }

    /// Run a semicolon-separated script without result rows. Suitable for
    /// DDL and pragmas; statements are not cached.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.exec_control(sql)
    }

    // ---- transactions ----

    /// `BEGIN EXCLUSIVE TRANSACTION`. Fails with `Misuse` when already inside
    /// a transaction; the in-transaction flag toggles only on success.
    pub fn begin_transaction(&self) -> Result<()> {
        self.begin("BEGIN EXCLUSIVE TRANSACTION")
    }

    /// `BEGIN DEFERRED TRANSACTION`.
    pub fn begin_deferred_transaction(&self) -> Result<()> {
        self.begin("BEGIN DEFERRED TRANSACTION")
    }

    pub fn commit(&self) -> Result<()> {
        self.end_transaction("COMMIT TRANSACTION")
    }

    pub fn rollback(&self) -> Result<()> {
        self.end_transaction("ROLLBACK TRANSACTION")
    }

    fn begin(&self, sql: &str) -> Result<()> {
        if self.state.borrow().in_transaction {
            return Err(DispatchError::Misuse(
                "transaction already in progress".into(),
            ));
        }
        self.exec_control(sql)?;
        self.state.borrow_mut().in_transaction = true;
        Ok(())
    }

    fn end_transaction(&self, sql: &str) -> Result<()> {
        if !self.state.borrow().in_transaction {
            return Err(DispatchError::Misuse("no transaction in progress".into()));
        }
        self.exec_control(sql)?;
        self.state.borrow_mut().in_transaction = false;
        Ok(())
    }

    // ---- savepoints ----

    /// `SAVEPOINT`. Names are escaped before interpolation; savepoints nest
    /// and a failure leaves the in-transaction flag untouched.
    pub fn start_savepoint(&self, name: &str) -> Result<()> {
        self.exec_control(&format!("SAVEPOINT '{}'", escape_savepoint_name(name)))
    }

    /// `RELEASE SAVEPOINT`.
    pub fn release_savepoint(&self, name: &str) -> Result<()> {
        self.exec_control(&format!(
            "RELEASE SAVEPOINT '{}'",
            escape_savepoint_name(name)
        ))
    }

    /// `ROLLBACK TO SAVEPOINT`. The savepoint stays on the stack afterwards;
    /// pair with [`release_savepoint`](Self::release_savepoint) to discard it.
    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.exec_control(&format!(
            "ROLLBACK TRANSACTION TO SAVEPOINT '{}'",
            escape_savepoint_name(name)
        ))
    }

    // ---- internals shared with the cursor ----

    fn run_update(&self, sql: &str, binding: Binding<'_>) -> Result<u64> {
        let mut handle = self.checkout_statement(sql)?;
        let outcome = self
            .bind_all(&mut handle.stmt, binding)
            .and_then(|()| self.retry_busy(|| handle.stmt.step()));
        self.checkin_statement(sql, handle);
        match outcome {
            Ok(_) => {
                let mut state = self.state.borrow_mut();
                let state = &mut *state;
                let engine = state.handle.as_ref().ok_or_else(closed_error)?;
                state.last_insert_rowid = engine.last_insert_rowid();
                state.changes = engine.changes();
                Ok(state.changes)
            }
            Err(err) => Err(self.record(err)),
        }
    }

    fn run_query<'conn>(&'conn self, sql: &str, binding: Binding<'_>) -> Result<ResultCursor<'conn>> {
        let mut handle = self.checkout_statement(sql)?;
        if let Err(err) = self.bind_all(&mut handle.stmt, binding) {
            self.checkin_statement(sql, handle);
            return Err(self.record(err));
        }
        Ok(ResultCursor::new(self, sql.to_owned(), handle))
    }

    /// Retry an engine operation while it reports lock contention, up to the
    /// configured busy budget. Blocking by design; connections never serve
    /// two logical operations at once.
    pub(crate) fn retry_busy<T>(
        &self,
        mut op: impl FnMut() -> EngineResult<T>,
    ) -> Result<T> {
        let budget = self.state.borrow().max_busy_duration;
        let started = Instant::now();
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_busy() => {
                    if started.elapsed() >= budget {
                        return Err(DispatchError::BusyTimeout {
                            waited_ms: u64::try_from(started.elapsed().as_millis())
                                .unwrap_or(u64::MAX),
                            message: err.message,
                        });
                    }
                    debug!(code = err.code, "database busy, retrying");
                    std::thread::sleep(BUSY_RETRY_INTERVAL);
                }
                Err(err) => return Err(DispatchError::step(err)),
            }
        }
    }

    /// Take a reusable statement from the cache, or prepare a fresh one. A
    /// checked-out entry is absent from the map, so reentrant use of the same
    /// SQL prepares fresh instead of corrupting the running cursor.
    pub(crate) fn checkout_statement(&self, sql: &str) -> Result<StatementHandle> {
        {
            let mut state = self.state.borrow_mut();
            if state.cache_enabled
                && let Some(entry) = state.cache.remove(sql)
            {
                return Ok(entry);
            }
        }
        let stmt = self.prepare_fresh(sql)?;
        Ok(StatementHandle { stmt })
    }

    fn prepare_fresh(&self, sql: &str) -> Result<RawStatement> {
        let budget = self.state.borrow().max_busy_duration;
        let started = Instant::now();
        loop {
            let result = {
                let state = self.state.borrow();
                let handle = state.handle.as_ref().ok_or_else(closed_error)?;
                handle.prepare(sql)
            };
            match result {
                Ok(stmt) => return Ok(stmt),
                Err(err) if err.is_busy() && started.elapsed() < budget => {
                    debug!(code = err.code, "prepare hit a busy database, retrying");
                    std::thread::sleep(BUSY_RETRY_INTERVAL);
                }
                Err(err) if err.is_busy() => {
                    return Err(self.record(DispatchError::BusyTimeout {
                        waited_ms: u64::try_from(started.elapsed().as_millis())
                            .unwrap_or(u64::MAX),
                        message: err.message,
                    }));
                }
                Err(err) => return Err(self.record(DispatchError::prepare(err))),
            }
        }
    }

    /// Reset a statement and return it to the cache. If a replacement entry
    /// for the same SQL landed in the meantime (reentrant use), the returning
    /// statement is finalized instead.
    pub(crate) fn checkin_statement(&self, sql: &str, mut handle: StatementHandle) {
        let reset_ok = handle.stmt.reset().is_ok();
        handle.stmt.clear_bindings();
        let mut state = self.state.borrow_mut();
        if state.cache_enabled && state.handle.is_some() && reset_ok {
            state.cache.entry(sql.to_owned()).or_insert(handle);
        }
    }

    pub(crate) fn record(&self, err: DispatchError) -> DispatchError {
        let code = err.code().unwrap_or(0);
        self.state.borrow_mut().last_error = Some((code, err.to_string()));
        err
    }

    fn bind_all(&self, stmt: &mut RawStatement, binding: Binding<'_>) -> Result<()> {
        let expected = stmt.parameter_count();
        let format = self.state.borrow().timestamp_format.clone();
        match binding {
            Binding::Positional(params) => {
                if params.len() != expected {
                    return Err(DispatchError::BindFailure(format!(
                        "statement expects {expected} parameters, {} supplied",
                        params.len()
                    )));
                }
                for (i, value) in params.iter().enumerate() {
                    bind_value(stmt, i + 1, value, format.as_deref())?;
                }
            }
            Binding::Named(params) => {
                for index in 1..=expected {
                    let Some(raw_name) = stmt.parameter_name(index) else {
                        return Err(DispatchError::BindFailure(format!(
                            "placeholder {index} is positional; named binding requires \
                             named placeholders throughout"
                        )));
                    };
                    let key = raw_name.trim_start_matches([':', '@', '$']);
                    let Some(value) = params.get(key) else {
                        return Err(DispatchError::BindFailure(format!(
                            "no value supplied for placeholder '{raw_name}'"
                        )));
                    };
                    bind_value(stmt, index, value, format.as_deref())?;
                }
                if params.len() > expected {
                    warn!(
                        supplied = params.len(),
                        expected, "more named parameters supplied than placeholders"
                    );
                }
            }
        }
        Ok(())
    }

    /// Transaction control and other ad hoc statements, outside the cache.
    fn exec_control(&self, sql: &str) -> Result<()> {
        let budget = self.state.borrow().max_busy_duration;
        let started = Instant::now();
        loop {
            let result = {
                let state = self.state.borrow();
                let handle = state.handle.as_ref().ok_or_else(closed_error)?;
                handle.exec(sql)
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_busy() && started.elapsed() < budget => {
                    debug!(code = err.code, "exec hit a busy database, retrying");
                    std::thread::sleep(BUSY_RETRY_INTERVAL);
                }
                Err(err) if err.is_busy() => {
                    return Err(self.record(DispatchError::BusyTimeout {
                        waited_ms: u64::try_from(started.elapsed().as_millis())
                            .unwrap_or(u64::MAX),
                        message: err.message,
                    }));
                }
                // `exec` reports the generic code for SQL that fails to
                // compile; anything else comes from a statement that ran.
                Err(err) if err.is_compile_failure() => {
                    return Err(self.record(DispatchError::prepare(err)));
                }
                Err(err) => return Err(self.record(DispatchError::step(err))),
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.cache.clear();
        if state.handle.take().is_some() {
            debug!(location = ?self.location, "connection dropped while open");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Connection")
            .field("location", &self.location)
            .field("open", &state.handle.is_some())
            .field("in_transaction", &state.in_transaction)
            .field("cached_statements", &state.cache.len())
            .finish()
    }
}

enum Binding<'a> {
    Positional(&'a [SqlValue]),
    Named(&'a HashMap<String, SqlValue>),
}

fn closed_error() -> DispatchError {
    DispatchError::Misuse("connection is closed".into())
}

fn escape_savepoint_name(name: &str) -> String {
    name.replace('\'', "''")
}

fn bind_value(
    stmt: &mut RawStatement,
    index: usize,
    value: &SqlValue,
    timestamp_format: Option<&str>,
) -> Result<()> {
    let bound = match value {
        SqlValue::Integer(v) => stmt.bind_i64(index, *v),
        SqlValue::Real(v) => stmt.bind_f64(index, *v),
        SqlValue::Text(v) => stmt.bind_text(index, v),
        SqlValue::Blob(v) => stmt.bind_blob(index, v),
        SqlValue::Null => stmt.bind_null(index),
        SqlValue::Timestamp(dt) => match timestamp_format {
            Some(format) => stmt.bind_text(index, &dt.format(format).to_string()),
            None => stmt.bind_f64(index, epoch_seconds(dt)),
        },
        SqlValue::Json(v) => stmt.bind_text(index, &v.to_string()),
    };
    bound.map_err(|err| DispatchError::BindFailure(err.message))
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn epoch_seconds(dt: &chrono::DateTime<chrono::Utc>) -> f64 {
    dt.timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn savepoint_names_neutralize_quotes() {
        assert_eq!(escape_savepoint_name("a'b"), "a''b");
        assert_eq!(escape_savepoint_name("plain"), "plain");
    }
}
