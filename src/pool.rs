//! Bounded pool of connections against one database.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::engine::{DatabaseLocation, OpenFlags};
use crate::error::{DispatchError, Result};
use crate::transaction::TransactionKind;

/// Admission control for pooled connections.
///
/// Consulted when a connection is created: a `false` answer still grants the
/// connection for the current checkout but keeps it out of future reuse (it
/// is closed instead of re-pooled on release).
pub trait PoolDelegate: Send + Sync {
    fn should_pool(&self, conn: &Connection) -> bool;
}

/// Pool of connections opened against the same database.
///
/// Distinct connections may be used concurrently from different threads; only
/// the pool's own bookkeeping is serialized (one lock, held briefly, never
/// across a unit of work). Writers still serialize at the database's file
/// lock, so pools suit read-mostly workloads; for write-heavy paths prefer a
/// [`SerialQueue`](crate::SerialQueue). Recursively acquiring a second
/// connection while holding one can deadlock once the bound is exhausted.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    location: DatabaseLocation,
    flags: OpenFlags,
    /// 0 means unbounded.
    max_size: usize,
    delegate: Option<Arc<dyn PoolDelegate>>,
    state: Mutex<PoolState>,
    notify: Notify,
}

struct PoolState {
    checked_in: Vec<Connection>,
    checked_out: usize,
    /// Bumped by `release_all`; guards from an older generation discard their
    /// connection instead of re-pooling it.
    generation: u64,
}

/// Builder for a [`ConnectionPool`].
pub struct PoolBuilder {
    location: DatabaseLocation,
    flags: OpenFlags,
    max_size: usize,
    delegate: Option<Arc<dyn PoolDelegate>>,
}

impl PoolBuilder {
    #[must_use]
    pub fn new(location: impl Into<DatabaseLocation>) -> Self {
        Self {
            location: location.into(),
            flags: OpenFlags::default(),
            max_size: 0,
            delegate: None,
        }
    }

    #[must_use]
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Upper bound on simultaneously open connections; 0 for unbounded.
    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub fn delegate(mut self, delegate: impl PoolDelegate + 'static) -> Self {
        self.delegate = Some(Arc::new(delegate));
        self
    }

    #[must_use]
    pub fn build(self) -> ConnectionPool {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                location: self.location,
                flags: self.flags,
                max_size: self.max_size,
                delegate: self.delegate,
                state: Mutex::new(PoolState {
                    checked_in: Vec::new(),
                    checked_out: 0,
                    generation: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }
}

impl ConnectionPool {
    /// Unbounded pool with default flags.
    #[must_use]
    pub fn new(location: impl Into<DatabaseLocation>) -> Self {
        PoolBuilder::new(location).build()
    }

    #[must_use]
    pub fn builder(location: impl Into<DatabaseLocation>) -> PoolBuilder {
        PoolBuilder::new(location)
    }

    /// Check a connection out, waiting while the bound is exhausted.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        loop {
            // Register as a waiter before re-checking availability, so a
            // release landing between the check and the await still wakes us
            // (Notify stores at most one permit for unregistered waiters).
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_acquire_inner()? {
                Some(guard) => return Ok(guard),
                None => notified.await,
            }
        }
    }

    /// Non-waiting variant of [`acquire`](Self::acquire); fails with
    /// [`DispatchError::PoolExhausted`] when the bound is reached.
    pub fn try_acquire(&self) -> Result<PooledConnection> {
        self.try_acquire_inner()?.ok_or_else(|| {
            DispatchError::PoolExhausted(format!(
                "all {} connections are checked out",
                self.inner.max_size
            ))
        })
    }

    /// `Some(guard)` on success, `None` when the caller must wait.
    fn try_acquire_inner(&self) -> Result<Option<PooledConnection>> {
        let generation;
        {
            let mut state = self.lock_state();
            if let Some(conn) = state.checked_in.pop() {
                state.checked_out += 1;
                return Ok(Some(PooledConnection {
                    conn: Some(conn),
                    pool: Arc::clone(&self.inner),
                    generation: state.generation,
                    reusable: true,
                }));
            }
            let total = state.checked_out + state.checked_in.len();
            if self.inner.max_size != 0 && total >= self.inner.max_size {
                return Ok(None);
            }
            // Reserve the slot before opening so concurrent acquires cannot
            // overshoot the bound while this open is in flight.
            state.checked_out += 1;
            generation = state.generation;
        }
        match self.open_connection() {
            Ok(conn) => {
                let reusable = self
                    .inner
                    .delegate
                    .as_ref()
                    .is_none_or(|delegate| delegate.should_pool(&conn));
                if !reusable {
                    debug!("pool delegate vetoed re-pooling a new connection");
                }
                Ok(Some(PooledConnection {
                    conn: Some(conn),
                    pool: Arc::clone(&self.inner),
                    generation,
                    reusable,
                }))
            }
            Err(err) => {
                self.lock_state().checked_out -= 1;
                self.inner.notify.notify_one();
                Err(err)
            }
        }
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::with_flags(self.inner.location.clone(), self.inner.flags);
        conn.open()?;
        Ok(conn)
    }

    /// Acquire, run a unit of work off the async threads, always release.
    pub async fn with_connection<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let guard = self.acquire().await?;
        run_blocking(move || {
            let result = work(&*guard);
            drop(guard);
            result
        })
        .await
    }

    /// Like [`with_connection`](Self::with_connection) inside a transaction,
    /// honoring both the rollback flag and error propagation.
    pub async fn with_transaction<F, R>(&self, kind: TransactionKind, work: F) -> Result<R>
    where
        F: FnOnce(&Connection, &mut bool) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let guard = self.acquire().await?;
        run_blocking(move || {
            match kind {
                TransactionKind::Exclusive => guard.begin_transaction()?,
                TransactionKind::Deferred => guard.begin_deferred_transaction()?,
            }
            let mut rollback = false;
            let result = match work(&*guard, &mut rollback) {
                Ok(value) => {
                    if rollback {
                        guard.rollback()?;
                    } else {
                        guard.commit()?;
                    }
                    Ok(value)
                }
                Err(err) => {
                    if let Err(rollback_err) = guard.rollback() {
                        warn!(%rollback_err, "rollback after failed unit of work also failed");
                    }
                    Err(err)
                }
            };
            drop(guard);
            result
        })
        .await
    }

    /// Close and discard every checked-in connection and orphan every
    /// checked-out one (guards from before this call discard their connection
    /// on release instead of re-pooling it). Teardown only: callers still
    /// holding guards get closed-connection errors on further use of anything
    /// the pool reclaimed.
    pub fn release_all(&self) {
        let drained: Vec<Connection> = {
            let mut state = self.lock_state();
            state.generation += 1;
            std::mem::take(&mut state.checked_in)
        };
        for conn in drained {
            if let Err(err) = conn.close() {
                warn!(%err, "closing pooled connection during release_all failed");
            }
        }
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn checked_in_count(&self) -> usize {
        self.lock_state().checked_in.len()
    }

    #[must_use]
    pub fn checked_out_count(&self) -> usize {
        self.lock_state().checked_out
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        let state = self.lock_state();
        state.checked_in.len() + state.checked_out
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("ConnectionPool")
            .field("location", &self.inner.location)
            .field("max_size", &self.inner.max_size)
            .field("checked_in", &state.checked_in.len())
            .field("checked_out", &state.checked_out)
            .finish()
    }
}

/// A checked-out connection; checked back in (or discarded) on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    generation: u64,
    reusable: bool,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Present from construction until drop.
        self.conn.as_ref().expect("pooled connection already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let mut discard = !self.reusable;
        if conn.is_in_transaction() {
            // Never re-pool a half-committed connection.
            warn!("pooled connection released mid-transaction; rolling back and discarding");
            if let Err(err) = conn.rollback() {
                warn!(%err, "rollback of a mid-transaction pooled connection failed");
            }
            discard = true;
        }
        if !conn.is_open() {
            discard = true;
        }
        let mut state = self
            .pool
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.checked_out = state.checked_out.saturating_sub(1);
        if state.generation != self.generation {
            discard = true;
        }
        if discard {
            drop(state);
            let _ = conn.close();
        } else {
            state.checked_in.push(conn);
            drop(state);
        }
        self.pool.notify.notify_one();
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("reusable", &self.reusable)
            .finish_non_exhaustive()
    }
}

async fn run_blocking<F, R>(func: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    spawn_blocking(func).await.map_err(|err| {
        DispatchError::ConnectionError(format!("pool unit of work join error: {err}"))
    })?
}
