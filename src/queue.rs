//! Strictly serialized access to one shared connection.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::engine::{DatabaseLocation, OpenFlags};
use crate::error::{DispatchError, Result};
use crate::transaction::TransactionKind;

static QUEUE_SEQ: AtomicU64 = AtomicU64::new(0);
static SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Serialized single-writer coordinator: one dedicated worker thread owns one
/// connection and drains a strict FIFO of units of work.
///
/// Units of work submitted from any number of tasks execute in acceptance
/// order, never concurrently; each submission resolves once its unit of work
/// has run. The connection opens lazily on the first submission.
///
/// Contract: never call `submit*` on a queue from inside one of its own units
/// of work: the single FIFO worker makes that a deadlock, which the queue
/// cannot detect cheaply. Use savepoints inside a single unit of work for
/// nested scoping instead.
#[derive(Clone)]
pub struct SerialQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    sender: Sender<Command>,
    closed: AtomicBool,
    /// Held across the drain in [`SerialQueue::close`] so concurrent closers
    /// return only once the worker has actually stopped.
    close_lock: tokio::sync::Mutex<()>,
    label: String,
}

type BoxedResponse = Result<Box<dyn Any + Send>>;
type UnitOfWork = Box<dyn FnOnce(&Connection) -> BoxedResponse + Send>;

enum Command {
    Run {
        work: UnitOfWork,
        respond_to: oneshot::Sender<BoxedResponse>,
    },
    Close {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

impl SerialQueue {
    /// Spawn the worker for a database at `location`.
    pub fn open(location: impl Into<DatabaseLocation>) -> Result<Self> {
        Self::open_with_flags(location, OpenFlags::default())
    }

    pub fn open_with_flags(
        location: impl Into<DatabaseLocation>,
        flags: OpenFlags,
    ) -> Result<Self> {
        let location = location.into();
        let label = format!("sqlite-dispatch-{}", QUEUE_SEQ.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel::<Command>();
        let connection = Connection::with_flags(location, flags);
        thread::Builder::new()
            .name(label.clone())
            .spawn(move || run_worker(&connection, &receiver))
            .map_err(|err| {
                DispatchError::ConnectionError(format!(
                    "failed to spawn queue worker thread: {err}"
                ))
            })?;
        debug!(%label, "serial queue worker spawned");
        Ok(Self {
            inner: Arc::new(QueueInner {
                sender,
                closed: AtomicBool::new(false),
                close_lock: tokio::sync::Mutex::new(()),
                label,
            }),
        })
    }

    /// Run a unit of work against the shared connection, serialized behind
    /// every previously accepted submission.
    pub async fn submit<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let boxed: UnitOfWork =
            Box::new(move |conn| work(conn).map(|value| Box::new(value) as Box<dyn Any + Send>));
        self.send(Command::Run {
            work: boxed,
            respond_to: tx,
        })?;
        match rx.await {
            Ok(Ok(payload)) => payload.downcast::<R>().map(|boxed| *boxed).map_err(|_| {
                DispatchError::ConnectionError("queue worker response downcast failure".into())
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(DispatchError::ConnectionError(
                "queue worker dropped while running unit of work".into(),
            )),
        }
    }

    /// Run a unit of work inside a transaction. Commits on success; rolls
    /// back when the unit of work either sets the rollback flag (still
    /// returning its value) or returns an error.
    pub async fn submit_transaction<F, R>(&self, kind: TransactionKind, work: F) -> Result<R>
    where
        F: FnOnce(&Connection, &mut bool) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.submit(move |conn| {
            match kind {
                TransactionKind::Exclusive => conn.begin_transaction()?,
                TransactionKind::Deferred => conn.begin_deferred_transaction()?,
            }
            let mut rollback = false;
            match work(conn, &mut rollback) {
                Ok(value) => {
                    if rollback {
                        conn.rollback()?;
                    } else {
                        conn.commit()?;
                    }
                    Ok(value)
                }
                Err(err) => {
                    if let Err(rollback_err) = conn.rollback() {
                        warn!(%rollback_err, "rollback after failed unit of work also failed");
                    }
                    Err(err)
                }
            }
        })
        .await
    }

    /// Run a unit of work inside a uniquely named savepoint. Unlike
    /// [`submit_transaction`](Self::submit_transaction) this nests: the unit
    /// of work may start further savepoints on the same connection.
    pub async fn submit_savepoint<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&Connection, &mut bool) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let name = format!(
            "dispatch_savepoint_{}",
            SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        self.submit(move |conn| {
            conn.start_savepoint(&name)?;
            let mut rollback = false;
            match work(conn, &mut rollback) {
                Ok(value) => {
                    if rollback {
                        conn.rollback_to_savepoint(&name)?;
                    }
                    conn.release_savepoint(&name)?;
                    Ok(value)
                }
                Err(err) => {
                    if let Err(rollback_err) = conn
                        .rollback_to_savepoint(&name)
                        .and_then(|()| conn.release_savepoint(&name))
                    {
                        warn!(%rollback_err, "savepoint rollback after failed unit of work also failed");
                    }
                    Err(err)
                }
            }
        })
        .await
    }

    /// Drain accepted submissions, close the connection, and stop the worker.
    /// Subsequent submissions fail with a `ConnectionError` instead of
    /// hanging. Idempotent, and concurrent calls all return only once the
    /// drain has completed.
    pub async fn close(&self) -> Result<()> {
        let _drain = self.inner.close_lock.lock().await;
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if self.inner.sender.send(Command::Close { respond_to: tx }).is_err() {
            return Ok(());
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::ConnectionError(
                "queue worker dropped during close".into(),
            )),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::ConnectionError("queue is closed".into()));
        }
        self.inner
            .sender
            .send(command)
            .map_err(|_| DispatchError::ConnectionError("queue is closed".into()))
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

fn run_worker(conn: &Connection, receiver: &Receiver<Command>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Run { work, respond_to } => {
                // Lazy open; a no-op while the connection is already open.
                let outcome = conn.open().and_then(|()| work(conn));
                let _ = respond_to.send(outcome);
            }
            Command::Close { respond_to } => {
                let _ = respond_to.send(conn.close());
                return;
            }
            Command::Shutdown => break,
        }
    }
    // Channel dropped without an explicit close; release the handle here.
    if let Err(err) = conn.close() {
        warn!(%err, "closing queue connection on worker shutdown failed");
    }
}
