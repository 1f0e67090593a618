//! Serialized and pooled access coordination for SQLite connections.
//!
//! A single SQLite connection is not safe for concurrent use from multiple
//! threads. This crate provides the two coordination disciplines that make
//! one shareable:
//!
//! - [`SerialQueue`]: one connection, one dedicated worker, strict FIFO.
//!   Every submission runs to completion before the next; the right tool for
//!   write-heavy paths and cross-operation ordering.
//! - [`ConnectionPool`]: a bounded set of connections handed out and
//!   reclaimed; concurrent on distinct connections, suited to read-mostly
//!   workloads.
//!
//! Underneath both sits [`Connection`]: statement caching, typed parameter
//! binding, forward-only [`ResultCursor`]s, transactions and nested
//! savepoints, and bounded busy retry under lock contention.
//!
//! ```no_run
//! use sqlite_dispatch::{SerialQueue, params};
//!
//! # async fn demo() -> sqlite_dispatch::Result<()> {
//! let queue = SerialQueue::open("app.db")?;
//! queue
//!     .submit(|conn| {
//!         conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)")?;
//!         conn.execute_update("INSERT INTO t (name) VALUES (?)", params!["a"])?;
//!         Ok(conn.last_insert_rowid())
//!     })
//!     .await?;
//! queue.close().await
//! # }
//! ```

pub mod connection;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod pool;
pub mod queue;
pub mod transaction;
pub mod value;

pub use connection::{Connection, DEFAULT_BUSY_DURATION};
pub use cursor::ResultCursor;
pub use engine::{DatabaseLocation, OpenFlags};
pub use error::{DispatchError, Result};
pub use pool::{ConnectionPool, PoolBuilder, PoolDelegate, PooledConnection};
pub use queue::SerialQueue;
pub use transaction::{TransactionKind, TransactionScope};
pub use value::SqlValue;
