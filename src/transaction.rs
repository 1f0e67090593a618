//! Begin/commit/rollback bookkeeping layered on a connection.

use tracing::warn;

use crate::connection::Connection;
use crate::error::{DispatchError, Result};

/// How a top-level transaction acquires its locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// `BEGIN EXCLUSIVE`: takes the write lock up front.
    Exclusive,
    /// `BEGIN DEFERRED`: locks lazily on first read/write.
    Deferred,
}

enum ScopeKind {
    Transaction,
    Savepoint(String),
}

/// A single transaction or savepoint, completed exactly once.
///
/// Begins on construction. Completing twice is [`DispatchError::Misuse`];
/// dropping an incomplete scope rolls back best-effort. Top-level transaction
/// scopes do not nest (begin fails inside an open transaction); savepoint
/// scopes nest freely.
pub struct TransactionScope<'conn> {
    conn: &'conn Connection,
    kind: ScopeKind,
    complete: bool,
}

impl<'conn> TransactionScope<'conn> {
    /// Begin a top-level transaction.
    pub fn begin(conn: &'conn Connection, kind: TransactionKind) -> Result<Self> {
        match kind {
            TransactionKind::Exclusive => conn.begin_transaction()?,
            TransactionKind::Deferred => conn.begin_deferred_transaction()?,
        }
        Ok(Self {
            conn,
            kind: ScopeKind::Transaction,
            complete: false,
        })
    }

    /// Begin a named savepoint.
    pub fn savepoint(conn: &'conn Connection, name: &str) -> Result<Self> {
        conn.start_savepoint(name)?;
        Ok(Self {
            conn,
            kind: ScopeKind::Savepoint(name.to_owned()),
            complete: false,
        })
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Commit the transaction, or release the savepoint.
    pub fn commit(&mut self) -> Result<()> {
        self.finish(false)
    }

    /// Roll back the transaction, or roll back to and release the savepoint.
    pub fn rollback(&mut self) -> Result<()> {
        self.finish(true)
    }

    fn finish(&mut self, rollback: bool) -> Result<()> {
        if self.complete {
            return Err(DispatchError::Misuse(
                "transaction scope already completed".into(),
            ));
        }
        let outcome = match (&self.kind, rollback) {
            (ScopeKind::Transaction, false) => self.conn.commit(),
            (ScopeKind::Transaction, true) => self.conn.rollback(),
            (ScopeKind::Savepoint(name), false) => self.conn.release_savepoint(name),
            (ScopeKind::Savepoint(name), true) => {
                self.conn.rollback_to_savepoint(name)?;
                self.conn.release_savepoint(name)
            }
        };
        // The scope is spent either way; a failed commit cannot be retried.
        self.complete = true;
        outcome
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.complete
            && let Err(err) = self.finish(true)
        {
            warn!(%err, "rollback of an abandoned transaction scope failed");
        }
    }
}
