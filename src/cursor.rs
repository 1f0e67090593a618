//! Forward-only iteration over query results.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::connection::{Connection, StatementHandle};
use crate::engine::{ColumnType, StepOutcome};
use crate::error::{DispatchError, Result};
use crate::value::SqlValue;

/// A forward-only cursor over the rows of one executed query.
///
/// Borrows its [`Connection`], so a cursor can neither outlive the connection
/// nor keep it alive. Column accessors are valid only while the cursor is on
/// a row, i.e. after an [`advance`](Self::advance) that returned `true` and
/// before the next one; anything else is reported as
/// [`DispatchError::Misuse`].
///
/// Exhausting the cursor returns its statement to the connection's cache
/// automatically; [`close`](Self::close) does the same early and is
/// idempotent (`Drop` closes too).
pub struct ResultCursor<'conn> {
    conn: &'conn Connection,
    sql: String,
    stmt: Option<StatementHandle>,
    position: Position,
    column_lookup: Option<HashMap<String, usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeFirst,
    OnRow,
    Exhausted,
    Closed,
}

impl<'conn> ResultCursor<'conn> {
    pub(crate) fn new(conn: &'conn Connection, sql: String, stmt: StatementHandle) -> Self {
        Self {
            conn,
            sql,
            stmt: Some(stmt),
            position: Position::BeforeFirst,
            column_lookup: None,
        }
    }

    /// Step to the next row. Returns `false` once the result set is exhausted
    /// (which also auto-closes the cursor); a failing step surfaces as
    /// [`DispatchError::StepFailure`], distinguishable from plain exhaustion.
    pub fn advance(&mut self) -> Result<bool> {
        match self.position {
            Position::Closed => {
                return Err(DispatchError::Misuse("cursor is closed".into()));
            }
            Position::Exhausted => return Ok(false),
            Position::BeforeFirst | Position::OnRow => {}
        }
        if !self.conn.is_open() {
            self.discard();
            return Err(DispatchError::Misuse(
                "cursor used after its connection closed".into(),
            ));
        }
        let stmt = self
            .stmt
            .as_mut()
            .ok_or_else(|| DispatchError::Misuse("cursor is closed".into()))?;
        match self.conn.retry_busy(|| stmt.stmt.step()) {
            Ok(StepOutcome::Row) => {
                self.position = Position::OnRow;
                Ok(true)
            }
            Ok(StepOutcome::Done) => {
                self.position = Position::Exhausted;
                self.release();
                Ok(false)
            }
            Err(err) => {
                self.position = Position::Exhausted;
                self.release();
                Err(self.conn.record(err))
            }
        }
    }

    /// Index of a column by (case-insensitive) name, memoized on first use.
    pub fn column_index(&mut self, name: &str) -> Result<usize> {
        if self.column_lookup.is_none() {
            let stmt = self.current()?;
            let mut lookup = HashMap::with_capacity(stmt.stmt.column_count());
            for i in 0..stmt.stmt.column_count() {
                lookup.entry(stmt.stmt.column_name(i).to_lowercase()).or_insert(i);
            }
            self.column_lookup = Some(lookup);
        }
        self.column_lookup
            .as_ref()
            .and_then(|lookup| lookup.get(&name.to_lowercase()).copied())
            .ok_or_else(|| DispatchError::Misuse(format!("no such column '{name}'")))
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.stmt.as_ref().map_or(0, |s| s.stmt.column_count())
    }

    /// The current row's value in a column, as a tagged union.
    pub fn value_at(&self, index: usize) -> Result<SqlValue> {
        let stmt = self.on_row(index)?;
        Ok(match stmt.stmt.column_type(index) {
            ColumnType::Integer => SqlValue::Integer(stmt.stmt.column_i64(index)),
            ColumnType::Real => SqlValue::Real(stmt.stmt.column_f64(index)),
            ColumnType::Text => SqlValue::Text(stmt.stmt.column_text(index)),
            ColumnType::Blob => SqlValue::Blob(stmt.stmt.column_blob(index)),
            ColumnType::Null => SqlValue::Null,
        })
    }

    pub fn value_named(&mut self, name: &str) -> Result<SqlValue> {
        let index = self.column_index(name)?;
        self.value_at(index)
    }

    /// Integer read with the engine's usual coercions; NULL reads as 0.
    pub fn i64_at(&self, index: usize) -> Result<i64> {
        Ok(self.on_row(index)?.stmt.column_i64(index))
    }

    pub fn i64_named(&mut self, name: &str) -> Result<i64> {
        let index = self.column_index(name)?;
        self.i64_at(index)
    }

    pub fn f64_at(&self, index: usize) -> Result<f64> {
        Ok(self.on_row(index)?.stmt.column_f64(index))
    }

    pub fn f64_named(&mut self, name: &str) -> Result<f64> {
        let index = self.column_index(name)?;
        self.f64_at(index)
    }

    /// Text read; `None` for NULL.
    pub fn string_at(&self, index: usize) -> Result<Option<String>> {
        let stmt = self.on_row(index)?;
        Ok(match stmt.stmt.column_type(index) {
            ColumnType::Null => None,
            _ => Some(stmt.stmt.column_text(index)),
        })
    }

    pub fn string_named(&mut self, name: &str) -> Result<Option<String>> {
        let index = self.column_index(name)?;
        self.string_at(index)
    }

    /// Blob read, byte-exact; `None` for NULL.
    pub fn blob_at(&self, index: usize) -> Result<Option<Vec<u8>>> {
        let stmt = self.on_row(index)?;
        Ok(match stmt.stmt.column_type(index) {
            ColumnType::Null => None,
            _ => Some(stmt.stmt.column_blob(index)),
        })
    }

    pub fn blob_named(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let index = self.column_index(name)?;
        self.blob_at(index)
    }

    /// Timestamp read: numeric columns are epoch seconds; text columns are
    /// parsed with the connection's configured timestamp format.
    pub fn timestamp_at(&self, index: usize) -> Result<Option<DateTime<Utc>>> {
        let stmt = self.on_row(index)?;
        match stmt.stmt.column_type(index) {
            ColumnType::Null => Ok(None),
            ColumnType::Integer => Ok(Utc.timestamp_opt(stmt.stmt.column_i64(index), 0).single()),
            ColumnType::Real => {
                let seconds = stmt.stmt.column_f64(index);
                #[allow(clippy::cast_possible_truncation)]
                let micros = (seconds * 1_000_000.0) as i64;
                Ok(Utc.timestamp_micros(micros).single())
            }
            ColumnType::Text => {
                let text = stmt.stmt.column_text(index);
                let Some(format) = self.conn.timestamp_format() else {
                    return Err(DispatchError::Misuse(
                        "timestamp column holds text but no timestamp format is configured"
                            .into(),
                    ));
                };
                chrono::NaiveDateTime::parse_from_str(&text, &format)
                    .map(|naive| Some(naive.and_utc()))
                    .map_err(|err| {
                        DispatchError::Misuse(format!(
                            "timestamp column '{text}' does not match format '{format}': {err}"
                        ))
                    })
            }
            ColumnType::Blob => Err(DispatchError::Misuse(
                "timestamp column holds a blob".into(),
            )),
        }
    }

    pub fn timestamp_named(&mut self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let index = self.column_index(name)?;
        self.timestamp_at(index)
    }

    /// Close the cursor, returning the statement for reuse. Idempotent, and
    /// safe after the owning connection is already closed.
    pub fn close(&mut self) {
        if self.position != Position::Closed {
            self.position = Position::Closed;
            self.release();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.position, Position::Closed)
    }

    fn on_row(&self, index: usize) -> Result<&StatementHandle> {
        let stmt = self.current()?;
        if index >= stmt.stmt.column_count() {
            return Err(DispatchError::Misuse(format!(
                "column index {index} out of range ({} columns)",
                stmt.stmt.column_count()
            )));
        }
        Ok(stmt)
    }

    fn current(&self) -> Result<&StatementHandle> {
        match self.position {
            Position::OnRow => self.stmt.as_ref().ok_or_else(|| {
                DispatchError::Misuse("cursor statement already released".into())
            }),
            Position::BeforeFirst => Err(DispatchError::Misuse(
                "cursor accessed before the first advance".into(),
            )),
            Position::Exhausted => Err(DispatchError::Misuse(
                "cursor accessed after exhaustion".into(),
            )),
            Position::Closed => Err(DispatchError::Misuse("cursor is closed".into())),
        }
    }

    fn release(&mut self) {
        if let Some(handle) = self.stmt.take() {
            if self.conn.is_open() {
                self.conn.checkin_statement(&self.sql, handle);
            }
            // A closed connection just lets the statement finalize on drop.
        }
    }

    fn discard(&mut self) {
        self.position = Position::Closed;
        self.stmt = None;
    }
}

impl Drop for ResultCursor<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
