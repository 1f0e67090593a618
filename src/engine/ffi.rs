//! Raw bindings to the SQLite C API via `libsqlite3-sys`.
//!
//! The only module in the crate containing `unsafe` code. [`RawHandle`] and
//! [`RawStatement`] own the C pointers and expose a safe, code-and-message
//! error surface; pointer validity is guaranteed by construction (a handle is
//! never exposed closed, a statement never finalized while reachable).

#![allow(unsafe_code)]

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;

use libsqlite3_sys as sys;

use super::{ColumnType, EngineError, EngineResult, OpenFlags, StepOutcome};

// Present in the bundled SQLite library but missing from the pregenerated
// `libsqlite3-sys` bindings, so declare it here.
unsafe extern "C" {
    fn sqlite3_close_v2(db: *mut sys::sqlite3) -> c_int;
}

pub(crate) const CODE_BUSY: i32 = sys::SQLITE_BUSY;
pub(crate) const CODE_LOCKED: i32 = sys::SQLITE_LOCKED;
pub(crate) const CODE_ERROR: i32 = sys::SQLITE_ERROR;

/// Owned handle to one open database.
///
/// `Send` but not `Sync`: the handle is opened in serialized threading mode
/// and may migrate between threads (worker handoff, pool checkout) but must
/// never be used from two threads at once. The coordinators enforce that.
pub(crate) struct RawHandle {
    db: *mut sys::sqlite3,
}

unsafe impl Send for RawHandle {}

impl RawHandle {
    pub(crate) fn open(path: &str, flags: OpenFlags) -> EngineResult<Self> {
        let c_path = CString::new(path)
            .map_err(|_| EngineError::new(sys::SQLITE_MISUSE, "path contains a NUL byte"))?;
        let c_flags = match flags {
            OpenFlags::ReadOnly => sys::SQLITE_OPEN_READONLY,
            OpenFlags::ReadWrite => sys::SQLITE_OPEN_READWRITE,
            OpenFlags::ReadWriteCreate => sys::SQLITE_OPEN_READWRITE | sys::SQLITE_OPEN_CREATE,
        } | sys::SQLITE_OPEN_URI;

        let mut db: *mut sys::sqlite3 = ptr::null_mut();
        let rc = unsafe { sys::sqlite3_open_v2(c_path.as_ptr(), &mut db, c_flags, ptr::null()) };
        if rc == sys::SQLITE_OK {
            Ok(Self { db })
        } else if db.is_null() {
            Err(EngineError::new(rc, "unable to allocate database handle"))
        } else {
            // Open failures still hand back a handle carrying the error.
            let message = unsafe { errmsg(db) };
            unsafe {
                sys::sqlite3_close(db);
            }
            Err(EngineError::new(rc, message))
        }
    }

    pub(crate) fn last_error(&self) -> EngineError {
        let code = unsafe { sys::sqlite3_extended_errcode(self.db) };
        EngineError::new(code, unsafe { errmsg(self.db) })
    }

    /// Run one or more semicolon-separated statements without result rows.
    pub(crate) fn exec(&self, sql: &str) -> EngineResult<()> {
        let c_sql = CString::new(sql)
            .map_err(|_| EngineError::new(sys::SQLITE_MISUSE, "sql contains a NUL byte"))?;
        let mut err: *mut c_char = ptr::null_mut();
        let rc = unsafe {
            sys::sqlite3_exec(self.db, c_sql.as_ptr(), None, ptr::null_mut(), &mut err)
        };
        if rc == sys::SQLITE_OK {
            Ok(())
        } else {
            let message = if err.is_null() {
                unsafe { errmsg(self.db) }
            } else {
                let msg = unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned();
                unsafe { sys::sqlite3_free(err.cast::<c_void>()) };
                msg
            };
            Err(EngineError::new(rc, message))
        }
    }

    pub(crate) fn prepare(&self, sql: &str) -> EngineResult<RawStatement> {
        let c_sql = CString::new(sql)
            .map_err(|_| EngineError::new(sys::SQLITE_MISUSE, "sql contains a NUL byte"))?;
        let mut stmt: *mut sys::sqlite3_stmt = ptr::null_mut();
        let rc = unsafe {
            sys::sqlite3_prepare_v2(self.db, c_sql.as_ptr(), -1, &mut stmt, ptr::null_mut())
        };
        if rc == sys::SQLITE_OK {
            if stmt.is_null() {
                // Whitespace or a bare comment compiles to no statement.
                Err(EngineError::new(
                    sys::SQLITE_MISUSE,
                    "sql compiled to an empty statement",
                ))
            } else {
                Ok(RawStatement { stmt, db: self.db })
            }
        } else {
            Err(self.last_error())
        }
    }

    pub(crate) fn changes(&self) -> u64 {
        let n = unsafe { sys::sqlite3_changes(self.db) };
        u64::try_from(n).unwrap_or(0)
    }

    pub(crate) fn last_insert_rowid(&self) -> i64 {
        unsafe { sys::sqlite3_last_insert_rowid(self.db) }
    }

    /// Close the handle. When the engine reports outstanding statements the
    /// error is surfaced, but the handle is still released via the deferred
    /// close so the caller never leaks it.
    pub(crate) fn close(mut self) -> EngineResult<()> {
        let rc = unsafe { sys::sqlite3_close(self.db) };
        if rc == sys::SQLITE_OK {
            self.db = ptr::null_mut();
            Ok(())
        } else {
            let err = self.last_error();
            unsafe {
                sqlite3_close_v2(self.db);
            }
            self.db = ptr::null_mut();
            Err(err)
        }
    }
}

impl Drop for RawHandle {
    fn drop(&mut self) {
        if !self.db.is_null() {
            unsafe {
                sqlite3_close_v2(self.db);
            }
        }
    }
}

/// Owned compiled statement, finalized on drop.
pub(crate) struct RawStatement {
    stmt: *mut sys::sqlite3_stmt,
    db: *mut sys::sqlite3,
}

unsafe impl Send for RawStatement {}

impl RawStatement {
    fn db_error(&self) -> EngineError {
        let code = unsafe { sys::sqlite3_extended_errcode(self.db) };
        EngineError::new(code, unsafe { errmsg(self.db) })
    }

    fn check(&self, rc: c_int) -> EngineResult<()> {
        if rc == sys::SQLITE_OK {
            Ok(())
        } else {
            Err(self.db_error())
        }
    }

    pub(crate) fn parameter_count(&self) -> usize {
        let n = unsafe { sys::sqlite3_bind_parameter_count(self.stmt) };
        usize::try_from(n).unwrap_or(0)
    }

    /// Placeholder name (including its `:`/`@`/`$` prefix) for a 1-based
    /// index, `None` for anonymous `?` placeholders.
    pub(crate) fn parameter_name(&self, index: usize) -> Option<String> {
        let idx = c_int::try_from(index).ok()?;
        let ptr = unsafe { sys::sqlite3_bind_parameter_name(self.stmt, idx) };
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
        }
    }

    pub(crate) fn bind_i64(&mut self, index: usize, value: i64) -> EngineResult<()> {
        let idx = bind_index(index)?;
        let rc = unsafe { sys::sqlite3_bind_int64(self.stmt, idx, value) };
        self.check(rc)
    }

    pub(crate) fn bind_f64(&mut self, index: usize, value: f64) -> EngineResult<()> {
        let idx = bind_index(index)?;
        let rc = unsafe { sys::sqlite3_bind_double(self.stmt, idx, value) };
        self.check(rc)
    }

    pub(crate) fn bind_text(&mut self, index: usize, value: &str) -> EngineResult<()> {
        let idx = bind_index(index)?;
        let len = c_int::try_from(value.len())
            .map_err(|_| EngineError::new(sys::SQLITE_TOOBIG, "text too large to bind"))?;
        let rc = unsafe {
            sys::sqlite3_bind_text(
                self.stmt,
                idx,
                value.as_ptr().cast::<c_char>(),
                len,
                sys::SQLITE_TRANSIENT(),
            )
        };
        self.check(rc)
    }

    pub(crate) fn bind_blob(&mut self, index: usize, value: &[u8]) -> EngineResult<()> {
        let idx = bind_index(index)?;
        // A null pointer with length zero binds NULL, not an empty blob.
        if value.is_empty() {
            let rc = unsafe { sys::sqlite3_bind_zeroblob(self.stmt, idx, 0) };
            return self.check(rc);
        }
        let len = c_int::try_from(value.len())
            .map_err(|_| EngineError::new(sys::SQLITE_TOOBIG, "blob too large to bind"))?;
        let rc = unsafe {
            sys::sqlite3_bind_blob(
                self.stmt,
                idx,
                value.as_ptr().cast::<c_void>(),
                len,
                sys::SQLITE_TRANSIENT(),
            )
        };
        self.check(rc)
    }

    pub(crate) fn bind_null(&mut self, index: usize) -> EngineResult<()> {
        let idx = bind_index(index)?;
        let rc = unsafe { sys::sqlite3_bind_null(self.stmt, idx) };
        self.check(rc)
    }

    pub(crate) fn step(&mut self) -> EngineResult<StepOutcome> {
        let rc = unsafe { sys::sqlite3_step(self.stmt) };
        match rc {
            sys::SQLITE_ROW => Ok(StepOutcome::Row),
            sys::SQLITE_DONE => Ok(StepOutcome::Done),
            _ => Err(self.db_error()),
        }
    }

    pub(crate) fn reset(&mut self) -> EngineResult<()> {
        let rc = unsafe { sys::sqlite3_reset(self.stmt) };
        self.check(rc)
    }

    pub(crate) fn clear_bindings(&mut self) {
        unsafe {
            sys::sqlite3_clear_bindings(self.stmt);
        }
    }

    pub(crate) fn column_count(&self) -> usize {
        let n = unsafe { sys::sqlite3_column_count(self.stmt) };
        usize::try_from(n).unwrap_or(0)
    }

    pub(crate) fn column_name(&self, index: usize) -> String {
        let Ok(idx) = c_int::try_from(index) else {
            return String::new();
        };
        let ptr = unsafe { sys::sqlite3_column_name(self.stmt, idx) };
        if ptr.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
        }
    }

    pub(crate) fn column_type(&self, index: usize) -> ColumnType {
        let Ok(idx) = c_int::try_from(index) else {
            return ColumnType::Null;
        };
        match unsafe { sys::sqlite3_column_type(self.stmt, idx) } {
            sys::SQLITE_INTEGER => ColumnType::Integer,
            sys::SQLITE_FLOAT => ColumnType::Real,
            sys::SQLITE_TEXT => ColumnType::Text,
            sys::SQLITE_BLOB => ColumnType::Blob,
            _ => ColumnType::Null,
        }
    }

    pub(crate) fn column_i64(&self, index: usize) -> i64 {
        let Ok(idx) = c_int::try_from(index) else {
            return 0;
        };
        unsafe { sys::sqlite3_column_int64(self.stmt, idx) }
    }

    pub(crate) fn column_f64(&self, index: usize) -> f64 {
        let Ok(idx) = c_int::try_from(index) else {
            return 0.0;
        };
        unsafe { sys::sqlite3_column_double(self.stmt, idx) }
    }

    pub(crate) fn column_text(&self, index: usize) -> String {
        let Ok(idx) = c_int::try_from(index) else {
            return String::new();
        };
        let ptr = unsafe { sys::sqlite3_column_text(self.stmt, idx) };
        if ptr.is_null() {
            return String::new();
        }
        let len = unsafe { sys::sqlite3_column_bytes(self.stmt, idx) };
        let len = usize::try_from(len).unwrap_or(0);
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
        String::from_utf8_lossy(bytes).into_owned()
    }

    pub(crate) fn column_blob(&self, index: usize) -> Vec<u8> {
        let Ok(idx) = c_int::try_from(index) else {
            return Vec::new();
        };
        let ptr = unsafe { sys::sqlite3_column_blob(self.stmt, idx) };
        if ptr.is_null() {
            return Vec::new();
        }
        let len = unsafe { sys::sqlite3_column_bytes(self.stmt, idx) };
        let len = usize::try_from(len).unwrap_or(0);
        unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) }.to_vec()
    }
}

impl Drop for RawStatement {
    fn drop(&mut self) {
        unsafe {
            sys::sqlite3_finalize(self.stmt);
        }
    }
}

fn bind_index(index: usize) -> EngineResult<c_int> {
    c_int::try_from(index)
        .map_err(|_| EngineError::new(sys::SQLITE_RANGE, "bind index out of range"))
}

unsafe fn errmsg(db: *mut sys::sqlite3) -> String {
    let ptr = unsafe { sys::sqlite3_errmsg(db) };
    if ptr.is_null() {
        "unknown engine error".to_owned()
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }
}
