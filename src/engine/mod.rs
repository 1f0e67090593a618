//! Narrow contract to the embedded SQL engine.
//!
//! All FFI interaction lives in the `ffi` submodule, which is the only file in
//! the crate permitted to contain `unsafe` code. Everything above this module
//! works with [`RawHandle`] and [`RawStatement`] and never sees a C type.

mod ffi;

use std::path::PathBuf;

pub(crate) use ffi::{RawHandle, RawStatement};

/// Where a database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    /// A file on disk, created if missing (subject to [`OpenFlags`]).
    File(PathBuf),
    /// A private temporary file, deleted when the connection closes.
    Temporary,
    /// A pure in-memory database.
    InMemory,
}

impl DatabaseLocation {
    /// The engine-level path string: `""` selects a private temporary file
    /// and `":memory:"` an in-memory database.
    #[must_use]
    pub fn as_engine_path(&self) -> String {
        match self {
            DatabaseLocation::File(path) => path.to_string_lossy().into_owned(),
            DatabaseLocation::Temporary => String::new(),
            DatabaseLocation::InMemory => ":memory:".to_owned(),
        }
    }
}

impl From<&str> for DatabaseLocation {
    fn from(path: &str) -> Self {
        match path {
            "" => DatabaseLocation::Temporary,
            ":memory:" => DatabaseLocation::InMemory,
            other => DatabaseLocation::File(PathBuf::from(other)),
        }
    }
}

impl From<PathBuf> for DatabaseLocation {
    fn from(path: PathBuf) -> Self {
        DatabaseLocation::File(path)
    }
}

/// Read/write/create mode for opening a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlags {
    ReadOnly,
    ReadWrite,
    ReadWriteCreate,
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags::ReadWriteCreate
    }
}

/// Result of a single step of a compiled statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A result row is available for column reads.
    Row,
    /// The statement has run to completion.
    Done,
}

/// Column datatype of the current row, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
    Null,
}

/// Error reported by the engine, prior to classification by the access layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub code: i32,
    pub message: String,
}

impl EngineError {
    pub(crate) fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// True when the engine reports lock contention, the one retryable class.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        let primary = self.code & 0xff;
        primary == ffi::CODE_BUSY || primary == ffi::CODE_LOCKED
    }

    /// True for the engine's generic error code, which `exec` reports when
    /// SQL fails to compile (as opposed to a constraint or I/O code from a
    /// statement that ran).
    pub(crate) fn is_compile_failure(&self) -> bool {
        self.code & 0xff == ffi::CODE_ERROR
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine error {}: {}", self.code, self.message)
    }
}

pub(crate) type EngineResult<T> = std::result::Result<T, EngineError>;
