//! Parameter and column value types.

use chrono::{DateTime, Utc};

/// A value bound to a statement placeholder or read from a result column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Binary blob.
    Blob(Vec<u8>),
    /// SQL NULL.
    Null,
    /// A point in time. Bound as formatted text when the owning connection
    /// has a timestamp format configured, otherwise as an epoch REAL.
    Timestamp(DateTime<Utc>),
    /// Arbitrary structured data, bound as its JSON text serialization.
    Json(serde_json::Value),
}

impl SqlValue {
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Real(v) => Some(*v),
            #[allow(clippy::cast_precision_loss)]
            SqlValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            SqlValue::Blob(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_owned())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Blob(v.to_vec())
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// Build a positional parameter list.
///
/// Usage: `params![1_i64, "text", blob.as_slice()]`
#[macro_export]
macro_rules! params {
    () => {
        &[] as &[$crate::SqlValue]
    };
    ($($val:expr),+ $(,)?) => {
        &[$($crate::SqlValue::from($val)),+][..]
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_impls_cover_the_core_types() {
        assert_eq!(SqlValue::from(7_i64), SqlValue::Integer(7));
        assert_eq!(SqlValue::from(true), SqlValue::Integer(1));
        assert_eq!(SqlValue::from("x"), SqlValue::Text("x".into()));
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert!(SqlValue::from(1.5).as_f64().is_some());
    }

    #[test]
    fn params_macro_builds_a_slice() {
        let p = params![1_i64, "a"];
        assert_eq!(p.len(), 2);
        assert_eq!(p[1].as_str(), Some("a"));
    }
}
