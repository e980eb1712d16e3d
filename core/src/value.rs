//! Positional bind values for parameterized statements.
//!
//! Arguments travel inside an envelope from the caller to a worker, so they
//! must be owned and `Send`. [`BindValue`] is the driver-neutral form; each
//! connection provider translates it into whatever its driver binds.

use serde::{Deserialize, Serialize};

/// One positional argument of a parameterized statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum BindValue {
    /// SQL `NULL`
    ///
    /// Carries no column type. Drivers that type every parameter (such as
    /// `PostgreSQL` through `querybus-sqlx`) send it as a text `NULL`, so a
    /// non-text column needs an explicit cast in the statement, e.g.
    /// `$2::BIGINT`.
    Null,
    /// Boolean
    Bool(bool),
    /// Signed 64-bit integer
    Int(i64),
    /// Double-precision float
    Float(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl BindValue {
    /// Returns `true` for [`BindValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow the value as text, if it is text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Read the value as an integer, if it is one.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Short type name used in logs and error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for BindValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for BindValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for BindValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for BindValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for BindValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for BindValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for BindValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for BindValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl<T> From<Option<T>> for BindValue
where
    T: Into<Self>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_none_binds_null() {
        let value: BindValue = Option::<String>::None.into();
        assert!(value.is_null());

        let value: BindValue = Some("seller-7").into();
        assert_eq!(value.as_text(), Some("seller-7"));
    }

    #[test]
    fn integer_widening() {
        assert_eq!(BindValue::from(42_i32).as_int(), Some(42));
        assert_eq!(BindValue::from(7_u32).as_int(), Some(7));
        assert_eq!(BindValue::from(-3_i64).type_name(), "int");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn serde_tagged_form() {
        let json = serde_json::to_string(&BindValue::Text("a".into())).unwrap();
        assert_eq!(json, r#"{"type":"text","value":"a"}"#);

        let null = serde_json::to_string(&BindValue::Null).unwrap();
        assert_eq!(null, r#"{"type":"null"}"#);
    }
}
