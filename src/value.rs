//! Attribute value types carried by source records.
//!
//! Source systems deliver attributes as untyped scalars. Aurum models them
//! as a tagged variant so similarity scoring and survivorship can
//! pattern-match safely instead of handling `any`.

use serde::{Deserialize, Serialize};

/// Possible values a source-record attribute can hold.
///
/// # Examples
///
/// ```
/// use aurum::AttributeValue;
///
/// let name = AttributeValue::String("John Doe".to_string());
/// let price = AttributeValue::Float(10.0);
///
/// assert!(name.is_string());
/// assert!(price.is_float());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl AttributeValue {
    pub const fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    pub const fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float(_))
    }

    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Null => "null",
        }
    }
}

impl Default for AttributeValue {
    fn default() -> Self {
        Self::Null
    }
}

impl std::fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Null => write!(f, "null"),
        }
    }
}

// Convenient From implementations
impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_string() {
        let val = AttributeValue::String("hello".to_string());
        assert!(val.is_string());
        assert_eq!(val.as_string(), Some("hello"));
        assert_eq!(val.type_name(), "string");
    }

    #[test]
    fn test_value_int_reads_as_float() {
        let val = AttributeValue::Int(42);
        assert!(val.is_int());
        assert_eq!(val.as_int(), Some(42));
        assert_eq!(val.as_float(), Some(42.0));
    }

    #[test]
    fn test_value_null() {
        let val = AttributeValue::Null;
        assert!(val.is_null());
        assert_eq!(val.type_name(), "null");
    }

    #[test]
    fn test_value_display() {
        assert_eq!(format!("{}", AttributeValue::Bool(true)), "true");
        assert_eq!(format!("{}", AttributeValue::Int(42)), "42");
        assert_eq!(format!("{}", AttributeValue::String("hi".into())), "hi");
        assert_eq!(format!("{}", AttributeValue::Null), "null");
    }

    #[test]
    fn test_value_from_conversions() {
        let _: AttributeValue = true.into();
        let _: AttributeValue = 42i32.into();
        let _: AttributeValue = 42i64.into();
        let _: AttributeValue = 3.14f64.into();
        let _: AttributeValue = "hello".into();
        let _: AttributeValue = String::from("hello").into();
    }

    #[test]
    fn test_value_serialization_round_trip() {
        let val = AttributeValue::String("test".into());
        let json = serde_json::to_string(&val).unwrap();
        let deserialized: AttributeValue = serde_json::from_str(&json).unwrap();
        assert_eq!(val, deserialized);
    }

    #[test]
    fn test_value_type_mismatch() {
        let val = AttributeValue::Bool(true);
        assert!(val.as_int().is_none());
        assert!(val.as_float().is_none());
        assert!(val.as_string().is_none());
    }
}
