//! Explicit conversions from JSON attribute values to Rust types

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A type that can be read out of an entity attribute
///
/// Conversions are strict: an integer attribute is not silently read as a
/// boolean, and a string is only a timestamp if it parses as RFC 3339.
pub trait FromAttribute: Sized {
    /// Human readable name used in [`crate::AttributeError::TypeMismatch`]
    const TYPE_NAME: &'static str;

    fn from_attribute(value: &Value) -> Option<Self>;
}

impl FromAttribute for bool {
    const TYPE_NAME: &'static str = "boolean";

    fn from_attribute(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromAttribute for i64 {
    const TYPE_NAME: &'static str = "integer";

    fn from_attribute(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

impl FromAttribute for u64 {
    const TYPE_NAME: &'static str = "unsigned integer";

    fn from_attribute(value: &Value) -> Option<Self> {
        value.as_u64()
    }
}

impl FromAttribute for f64 {
    const TYPE_NAME: &'static str = "number";

    fn from_attribute(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

impl FromAttribute for String {
    const TYPE_NAME: &'static str = "string";

    fn from_attribute(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromAttribute for DateTime<Utc> {
    const TYPE_NAME: &'static str = "timestamp";

    fn from_attribute(value: &Value) -> Option<Self> {
        let text = value.as_str()?;
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl FromAttribute for Vec<String> {
    const TYPE_NAME: &'static str = "list of strings";

    fn from_attribute(value: &Value) -> Option<Self> {
        value
            .as_array()?
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect()
    }
}

impl FromAttribute for Value {
    const TYPE_NAME: &'static str = "value";

    fn from_attribute(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}
