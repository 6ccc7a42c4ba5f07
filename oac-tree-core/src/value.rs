use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Dynamic, self-describing value moving through workspaces and attributes.
///
/// The engine treats the payload as opaque JSON; everything it needs (field
/// navigation, typed parsing, equality) lives in this module.
pub type AnyValue = serde_json::Value;

/// The engine's view of a value type, used by attribute definitions and the
/// `Local` variable's `type` attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Integer,
    UnsignedInteger,
    Float,
    String,
    /// No type constraint: any well-formed value is accepted.
    Any,
}

const TRUE_REPRESENTATIONS: [&str; 3] = ["true", "yes", "on"];

impl ValueKind {
    /// Resolve a scalar type name (`bool`, `int8`..`int64`, `uint8`..`uint64`,
    /// `float32`, `float64`, `string`) to a kind.
    pub fn from_type_name(name: &str) -> Option<ValueKind> {
        match name {
            "bool" => Some(ValueKind::Bool),
            "int8" | "int16" | "int32" | "int64" => Some(ValueKind::Integer),
            "uint8" | "uint16" | "uint32" | "uint64" => Some(ValueKind::UnsignedInteger),
            "float32" | "float64" => Some(ValueKind::Float),
            "string" => Some(ValueKind::String),
            "any" => Some(ValueKind::Any),
            _ => None,
        }
    }

    /// Parse an attribute string into a value of this kind.
    ///
    /// Booleans accept `true`/`yes`/`on` case-insensitively (anything else is
    /// `false`); numeric kinds parse as JSON; strings are taken verbatim.
    pub fn parse_literal(&self, repr: &str) -> Result<AnyValue, EngineError> {
        match self {
            ValueKind::Bool => {
                let lowered = repr.to_ascii_lowercase();
                Ok(AnyValue::Bool(TRUE_REPRESENTATIONS.contains(&lowered.as_str())))
            }
            ValueKind::String => Ok(AnyValue::String(repr.to_string())),
            ValueKind::Any => match serde_json::from_str(repr) {
                Ok(value) => Ok(value),
                Err(_) => Ok(AnyValue::String(repr.to_string())),
            },
            _ => {
                let parsed: AnyValue = serde_json::from_str(repr).map_err(|e| {
                    EngineError::Parse(format!("could not parse attribute value '{repr}': {e}"))
                })?;
                if self.matches(&parsed) {
                    Ok(parsed)
                } else {
                    Err(EngineError::Parse(format!(
                        "attribute value '{repr}' is not of kind {self:?}"
                    )))
                }
            }
        }
    }

    /// Check a value against this kind. `Any` matches everything; `Float`
    /// accepts any JSON number.
    pub fn matches(&self, value: &AnyValue) -> bool {
        match self {
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Integer => value.is_i64(),
            ValueKind::UnsignedInteger => value.is_u64(),
            ValueKind::Float => value.is_number(),
            ValueKind::String => value.is_string(),
            ValueKind::Any => true,
        }
    }

    /// Kind of an existing value, used when `Local` variables infer their type
    /// from the `value` attribute.
    pub fn of(value: &AnyValue) -> ValueKind {
        match value {
            AnyValue::Bool(_) => ValueKind::Bool,
            AnyValue::Number(n) if n.is_u64() => ValueKind::UnsignedInteger,
            AnyValue::Number(n) if n.is_i64() => ValueKind::Integer,
            AnyValue::Number(_) => ValueKind::Float,
            AnyValue::String(_) => ValueKind::String,
            _ => ValueKind::Any,
        }
    }
}

/// Split a workspace address of the form `name[.field.path]` into the variable
/// name and the (possibly empty) field path.
pub fn split_address(address: &str) -> (&str, &str) {
    match address.split_once('.') {
        Some((name, path)) => (name, path),
        None => (address, ""),
    }
}

/// Navigate a dot-separated field path. Numeric segments index into arrays.
/// An empty path addresses the whole value.
pub fn lookup<'a>(value: &'a AnyValue, path: &str) -> Option<&'a AnyValue> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            AnyValue::Object(map) => map.get(segment)?,
            AnyValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Assign `new_value` at `path` inside `value`. Fails when an intermediate
/// segment does not resolve; it never creates missing fields.
pub fn assign(value: &mut AnyValue, path: &str, new_value: AnyValue) -> bool {
    if path.is_empty() {
        *value = new_value;
        return true;
    }
    let mut current = value;
    for segment in path.split('.') {
        let next = match current {
            AnyValue::Object(map) => map.get_mut(segment),
            AnyValue::Array(items) => match segment.parse::<usize>() {
                Ok(idx) => items.get_mut(idx),
                Err(_) => None,
            },
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return false,
        }
    }
    *current = new_value;
    true
}

/// Add a signed delta to a numeric value, preserving its integer class.
pub fn add_delta(value: &AnyValue, delta: i64) -> Option<AnyValue> {
    match value {
        AnyValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(AnyValue::from(i.checked_add(delta)?))
            } else if let Some(u) = n.as_u64() {
                let result = if delta >= 0 {
                    u.checked_add(delta as u64)?
                } else {
                    u.checked_sub(delta.unsigned_abs())?
                };
                Some(AnyValue::from(result))
            } else {
                n.as_f64().map(|f| AnyValue::from(f + delta as f64))
            }
        }
        _ => None,
    }
}

/// Numeric strictly-greater comparison. `None` when either side is not a
/// number.
pub fn numeric_greater(left: &AnyValue, right: &AnyValue) -> Option<bool> {
    Some(left.as_f64()? > right.as_f64()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bool_literals_accept_true_yes_on() {
        for repr in ["true", "YES", "On"] {
            assert_eq!(ValueKind::Bool.parse_literal(repr).unwrap(), json!(true));
        }
        assert_eq!(ValueKind::Bool.parse_literal("1").unwrap(), json!(false));
    }

    #[test]
    fn scalar_literals_parse_as_json() {
        assert_eq!(ValueKind::Integer.parse_literal("-42").unwrap(), json!(-42));
        assert_eq!(ValueKind::Float.parse_literal("2.5").unwrap(), json!(2.5));
        assert!(ValueKind::UnsignedInteger.parse_literal("-1").is_err());
        assert!(ValueKind::Integer.parse_literal("not a number").is_err());
    }

    #[test]
    fn string_literals_are_verbatim() {
        assert_eq!(
            ValueKind::String.parse_literal("[1,2,3]").unwrap(),
            json!("[1,2,3]")
        );
    }

    #[test]
    fn lookup_navigates_fields_and_indices() {
        let value = json!({"a": {"b": [10, {"c": 7}]}});
        assert_eq!(lookup(&value, "a.b.1.c"), Some(&json!(7)));
        assert_eq!(lookup(&value, ""), Some(&value));
        assert_eq!(lookup(&value, "a.missing"), None);
    }

    #[test]
    fn assign_replaces_nested_fields_only() {
        let mut value = json!({"a": {"b": 1}});
        assert!(assign(&mut value, "a.b", json!(2)));
        assert_eq!(value, json!({"a": {"b": 2}}));
        assert!(!assign(&mut value, "a.c", json!(3)));
    }

    #[test]
    fn add_delta_preserves_integer_class() {
        assert_eq!(add_delta(&json!(1), 1), Some(json!(2)));
        assert_eq!(add_delta(&json!(1.5), -1), Some(json!(0.5)));
        assert_eq!(add_delta(&json!("x"), 1), None);
        // u64 territory stays unsigned
        let big = AnyValue::from(u64::MAX - 1);
        assert_eq!(add_delta(&big, 1), Some(AnyValue::from(u64::MAX)));
    }

    #[test]
    fn split_address_handles_paths() {
        assert_eq!(split_address("var.a.b"), ("var", "a.b"));
        assert_eq!(split_address("var"), ("var", ""));
    }
}
