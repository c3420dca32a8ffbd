//! Built-in task handlers for scenarios and demos.

use serde_json::{json, Value};
use std::sync::Arc;
use tessera_mesh::{HandlerError, TaskHandler};

/// Names accepted by [`builtin`]
pub const BUILTIN_HANDLERS: &[&str] = &["echo", "sum"];

/// Returns its input unchanged
pub fn echo(data: &Value) -> Result<Value, HandlerError> {
    Ok(data.clone())
}

/// Adds up an array of numbers, or the `values` array of an object
///
/// Integers are summed exactly; any non-integer switches to floating point.
///
/// # Errors
///
/// Returns error if the input holds anything but numbers, or an integer
/// total overflows `i64`
pub fn sum(data: &Value) -> Result<Value, HandlerError> {
    let values = match data {
        Value::Array(values) => values,
        Value::Object(map) => match map.get("values") {
            Some(Value::Array(values)) => values,
            _ => return Err(HandlerError::new("expected a \"values\" array")),
        },
        _ => return Err(HandlerError::new("expected an array of numbers")),
    };

    let mut numbers = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::Number(n) => numbers.push(n),
            other => return Err(HandlerError::new(format!("not a number: {other}"))),
        }
    }

    if numbers.iter().all(|n| n.is_i64()) {
        let mut total: i64 = 0;
        for n in numbers.iter().filter_map(|n| n.as_i64()) {
            total = total
                .checked_add(n)
                .ok_or_else(|| HandlerError::new("integer overflow"))?;
        }
        Ok(json!(total))
    } else {
        let total: f64 = numbers.iter().filter_map(|n| n.as_f64()).sum();
        Ok(json!(total))
    }
}

/// Look up a built-in handler by name
#[must_use]
pub fn builtin(name: &str) -> Option<Arc<dyn TaskHandler>> {
    match name {
        "echo" => Some(Arc::new(echo)),
        "sum" => Some(Arc::new(sum)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_echo() {
        assert_eq!(echo(&json!({"a": 1})).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_sum_integers_and_floats() {
        assert_eq!(sum(&json!([1, 2, 3])).unwrap(), json!(6));
        assert_eq!(sum(&json!({"values": [1.5, 2]})).unwrap(), json!(3.5));
        assert_eq!(sum(&json!([])).unwrap(), json!(0));
    }

    #[test]
    fn test_sum_keeps_large_integers_exact() {
        let big = 9_007_199_254_740_993i64;
        assert_eq!(sum(&json!([big])).unwrap(), json!(big));
        assert_eq!(sum(&json!([big, 1])).unwrap(), json!(big + 1));
    }

    #[test]
    fn test_sum_reports_overflow() {
        let err = sum(&json!([i64::MAX, 1])).unwrap_err();
        assert_eq!(err.message(), "integer overflow");
        assert_eq!(sum(&json!([i64::MAX, -1])).unwrap(), json!(i64::MAX - 1));
    }

    #[test]
    fn test_sum_rejects_non_numbers() {
        let err = sum(&json!([1, "two"])).unwrap_err();
        assert!(err.message().contains("not a number"));
        assert!(sum(&json!("seven")).is_err());
    }

    #[test]
    fn test_builtin_lookup() {
        for name in BUILTIN_HANDLERS {
            assert!(builtin(name).is_some());
        }
        assert!(builtin("nope").is_none());
        let handler = builtin("sum").unwrap();
        assert_eq!(handler.handle(&json!([2, 2])).unwrap(), json!(4));
    }

    proptest! {
        #[test]
        fn prop_sum_matches_integer_total(values in proptest::collection::vec(-1_000_000i64..1_000_000, 0..50)) {
            let expected: i64 = values.iter().sum();
            prop_assert_eq!(sum(&json!(values)).unwrap(), json!(expected));
        }
    }
}
