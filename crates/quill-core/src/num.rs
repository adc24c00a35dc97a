//! Minimal numeric widening helpers
//!
//! The full numeric tower is an external collaborator; this module only
//! implements what the core consumes: widening addition for `sum`, decimal
//! division for `avg`, and mathematical comparison/equality across the
//! widening order Int < Long < Float < Decimal.

use std::cmp::Ordering;
use std::sync::Arc;

use bigdecimal::{BigDecimal, FromPrimitive};

use crate::error::{RunResult, RuntimeError, SourceLoc};
use crate::value::Value;

/// Convert a numeric value to a BigDecimal
pub fn to_decimal(v: &Value) -> Option<BigDecimal> {
    match v {
        Value::Int(i) => Some(BigDecimal::from(*i)),
        Value::Long(i) => Some(BigDecimal::from(*i)),
        Value::Float(f) => BigDecimal::from_f64(*f),
        Value::Decimal(d) => Some(d.as_ref().clone()),
        _ => None,
    }
}

/// Widening addition, used by `sum`
///
/// Int + Int stays Int (wrapping, like the host language's fixed-width
/// arithmetic); any Long operand widens to Long, any Float to Float, any
/// Decimal to Decimal.
pub fn add(a: &Value, b: &Value, loc: &SourceLoc) -> RunResult<Value> {
    match (a, b) {
        (Value::Decimal(_), _) | (_, Value::Decimal(_)) => {
            let (x, y) = both_decimal(a, b, loc)?;
            Ok(Value::decimal(x + y))
        }
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            let x = a.as_float().ok_or_else(|| non_numeric(a, loc))?;
            let y = b.as_float().ok_or_else(|| non_numeric(b, loc))?;
            Ok(Value::Float(x + y))
        }
        (Value::Long(_), _) | (_, Value::Long(_)) => {
            let x = a.as_long().ok_or_else(|| non_numeric(a, loc))?;
            let y = b.as_long().ok_or_else(|| non_numeric(b, loc))?;
            Ok(Value::Long(x.wrapping_add(y)))
        }
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_add(*y))),
        _ => Err(RuntimeError::new(
            format!(
                "Cannot add operands of type {} and {}",
                a.type_name(),
                b.type_name()
            ),
            loc.clone(),
        )),
    }
}

/// Decimal division for `avg`: `sum / count`, normalized
pub fn avg_divide(sum: &Value, count: i64, loc: &SourceLoc) -> RunResult<Value> {
    let total =
        to_decimal(sum).ok_or_else(|| non_numeric(sum, loc))?;
    let divisor = BigDecimal::from(count);
    Ok(Value::decimal((total / divisor).normalized()))
}

/// Natural ordering used by `sort`, `min`, and `max`
///
/// Numbers compare by mathematical value with widening; strings and
/// booleans by their usual order; lists lexicographically by element.
pub fn compare(a: &Value, b: &Value, loc: &SourceLoc) -> RunResult<Ordering> {
    if a.is_number() && b.is_number() {
        return numeric_compare(a, b, loc);
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        (Value::List(x), Value::List(y)) => {
            let (xs, ys) = (x.lock().clone(), y.lock().clone());
            for (ex, ey) in xs.iter().zip(ys.iter()) {
                match compare(ex, ey, loc)? {
                    Ordering::Equal => continue,
                    other => return Ok(other),
                }
            }
            Ok(xs.len().cmp(&ys.len()))
        }
        _ => Err(RuntimeError::new(
            format!(
                "Cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            ),
            loc.clone(),
        )),
    }
}

/// Mathematical equality across numeric types
pub fn numeric_eq(a: &Value, b: &Value) -> bool {
    matches!(
        numeric_compare(a, b, &SourceLoc::internal()),
        Ok(Ordering::Equal)
    )
}

fn numeric_compare(a: &Value, b: &Value, loc: &SourceLoc) -> RunResult<Ordering> {
    match (a, b) {
        (Value::Decimal(_), _) | (_, Value::Decimal(_)) => {
            let (x, y) = both_decimal(a, b, loc)?;
            Ok(x.cmp(&y))
        }
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            let x = a.as_float().ok_or_else(|| non_numeric(a, loc))?;
            let y = b.as_float().ok_or_else(|| non_numeric(b, loc))?;
            x.partial_cmp(&y).ok_or_else(|| {
                RuntimeError::new("Cannot compare NaN", loc.clone())
            })
        }
        _ => {
            let x = a.as_long().ok_or_else(|| non_numeric(a, loc))?;
            let y = b.as_long().ok_or_else(|| non_numeric(b, loc))?;
            Ok(x.cmp(&y))
        }
    }
}

fn both_decimal(a: &Value, b: &Value, loc: &SourceLoc) -> RunResult<(BigDecimal, BigDecimal)> {
    let x = to_decimal(a).ok_or_else(|| non_numeric(a, loc))?;
    let y = to_decimal(b).ok_or_else(|| non_numeric(b, loc))?;
    Ok((x, y))
}

fn non_numeric(v: &Value, loc: &SourceLoc) -> RuntimeError {
    RuntimeError::new(
        format!("Expected a number, got {}", v.type_name()),
        loc.clone(),
    )
}

/// Parse a decimal from its canonical string form (checkpoint restore)
pub fn decimal_from_str(s: &str) -> RunResult<Value> {
    s.parse::<BigDecimal>()
        .map(|d| Value::Decimal(Arc::new(d)))
        .map_err(|e| RuntimeError::msg(format!("Invalid decimal literal '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> SourceLoc {
        SourceLoc::internal()
    }

    #[test]
    fn test_add_widens() {
        assert_eq!(
            add(&Value::Int(1), &Value::Int(2), &loc()).unwrap().as_int(),
            Some(3)
        );
        assert!(matches!(
            add(&Value::Int(1), &Value::Long(2), &loc()).unwrap(),
            Value::Long(3)
        ));
        assert!(matches!(
            add(&Value::Long(1), &Value::Float(0.5), &loc()).unwrap(),
            Value::Float(_)
        ));
        assert!(matches!(
            add(
                &Value::Int(1),
                &Value::decimal("0.5".parse().unwrap()),
                &loc()
            )
            .unwrap(),
            Value::Decimal(_)
        ));
    }

    #[test]
    fn test_add_int_wraps() {
        let v = add(&Value::Int(i32::MAX), &Value::Int(1), &loc()).unwrap();
        assert_eq!(v.as_int(), Some(i32::MIN));
    }

    #[test]
    fn test_add_rejects_non_numeric() {
        assert!(add(&Value::str("a"), &Value::Int(1), &loc()).is_err());
    }

    #[test]
    fn test_avg_divide() {
        let v = avg_divide(&Value::Int(6), 3, &loc()).unwrap();
        match v {
            Value::Decimal(d) => assert_eq!(d.to_string(), "2"),
            other => panic!("expected decimal, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_compare_across_types() {
        assert_eq!(
            compare(&Value::Int(2), &Value::Long(3), &loc()).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            compare(&Value::Float(2.0), &Value::Int(2), &loc()).unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            compare(&Value::str("b"), &Value::str("a"), &loc()).unwrap(),
            Ordering::Greater
        );
        assert!(compare(&Value::str("a"), &Value::Int(1), &loc()).is_err());
    }

    #[test]
    fn test_compare_lists_lexicographic() {
        let a = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::list(vec![Value::Int(1), Value::Int(3)]);
        let c = Value::list(vec![Value::Int(1)]);
        assert_eq!(compare(&a, &b, &loc()).unwrap(), Ordering::Less);
        assert_eq!(compare(&c, &a, &loc()).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_numeric_eq() {
        assert!(numeric_eq(&Value::Int(2), &Value::Float(2.0)));
        assert!(numeric_eq(
            &Value::Long(2),
            &Value::decimal("2.00".parse().unwrap())
        ));
        assert!(!numeric_eq(&Value::Int(2), &Value::Int(3)));
    }
}
