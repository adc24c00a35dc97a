//! Script value representation
//!
//! Values are a tagged union. Small values (null, bool, numbers) are stored
//! inline; containers and other heap values share their interior through
//! `Arc<parking_lot::Mutex<_>>` so that a fiber can suspend on one thread
//! and resume on another. The `Arc` allocation address doubles as the
//! identity key used by the checkpoint codec to preserve object identity
//! (two references to the same live object serialize to one object id).

use std::sync::Arc;

use bigdecimal::BigDecimal;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{RunResult, RuntimeError, SourceLoc};
use crate::object::{Instance, TypedArray};
use crate::rxmatch::RegexMatcher;
use crate::suspend::{FunctionValue, IterValue};

/// Insertion-ordered script map (keys are strings)
pub type ValueMap = IndexMap<String, Value>;

/// A script value
#[derive(Clone)]
pub enum Value {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 64-bit float
    Float(f64),
    /// Arbitrary-precision decimal
    Decimal(Arc<BigDecimal>),
    /// Immutable string
    Str(Arc<str>),
    /// Ordered list of values
    List(Arc<Mutex<Vec<Value>>>),
    /// Insertion-ordered map of string keys to values
    Map(Arc<Mutex<ValueMap>>),
    /// Typed, possibly multi-dimensional array
    Array(Arc<Mutex<TypedArray>>),
    /// Instance of a user-declared class
    Instance(Arc<Mutex<Instance>>),
    /// Callable function handle
    Function(FunctionValue),
    /// Lazy iterator
    Iterator(IterValue),
    /// Mutable string builder
    StringBuilder(Arc<Mutex<String>>),
    /// Regex matcher with resumable cursor state
    Matcher(Arc<Mutex<RegexMatcher>>),
}

impl Value {
    /// Create an Int value
    pub fn int(i: i32) -> Self {
        Value::Int(i)
    }

    /// Create a Long value
    pub fn long(i: i64) -> Self {
        Value::Long(i)
    }

    /// Create a Float value
    pub fn float(f: f64) -> Self {
        Value::Float(f)
    }

    /// Create a Decimal value
    pub fn decimal(d: BigDecimal) -> Self {
        Value::Decimal(Arc::new(d))
    }

    /// Create a string value
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    /// Create a list value
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(Mutex::new(items)))
    }

    /// Create a map value
    pub fn map(entries: ValueMap) -> Self {
        Value::Map(Arc::new(Mutex::new(entries)))
    }

    /// Create an empty map value
    pub fn empty_map() -> Self {
        Value::Map(Arc::new(Mutex::new(ValueMap::new())))
    }

    /// Create a typed array value
    pub fn array(arr: TypedArray) -> Self {
        Value::Array(Arc::new(Mutex::new(arr)))
    }

    /// Create an instance value
    pub fn instance(inst: Instance) -> Self {
        Value::Instance(Arc::new(Mutex::new(inst)))
    }

    /// Create a string builder value
    pub fn string_builder() -> Self {
        Value::StringBuilder(Arc::new(Mutex::new(String::new())))
    }

    /// Create a matcher value
    pub fn matcher(m: RegexMatcher) -> Self {
        Value::Matcher(Arc::new(Mutex::new(m)))
    }

    /// Check if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Extract a bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract an i32
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract an i64, widening Int
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i as i64),
            Value::Long(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract an f64, widening Int/Long
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Long(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Extract a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Check if this value is any numeric kind
    pub fn is_number(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::Long(_) | Value::Float(_) | Value::Decimal(_)
        )
    }

    /// Script-visible type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Array(_) => "array",
            Value::Instance(_) => "instance",
            Value::Function(_) => "function",
            Value::Iterator(_) => "iterator",
            Value::StringBuilder(_) => "stringbuilder",
            Value::Matcher(_) => "matcher",
        }
    }

    /// Check if value is truthy (for conditionals and default predicates)
    ///
    /// null is false; booleans are themselves; numbers are true iff
    /// non-zero; strings, lists, maps, and arrays are true iff non-empty;
    /// any other object is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Long(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Decimal(d) => !bigdecimal::Zero::is_zero(d.as_ref()),
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.lock().is_empty(),
            Value::Map(m) => !m.lock().is_empty(),
            Value::Array(a) => a.lock().len() != 0,
            _ => true,
        }
    }

    /// Stable identity key for heap values (the shared allocation address)
    ///
    /// Inline values have no identity and return `None`. The key is only
    /// meaningful while the value is alive, which the codec guarantees by
    /// holding the object graph for the duration of a checkpoint.
    pub fn identity_key(&self) -> Option<usize> {
        match self {
            Value::Str(s) => Some(Arc::as_ptr(s) as *const u8 as usize),
            Value::List(l) => Some(Arc::as_ptr(l) as usize),
            Value::Map(m) => Some(Arc::as_ptr(m) as usize),
            Value::Array(a) => Some(Arc::as_ptr(a) as usize),
            Value::Instance(i) => Some(Arc::as_ptr(i) as usize),
            Value::Function(f) => Some(f.identity_key()),
            Value::Iterator(i) => Some(i.identity_key()),
            Value::StringBuilder(b) => Some(Arc::as_ptr(b) as usize),
            Value::Matcher(m) => Some(Arc::as_ptr(m) as usize),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "bool({})", b),
            Value::Int(i) => write!(f, "int({})", i),
            Value::Long(i) => write!(f, "long({})", i),
            Value::Float(x) => write!(f, "float({})", x),
            Value::Decimal(d) => write!(f, "decimal({})", d),
            Value::Str(s) => write!(f, "string({:?})", s),
            other => write!(f, "{}@{:#x}", other.type_name(), other.identity_key().unwrap_or(0)),
        }
    }
}

/// Resolve a possibly-negative index against a collection of `len` elements.
///
/// Negative indices resolve as `len + index`. Out-of-range indices (after
/// resolution) report the resolved position in the error message.
pub fn resolve_index(index: i64, len: usize, loc: &SourceLoc) -> RunResult<usize> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved < 0 || resolved >= len as i64 {
        return Err(RuntimeError::new(
            format!(
                "Index out of bounds: {} resolves to position {} (size {})",
                index, resolved, len
            ),
            loc.clone(),
        ));
    }
    Ok(resolved as usize)
}

/// Resolve a possibly-negative *bound* (for sublist/substring ends).
///
/// Unlike [`resolve_index`], a bound of `len` is allowed.
pub fn resolve_bound(index: i64, len: usize, loc: &SourceLoc) -> RunResult<usize> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    if resolved < 0 || resolved > len as i64 {
        return Err(RuntimeError::new(
            format!(
                "Bound out of range: {} resolves to position {} (size {})",
                index, resolved, len
            ),
            loc.clone(),
        ));
    }
    Ok(resolved as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(Value::str("x").is_truthy());
        assert!(!Value::list(vec![]).is_truthy());
        assert!(Value::list(vec![Value::Null]).is_truthy());
        assert!(!Value::decimal("0.000".parse().unwrap()).is_truthy());
        assert!(Value::decimal("0.001".parse().unwrap()).is_truthy());
    }

    #[test]
    fn test_widening_accessors() {
        assert_eq!(Value::Int(7).as_long(), Some(7));
        assert_eq!(Value::Long(7).as_float(), Some(7.0));
        assert_eq!(Value::Float(1.5).as_long(), None);
    }

    #[test]
    fn test_identity_key_shared() {
        let a = Value::list(vec![Value::Int(1)]);
        let b = a.clone();
        assert_eq!(a.identity_key(), b.identity_key());

        let c = Value::list(vec![Value::Int(1)]);
        assert_ne!(a.identity_key(), c.identity_key());
        assert!(Value::Int(3).identity_key().is_none());
    }

    #[test]
    fn test_resolve_index_negative() {
        let loc = SourceLoc::internal();
        assert_eq!(resolve_index(-1, 3, &loc).unwrap(), 2);
        assert_eq!(resolve_index(0, 3, &loc).unwrap(), 0);

        let err = resolve_index(-5, 3, &loc).unwrap_err();
        assert!(err.message.contains("-2"), "message: {}", err.message);
    }

    #[test]
    fn test_resolve_bound_allows_len() {
        let loc = SourceLoc::internal();
        assert_eq!(resolve_bound(3, 3, &loc).unwrap(), 3);
        assert_eq!(resolve_bound(-1, 3, &loc).unwrap(), 2);
        assert!(resolve_bound(4, 3, &loc).is_err());
    }
}
