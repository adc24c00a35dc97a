//! Script-facing stringification and deep equality
//!
//! Both walks guard against cyclic object graphs: printing emits the
//! `<CIRCULAR_REF>` sentinel when it revisits a container already on the
//! current path, and equality treats a revisited pair as equal (the cycle
//! itself carries no distinguishing information).

use rustc_hash::FxHashSet;

use crate::num;
use crate::value::Value;

/// Sentinel printed in place of a container that refers back to itself
pub const CIRCULAR_REF: &str = "<CIRCULAR_REF>";

/// Render a value the way scripts see it
pub fn display(v: &Value) -> String {
    let mut out = String::new();
    let mut on_path = FxHashSet::default();
    render(v, false, &mut on_path, &mut out);
    out
}

fn render(v: &Value, nested: bool, on_path: &mut FxHashSet<usize>, out: &mut String) {
    match v {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Long(i) => out.push_str(&i.to_string()),
        Value::Float(f) => out.push_str(&f.to_string()),
        Value::Decimal(d) => out.push_str(&d.to_string()),
        Value::Str(s) => {
            if nested {
                out.push('\'');
                out.push_str(s);
                out.push('\'');
            } else {
                out.push_str(s);
            }
        }
        Value::List(l) => {
            let key = v.identity_key().unwrap();
            if !on_path.insert(key) {
                out.push_str(CIRCULAR_REF);
                return;
            }
            let items = l.lock().clone();
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render(item, true, on_path, out);
            }
            out.push(']');
            on_path.remove(&key);
        }
        Value::Map(m) => {
            let key = v.identity_key().unwrap();
            if !on_path.insert(key) {
                out.push_str(CIRCULAR_REF);
                return;
            }
            let entries = m.lock().clone();
            out.push('{');
            for (i, (k, val)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(k);
                out.push_str(": ");
                render(val, true, on_path, out);
            }
            out.push('}');
            on_path.remove(&key);
        }
        Value::Array(a) => {
            let key = v.identity_key().unwrap();
            if !on_path.insert(key) {
                out.push_str(CIRCULAR_REF);
                return;
            }
            let items = a.lock().to_values();
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render(item, true, on_path, out);
            }
            out.push(']');
            on_path.remove(&key);
        }
        Value::Instance(inst) => {
            let key = v.identity_key().unwrap();
            if !on_path.insert(key) {
                out.push_str(CIRCULAR_REF);
                return;
            }
            let (name, fields, values) = {
                let i = inst.lock();
                (
                    i.shape.name.clone(),
                    i.shape.fields.clone(),
                    i.fields.clone(),
                )
            };
            out.push_str(&name);
            out.push('{');
            for (i, (fname, fval)) in fields.iter().zip(values.iter()).enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(fname);
                out.push_str(": ");
                render(fval, true, on_path, out);
            }
            out.push('}');
            on_path.remove(&key);
        }
        Value::Function(f) => {
            out.push_str("function ");
            out.push_str(&f.name());
        }
        Value::Iterator(it) => {
            out.push_str("iterator ");
            out.push_str(it.kind());
        }
        Value::StringBuilder(b) => out.push_str(&b.lock().clone()),
        Value::Matcher(_) => out.push_str("matcher"),
    }
}

/// Deep equality per the script's rules
///
/// Primitives compare by value with numeric widening; lists elementwise;
/// maps by key set and pairwise values; instances elementwise over
/// declared fields; a map compares against an instance over the declared
/// field names. Other heap values compare by identity.
pub fn deep_equals(a: &Value, b: &Value) -> bool {
    let mut visiting = FxHashSet::default();
    eq(a, b, &mut visiting)
}

fn eq(a: &Value, b: &Value, visiting: &mut FxHashSet<(usize, usize)>) -> bool {
    if a.is_number() && b.is_number() {
        return num::numeric_eq(a, b);
    }
    // Cycle guard for container pairs: a revisited pair is considered equal
    if let (Some(ka), Some(kb)) = (a.identity_key(), b.identity_key()) {
        if ka == kb {
            return true;
        }
        if !visiting.insert((ka, kb)) {
            return true;
        }
        let result = eq_containers(a, b, visiting);
        visiting.remove(&(ka, kb));
        return result;
    }
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => false,
    }
}

fn eq_containers(a: &Value, b: &Value, visiting: &mut FxHashSet<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::StringBuilder(x), Value::StringBuilder(y)) => *x.lock() == *y.lock(),
        (Value::List(x), Value::List(y)) => {
            let (xs, ys) = (x.lock().clone(), y.lock().clone());
            xs.len() == ys.len()
                && xs.iter().zip(ys.iter()).all(|(ex, ey)| eq(ex, ey, visiting))
        }
        (Value::Array(x), Value::Array(y)) => {
            let (xs, ys) = (x.lock().to_values(), y.lock().to_values());
            xs.len() == ys.len()
                && xs.iter().zip(ys.iter()).all(|(ex, ey)| eq(ex, ey, visiting))
        }
        (Value::List(x), Value::Array(y)) | (Value::Array(y), Value::List(x)) => {
            let (xs, ys) = (x.lock().clone(), y.lock().to_values());
            xs.len() == ys.len()
                && xs.iter().zip(ys.iter()).all(|(ex, ey)| eq(ex, ey, visiting))
        }
        (Value::Map(x), Value::Map(y)) => {
            let (xs, ys) = (x.lock().clone(), y.lock().clone());
            xs.len() == ys.len()
                && xs.iter().all(|(k, vx)| match ys.get(k) {
                    Some(vy) => eq(vx, vy, visiting),
                    None => false,
                })
        }
        (Value::Instance(x), Value::Instance(y)) => {
            let (xs, ys) = (x.lock().fields.clone(), y.lock().fields.clone());
            let same_shape = {
                let (ix, iy) = (x.lock(), y.lock());
                ix.shape.name == iy.shape.name
            };
            same_shape
                && xs.len() == ys.len()
                && xs.iter().zip(ys.iter()).all(|(ex, ey)| eq(ex, ey, visiting))
        }
        (Value::Map(m), Value::Instance(inst)) | (Value::Instance(inst), Value::Map(m)) => {
            // Map keys compare against the instance's declared field names
            let entries = m.lock().clone();
            let (fields, values) = {
                let i = inst.lock();
                (i.shape.fields.clone(), i.fields.clone())
            };
            entries.len() == fields.len()
                && fields.iter().zip(values.iter()).all(|(fname, fval)| {
                    match entries.get(fname.as_ref()) {
                        Some(mv) => eq(mv, fval, visiting),
                        None => false,
                    }
                })
        }
        // Functions, iterators, matchers: identity only (handled by caller
        // when keys were equal), so distinct objects are unequal
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueMap;

    #[test]
    fn test_display_scalars() {
        assert_eq!(display(&Value::Null), "null");
        assert_eq!(display(&Value::Bool(true)), "true");
        assert_eq!(display(&Value::Int(42)), "42");
        assert_eq!(display(&Value::str("hi")), "hi");
    }

    #[test]
    fn test_display_containers() {
        let v = Value::list(vec![Value::Int(1), Value::str("a")]);
        assert_eq!(display(&v), "[1, 'a']");

        let mut m = ValueMap::new();
        m.insert("x".to_string(), Value::Int(1));
        assert_eq!(display(&Value::map(m)), "{x: 1}");
    }

    #[test]
    fn test_display_cycle_sentinel() {
        let v = Value::list(vec![Value::Int(1)]);
        if let Value::List(l) = &v {
            l.lock().push(v.clone());
        }
        let text = display(&v);
        assert!(text.contains(CIRCULAR_REF), "got: {}", text);
    }

    #[test]
    fn test_deep_equals_numeric_widening() {
        assert!(deep_equals(&Value::Int(2), &Value::Float(2.0)));
        assert!(!deep_equals(&Value::Int(2), &Value::str("2")));
    }

    #[test]
    fn test_deep_equals_lists_and_maps() {
        let a = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::list(vec![Value::Int(1), Value::Long(2)]);
        assert!(deep_equals(&a, &b));

        let mut m1 = ValueMap::new();
        m1.insert("k".into(), Value::Int(1));
        let mut m2 = ValueMap::new();
        m2.insert("k".into(), Value::Float(1.0));
        assert!(deep_equals(&Value::map(m1), &Value::map(m2)));
    }

    #[test]
    fn test_deep_equals_map_vs_instance() {
        use crate::object::{ClassShape, Instance};

        let shape = ClassShape::new("Point", vec!["x", "y"]);
        let inst = Value::instance(
            Instance::with_fields(shape, vec![Value::Int(1), Value::Int(2)]).unwrap(),
        );
        let mut m = ValueMap::new();
        m.insert("x".into(), Value::Int(1));
        m.insert("y".into(), Value::Int(2));
        assert!(deep_equals(&Value::map(m.clone()), &inst));

        m.insert("z".into(), Value::Int(3));
        assert!(!deep_equals(&Value::map(m), &inst));
    }

    #[test]
    fn test_deep_equals_cyclic() {
        let a = Value::list(vec![Value::Int(1)]);
        if let Value::List(l) = &a {
            let inner = a.clone();
            l.lock().push(inner);
        }
        let b = Value::list(vec![Value::Int(1)]);
        if let Value::List(l) = &b {
            let inner = b.clone();
            l.lock().push(inner);
        }
        assert!(deep_equals(&a, &b));
    }
}
