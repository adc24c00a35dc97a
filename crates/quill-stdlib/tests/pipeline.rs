//! Iterator laws and concrete pipeline scenarios

mod common;

use common::{as_ints, int_list, run_method};
use quill_core::stringify::deep_equals;
use quill_core::suspend::native_fn;
use quill_core::value::Value;

#[test]
fn sort_scenario() {
    let v = run_method(int_list(&[3, 1, 2]), "sort", vec![]).unwrap();
    let v = run_method(v, "collect", vec![]).unwrap();
    assert_eq!(as_ints(&v), vec![1, 2, 3]);
}

#[test]
fn grouped_scenarios() {
    let v = run_method(int_list(&[1, 2, 3, 4]), "grouped", vec![Value::Int(2)]).unwrap();
    let v = run_method(v, "collect", vec![]).unwrap();
    if let Value::List(l) = &v {
        let groups = l.lock().clone();
        assert_eq!(as_ints(&groups[0]), vec![1, 2]);
        assert_eq!(as_ints(&groups[1]), vec![3, 4]);
    } else {
        panic!("expected list");
    }

    let v = run_method(int_list(&[1, 2, 3]), "grouped", vec![Value::Int(2)]).unwrap();
    let v = run_method(v, "collect", vec![]).unwrap();
    if let Value::List(l) = &v {
        let groups = l.lock().clone();
        assert_eq!(as_ints(&groups[0]), vec![1, 2]);
        assert_eq!(as_ints(&groups[1]), vec![3]);
    } else {
        panic!("expected list");
    }
}

#[test]
fn window_sliding_scenario() {
    let v = run_method(int_list(&[1, 2, 3]), "windowSliding", vec![Value::Int(2)]).unwrap();
    let v = run_method(v, "collect", vec![]).unwrap();
    if let Value::List(l) = &v {
        let windows = l.lock().clone();
        assert_eq!(windows.len(), 2);
        assert_eq!(as_ints(&windows[0]), vec![1, 2]);
        assert_eq!(as_ints(&windows[1]), vec![2, 3]);
    } else {
        panic!("expected list");
    }
}

#[test]
fn sum_and_avg_scenarios() {
    let v = run_method(int_list(&[1, 2, 3]), "sum", vec![]).unwrap();
    assert_eq!(v.as_int(), Some(6));

    let v = run_method(int_list(&[1, 2, 3]), "avg", vec![]).unwrap();
    match v {
        Value::Decimal(d) => assert_eq!(d.to_string(), "2"),
        other => panic!("avg should be decimal, got {}", other.type_name()),
    }
}

#[test]
fn join_scenarios() {
    let strs = Value::list(vec![Value::str("a"), Value::str("b"), Value::str("c")]);
    let v = run_method(strs, "join", vec![Value::str(",")]).unwrap();
    assert_eq!(v.as_str(), Some("a,b,c"));

    let one = Value::list(vec![Value::str("a")]);
    let v = run_method(one, "join", vec![Value::str(",")]).unwrap();
    assert_eq!(v.as_str(), Some("a"));

    let none = Value::list(vec![]);
    let v = run_method(none, "join", vec![Value::str(",")]).unwrap();
    assert_eq!(v.as_str(), Some(""));
}

#[test]
fn transpose_scenario() {
    let rows = Value::list(vec![
        int_list(&[1, 2]),
        int_list(&[3, 4]),
        int_list(&[5]),
    ]);
    let v = run_method(rows, "transpose", vec![]).unwrap();
    if let Value::List(l) = &v {
        let cols = l.lock().clone();
        assert_eq!(cols.len(), 2);
        assert_eq!(as_ints(&cols[0]), vec![1, 3, 5]);
        if let Value::List(c1) = &cols[1] {
            let c1 = c1.lock().clone();
            assert_eq!(c1[0].as_int(), Some(2));
            assert_eq!(c1[1].as_int(), Some(4));
            assert!(c1[2].is_null());
        }
    } else {
        panic!("expected list");
    }
}

#[test]
fn law_filter_partition_counts() {
    let xs = int_list(&[1, 2, 3, 4, 5, 6, 7]);
    let even = native_fn("law.even", |args| {
        Ok(Value::Bool(args[0].as_int().unwrap_or(0) % 2 == 0))
    });
    let odd = native_fn("law.odd", |args| {
        Ok(Value::Bool(args[0].as_int().unwrap_or(0) % 2 != 0))
    });

    let kept = run_method(xs.clone(), "filter", vec![Value::Function(even)]).unwrap();
    let kept = run_method(kept, "count", vec![]).unwrap().as_int().unwrap();
    let dropped = run_method(xs.clone(), "filter", vec![Value::Function(odd)]).unwrap();
    let dropped = run_method(dropped, "count", vec![]).unwrap().as_int().unwrap();
    let total = run_method(xs, "count", vec![]).unwrap().as_int().unwrap();

    assert_eq!(kept + dropped, total);
}

#[test]
fn law_map_identity() {
    let xs = int_list(&[4, 5, 6]);
    let id = native_fn("law.id", |args| Ok(args[0].clone()));
    let mapped = run_method(xs.clone(), "map", vec![Value::Function(id)]).unwrap();
    let mapped = run_method(mapped, "collect", vec![]).unwrap();
    assert!(deep_equals(&mapped, &xs));
}

#[test]
fn law_reverse_reverse() {
    let xs = int_list(&[1, 2, 3, 4]);
    let once = run_method(xs.clone(), "reverse", vec![]).unwrap();
    let twice = run_method(once, "reverse", vec![]).unwrap();
    let twice = run_method(twice, "collect", vec![]).unwrap();
    assert!(deep_equals(&twice, &xs));
}

#[test]
fn law_sort_is_sorted() {
    let xs = int_list(&[5, 3, 9, 1, 3, 7]);
    let sorted = run_method(xs, "sort", vec![]).unwrap();
    let sorted = run_method(sorted, "collect", vec![]).unwrap();
    let ints = as_ints(&sorted);
    let mut expected = ints.clone();
    expected.sort();
    assert_eq!(ints, expected);
}

#[test]
fn law_unique_never_grows() {
    let xs = int_list(&[1, 2, 2, 3, 1]);
    let uniq = run_method(xs.clone(), "unique", vec![]).unwrap();
    let uniq = run_method(uniq, "count", vec![]).unwrap().as_int().unwrap();
    let total = run_method(xs, "count", vec![]).unwrap().as_int().unwrap();
    assert!(uniq <= total);
    assert_eq!(uniq, 3);
}

#[test]
fn map_with_index_pairs() {
    let xs = Value::list(vec![Value::str("a"), Value::str("b")]);
    let pair = native_fn("law.pair", |args| {
        Ok(Value::list(vec![args[0].clone(), args[1].clone()]))
    });
    let v = run_method(xs, "mapWithIndex", vec![Value::Function(pair)]).unwrap();
    let v = run_method(v, "collect", vec![]).unwrap();
    if let Value::List(l) = &v {
        let pairs = l.lock().clone();
        if let Value::List(p) = &pairs[1] {
            let p = p.lock().clone();
            assert_eq!(p[0].as_str(), Some("b"));
            assert_eq!(p[1].as_long(), Some(1));
        }
    } else {
        panic!("expected list");
    }
}

#[test]
fn collect_entries_builds_ordered_map() {
    let entries = Value::list(vec![
        Value::list(vec![Value::str("z"), Value::Int(1)]),
        Value::list(vec![Value::str("a"), Value::Int(2)]),
    ]);
    let v = run_method(entries, "collectEntries", vec![]).unwrap();
    if let Value::Map(m) = &v {
        let keys: Vec<String> = m.lock().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a"]);
    } else {
        panic!("expected map");
    }
}

#[test]
fn each_returns_null_and_runs_side_effects() {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    let total = Arc::new(AtomicI32::new(0));
    let total2 = total.clone();
    let add = native_fn("law.add_side_effect", move |args| {
        total2.fetch_add(args[0].as_int().unwrap_or(0), Ordering::SeqCst);
        Ok(Value::Null)
    });
    let v = run_method(int_list(&[1, 2, 3]), "each", vec![Value::Function(add)]).unwrap();
    assert!(v.is_null());
    assert_eq!(total.load(Ordering::SeqCst), 6);
}

#[test]
fn flat_map_scenario() {
    let dup = native_fn("law.dup", |args| {
        Ok(Value::list(vec![args[0].clone(), args[0].clone()]))
    });
    let v = run_method(int_list(&[1, 2]), "flatMap", vec![Value::Function(dup)]).unwrap();
    let v = run_method(v, "collect", vec![]).unwrap();
    assert_eq!(as_ints(&v), vec![1, 1, 2, 2]);
}

#[test]
fn group_by_preserves_encounter_order() {
    let parity = native_fn("law.parity", |args| {
        Ok(Value::str(if args[0].as_int().unwrap_or(0) % 2 == 0 {
            "even"
        } else {
            "odd"
        }))
    });
    let v = run_method(
        int_list(&[3, 2, 5, 8]),
        "groupBy",
        vec![Value::Function(parity)],
    )
    .unwrap();
    if let Value::Map(m) = &v {
        let m = m.lock();
        let keys: Vec<String> = m.keys().cloned().collect();
        assert_eq!(keys, vec!["odd", "even"]);
        if let Some(list) = m.get("odd") {
            assert_eq!(as_ints(list), vec![3, 5]);
        }
    } else {
        panic!("expected map");
    }
}

#[test]
fn skip_and_limit_negative() {
    let v = run_method(int_list(&[1, 2, 3, 4, 5]), "skip", vec![Value::Int(-2)]).unwrap();
    let v = run_method(v, "collect", vec![]).unwrap();
    assert_eq!(as_ints(&v), vec![1, 2, 3]);

    let v = run_method(int_list(&[1, 2, 3, 4, 5]), "limit", vec![Value::Int(-1)]).unwrap();
    let v = run_method(v, "collect", vec![]).unwrap();
    assert_eq!(as_ints(&v), vec![1, 2, 3, 4]);
}

#[test]
fn min_max_on_floats_and_ints() {
    let mixed = Value::list(vec![Value::Float(2.5), Value::Int(1), Value::Long(3)]);
    let v = run_method(mixed.clone(), "min", vec![]).unwrap();
    assert_eq!(v.as_int(), Some(1));
    let v = run_method(mixed, "max", vec![]).unwrap();
    assert_eq!(v.as_long(), Some(3));
}

#[test]
fn reduce_with_list_accumulator() {
    let append = native_fn("law.append", |args| {
        if let Value::List(l) = &args[0] {
            l.lock().push(args[1].clone());
        }
        Ok(args[0].clone())
    });
    let v = run_method(
        int_list(&[1, 2, 3]),
        "reduce",
        vec![Value::list(vec![]), Value::Function(append)],
    )
    .unwrap();
    assert_eq!(as_ints(&v), vec![1, 2, 3]);
}
