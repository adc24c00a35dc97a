//! Generalized terminal driver
//!
//! One state machine walks an upstream iterator and applies a per-element
//! step for every eagerly-consuming terminal operation: reduce, sum, avg,
//! min, max, join, groupBy, transpose, collect, collectEntries, each, and
//! size. Integration is kind-specific but pure; only the step invocation
//! (the user callback) and the upstream pulls may suspend. The driver has
//! no object of its own: all of its state rides in its continuation frame
//! under the `iter.reduce` resume entry.

use quill_core::error::{RunResult, RuntimeError, SourceLoc};
use quill_core::num;
use quill_core::stringify::display;
use quill_core::suspend::{
    Continuation, FunctionValue, IterValue, ResumeHandle, Step, StepResult,
};
use quill_core::value::Value;

use crate::iter::delivered_bool;

/// Resume-entry name for driver frames
pub const RESUME_NAME: &str = "iter.reduce";

/// Which terminal operation the driver is running
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReduceKind {
    /// Materialize into a list (optionally through a mapper)
    Collect,
    /// Materialize into an insertion-ordered map of `[key, value]` pairs
    CollectEntries,
    /// Left fold with a user accumulator callback
    Reduce,
    /// Numeric sum with widening
    Sum,
    /// Sum then decimal division by the count
    Avg,
    /// Smallest element (optional key extractor)
    Min,
    /// Largest element (optional key extractor)
    Max,
    /// Stringwise reduction with a separator
    Join,
    /// Insertion-ordered map from key to list of elements
    GroupBy,
    /// List-of-lists transposition, padded with null
    Transpose,
    /// Run an action for side effects, result null
    Each,
    /// Count elements
    Size,
    /// Materialize then slice (`key` holds the `[start, end]` bounds;
    /// a null end means "end of list")
    SubList,
}

impl ReduceKind {
    fn tag(self) -> i64 {
        self as i64
    }

    fn from_tag(tag: i64) -> RunResult<Self> {
        use ReduceKind::*;
        Ok(match tag {
            0 => Collect,
            1 => CollectEntries,
            2 => Reduce,
            3 => Sum,
            4 => Avg,
            5 => Min,
            6 => Max,
            7 => Join,
            8 => GroupBy,
            9 => Transpose,
            10 => Each,
            11 => Size,
            12 => SubList,
            other => {
                return Err(RuntimeError::msg(format!(
                    "Corrupt resume: unknown reduce kind {}",
                    other
                )))
            }
        })
    }
}

struct DriverState {
    kind: ReduceKind,
    upstream: IterValue,
    callback: Option<FunctionValue>,
    acc: Value,
    key: Value,
    elem: Value,
    count: i64,
    have: bool,
    loc: SourceLoc,
}

impl DriverState {
    fn frame(&self, location: u32) -> Continuation {
        let callback = match &self.callback {
            Some(f) => Value::Function(f.clone()),
            None => Value::Null,
        };
        Continuation::frame(
            ResumeHandle::Named(RESUME_NAME.into()),
            location,
            vec![
                self.kind.tag(),
                self.count,
                self.have as i64,
                self.loc.offset as i64,
            ],
            vec![
                Value::Iterator(self.upstream.clone()),
                callback,
                self.acc.clone(),
                self.key.clone(),
                self.elem.clone(),
                Value::str(self.loc.source.as_ref()),
            ],
        )
    }

    fn from_frame(mut frame: Continuation) -> RunResult<Self> {
        let kind = ReduceKind::from_tag(frame.long_at(0))?;
        let count = frame.long_at(1);
        let have = frame.long_at(2) != 0;
        let offset = frame.long_at(3) as usize;
        let upstream = match frame.obj_at(0) {
            Value::Iterator(it) => it,
            other => {
                return Err(RuntimeError::msg(format!(
                    "Corrupt resume: reduce upstream is {}",
                    other.type_name()
                )))
            }
        };
        let callback = match frame.obj_at(1) {
            Value::Function(f) => Some(f),
            Value::Null => None,
            other => {
                return Err(RuntimeError::msg(format!(
                    "Corrupt resume: reduce callback is {}",
                    other.type_name()
                )))
            }
        };
        let acc = frame.obj_at(2);
        let key = frame.obj_at(3);
        let elem = frame.obj_at(4);
        let source = match frame.obj_at(5) {
            Value::Str(s) => s,
            _ => "".into(),
        };
        Ok(Self {
            kind,
            upstream,
            callback,
            acc,
            key,
            elem,
            count,
            have,
            loc: SourceLoc {
                source,
                offset,
            },
        })
    }
}

/// Run a terminal operation over an upstream iterator.
///
/// `acc` is the kind's initial accumulator and `key` its auxiliary value
/// (the join separator; scratch for min/max comparison keys).
pub fn drive(
    kind: ReduceKind,
    upstream: IterValue,
    callback: Option<FunctionValue>,
    acc: Value,
    key: Value,
    loc: SourceLoc,
) -> StepResult<Value> {
    let mut st = DriverState {
        kind,
        upstream,
        callback,
        acc,
        key,
        elem: Value::Null,
        count: 0,
        have: false,
        loc,
    };
    run(&mut st, 0, Value::Null)
}

/// Resume entry registered under [`RESUME_NAME`]
pub fn resume(frame: Continuation, result: Value) -> StepResult<Value> {
    let location = frame.method_location;
    let mut st = DriverState::from_frame(frame)?;
    run(&mut st, location, result)
}

// Driver states: 0 pull-hasNext, 1 receive-hasNext, 2 pull-next,
// 3 receive-next, 4 apply-step, 5 receive-step, 6 integrate (pure)
fn run(st: &mut DriverState, mut location: u32, mut incoming: Value) -> StepResult<Value> {
    loop {
        match location {
            0 => match st.upstream.has_next()? {
                Step::Ready(true) => location = 2,
                Step::Ready(false) => return Ok(Step::Ready(finalize(st)?)),
                Step::Suspended(c) => {
                    return Ok(Step::Suspended(c.push_frame(st.frame(1))))
                }
            },
            1 => {
                if !delivered_bool(&incoming)? {
                    return Ok(Step::Ready(finalize(st)?));
                }
                location = 2;
            }
            2 => match st.upstream.next()? {
                Step::Ready(v) => {
                    st.elem = v;
                    location = 4;
                }
                Step::Suspended(c) => {
                    return Ok(Step::Suspended(c.push_frame(st.frame(3))))
                }
            },
            3 => {
                st.elem = std::mem::take(&mut incoming);
                location = 4;
            }
            4 => {
                let args: Option<Vec<Value>> = match st.kind {
                    ReduceKind::Reduce => Some(vec![st.acc.clone(), st.elem.clone()]),
                    ReduceKind::Collect
                    | ReduceKind::CollectEntries
                    | ReduceKind::Min
                    | ReduceKind::Max => st.callback.as_ref().map(|_| vec![st.elem.clone()]),
                    ReduceKind::GroupBy | ReduceKind::Each => Some(vec![st.elem.clone()]),
                    _ => None,
                };
                match args {
                    None => {
                        // No step callback: the element is its own step result
                        incoming = st.elem.clone();
                        location = 6;
                    }
                    Some(args) => {
                        let f = st.callback.as_ref().ok_or_else(|| {
                            RuntimeError::new(
                                format!("{:?} requires a callback", st.kind),
                                st.loc.clone(),
                            )
                        })?;
                        match f.invoke(&args)? {
                            Step::Ready(v) => {
                                incoming = v;
                                location = 6;
                            }
                            Step::Suspended(c) => {
                                return Ok(Step::Suspended(c.push_frame(st.frame(5))))
                            }
                        }
                    }
                }
            }
            5 => location = 6,
            6 => {
                let step_result = std::mem::take(&mut incoming);
                integrate(st, step_result)?;
                st.count += 1;
                location = 0;
            }
            other => {
                return Err(RuntimeError::msg(format!(
                    "Corrupt resume: reduce driver has no state {}",
                    other
                )))
            }
        }
    }
}

fn integrate(st: &mut DriverState, step_result: Value) -> RunResult<()> {
    match st.kind {
        ReduceKind::Collect | ReduceKind::Transpose | ReduceKind::SubList => {
            if let Value::List(l) = &st.acc {
                l.lock().push(step_result);
            }
            Ok(())
        }
        ReduceKind::CollectEntries => {
            let (k, v) = entry_pair(&step_result, &st.loc)?;
            if let Value::Map(m) = &st.acc {
                m.lock().insert(k, v);
            }
            Ok(())
        }
        ReduceKind::Reduce => {
            st.acc = step_result;
            Ok(())
        }
        ReduceKind::Sum | ReduceKind::Avg => {
            st.acc = num::add(&st.acc, &step_result, &st.loc)?;
            Ok(())
        }
        ReduceKind::Min | ReduceKind::Max => {
            let better = if !st.have {
                true
            } else {
                let ord = num::compare(&step_result, &st.key, &st.loc)?;
                match st.kind {
                    ReduceKind::Min => ord == std::cmp::Ordering::Less,
                    _ => ord == std::cmp::Ordering::Greater,
                }
            };
            if better {
                st.key = step_result;
                st.acc = st.elem.clone();
                st.have = true;
            }
            Ok(())
        }
        ReduceKind::Join => {
            if let Value::StringBuilder(b) = &st.acc {
                let mut b = b.lock();
                if st.count > 0 {
                    if let Value::Str(sep) = &st.key {
                        b.push_str(sep);
                    }
                }
                b.push_str(&display(&step_result));
            }
            Ok(())
        }
        ReduceKind::GroupBy => {
            let group_key = match &step_result {
                Value::Str(s) => s.to_string(),
                other => display(other),
            };
            if let Value::Map(m) = &st.acc {
                let mut m = m.lock();
                let slot = match m.get(&group_key) {
                    Some(Value::List(l)) => Some(l.clone()),
                    _ => None,
                };
                match slot {
                    Some(l) => l.lock().push(st.elem.clone()),
                    None => {
                        m.insert(group_key, Value::list(vec![st.elem.clone()]));
                    }
                }
            }
            Ok(())
        }
        ReduceKind::Each | ReduceKind::Size => Ok(()),
    }
}

fn finalize(st: &mut DriverState) -> RunResult<Value> {
    match st.kind {
        ReduceKind::Collect | ReduceKind::CollectEntries | ReduceKind::Reduce => {
            Ok(st.acc.clone())
        }
        ReduceKind::Sum => Ok(st.acc.clone()),
        ReduceKind::Avg => {
            if st.count == 0 {
                return Err(RuntimeError::new("avg() of empty input", st.loc.clone()));
            }
            num::avg_divide(&st.acc, st.count, &st.loc)
        }
        ReduceKind::Min | ReduceKind::Max => {
            Ok(if st.have { st.acc.clone() } else { Value::Null })
        }
        ReduceKind::Join => match &st.acc {
            Value::StringBuilder(b) => Ok(Value::str(b.lock().clone())),
            _ => Ok(Value::str("")),
        },
        ReduceKind::GroupBy => Ok(st.acc.clone()),
        ReduceKind::Transpose => match &st.acc {
            Value::List(rows) => transpose(&rows.lock(), &st.loc),
            _ => Ok(Value::list(vec![])),
        },
        ReduceKind::Each => Ok(Value::Null),
        ReduceKind::Size => Ok(Value::Int(st.count as i32)),
        ReduceKind::SubList => {
            let items = match &st.acc {
                Value::List(l) => l.lock().clone(),
                _ => Vec::new(),
            };
            let (start_raw, end_raw) = match &st.key {
                Value::List(bounds) => {
                    let bounds = bounds.lock().clone();
                    let start = bounds.first().and_then(Value::as_long).unwrap_or(0);
                    let end = bounds.get(1).cloned().unwrap_or(Value::Null);
                    (start, end)
                }
                _ => (0, Value::Null),
            };
            let start = quill_core::value::resolve_bound(start_raw, items.len(), &st.loc)?;
            let end = match end_raw {
                // A null end is the "end of list" sentinel
                Value::Null => items.len(),
                other => {
                    let e = other.as_long().ok_or_else(|| {
                        RuntimeError::new(
                            format!("subList() end must be a number, got {}", other.type_name()),
                            st.loc.clone(),
                        )
                    })?;
                    quill_core::value::resolve_bound(e, items.len(), &st.loc)?
                }
            };
            if start > end {
                return Err(RuntimeError::new(
                    format!("subList() start {} is after end {}", start, end),
                    st.loc.clone(),
                ));
            }
            Ok(Value::list(items[start..end].to_vec()))
        }
    }
}

fn entry_pair(v: &Value, loc: &SourceLoc) -> RunResult<(String, Value)> {
    if let Value::List(l) = v {
        let items = l.lock().clone();
        if items.len() == 2 {
            if let Value::Str(k) = &items[0] {
                return Ok((k.to_string(), items[1].clone()));
            }
            return Err(RuntimeError::new(
                format!("Entry key must be a string, got {}", items[0].type_name()),
                loc.clone(),
            ));
        }
    }
    Err(RuntimeError::new(
        format!(
            "collectEntries() expects two-element [key, value] entries, got {}",
            v.type_name()
        ),
        loc.clone(),
    ))
}

fn transpose(rows: &[Value], loc: &SourceLoc) -> RunResult<Value> {
    let mut row_vecs = Vec::with_capacity(rows.len());
    for row in rows {
        match row {
            Value::List(l) => row_vecs.push(l.lock().clone()),
            other => {
                return Err(RuntimeError::new(
                    format!(
                        "transpose() expects a list of lists, found {}",
                        other.type_name()
                    ),
                    loc.clone(),
                ))
            }
        }
    }
    let width = row_vecs.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = Vec::with_capacity(width);
    for i in 0..width {
        let column: Vec<Value> = row_vecs
            .iter()
            .map(|row| row.get(i).cloned().unwrap_or(Value::Null))
            .collect();
        out.push(Value::list(column));
    }
    Ok(Value::list(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::ListIter;
    use quill_core::suspend::native_fn;

    fn ints(vals: &[i32]) -> IterValue {
        IterValue::new(ListIter::new(vals.iter().map(|i| Value::Int(*i)).collect()))
    }

    fn ready(step: StepResult<Value>) -> Value {
        match step.unwrap() {
            Step::Ready(v) => v,
            Step::Suspended(_) => panic!("unexpected suspension"),
        }
    }

    fn loc() -> SourceLoc {
        SourceLoc::internal()
    }

    #[test]
    fn test_sum() {
        let v = ready(drive(
            ReduceKind::Sum,
            ints(&[1, 2, 3]),
            None,
            Value::Int(0),
            Value::Null,
            loc(),
        ));
        assert_eq!(v.as_int(), Some(6));
    }

    #[test]
    fn test_sum_widens() {
        let vals = vec![Value::Int(1), Value::Long(1 << 40)];
        let v = ready(drive(
            ReduceKind::Sum,
            IterValue::new(ListIter::new(vals)),
            None,
            Value::Int(0),
            Value::Null,
            loc(),
        ));
        assert_eq!(v.as_long(), Some((1 << 40) + 1));
    }

    #[test]
    fn test_avg_returns_decimal() {
        let v = ready(drive(
            ReduceKind::Avg,
            ints(&[1, 2, 3]),
            None,
            Value::Int(0),
            Value::Null,
            loc(),
        ));
        match v {
            Value::Decimal(d) => assert_eq!(d.to_string(), "2"),
            other => panic!("expected decimal, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_avg_empty_errors() {
        let err = drive(
            ReduceKind::Avg,
            ints(&[]),
            None,
            Value::Int(0),
            Value::Null,
            loc(),
        )
        .err()
        .unwrap();
        assert!(err.message.contains("avg"));
    }

    #[test]
    fn test_reduce_folds_left() {
        let acc_fn = native_fn("sub", |args| {
            let a = args[0].as_int().unwrap_or(0);
            let b = args[1].as_int().unwrap_or(0);
            Ok(Value::Int(a - b))
        });
        let v = ready(drive(
            ReduceKind::Reduce,
            ints(&[1, 2, 3]),
            Some(acc_fn),
            Value::Int(100),
            Value::Null,
            loc(),
        ));
        // ((100 - 1) - 2) - 3
        assert_eq!(v.as_int(), Some(94));
    }

    #[test]
    fn test_join() {
        let vals = vec![Value::str("a"), Value::str("b"), Value::str("c")];
        let v = ready(drive(
            ReduceKind::Join,
            IterValue::new(ListIter::new(vals)),
            None,
            Value::string_builder(),
            Value::str(","),
            loc(),
        ));
        assert_eq!(v.as_str(), Some("a,b,c"));
    }

    #[test]
    fn test_join_single_and_empty() {
        let v = ready(drive(
            ReduceKind::Join,
            IterValue::new(ListIter::new(vec![Value::str("a")])),
            None,
            Value::string_builder(),
            Value::str(","),
            loc(),
        ));
        assert_eq!(v.as_str(), Some("a"));

        let v = ready(drive(
            ReduceKind::Join,
            ints(&[]),
            None,
            Value::string_builder(),
            Value::str(","),
            loc(),
        ));
        assert_eq!(v.as_str(), Some(""));
    }

    #[test]
    fn test_min_max_ties_first_seen() {
        let v = ready(drive(
            ReduceKind::Min,
            ints(&[3, 1, 2]),
            None,
            Value::Null,
            Value::Null,
            loc(),
        ));
        assert_eq!(v.as_int(), Some(1));

        let v = ready(drive(
            ReduceKind::Max,
            ints(&[3, 1, 2]),
            None,
            Value::Null,
            Value::Null,
            loc(),
        ));
        assert_eq!(v.as_int(), Some(3));
    }

    #[test]
    fn test_min_with_key_extractor() {
        // Minimize by absolute value
        let key = native_fn("abs", |args| {
            Ok(Value::Int(args[0].as_int().unwrap_or(0).abs()))
        });
        let v = ready(drive(
            ReduceKind::Min,
            ints(&[-5, 2, -1]),
            Some(key),
            Value::Null,
            Value::Null,
            loc(),
        ));
        assert_eq!(v.as_int(), Some(-1));
    }

    #[test]
    fn test_group_by() {
        let parity = native_fn("parity", |args| {
            Ok(Value::str(if args[0].as_int().unwrap_or(0) % 2 == 0 {
                "even"
            } else {
                "odd"
            }))
        });
        let v = ready(drive(
            ReduceKind::GroupBy,
            ints(&[1, 2, 3, 4]),
            Some(parity),
            Value::empty_map(),
            Value::Null,
            loc(),
        ));
        if let Value::Map(m) = v {
            let m = m.lock();
            let keys: Vec<String> = m.keys().cloned().collect();
            // Encounter order preserved
            assert_eq!(keys, vec!["odd", "even"]);
            if let Some(Value::List(l)) = m.get("odd") {
                assert_eq!(l.lock().len(), 2);
            }
        } else {
            panic!("expected map");
        }
    }

    #[test]
    fn test_transpose_pads_with_null() {
        let rows = vec![
            Value::list(vec![Value::Int(1), Value::Int(2)]),
            Value::list(vec![Value::Int(3), Value::Int(4)]),
            Value::list(vec![Value::Int(5)]),
        ];
        let v = ready(drive(
            ReduceKind::Transpose,
            IterValue::new(ListIter::new(rows)),
            None,
            Value::list(vec![]),
            Value::Null,
            loc(),
        ));
        if let Value::List(l) = v {
            let cols = l.lock().clone();
            assert_eq!(cols.len(), 2);
            if let Value::List(c0) = &cols[0] {
                let c0 = c0.lock().clone();
                assert_eq!(c0[0].as_int(), Some(1));
                assert_eq!(c0[1].as_int(), Some(3));
                assert_eq!(c0[2].as_int(), Some(5));
            }
            if let Value::List(c1) = &cols[1] {
                assert!(c1.lock()[2].is_null());
            }
        } else {
            panic!("expected list");
        }
    }

    #[test]
    fn test_size_counts() {
        let v = ready(drive(
            ReduceKind::Size,
            ints(&[5, 6, 7]),
            None,
            Value::Null,
            Value::Null,
            loc(),
        ));
        assert_eq!(v.as_int(), Some(3));
    }

    #[test]
    fn test_collect_entries_shape_mismatch() {
        let err = drive(
            ReduceKind::CollectEntries,
            ints(&[1]),
            None,
            Value::empty_map(),
            Value::Null,
            loc(),
        )
        .err()
        .unwrap();
        assert!(err.message.contains("two-element"));
    }
}
