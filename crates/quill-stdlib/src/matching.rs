//! Short-circuiting match driver for allMatch / anyMatch / noneMatch
//!
//! Same shape as the reduce driver but with a decide step: `all` bails
//! false on the first rejected element, `any` bails true on the first
//! accepted one, `none` bails false. Empty input decides all → true,
//! any → false, none → true. Without a predicate, element truthiness is
//! the verdict.

use quill_core::error::{RunResult, RuntimeError, SourceLoc};
use quill_core::suspend::{
    Continuation, FunctionValue, IterValue, ResumeHandle, Step, StepResult,
};
use quill_core::value::Value;

use crate::iter::delivered_bool;

/// Resume-entry name for match frames
pub const RESUME_NAME: &str = "iter.match";

/// Which quantifier is being evaluated
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MatchKind {
    /// Every element must match
    All,
    /// At least one element must match
    Any,
    /// No element may match
    None,
}

impl MatchKind {
    fn tag(self) -> i64 {
        self as i64
    }

    fn from_tag(tag: i64) -> RunResult<Self> {
        Ok(match tag {
            0 => MatchKind::All,
            1 => MatchKind::Any,
            2 => MatchKind::None,
            other => {
                return Err(RuntimeError::msg(format!(
                    "Corrupt resume: unknown match kind {}",
                    other
                )))
            }
        })
    }

    fn on_empty(self) -> bool {
        match self {
            MatchKind::All | MatchKind::None => true,
            MatchKind::Any => false,
        }
    }

    /// Returns the short-circuit verdict for one element's match result,
    /// or None to keep scanning
    fn decide(self, matched: bool) -> Option<bool> {
        match (self, matched) {
            (MatchKind::All, false) => Some(false),
            (MatchKind::Any, true) => Some(true),
            (MatchKind::None, true) => Some(false),
            _ => None,
        }
    }
}

struct MatchState {
    kind: MatchKind,
    upstream: IterValue,
    pred: Option<FunctionValue>,
    elem: Value,
    loc: SourceLoc,
}

impl MatchState {
    fn frame(&self, location: u32) -> Continuation {
        let pred = match &self.pred {
            Some(f) => Value::Function(f.clone()),
            None => Value::Null,
        };
        Continuation::frame(
            ResumeHandle::Named(RESUME_NAME.into()),
            location,
            vec![self.kind.tag(), self.loc.offset as i64],
            vec![
                Value::Iterator(self.upstream.clone()),
                pred,
                self.elem.clone(),
                Value::str(self.loc.source.as_ref()),
            ],
        )
    }

    fn from_frame(mut frame: Continuation) -> RunResult<Self> {
        let kind = MatchKind::from_tag(frame.long_at(0))?;
        let offset = frame.long_at(1) as usize;
        let upstream = match frame.obj_at(0) {
            Value::Iterator(it) => it,
            other => {
                return Err(RuntimeError::msg(format!(
                    "Corrupt resume: match upstream is {}",
                    other.type_name()
                )))
            }
        };
        let pred = match frame.obj_at(1) {
            Value::Function(f) => Some(f),
            Value::Null => None,
            other => {
                return Err(RuntimeError::msg(format!(
                    "Corrupt resume: match predicate is {}",
                    other.type_name()
                )))
            }
        };
        let elem = frame.obj_at(2);
        let source = match frame.obj_at(3) {
            Value::Str(s) => s,
            _ => "".into(),
        };
        Ok(Self {
            kind,
            upstream,
            pred,
            elem,
            loc: SourceLoc { source, offset },
        })
    }
}

/// Evaluate a quantifier over an upstream iterator
pub fn drive(
    kind: MatchKind,
    upstream: IterValue,
    pred: Option<FunctionValue>,
    loc: SourceLoc,
) -> StepResult<Value> {
    let mut st = MatchState {
        kind,
        upstream,
        pred,
        elem: Value::Null,
        loc,
    };
    run(&mut st, 0, Value::Null)
}

/// Resume entry registered under [`RESUME_NAME`]
pub fn resume(frame: Continuation, result: Value) -> StepResult<Value> {
    let location = frame.method_location;
    let mut st = MatchState::from_frame(frame)?;
    run(&mut st, location, result)
}

// States: 0 pull-hasNext, 1 receive-hasNext, 2 pull-next, 3 receive-next,
// 4 apply-predicate, 5 receive-predicate, 6 decide (pure)
fn run(st: &mut MatchState, mut location: u32, mut incoming: Value) -> StepResult<Value> {
    loop {
        match location {
            0 => match st.upstream.has_next()? {
                Step::Ready(true) => location = 2,
                Step::Ready(false) => return Ok(Step::Ready(Value::Bool(st.kind.on_empty()))),
                Step::Suspended(c) => return Ok(Step::Suspended(c.push_frame(st.frame(1)))),
            },
            1 => {
                if !delivered_bool(&incoming)? {
                    return Ok(Step::Ready(Value::Bool(st.kind.on_empty())));
                }
                location = 2;
            }
            2 => match st.upstream.next()? {
                Step::Ready(v) => {
                    st.elem = v;
                    location = 4;
                }
                Step::Suspended(c) => return Ok(Step::Suspended(c.push_frame(st.frame(3)))),
            },
            3 => {
                st.elem = std::mem::take(&mut incoming);
                location = 4;
            }
            4 => match &st.pred {
                None => {
                    incoming = Value::Bool(st.elem.is_truthy());
                    location = 6;
                }
                Some(p) => match p.invoke(&[st.elem.clone()])? {
                    Step::Ready(v) => {
                        incoming = v;
                        location = 6;
                    }
                    Step::Suspended(c) => {
                        return Ok(Step::Suspended(c.push_frame(st.frame(5))))
                    }
                },
            },
            5 => location = 6,
            6 => {
                let matched = std::mem::take(&mut incoming).is_truthy();
                if let Some(verdict) = st.kind.decide(matched) {
                    return Ok(Step::Ready(Value::Bool(verdict)));
                }
                location = 0;
            }
            other => {
                return Err(RuntimeError::msg(format!(
                    "Corrupt resume: match driver has no state {}",
                    other
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::ListIter;
    use quill_core::suspend::native_fn;

    fn ints(vals: &[i32]) -> IterValue {
        IterValue::new(ListIter::new(vals.iter().map(|i| Value::Int(*i)).collect()))
    }

    fn verdict(kind: MatchKind, vals: &[i32], pred: Option<FunctionValue>) -> bool {
        match drive(kind, ints(vals), pred, SourceLoc::internal()).unwrap() {
            Step::Ready(v) => v.as_bool().unwrap(),
            Step::Suspended(_) => panic!("unexpected suspension"),
        }
    }

    fn positive() -> FunctionValue {
        native_fn("positive", |args| {
            Ok(Value::Bool(args[0].as_int().unwrap_or(0) > 0))
        })
    }

    #[test]
    fn test_all_match() {
        assert!(verdict(MatchKind::All, &[1, 2, 3], Some(positive())));
        assert!(!verdict(MatchKind::All, &[1, -2, 3], Some(positive())));
    }

    #[test]
    fn test_any_match() {
        assert!(verdict(MatchKind::Any, &[-1, 2], Some(positive())));
        assert!(!verdict(MatchKind::Any, &[-1, -2], Some(positive())));
    }

    #[test]
    fn test_none_match() {
        assert!(verdict(MatchKind::None, &[-1, -2], Some(positive())));
        assert!(!verdict(MatchKind::None, &[-1, 2], Some(positive())));
    }

    #[test]
    fn test_empty_input_verdicts() {
        assert!(verdict(MatchKind::All, &[], Some(positive())));
        assert!(verdict(MatchKind::None, &[], Some(positive())));
        assert!(!verdict(MatchKind::Any, &[], Some(positive())));
    }

    #[test]
    fn test_default_predicate_is_truthiness() {
        assert!(verdict(MatchKind::All, &[1, 2], None));
        assert!(!verdict(MatchKind::All, &[1, 0], None));
        assert!(verdict(MatchKind::Any, &[0, 5], None));
    }

    #[test]
    fn test_short_circuit_stops_pulling() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let pred = native_fn("count_calls", move |args| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Bool(args[0].as_int().unwrap_or(0) > 0))
        });
        assert!(verdict(MatchKind::Any, &[5, 1, 2, 3], Some(pred)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
