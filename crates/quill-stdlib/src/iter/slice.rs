//! Positional operators: skip, limit, unique
//!
//! None of these take user callbacks, so they only suspend through their
//! upstream. Negative counts use bounded rings: `skip(-n)` drops the last
//! n elements (the upstream must be finite for the ring to see its end),
//! `limit(-n)` emits everything but the last n.

use std::collections::VecDeque;

use quill_core::checkpoint::{CheckpointReader, CheckpointWriter};
use quill_core::error::RunResult;
use quill_core::stringify::deep_equals;
use quill_core::suspend::{Continuation, IterValue, Step, StepResult, ValueIter};
use quill_core::value::Value;

use super::{bad_location, delivered_bool, exhausted, op_frame, read_iter, read_values, write_values, Via};

// advance states shared by the three operators in this module:
// 0 pull has_next, 1 receive has_next, 2 pull element, 3 receive element,
// 4 integrate (pure)
macro_rules! pull_loop {
    ($self:ident, $via:ident, $location:ident, $incoming:ident, $integrate:expr) => {
        loop {
            match $location {
                0 => match $self.upstream.has_next()? {
                    Step::Ready(true) => $location = 2,
                    Step::Ready(false) => return $self.on_upstream_end(),
                    Step::Suspended(c) => {
                        return Ok(Step::Suspended(c.push_frame(op_frame(
                            $via,
                            1,
                            vec![],
                            vec![],
                        ))))
                    }
                },
                1 => {
                    if !delivered_bool(&$incoming)? {
                        return $self.on_upstream_end();
                    }
                    $location = 2;
                }
                2 => match $self.upstream.next()? {
                    Step::Ready(v) => {
                        $incoming = v;
                        $location = 3;
                    }
                    Step::Suspended(c) => {
                        return Ok(Step::Suspended(c.push_frame(op_frame(
                            $via,
                            3,
                            vec![],
                            vec![],
                        ))))
                    }
                },
                3 => {
                    let elem = std::mem::take(&mut $incoming);
                    #[allow(clippy::redundant_closure_call)]
                    if ($integrate)($self, elem)? {
                        return Ok(Step::Ready(true));
                    }
                    $location = 0;
                }
                other => return Err(bad_location($self.kind_name(), other)),
            }
        }
    };
}

fn emit_pending(pending: &mut Option<Value>, advanced: Step<bool>) -> StepResult<Value> {
    match advanced {
        Step::Ready(true) => pending
            .take()
            .map(Step::Ready)
            .ok_or_else(|| bad_location("slice operator", u32::MAX)),
        Step::Ready(false) => Err(exhausted()),
        Step::Suspended(c) => Ok(Step::Suspended(c)),
    }
}

// ============================================================================
// skip
// ============================================================================

/// Drops the first `n` elements, or — for negative `n` — the last `|n|`
/// using a bounded ring buffer (requires a finite upstream).
pub struct SkipIter {
    upstream: IterValue,
    n: i64,
    skipped: i64,
    ring: VecDeque<Value>,
    pending: Option<Value>,
}

impl SkipIter {
    /// Create a skip operator
    pub fn new(upstream: IterValue, n: i64) -> Self {
        Self {
            upstream,
            n,
            skipped: 0,
            ring: VecDeque::new(),
            pending: None,
        }
    }

    fn kind_name(&self) -> &'static str {
        "iter.skip"
    }

    fn on_upstream_end(&mut self) -> StepResult<bool> {
        // Whatever remains in the ring is exactly the dropped tail
        Ok(Step::Ready(false))
    }

    fn integrate(&mut self, elem: Value) -> RunResult<bool> {
        if self.n >= 0 {
            if self.skipped < self.n {
                self.skipped += 1;
                return Ok(false);
            }
            self.pending = Some(elem);
            return Ok(true);
        }
        let keep_back = (-self.n) as usize;
        self.ring.push_back(elem);
        if self.ring.len() > keep_back {
            self.pending = self.ring.pop_front();
            return Ok(true);
        }
        Ok(false)
    }

    fn advance(&mut self, via: Via, mut location: u32, mut incoming: Value) -> StepResult<bool> {
        pull_loop!(self, via, location, incoming, |s: &mut Self, elem| s
            .integrate(elem))
    }
}

impl ValueIter for SkipIter {
    fn kind(&self) -> &'static str {
        "iter.skip"
    }

    fn has_next(&mut self) -> StepResult<bool> {
        if self.pending.is_some() {
            return Ok(Step::Ready(true));
        }
        self.advance(Via::HasNext, 0, Value::Null)
    }

    fn resume_has_next(&mut self, frame: Continuation, result: Value) -> StepResult<bool> {
        self.advance(Via::HasNext, frame.method_location, result)
    }

    fn next(&mut self) -> StepResult<Value> {
        if let Some(v) = self.pending.take() {
            return Ok(Step::Ready(v));
        }
        let advanced = self.advance(Via::Next, 0, Value::Null)?;
        emit_pending(&mut self.pending, advanced)
    }

    fn resume_next(&mut self, frame: Continuation, result: Value) -> StepResult<Value> {
        let advanced = self.advance(Via::Next, frame.method_location, result)?;
        emit_pending(&mut self.pending, advanced)
    }

    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        w.write_value(&Value::Iterator(self.upstream.clone()))?;
        w.write_clong(self.n)?;
        w.write_clong(self.skipped)?;
        write_values(w, self.ring.iter().cloned().collect::<Vec<_>>().as_slice())?;
        w.write_opt_value(self.pending.as_ref())
    }
}

/// Restore factory for [`SkipIter`]
pub fn read_skip_iter(r: &mut CheckpointReader<'_>) -> RunResult<Box<dyn ValueIter>> {
    let upstream = read_iter(r)?;
    let n = r.read_clong()?;
    let skipped = r.read_clong()?;
    let ring: VecDeque<Value> = read_values(r)?.into();
    let pending = r.read_opt_value()?;
    Ok(Box::new(SkipIter {
        upstream,
        n,
        skipped,
        ring,
        pending,
    }))
}

// ============================================================================
// limit
// ============================================================================

/// Emits the first `n` elements, or — for negative `n` — everything but
/// the last `|n|` using a bounded lookahead ring.
pub struct LimitIter {
    upstream: IterValue,
    n: i64,
    emitted: i64,
    ring: VecDeque<Value>,
    pending: Option<Value>,
}

impl LimitIter {
    /// Create a limit operator
    pub fn new(upstream: IterValue, n: i64) -> Self {
        Self {
            upstream,
            n,
            emitted: 0,
            ring: VecDeque::new(),
            pending: None,
        }
    }

    fn kind_name(&self) -> &'static str {
        "iter.limit"
    }

    fn on_upstream_end(&mut self) -> StepResult<bool> {
        Ok(Step::Ready(false))
    }

    fn integrate(&mut self, elem: Value) -> RunResult<bool> {
        if self.n >= 0 {
            // The pull is only reached while emitted < n
            self.pending = Some(elem);
            self.emitted += 1;
            return Ok(true);
        }
        let hold_back = (-self.n) as usize;
        self.ring.push_back(elem);
        if self.ring.len() > hold_back {
            self.pending = self.ring.pop_front();
            return Ok(true);
        }
        Ok(false)
    }

    fn advance(&mut self, via: Via, mut location: u32, mut incoming: Value) -> StepResult<bool> {
        if location == 0 && self.n >= 0 && self.emitted >= self.n {
            // Short-circuit: never pulls the upstream past the limit
            return Ok(Step::Ready(false));
        }
        pull_loop!(self, via, location, incoming, |s: &mut Self, elem| s
            .integrate(elem))
    }
}

impl ValueIter for LimitIter {
    fn kind(&self) -> &'static str {
        "iter.limit"
    }

    fn has_next(&mut self) -> StepResult<bool> {
        if self.pending.is_some() {
            return Ok(Step::Ready(true));
        }
        self.advance(Via::HasNext, 0, Value::Null)
    }

    fn resume_has_next(&mut self, frame: Continuation, result: Value) -> StepResult<bool> {
        self.advance(Via::HasNext, frame.method_location, result)
    }

    fn next(&mut self) -> StepResult<Value> {
        if let Some(v) = self.pending.take() {
            return Ok(Step::Ready(v));
        }
        let advanced = self.advance(Via::Next, 0, Value::Null)?;
        emit_pending(&mut self.pending, advanced)
    }

    fn resume_next(&mut self, frame: Continuation, result: Value) -> StepResult<Value> {
        let advanced = self.advance(Via::Next, frame.method_location, result)?;
        emit_pending(&mut self.pending, advanced)
    }

    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        w.write_value(&Value::Iterator(self.upstream.clone()))?;
        w.write_clong(self.n)?;
        w.write_clong(self.emitted)?;
        write_values(w, self.ring.iter().cloned().collect::<Vec<_>>().as_slice())?;
        w.write_opt_value(self.pending.as_ref())
    }
}

/// Restore factory for [`LimitIter`]
pub fn read_limit_iter(r: &mut CheckpointReader<'_>) -> RunResult<Box<dyn ValueIter>> {
    let upstream = read_iter(r)?;
    let n = r.read_clong()?;
    let emitted = r.read_clong()?;
    let ring: VecDeque<Value> = read_values(r)?.into();
    let pending = r.read_opt_value()?;
    Ok(Box::new(LimitIter {
        upstream,
        n,
        emitted,
        ring,
        pending,
    }))
}

// ============================================================================
// unique
// ============================================================================

/// Deduplicates by deep equality, preserving first occurrences
pub struct UniqueIter {
    upstream: IterValue,
    seen: Vec<Value>,
    pending: Option<Value>,
}

impl UniqueIter {
    /// Create a unique operator
    pub fn new(upstream: IterValue) -> Self {
        Self {
            upstream,
            seen: Vec::new(),
            pending: None,
        }
    }

    fn kind_name(&self) -> &'static str {
        "iter.unique"
    }

    fn on_upstream_end(&mut self) -> StepResult<bool> {
        Ok(Step::Ready(false))
    }

    fn integrate(&mut self, elem: Value) -> RunResult<bool> {
        if self.seen.iter().any(|s| deep_equals(s, &elem)) {
            return Ok(false);
        }
        self.seen.push(elem.clone());
        self.pending = Some(elem);
        Ok(true)
    }

    fn advance(&mut self, via: Via, mut location: u32, mut incoming: Value) -> StepResult<bool> {
        pull_loop!(self, via, location, incoming, |s: &mut Self, elem| s
            .integrate(elem))
    }
}

impl ValueIter for UniqueIter {
    fn kind(&self) -> &'static str {
        "iter.unique"
    }

    fn has_next(&mut self) -> StepResult<bool> {
        if self.pending.is_some() {
            return Ok(Step::Ready(true));
        }
        self.advance(Via::HasNext, 0, Value::Null)
    }

    fn resume_has_next(&mut self, frame: Continuation, result: Value) -> StepResult<bool> {
        self.advance(Via::HasNext, frame.method_location, result)
    }

    fn next(&mut self) -> StepResult<Value> {
        if let Some(v) = self.pending.take() {
            return Ok(Step::Ready(v));
        }
        let advanced = self.advance(Via::Next, 0, Value::Null)?;
        emit_pending(&mut self.pending, advanced)
    }

    fn resume_next(&mut self, frame: Continuation, result: Value) -> StepResult<Value> {
        let advanced = self.advance(Via::Next, frame.method_location, result)?;
        emit_pending(&mut self.pending, advanced)
    }

    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        w.write_value(&Value::Iterator(self.upstream.clone()))?;
        write_values(w, &self.seen)?;
        w.write_opt_value(self.pending.as_ref())
    }
}

/// Restore factory for [`UniqueIter`]
pub fn read_unique_iter(r: &mut CheckpointReader<'_>) -> RunResult<Box<dyn ValueIter>> {
    let upstream = read_iter(r)?;
    let seen = read_values(r)?;
    let pending = r.read_opt_value()?;
    Ok(Box::new(UniqueIter {
        upstream,
        seen,
        pending,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::ListIter;

    fn ints(vals: &[i32]) -> IterValue {
        IterValue::new(ListIter::new(vals.iter().map(|i| Value::Int(*i)).collect()))
    }

    fn drain_ints(it: IterValue) -> Vec<i32> {
        let mut out = Vec::new();
        loop {
            match it.has_next().unwrap() {
                Step::Ready(true) => {}
                Step::Ready(false) => return out,
                Step::Suspended(_) => panic!("unexpected suspension"),
            }
            match it.next().unwrap() {
                Step::Ready(v) => out.push(v.as_int().unwrap()),
                Step::Suspended(_) => panic!("unexpected suspension"),
            }
        }
    }

    #[test]
    fn test_skip_positive() {
        let it = IterValue::new(SkipIter::new(ints(&[1, 2, 3, 4]), 2));
        assert_eq!(drain_ints(it), vec![3, 4]);
    }

    #[test]
    fn test_skip_negative_drops_tail() {
        let it = IterValue::new(SkipIter::new(ints(&[1, 2, 3, 4, 5]), -2));
        assert_eq!(drain_ints(it), vec![1, 2, 3]);
    }

    #[test]
    fn test_skip_negative_short_input() {
        let it = IterValue::new(SkipIter::new(ints(&[1, 2]), -3));
        assert_eq!(drain_ints(it), Vec::<i32>::new());
    }

    #[test]
    fn test_limit_positive() {
        let it = IterValue::new(LimitIter::new(ints(&[1, 2, 3, 4]), 2));
        assert_eq!(drain_ints(it), vec![1, 2]);
    }

    #[test]
    fn test_limit_zero() {
        let it = IterValue::new(LimitIter::new(ints(&[1, 2]), 0));
        assert_eq!(drain_ints(it), Vec::<i32>::new());
    }

    #[test]
    fn test_limit_negative_drops_tail() {
        let it = IterValue::new(LimitIter::new(ints(&[1, 2, 3, 4, 5]), -2));
        assert_eq!(drain_ints(it), vec![1, 2, 3]);
    }

    #[test]
    fn test_unique_dedupes_by_equality() {
        let it = IterValue::new(UniqueIter::new(ints(&[1, 2, 1, 3, 2])));
        assert_eq!(drain_ints(it), vec![1, 2, 3]);
    }

    #[test]
    fn test_unique_numeric_widening() {
        let vals = vec![Value::Int(1), Value::Float(1.0), Value::Long(2)];
        let it = IterValue::new(UniqueIter::new(IterValue::new(ListIter::new(vals))));
        let mut out = Vec::new();
        loop {
            match it.has_next().unwrap() {
                Step::Ready(true) => {}
                _ => break,
            }
            if let Step::Ready(v) = it.next().unwrap() {
                out.push(v);
            }
        }
        // 1 and 1.0 are mathematically equal
        assert_eq!(out.len(), 2);
    }
}
