//! Batching operators: grouped (disjoint) and sliding windows

use std::collections::VecDeque;

use quill_core::checkpoint::{CheckpointReader, CheckpointWriter};
use quill_core::error::RunResult;
use quill_core::suspend::{Continuation, IterValue, Step, StepResult, ValueIter};
use quill_core::value::Value;

use super::{bad_location, delivered_bool, exhausted, op_frame, read_iter, read_values, write_values, Via};

/// Emits batches of `size` elements.
///
/// With `step == size` batches are disjoint and the final batch may be
/// short; with `step == 1` the batches are overlapping windows and inputs
/// shorter than `size` produce nothing. `size == 0` is handled upstream
/// by returning the source unchanged; negative sizes error at
/// construction.
pub struct GroupedIter {
    upstream: IterValue,
    size: usize,
    step: usize,
    buf: VecDeque<Value>,
    upstream_done: bool,
    pending: Option<Value>,
}

impl GroupedIter {
    /// Create a grouped/windowed operator (`step = size` for disjoint
    /// batches, `step = 1` for sliding windows)
    pub fn new(upstream: IterValue, size: usize, step: usize) -> Self {
        Self {
            upstream,
            size,
            step,
            buf: VecDeque::new(),
            upstream_done: false,
            pending: None,
        }
    }

    fn sliding(&self) -> bool {
        self.step < self.size
    }

    // advance states: 0 dispatch (pure), 2 pull has_next, 3 receive
    // has_next, 4 pull element, 5 receive element
    fn advance(&mut self, via: Via, mut location: u32, mut incoming: Value) -> StepResult<bool> {
        loop {
            match location {
                0 => {
                    if self.buf.len() == self.size {
                        let window: Vec<Value> = self.buf.iter().cloned().collect();
                        for _ in 0..self.step {
                            self.buf.pop_front();
                        }
                        self.pending = Some(Value::list(window));
                        return Ok(Step::Ready(true));
                    }
                    if self.upstream_done {
                        if !self.sliding() && !self.buf.is_empty() {
                            // Final short batch
                            let partial: Vec<Value> = self.buf.drain(..).collect();
                            self.pending = Some(Value::list(partial));
                            return Ok(Step::Ready(true));
                        }
                        return Ok(Step::Ready(false));
                    }
                    location = 2;
                }
                2 => match self.upstream.has_next()? {
                    Step::Ready(true) => location = 4,
                    Step::Ready(false) => {
                        self.upstream_done = true;
                        location = 0;
                    }
                    Step::Suspended(c) => {
                        return Ok(Step::Suspended(c.push_frame(op_frame(
                            via,
                            3,
                            vec![],
                            vec![],
                        ))))
                    }
                },
                3 => {
                    if delivered_bool(&incoming)? {
                        location = 4;
                    } else {
                        self.upstream_done = true;
                        location = 0;
                    }
                }
                4 => match self.upstream.next()? {
                    Step::Ready(v) => {
                        self.buf.push_back(v);
                        location = 0;
                    }
                    Step::Suspended(c) => {
                        return Ok(Step::Suspended(c.push_frame(op_frame(
                            via,
                            5,
                            vec![],
                            vec![],
                        ))))
                    }
                },
                5 => {
                    self.buf.push_back(std::mem::take(&mut incoming));
                    location = 0;
                }
                other => return Err(bad_location(self.kind(), other)),
            }
        }
    }
}

impl ValueIter for GroupedIter {
    fn kind(&self) -> &'static str {
        "iter.grouped"
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
        match self.advance(Via::Next, 0, Value::Null)? {
            Step::Ready(true) => self
                .pending
                .take()
                .map(Step::Ready)
                .ok_or_else(|| bad_location(self.kind(), u32::MAX)),
            Step::Ready(false) => Err(exhausted()),
            Step::Suspended(c) => Ok(Step::Suspended(c)),
        }
    }

    fn resume_next(&mut self, frame: Continuation, result: Value) -> StepResult<Value> {
        match self.advance(Via::Next, frame.method_location, result)? {
            Step::Ready(true) => self
                .pending
                .take()
                .map(Step::Ready)
                .ok_or_else(|| bad_location(self.kind(), u32::MAX)),
            Step::Ready(false) => Err(exhausted()),
            Step::Suspended(c) => Ok(Step::Suspended(c)),
        }
    }

    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        w.write_value(&Value::Iterator(self.upstream.clone()))?;
        w.write_clong(self.size as i64)?;
        w.write_clong(self.step as i64)?;
        write_values(w, self.buf.iter().cloned().collect::<Vec<_>>().as_slice())?;
        w.write_bool(self.upstream_done)?;
        w.write_opt_value(self.pending.as_ref())
    }
}

/// Restore factory for [`GroupedIter`]
pub fn read_grouped_iter(r: &mut CheckpointReader<'_>) -> RunResult<Box<dyn ValueIter>> {
    let upstream = read_iter(r)?;
    let size = r.read_clong()? as usize;
    let step = r.read_clong()? as usize;
    let buf: VecDeque<Value> = read_values(r)?.into();
    let upstream_done = r.read_bool()?;
    let pending = r.read_opt_value()?;
    Ok(Box::new(GroupedIter {
        upstream,
        size,
        step,
        buf,
        upstream_done,
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

    fn drain_lists(it: IterValue) -> Vec<Vec<i32>> {
        let mut out = Vec::new();
        loop {
            match it.has_next().unwrap() {
                Step::Ready(true) => {}
                Step::Ready(false) => return out,
                Step::Suspended(_) => panic!("unexpected suspension"),
            }
            match it.next().unwrap() {
                Step::Ready(Value::List(l)) => out.push(
                    l.lock().iter().map(|v| v.as_int().unwrap()).collect(),
                ),
                Step::Ready(other) => panic!("expected list, got {}", other.type_name()),
                Step::Suspended(_) => panic!("unexpected suspension"),
            }
        }
    }

    #[test]
    fn test_grouped_even() {
        let it = IterValue::new(GroupedIter::new(ints(&[1, 2, 3, 4]), 2, 2));
        assert_eq!(drain_lists(it), vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_grouped_short_final_batch() {
        let it = IterValue::new(GroupedIter::new(ints(&[1, 2, 3]), 2, 2));
        assert_eq!(drain_lists(it), vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_window_sliding() {
        let it = IterValue::new(GroupedIter::new(ints(&[1, 2, 3]), 2, 1));
        assert_eq!(drain_lists(it), vec![vec![1, 2], vec![2, 3]]);
    }

    #[test]
    fn test_window_shorter_than_size() {
        let it = IterValue::new(GroupedIter::new(ints(&[1]), 2, 1));
        assert_eq!(drain_lists(it), Vec::<Vec<i32>>::new());
    }
}
