//! Materializing operators: reverse and sort
//!
//! Both consume the upstream to completion on the first pull. Sort is a
//! stable bottom-up merge sort whose pass state `(width, outer)` and merge
//! state `(i1, i2, d, end1, end2)` plus both buffers survive comparator
//! suspensions, so a comparator that parks the fiber resumes mid-merge
//! without losing its place.

use quill_core::checkpoint::{CheckpointReader, CheckpointWriter};
use quill_core::error::{RunResult, RuntimeError, SourceLoc};
use quill_core::num;
use quill_core::suspend::{
    Continuation, FunctionValue, IterValue, Step, StepResult, ValueIter,
};
use quill_core::value::Value;

use super::{
    bad_location, delivered_bool, delivered_sign, exhausted, op_frame, read_iter, read_opt_fn,
    read_values, write_opt_fn, write_values, Via,
};

// ============================================================================
// reverse
// ============================================================================

/// Materializes the upstream, then emits it back to front
pub struct ReverseIter {
    upstream: IterValue,
    items: Vec<Value>,
    done_gathering: bool,
    pos: usize,
}

impl ReverseIter {
    /// Create a reverse operator
    pub fn new(upstream: IterValue) -> Self {
        Self {
            upstream,
            items: Vec::new(),
            done_gathering: false,
            pos: 0,
        }
    }

    // gather states: 0 pull has_next, 1 receive has_next, 2 pull element,
    // 3 receive element
    fn gather(&mut self, via: Via, mut location: u32, mut incoming: Value) -> StepResult<()> {
        loop {
            if self.done_gathering {
                return Ok(Step::Ready(()));
            }
            match location {
                0 => match self.upstream.has_next()? {
                    Step::Ready(true) => location = 2,
                    Step::Ready(false) => {
                        self.items.reverse();
                        self.done_gathering = true;
                    }
                    Step::Suspended(c) => {
                        return Ok(Step::Suspended(c.push_frame(op_frame(
                            via,
                            1,
                            vec![],
                            vec![],
                        ))))
                    }
                },
                1 => {
                    if delivered_bool(&incoming)? {
                        location = 2;
                    } else {
                        self.items.reverse();
                        self.done_gathering = true;
                    }
                }
                2 => match self.upstream.next()? {
                    Step::Ready(v) => {
                        self.items.push(v);
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
                    self.items.push(std::mem::take(&mut incoming));
                    location = 0;
                }
                other => return Err(bad_location(self.kind(), other)),
            }
        }
    }

    fn emit(&mut self, gathered: Step<()>) -> StepResult<Value> {
        match gathered {
            Step::Ready(()) => match self.items.get(self.pos) {
                Some(v) => {
                    let v = v.clone();
                    self.pos += 1;
                    Ok(Step::Ready(v))
                }
                None => Err(exhausted()),
            },
            Step::Suspended(c) => Ok(Step::Suspended(c)),
        }
    }
}

impl ValueIter for ReverseIter {
    fn kind(&self) -> &'static str {
        "iter.reverse"
    }

    fn has_next(&mut self) -> StepResult<bool> {
        match self.gather(Via::HasNext, 0, Value::Null)? {
            Step::Ready(()) => Ok(Step::Ready(self.pos < self.items.len())),
            Step::Suspended(c) => Ok(Step::Suspended(c)),
        }
    }

    fn resume_has_next(&mut self, frame: Continuation, result: Value) -> StepResult<bool> {
        match self.gather(Via::HasNext, frame.method_location, result)? {
            Step::Ready(()) => Ok(Step::Ready(self.pos < self.items.len())),
            Step::Suspended(c) => Ok(Step::Suspended(c)),
        }
    }

    fn next(&mut self) -> StepResult<Value> {
        let gathered = self.gather(Via::Next, 0, Value::Null)?;
        self.emit(gathered)
    }

    fn resume_next(&mut self, frame: Continuation, result: Value) -> StepResult<Value> {
        let gathered = self.gather(Via::Next, frame.method_location, result)?;
        self.emit(gathered)
    }

    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        w.write_value(&Value::Iterator(self.upstream.clone()))?;
        write_values(w, &self.items)?;
        w.write_bool(self.done_gathering)?;
        w.write_clong(self.pos as i64)
    }
}

/// Restore factory for [`ReverseIter`]
pub fn read_reverse_iter(r: &mut CheckpointReader<'_>) -> RunResult<Box<dyn ValueIter>> {
    let upstream = read_iter(r)?;
    let items = read_values(r)?;
    let done_gathering = r.read_bool()?;
    let pos = r.read_clong()? as usize;
    Ok(Box::new(ReverseIter {
        upstream,
        items,
        done_gathering,
        pos,
    }))
}

// ============================================================================
// sort
// ============================================================================

const PHASE_GATHER: u8 = 0;
const PHASE_SORT: u8 = 1;
const PHASE_DONE: u8 = 2;

/// Materializes the upstream, then sorts it with a stable bottom-up merge
/// sort. Natural ordering when no comparator is given; the comparator
/// receives `(a, b)` and returns a negative, zero, or positive number.
pub struct SortIter {
    upstream: IterValue,
    cmp: Option<FunctionValue>,
    phase: u8,
    src: Vec<Value>,
    dst: Vec<Value>,
    width: usize,
    outer: usize,
    merging: bool,
    i1: usize,
    i2: usize,
    d: usize,
    end1: usize,
    end2: usize,
    pos: usize,
}

impl SortIter {
    /// Create a sort operator
    pub fn new(upstream: IterValue, cmp: Option<FunctionValue>) -> Self {
        Self {
            upstream,
            cmp,
            phase: PHASE_GATHER,
            src: Vec::new(),
            dst: Vec::new(),
            width: 0,
            outer: 0,
            merging: false,
            i1: 0,
            i2: 0,
            d: 0,
            end1: 0,
            end2: 0,
            pos: 0,
        }
    }

    fn begin_sort(&mut self) {
        if self.src.len() < 2 {
            self.phase = PHASE_DONE;
            return;
        }
        self.dst = vec![Value::Null; self.src.len()];
        self.width = 1;
        self.outer = 0;
        self.merging = false;
        self.phase = PHASE_SORT;
    }

    fn place(&mut self, sign: i64) {
        // Ties take the left run, which keeps the sort stable
        if sign <= 0 {
            self.dst[self.d] = self.src[self.i1].clone();
            self.i1 += 1;
        } else {
            self.dst[self.d] = self.src[self.i2].clone();
            self.i2 += 1;
        }
        self.d += 1;
    }

    fn compare_pair(&mut self) -> StepResult<i64> {
        let a = self.src[self.i1].clone();
        let b = self.src[self.i2].clone();
        match &self.cmp {
            None => {
                let ord = num::compare(&a, &b, &SourceLoc::internal())?;
                Ok(Step::Ready(ord as i64))
            }
            Some(f) => match f.invoke(&[a, b])? {
                Step::Ready(v) => Ok(Step::Ready(delivered_sign(&v)?)),
                Step::Suspended(c) => Ok(Step::Suspended(c)),
            },
        }
    }

    // The only suspension point in the sort phase is the comparator; its
    // frame resumes at location 5 with the comparison result. Gather
    // states are 0..=3 as in the other materializing operators.
    fn advance(&mut self, via: Via, mut location: u32, mut incoming: Value) -> StepResult<()> {
        loop {
            match self.phase {
                PHASE_GATHER => match location {
                    0 => match self.upstream.has_next()? {
                        Step::Ready(true) => location = 2,
                        Step::Ready(false) => {
                            self.begin_sort();
                            location = 0;
                        }
                        Step::Suspended(c) => {
                            return Ok(Step::Suspended(c.push_frame(op_frame(
                                via,
                                1,
                                vec![],
                                vec![],
                            ))))
                        }
                    },
                    1 => {
                        if delivered_bool(&incoming)? {
                            location = 2;
                        } else {
                            self.begin_sort();
                            location = 0;
                        }
                        incoming = Value::Null;
                    }
                    2 => match self.upstream.next()? {
                        Step::Ready(v) => {
                            self.src.push(v);
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
                        self.src.push(std::mem::take(&mut incoming));
                        location = 0;
                    }
                    other => return Err(bad_location(self.kind(), other)),
                },
                PHASE_SORT => {
                    if location == 5 {
                        let sign = delivered_sign(&incoming)?;
                        incoming = Value::Null;
                        location = 0;
                        self.place(sign);
                        continue;
                    }
                    let n = self.src.len();
                    if self.width >= n {
                        self.phase = PHASE_DONE;
                        continue;
                    }
                    if !self.merging {
                        if self.outer >= n {
                            std::mem::swap(&mut self.src, &mut self.dst);
                            self.width *= 2;
                            self.outer = 0;
                            continue;
                        }
                        self.end1 = (self.outer + self.width).min(n);
                        self.end2 = (self.outer + 2 * self.width).min(n);
                        self.i1 = self.outer;
                        self.i2 = self.end1;
                        self.d = self.outer;
                        self.merging = true;
                        continue;
                    }
                    if self.i1 < self.end1 && self.i2 < self.end2 {
                        match self.compare_pair()? {
                            Step::Ready(sign) => self.place(sign),
                            Step::Suspended(c) => {
                                return Ok(Step::Suspended(c.push_frame(op_frame(
                                    via,
                                    5,
                                    vec![],
                                    vec![],
                                ))))
                            }
                        }
                    } else {
                        while self.i1 < self.end1 {
                            self.dst[self.d] = self.src[self.i1].clone();
                            self.i1 += 1;
                            self.d += 1;
                        }
                        while self.i2 < self.end2 {
                            self.dst[self.d] = self.src[self.i2].clone();
                            self.i2 += 1;
                            self.d += 1;
                        }
                        self.merging = false;
                        self.outer += 2 * self.width;
                    }
                }
                _ => return Ok(Step::Ready(())),
            }
        }
    }

    fn emit(&mut self, advanced: Step<()>) -> StepResult<Value> {
        match advanced {
            Step::Ready(()) => match self.src.get(self.pos) {
                Some(v) => {
                    let v = v.clone();
                    self.pos += 1;
                    Ok(Step::Ready(v))
                }
                None => Err(exhausted()),
            },
            Step::Suspended(c) => Ok(Step::Suspended(c)),
        }
    }
}

impl ValueIter for SortIter {
    fn kind(&self) -> &'static str {
        "iter.sort"
    }

    fn has_next(&mut self) -> StepResult<bool> {
        match self.advance(Via::HasNext, 0, Value::Null)? {
            Step::Ready(()) => Ok(Step::Ready(self.pos < self.src.len())),
            Step::Suspended(c) => Ok(Step::Suspended(c)),
        }
    }

    fn resume_has_next(&mut self, frame: Continuation, result: Value) -> StepResult<bool> {
        match self.advance(Via::HasNext, frame.method_location, result)? {
            Step::Ready(()) => Ok(Step::Ready(self.pos < self.src.len())),
            Step::Suspended(c) => Ok(Step::Suspended(c)),
        }
    }

    fn next(&mut self) -> StepResult<Value> {
        let advanced = self.advance(Via::Next, 0, Value::Null)?;
        self.emit(advanced)
    }

    fn resume_next(&mut self, frame: Continuation, result: Value) -> StepResult<Value> {
        let advanced = self.advance(Via::Next, frame.method_location, result)?;
        self.emit(advanced)
    }

    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        w.write_value(&Value::Iterator(self.upstream.clone()))?;
        write_opt_fn(w, self.cmp.as_ref())?;
        w.write_u8(self.phase)?;
        write_values(w, &self.src)?;
        write_values(w, &self.dst)?;
        for scalar in [
            self.width, self.outer, self.i1, self.i2, self.d, self.end1, self.end2, self.pos,
        ] {
            w.write_clong(scalar as i64)?;
        }
        w.write_bool(self.merging)
    }
}

/// Restore factory for [`SortIter`]
pub fn read_sort_iter(r: &mut CheckpointReader<'_>) -> RunResult<Box<dyn ValueIter>> {
    let upstream = read_iter(r)?;
    let cmp = read_opt_fn(r)?;
    let phase = r.read_u8()?;
    if phase > PHASE_DONE {
        return Err(RuntimeError::msg("Corrupt checkpoint: bad sort phase"));
    }
    let src = read_values(r)?;
    let dst = read_values(r)?;
    let mut scalars = [0usize; 8];
    for s in scalars.iter_mut() {
        *s = r.read_clong()? as usize;
    }
    let merging = r.read_bool()?;
    Ok(Box::new(SortIter {
        upstream,
        cmp,
        phase,
        src,
        dst,
        width: scalars[0],
        outer: scalars[1],
        i1: scalars[2],
        i2: scalars[3],
        d: scalars[4],
        end1: scalars[5],
        end2: scalars[6],
        pos: scalars[7],
        merging,
    }))
}
