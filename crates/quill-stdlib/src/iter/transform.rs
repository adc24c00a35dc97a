//! Element-transforming operators: map, mapWithIndex, filter, flatMap

use quill_core::checkpoint::{CheckpointReader, CheckpointWriter};
use quill_core::error::{RunResult, SourceLoc};
use quill_core::suspend::{
    Continuation, FunctionValue, IterValue, Step, StepResult, ValueIter,
};
use quill_core::value::Value;

use super::{
    bad_location, delivered_bool, exhausted, flat_source, op_frame, read_fn, read_iter,
    read_opt_fn, write_opt_fn, Via,
};

// ============================================================================
// map / mapWithIndex
// ============================================================================

/// Lazily applies a mapper to each upstream element.
///
/// With `with_index` set the mapper receives `(element, zeroBasedIndex)`.
pub struct MapIter {
    upstream: IterValue,
    mapper: FunctionValue,
    with_index: bool,
    index: i64,
}

impl MapIter {
    /// Create a map operator
    pub fn new(upstream: IterValue, mapper: FunctionValue, with_index: bool) -> Self {
        Self {
            upstream,
            mapper,
            with_index,
            index: 0,
        }
    }

    // next() states: 0 pull element, 1 receive element, 2 apply mapper,
    // 3 receive mapped value
    fn next_from(&mut self, location: u32, incoming: Value) -> StepResult<Value> {
        let elem = match location {
            0 => match self.upstream.next()? {
                Step::Ready(v) => v,
                Step::Suspended(c) => {
                    return Ok(Step::Suspended(c.push_frame(op_frame(
                        Via::Next,
                        1,
                        vec![],
                        vec![],
                    ))))
                }
            },
            1 => incoming,
            3 => return Ok(Step::Ready(incoming)),
            other => return Err(bad_location(self.kind(), other)),
        };

        let idx = self.index;
        self.index += 1;
        let args = if self.with_index {
            vec![elem, Value::Long(idx)]
        } else {
            vec![elem]
        };
        match self.mapper.invoke(&args)? {
            Step::Ready(v) => Ok(Step::Ready(v)),
            Step::Suspended(c) => Ok(Step::Suspended(c.push_frame(op_frame(
                Via::Next,
                3,
                vec![],
                vec![],
            )))),
        }
    }
}

impl ValueIter for MapIter {
    fn kind(&self) -> &'static str {
        "iter.map"
    }

    fn has_next(&mut self) -> StepResult<bool> {
        match self.upstream.has_next()? {
            Step::Ready(b) => Ok(Step::Ready(b)),
            Step::Suspended(c) => Ok(Step::Suspended(c.push_frame(op_frame(
                Via::HasNext,
                1,
                vec![],
                vec![],
            )))),
        }
    }

    fn resume_has_next(&mut self, frame: Continuation, result: Value) -> StepResult<bool> {
        match frame.method_location {
            1 => Ok(Step::Ready(delivered_bool(&result)?)),
            other => Err(bad_location(self.kind(), other)),
        }
    }

    fn next(&mut self) -> StepResult<Value> {
        self.next_from(0, Value::Null)
    }

    fn resume_next(&mut self, frame: Continuation, result: Value) -> StepResult<Value> {
        self.next_from(frame.method_location, result)
    }

    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        w.write_value(&Value::Iterator(self.upstream.clone()))?;
        w.write_value(&Value::Function(self.mapper.clone()))?;
        w.write_bool(self.with_index)?;
        w.write_clong(self.index)
    }
}

/// Restore factory for [`MapIter`]
pub fn read_map_iter(r: &mut CheckpointReader<'_>) -> RunResult<Box<dyn ValueIter>> {
    let upstream = read_iter(r)?;
    let mapper = read_fn(r)?;
    let with_index = r.read_bool()?;
    let index = r.read_clong()?;
    Ok(Box::new(MapIter {
        upstream,
        mapper,
        with_index,
        index,
    }))
}

// ============================================================================
// filter
// ============================================================================

/// Retains elements the predicate accepts; with no predicate, truthy
/// elements are retained.
pub struct FilterIter {
    upstream: IterValue,
    pred: Option<FunctionValue>,
    pending: Option<Value>,
}

impl FilterIter {
    /// Create a filter operator
    pub fn new(upstream: IterValue, pred: Option<FunctionValue>) -> Self {
        Self {
            upstream,
            pred,
            pending: None,
        }
    }

    // advance states: 0 pull has_next, 1 receive has_next, 2 pull element,
    // 3 receive element, 4 apply predicate, 5 receive predicate result
    // (the element rides in the frame across a predicate suspension)
    fn advance(
        &mut self,
        via: Via,
        location: u32,
        incoming: Value,
        saved: Value,
    ) -> StepResult<bool> {
        let mut location = location;
        let mut incoming = incoming;
        let mut elem = saved;
        loop {
            match location {
                0 => match self.upstream.has_next()? {
                    Step::Ready(true) => location = 2,
                    Step::Ready(false) => return Ok(Step::Ready(false)),
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
                    if !delivered_bool(&incoming)? {
                        return Ok(Step::Ready(false));
                    }
                    location = 2;
                }
                2 => match self.upstream.next()? {
                    Step::Ready(v) => {
                        elem = v;
                        location = 4;
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
                    elem = std::mem::take(&mut incoming);
                    location = 4;
                }
                4 => match &self.pred {
                    None => {
                        if elem.is_truthy() {
                            self.pending = Some(elem);
                            return Ok(Step::Ready(true));
                        }
                        location = 0;
                    }
                    Some(p) => match p.invoke(&[elem.clone()])? {
                        Step::Ready(keep) => {
                            if keep.is_truthy() {
                                self.pending = Some(elem);
                                return Ok(Step::Ready(true));
                            }
                            location = 0;
                        }
                        Step::Suspended(c) => {
                            return Ok(Step::Suspended(c.push_frame(op_frame(
                                via,
                                5,
                                vec![],
                                vec![elem],
                            ))))
                        }
                    },
                },
                5 => {
                    if incoming.is_truthy() {
                        self.pending = Some(elem);
                        return Ok(Step::Ready(true));
                    }
                    incoming = Value::Null;
                    location = 0;
                }
                other => return Err(bad_location(self.kind(), other)),
            }
        }
    }

    fn emit(&mut self, advanced: Step<bool>) -> StepResult<Value> {
        match advanced {
            Step::Ready(true) => self
                .pending
                .take()
                .map(Step::Ready)
                .ok_or_else(|| bad_location(self.kind(), u32::MAX)),
            Step::Ready(false) => Err(exhausted()),
            Step::Suspended(c) => Ok(Step::Suspended(c)),
        }
    }
}

impl ValueIter for FilterIter {
    fn kind(&self) -> &'static str {
        "iter.filter"
    }

    fn has_next(&mut self) -> StepResult<bool> {
        if self.pending.is_some() {
            return Ok(Step::Ready(true));
        }
        self.advance(Via::HasNext, 0, Value::Null, Value::Null)
    }

    fn resume_has_next(&mut self, mut frame: Continuation, result: Value) -> StepResult<bool> {
        let saved = frame.obj_at(1);
        self.advance(Via::HasNext, frame.method_location, result, saved)
    }

    fn next(&mut self) -> StepResult<Value> {
        if let Some(v) = self.pending.take() {
            return Ok(Step::Ready(v));
        }
        let advanced = self.advance(Via::Next, 0, Value::Null, Value::Null)?;
        self.emit(advanced)
    }

    fn resume_next(&mut self, mut frame: Continuation, result: Value) -> StepResult<Value> {
        let saved = frame.obj_at(1);
        let advanced = self.advance(Via::Next, frame.method_location, result, saved)?;
        self.emit(advanced)
    }

    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        w.write_value(&Value::Iterator(self.upstream.clone()))?;
        write_opt_fn(w, self.pred.as_ref())?;
        w.write_opt_value(self.pending.as_ref())
    }
}

/// Restore factory for [`FilterIter`]
pub fn read_filter_iter(r: &mut CheckpointReader<'_>) -> RunResult<Box<dyn ValueIter>> {
    let upstream = read_iter(r)?;
    let pred = read_opt_fn(r)?;
    let pending = r.read_opt_value()?;
    Ok(Box::new(FilterIter {
        upstream,
        pred,
        pending,
    }))
}

// ============================================================================
// flatMap
// ============================================================================

/// Maps each element and iterates the result: null is empty, iterables
/// are spliced in, anything else becomes a one-element sequence. With no
/// mapper the upstream is simply flattened.
pub struct FlatMapIter {
    upstream: IterValue,
    mapper: Option<FunctionValue>,
    inner: Option<IterValue>,
    pending: Option<Value>,
}

impl FlatMapIter {
    /// Create a flatMap operator
    pub fn new(upstream: IterValue, mapper: Option<FunctionValue>) -> Self {
        Self {
            upstream,
            mapper,
            inner: None,
            pending: None,
        }
    }

    // advance states: 0 dispatch, 1 receive upstream has_next, 2 pull
    // element, 3 receive element, 4 apply mapper, 5 receive mapped value,
    // 6 pull inner has_next, 7 receive inner has_next, 8 pull inner
    // element, 9 receive inner element
    fn advance(&mut self, via: Via, location: u32, incoming: Value) -> StepResult<bool> {
        let mut location = location;
        let mut incoming = incoming;
        loop {
            match location {
                0 => {
                    if self.inner.is_some() {
                        location = 6;
                    } else {
                        match self.upstream.has_next()? {
                            Step::Ready(true) => location = 2,
                            Step::Ready(false) => return Ok(Step::Ready(false)),
                            Step::Suspended(c) => {
                                return Ok(Step::Suspended(c.push_frame(op_frame(
                                    via,
                                    1,
                                    vec![],
                                    vec![],
                                ))))
                            }
                        }
                    }
                }
                1 => {
                    if !delivered_bool(&incoming)? {
                        return Ok(Step::Ready(false));
                    }
                    location = 2;
                }
                2 => match self.upstream.next()? {
                    Step::Ready(v) => {
                        incoming = v;
                        location = 3;
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
                    let elem = std::mem::take(&mut incoming);
                    match &self.mapper {
                        None => {
                            self.inner =
                                Some(flat_source(elem, &SourceLoc::internal())?);
                            location = 0;
                        }
                        Some(m) => match m.invoke(&[elem])? {
                            Step::Ready(mapped) => {
                                self.inner =
                                    Some(flat_source(mapped, &SourceLoc::internal())?);
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
                    }
                }
                5 => {
                    let mapped = std::mem::take(&mut incoming);
                    self.inner = Some(flat_source(mapped, &SourceLoc::internal())?);
                    location = 0;
                }
                6 => {
                    let inner = self.inner.clone().ok_or_else(|| bad_location(self.kind(), 6))?;
                    match inner.has_next()? {
                        Step::Ready(true) => location = 8,
                        Step::Ready(false) => {
                            self.inner = None;
                            location = 0;
                        }
                        Step::Suspended(c) => {
                            return Ok(Step::Suspended(c.push_frame(op_frame(
                                via,
                                7,
                                vec![],
                                vec![],
                            ))))
                        }
                    }
                }
                7 => {
                    if delivered_bool(&incoming)? {
                        location = 8;
                    } else {
                        self.inner = None;
                        location = 0;
                    }
                }
                8 => {
                    let inner = self.inner.clone().ok_or_else(|| bad_location(self.kind(), 8))?;
                    match inner.next()? {
                        Step::Ready(v) => {
                            self.pending = Some(v);
                            return Ok(Step::Ready(true));
                        }
                        Step::Suspended(c) => {
                            return Ok(Step::Suspended(c.push_frame(op_frame(
                                via,
                                9,
                                vec![],
                                vec![],
                            ))))
                        }
                    }
                }
                9 => {
                    self.pending = Some(std::mem::take(&mut incoming));
                    return Ok(Step::Ready(true));
                }
                other => return Err(bad_location(self.kind(), other)),
            }
        }
    }

    fn emit(&mut self, advanced: Step<bool>) -> StepResult<Value> {
        match advanced {
            Step::Ready(true) => self
                .pending
                .take()
                .map(Step::Ready)
                .ok_or_else(|| bad_location(self.kind(), u32::MAX)),
            Step::Ready(false) => Err(exhausted()),
            Step::Suspended(c) => Ok(Step::Suspended(c)),
        }
    }
}

impl ValueIter for FlatMapIter {
    fn kind(&self) -> &'static str {
        "iter.flat_map"
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
        self.emit(advanced)
    }

    fn resume_next(&mut self, frame: Continuation, result: Value) -> StepResult<Value> {
        let advanced = self.advance(Via::Next, frame.method_location, result)?;
        self.emit(advanced)
    }

    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        w.write_value(&Value::Iterator(self.upstream.clone()))?;
        write_opt_fn(w, self.mapper.as_ref())?;
        let inner = self.inner.clone().map(Value::Iterator);
        w.write_opt_value(inner.as_ref())?;
        w.write_opt_value(self.pending.as_ref())
    }
}

/// Restore factory for [`FlatMapIter`]
pub fn read_flat_map_iter(r: &mut CheckpointReader<'_>) -> RunResult<Box<dyn ValueIter>> {
    let upstream = read_iter(r)?;
    let mapper = read_opt_fn(r)?;
    let inner = match r.read_opt_value()? {
        None => None,
        Some(Value::Iterator(it)) => Some(it),
        Some(other) => {
            return Err(quill_core::error::RuntimeError::msg(format!(
                "Corrupt checkpoint: expected iterator, got {}",
                other.type_name()
            )))
        }
    };
    let pending = r.read_opt_value()?;
    Ok(Box::new(FlatMapIter {
        upstream,
        mapper,
        inner,
        pending,
    }))
}
