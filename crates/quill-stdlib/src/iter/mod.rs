//! Lazy iterator pipeline
//!
//! Source iterators plus the chainable operators. Every operator follows
//! the state-machine discipline: even locations perform a potentially-
//! suspending step, odd locations receive its result. Durable operator
//! state (positions, rings, materialized buffers) lives in the iterator
//! object; a suspended call's transient locals ride in its continuation
//! frame. All iterators are checkpointable: the codec writes their kind
//! tag and state, and the factories registered at init rebuild them.

pub mod batch;
pub mod slice;
pub mod sort;
pub mod transform;

use quill_core::checkpoint::{CheckpointReader, CheckpointWriter};
use quill_core::error::{RunResult, RuntimeError, SourceLoc};
use quill_core::suspend::{
    Continuation, FunctionValue, IterValue, ResumeHandle, Step, StepResult, ValueIter,
};
use quill_core::value::Value;

/// Convert any iterable value into an iterator.
///
/// Iterators pass through; lists, maps, and arrays get snapshot sources
/// (map entries become two-element `[key, value]` lists, so entry
/// normalization is inherent to the source).
pub fn iter_source(v: &Value, loc: &SourceLoc) -> RunResult<IterValue> {
    match v {
        Value::Iterator(it) => Ok(it.clone()),
        Value::List(l) => Ok(IterValue::new(ListIter::new(l.lock().clone()))),
        Value::Map(m) => {
            let entries: Vec<Value> = m
                .lock()
                .iter()
                .map(|(k, val)| Value::list(vec![Value::str(k.as_str()), val.clone()]))
                .collect();
            Ok(IterValue::new(ListIter::new(entries)))
        }
        Value::Array(a) => Ok(IterValue::new(ListIter::new(a.lock().to_values()))),
        other => Err(RuntimeError::new(
            format!("Cannot iterate over {}", other.type_name()),
            loc.clone(),
        )),
    }
}

/// Source used by `flatMap` for each mapped element: null is empty,
/// iterables iterate, anything else is a one-element sequence
pub fn flat_source(v: Value, loc: &SourceLoc) -> RunResult<IterValue> {
    match &v {
        Value::Null => Ok(IterValue::new(ListIter::new(Vec::new()))),
        Value::Iterator(_) | Value::List(_) | Value::Map(_) | Value::Array(_) => {
            iter_source(&v, loc)
        }
        _ => Ok(IterValue::new(ListIter::new(vec![v]))),
    }
}

// ============================================================================
// Frame helpers shared by the operators
// ============================================================================

/// Which iterator method a suspension frame should re-enter
#[derive(Copy, Clone)]
pub(crate) enum Via {
    /// Frame resumes `has_next`
    HasNext,
    /// Frame resumes `next`
    Next,
}

/// Build a suspension frame for the given method (the receiver slot is
/// filled by the `IterValue` wrapper or the resume dispatcher)
pub(crate) fn op_frame(via: Via, location: u32, longs: Vec<i64>, extra: Vec<Value>) -> Continuation {
    let handle = match via {
        Via::HasNext => ResumeHandle::IterHasNext,
        Via::Next => ResumeHandle::IterNext,
    };
    let mut objs = vec![Value::Null];
    objs.extend(extra);
    Continuation::frame(handle, location, longs, objs)
}

/// Interpret a delivered `has_next` result
pub(crate) fn delivered_bool(v: &Value) -> RunResult<bool> {
    v.as_bool()
        .ok_or_else(|| RuntimeError::msg("Corrupt resume: expected a boolean result"))
}

/// Interpret a delivered comparator result as a sign
pub(crate) fn delivered_sign(v: &Value) -> RunResult<i64> {
    let f = v
        .as_float()
        .ok_or_else(|| RuntimeError::msg("Comparator must return a number"))?;
    Ok(if f < 0.0 {
        -1
    } else if f > 0.0 {
        1
    } else {
        0
    })
}

/// Error for pulling past the end of an iterator
pub(crate) fn exhausted() -> RuntimeError {
    RuntimeError::msg("next() called on exhausted iterator")
}

/// Error for a resume at a location the operator never suspends at
pub(crate) fn bad_location(kind: &str, location: u32) -> RuntimeError {
    RuntimeError::msg(format!(
        "Corrupt resume: {} has no state {}",
        kind, location
    ))
}

/// Read an iterator reference back out of a checkpoint
pub(crate) fn read_iter(r: &mut CheckpointReader<'_>) -> RunResult<IterValue> {
    match r.read_value()? {
        Value::Iterator(it) => Ok(it),
        other => Err(RuntimeError::msg(format!(
            "Corrupt checkpoint: expected iterator, got {}",
            other.type_name()
        ))),
    }
}

/// Read a function reference back out of a checkpoint
pub(crate) fn read_fn(r: &mut CheckpointReader<'_>) -> RunResult<FunctionValue> {
    match r.read_value()? {
        Value::Function(f) => Ok(f),
        other => Err(RuntimeError::msg(format!(
            "Corrupt checkpoint: expected function, got {}",
            other.type_name()
        ))),
    }
}

/// Read an optional function reference
pub(crate) fn read_opt_fn(r: &mut CheckpointReader<'_>) -> RunResult<Option<FunctionValue>> {
    match r.read_opt_value()? {
        None => Ok(None),
        Some(Value::Function(f)) => Ok(Some(f)),
        Some(other) => Err(RuntimeError::msg(format!(
            "Corrupt checkpoint: expected function, got {}",
            other.type_name()
        ))),
    }
}

/// Write an optional function reference
pub(crate) fn write_opt_fn(
    w: &mut CheckpointWriter,
    f: Option<&FunctionValue>,
) -> RunResult<()> {
    let as_value = f.map(|f| Value::Function(f.clone()));
    w.write_opt_value(as_value.as_ref())
}

/// Write a sequence of values (length-prefixed)
pub(crate) fn write_values(w: &mut CheckpointWriter, items: &[Value]) -> RunResult<()> {
    w.write_cint(items.len() as i32)?;
    for v in items {
        w.write_value(v)?;
    }
    Ok(())
}

/// Read a sequence of values written by [`write_values`]
pub(crate) fn read_values(r: &mut CheckpointReader<'_>) -> RunResult<Vec<Value>> {
    let n = r.read_cint()?;
    if n < 0 {
        return Err(RuntimeError::msg("Corrupt checkpoint: negative length"));
    }
    let mut items = Vec::with_capacity(n as usize);
    for _ in 0..n {
        items.push(r.read_value()?);
    }
    Ok(items)
}

// ============================================================================
// Snapshot list source
// ============================================================================

/// Iterator over a snapshot of elements (lists, map entries, arrays)
pub struct ListIter {
    items: Vec<Value>,
    pos: usize,
}

impl ListIter {
    /// Create a source over the given elements
    pub fn new(items: Vec<Value>) -> Self {
        Self { items, pos: 0 }
    }
}

impl ValueIter for ListIter {
    fn kind(&self) -> &'static str {
        "iter.list_source"
    }

    fn has_next(&mut self) -> StepResult<bool> {
        Ok(Step::Ready(self.pos < self.items.len()))
    }

    fn next(&mut self) -> StepResult<Value> {
        match self.items.get(self.pos) {
            Some(v) => {
                let v = v.clone();
                self.pos += 1;
                Ok(Step::Ready(v))
            }
            None => Err(RuntimeError::msg("next() called on exhausted iterator")),
        }
    }

    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        write_values(w, &self.items)?;
        w.write_clong(self.pos as i64)
    }
}

/// Restore factory for [`ListIter`]
pub fn read_list_iter(r: &mut CheckpointReader<'_>) -> RunResult<Box<dyn ValueIter>> {
    let items = read_values(r)?;
    let pos = r.read_clong()? as usize;
    Ok(Box::new(ListIter { items, pos }))
}
