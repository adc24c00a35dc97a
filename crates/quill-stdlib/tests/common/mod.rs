//! Shared helpers for the behaviour tests: a call-driving root callback
//! and a wrapper that forces suspensions of arbitrary depth around a pure
//! function, so every pipeline can be exercised with and without parked
//! fibers.

// Each test binary uses a different subset of these helpers
#![allow(dead_code)]

use std::sync::Arc;

use quill_core::checkpoint::{CheckpointReader, CheckpointWriter};
use quill_core::error::{RunResult, RuntimeError, SourceLoc};
use quill_core::fiber::Fiber;
use quill_core::registry::{self, Args};
use quill_core::suspend::{
    Callback, Continuation, FunctionValue, ResumeHandle, Step, StepResult,
};
use quill_core::value::Value;

/// Root callback that performs one method call on a receiver and returns
/// its result; serializable so fibers using it can checkpoint.
pub struct CallRoot {
    pub receiver: Value,
    pub method: String,
    pub args: Vec<Value>,
}

impl Callback for CallRoot {
    fn name(&self) -> &str {
        "test.call_root"
    }

    fn invoke(&mut self, _args: &[Value]) -> StepResult<Value> {
        let step = registry::call_method(
            &self.receiver,
            &self.method,
            Args::Positional(self.args.clone()),
            SourceLoc::internal(),
        )?;
        match step {
            Step::Ready(v) => Ok(Step::Ready(v)),
            Step::Suspended(c) => Ok(Step::Suspended(c.push_frame(Continuation::frame(
                ResumeHandle::Callback,
                1,
                vec![],
                vec![Value::Null],
            )))),
        }
    }

    fn resume(&mut self, frame: Continuation, result: Value) -> StepResult<Value> {
        match frame.method_location {
            1 => Ok(Step::Ready(result)),
            other => Err(RuntimeError::msg(format!(
                "call root has no state {}",
                other
            ))),
        }
    }

    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        w.write_value(&self.receiver)?;
        w.write_str(&self.method)?;
        w.write_cint(self.args.len() as i32)?;
        for a in &self.args {
            w.write_value(a)?;
        }
        Ok(())
    }
}

fn read_call_root(r: &mut CheckpointReader<'_>) -> RunResult<Box<dyn Callback>> {
    let receiver = r.read_value()?;
    let method = r.read_str()?;
    let n = r.read_cint()?;
    let mut args = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
        args.push(r.read_value()?);
    }
    Ok(Box::new(CallRoot {
        receiver,
        method,
        args,
    }))
}

/// Initialize the stdlib and the test factories (idempotent)
pub fn setup() {
    quill_stdlib::init();
    registry::init_once("quill-stdlib-test-helpers", || {
        registry::register_callback_factory("test.call_root", Arc::new(read_call_root));
    });
}

/// Run one method call on a receiver through a fiber, executing any
/// suspensions it produces
pub fn run_method(receiver: Value, method: &str, args: Vec<Value>) -> RunResult<Value> {
    setup();
    let root = FunctionValue::new(CallRoot {
        receiver,
        method: method.to_string(),
        args,
    });
    Fiber::new(root, vec![]).run_to_completion()
}

/// Callback that computes its result synchronously, then forces `depth`
/// suspensions (each a trivial blocking task) before delivering it
pub struct SuspendingFn {
    name: String,
    depth: u32,
    inner: Arc<dyn Fn(&[Value]) -> RunResult<Value> + Send + Sync>,
}

impl SuspendingFn {
    fn park(&self, remaining: u32, value: Value) -> Continuation {
        Continuation::suspend_blocking(SourceLoc::internal(), Box::new(|| Ok(Value::Null)))
            .push_frame(Continuation::frame(
                ResumeHandle::Callback,
                1,
                vec![remaining as i64],
                vec![Value::Null, value],
            ))
    }
}

impl Callback for SuspendingFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&mut self, args: &[Value]) -> StepResult<Value> {
        let value = (self.inner)(args)?;
        if self.depth == 0 {
            return Ok(Step::Ready(value));
        }
        Ok(Step::Suspended(self.park(self.depth - 1, value)))
    }

    fn resume(&mut self, mut frame: Continuation, _result: Value) -> StepResult<Value> {
        match frame.method_location {
            1 => {
                let remaining = frame.long_at(0) as u32;
                let value = frame.obj_at(1);
                if remaining == 0 {
                    Ok(Step::Ready(value))
                } else {
                    Ok(Step::Suspended(self.park(remaining - 1, value)))
                }
            }
            other => Err(RuntimeError::msg(format!(
                "suspending fn has no state {}",
                other
            ))),
        }
    }

    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        w.write_cint(self.depth as i32)
    }
}

/// Create a function value that suspends `depth` times per call around
/// `f`, registering a restore factory under `name`
pub fn suspending_fn(
    name: &'static str,
    depth: u32,
    f: impl Fn(&[Value]) -> RunResult<Value> + Send + Sync + 'static,
) -> FunctionValue {
    let inner: Arc<dyn Fn(&[Value]) -> RunResult<Value> + Send + Sync> = Arc::new(f);
    let factory_inner = inner.clone();
    registry::init_once(name, move || {
        registry::register_callback_factory(
            name,
            Arc::new(move |r: &mut CheckpointReader<'_>| {
                let depth = r.read_cint()? as u32;
                Ok(Box::new(SuspendingFn {
                    name: name.to_string(),
                    depth,
                    inner: factory_inner.clone(),
                }) as Box<dyn Callback>)
            }),
        );
    });
    FunctionValue::new(SuspendingFn {
        name: name.to_string(),
        depth,
        inner,
    })
}

/// Build a list value of ints
pub fn int_list(vals: &[i32]) -> Value {
    Value::list(vals.iter().map(|i| Value::Int(*i)).collect())
}

/// Extract a list value into ints
pub fn as_ints(v: &Value) -> Vec<i32> {
    match v {
        Value::List(l) => l.lock().iter().map(|v| v.as_int().unwrap()).collect(),
        other => panic!("expected list, got {}", other.type_name()),
    }
}
