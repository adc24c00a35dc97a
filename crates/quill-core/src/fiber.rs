//! Fiber driver: runs a script function to completion across suspensions
//!
//! A fiber owns its continuation chain exclusively. The script side is
//! single-threaded cooperative: the fiber either runs on the driving
//! thread or is suspended waiting for exactly one delivered result, and it
//! may resume on a different thread than it suspended on. Checkpoint
//! tasks are intercepted here: the chain plus the fiber's arguments are
//! serialized, handed to the `commit` callback, and execution continues
//! immediately with its return value.

use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::checkpoint::{CheckpointReader, CheckpointWriter};
use crate::error::{RunResult, RuntimeError};
use crate::suspend::{
    resume_chain, AsyncTask, Continuation, FunctionValue, ResumeHandle, Resumer, Step, TaskKind,
};
use crate::value::Value;
use crate::workers::WorkerPool;

/// One logical script execution
pub struct Fiber {
    main: FunctionValue,
    args: Vec<Value>,
    pool: Arc<WorkerPool>,
    tx: Sender<RunResult<Value>>,
    rx: Receiver<RunResult<Value>>,
    restored: Option<(Continuation, Value)>,
}

impl Fiber {
    /// Create a fiber over a script function and its arguments
    pub fn new(main: FunctionValue, args: Vec<Value>) -> Self {
        Self::with_pool(main, args, WorkerPool::shared())
    }

    /// Create a fiber using a specific worker pool
    pub fn with_pool(main: FunctionValue, args: Vec<Value>, pool: Arc<WorkerPool>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            main,
            args,
            pool,
            tx,
            rx,
            restored: None,
        }
    }

    /// Run the fiber until it completes, executing every suspension's task
    pub fn run_to_completion(&mut self) -> RunResult<Value> {
        let mut step = match self.restored.take() {
            Some((chain, synthetic)) => resume_chain(chain, synthetic)?,
            None => self.main.invoke(&self.args)?,
        };
        loop {
            match step {
                Step::Ready(v) => return Ok(v),
                Step::Suspended(mut chain) => {
                    let task = chain
                        .take_task()
                        .ok_or_else(|| RuntimeError::msg("Suspension has no task to execute"))?;
                    let value = self.run_task(task, &chain)?;
                    step = resume_chain(chain, value)?;
                }
            }
        }
    }

    fn run_task(&self, task: AsyncTask, chain: &Continuation) -> RunResult<Value> {
        match task.kind {
            TaskKind::Blocking(work) => {
                self.pool.submit(work, self.tx.clone());
                self.rx
                    .recv()
                    .map_err(|_| RuntimeError::msg("Worker pool disconnected"))?
            }
            TaskKind::NonBlocking(initiate) => {
                initiate(Resumer::new(self.tx.clone()));
                self.rx
                    .recv()
                    .map_err(|_| RuntimeError::msg("Non-blocking task abandoned its resumer"))?
            }
            TaskKind::Checkpoint { commit, recover } => {
                let bytes = snapshot(&self.main, &self.args, chain, recover.as_ref())?;
                match commit {
                    Some(c) => c(&bytes),
                    None => Ok(Value::Null),
                }
            }
        }
    }

    /// Reinflate a fiber from a checkpoint image.
    ///
    /// If a `recover` callback was captured at the original `checkpoint`
    /// call, it runs now and its return value becomes the synthetic result
    /// of that call; otherwise the result is null. The fiber continues
    /// from the suspension point on the next `run_to_completion`.
    pub fn restore(bytes: &[u8]) -> RunResult<Fiber> {
        let mut r = CheckpointReader::new(bytes)?;
        let main = match r.read_value()? {
            Value::Function(f) => f,
            other => {
                return Err(RuntimeError::msg(format!(
                    "Checkpoint does not start with a function (got {})",
                    other.type_name()
                )))
            }
        };
        let argc = r.read_cint()?;
        let mut args = Vec::with_capacity(argc.max(0) as usize);
        for _ in 0..argc {
            args.push(r.read_value()?);
        }

        let frame_count = r.read_cint()?;
        if frame_count < 1 {
            return Err(RuntimeError::msg("Checkpoint has no continuation frames"));
        }
        let mut chain: Option<Continuation> = None;
        for i in 0..frame_count {
            let frame = read_frame(&mut r, i == 0)?;
            chain = Some(match chain {
                None => frame,
                Some(c) => c.push_frame(frame),
            });
        }
        let chain = chain.unwrap();

        let synthetic = match r.read_opt_value()? {
            Some(Value::Function(f)) => match f.invoke(&[])? {
                Step::Ready(v) => v,
                Step::Suspended(_) => {
                    return Err(RuntimeError::msg(
                        "Checkpoint recover callback may not suspend",
                    ))
                }
            },
            Some(Value::Null) | None => Value::Null,
            Some(other) => {
                return Err(RuntimeError::msg(format!(
                    "Checkpoint recover value must be a function, got {}",
                    other.type_name()
                )))
            }
        };

        let mut fiber = Fiber::new(main, args);
        fiber.restored = Some((chain, synthetic));
        Ok(fiber)
    }
}

/// Serialize a suspended fiber: its function, arguments, and every live
/// continuation frame from the suspension point outward
fn snapshot(
    main: &FunctionValue,
    args: &[Value],
    chain: &Continuation,
    recover: Option<&Value>,
) -> RunResult<Vec<u8>> {
    let mut w = CheckpointWriter::new()?;
    w.write_value(&Value::Function(main.clone()))?;
    w.write_cint(args.len() as i32)?;
    for a in args {
        w.write_value(a)?;
    }
    w.write_cint(chain.frame_count() as i32)?;
    let mut node = Some(chain);
    while let Some(c) = node {
        write_frame(&mut w, c)?;
        node = c.parent.as_deref();
    }
    w.write_opt_value(recover)?;
    w.finish()
}

const FRAME_SUSPENSION_POINT: u8 = 0;
const FRAME_ITER_HAS_NEXT: u8 = 1;
const FRAME_ITER_NEXT: u8 = 2;
const FRAME_CALLBACK: u8 = 3;
const FRAME_NAMED: u8 = 4;

fn write_frame(w: &mut CheckpointWriter, c: &Continuation) -> RunResult<()> {
    match &c.handle {
        ResumeHandle::SuspensionPoint => w.write_u8(FRAME_SUSPENSION_POINT)?,
        ResumeHandle::IterHasNext => w.write_u8(FRAME_ITER_HAS_NEXT)?,
        ResumeHandle::IterNext => w.write_u8(FRAME_ITER_NEXT)?,
        ResumeHandle::Callback => w.write_u8(FRAME_CALLBACK)?,
        ResumeHandle::Named(name) => {
            w.write_u8(FRAME_NAMED)?;
            w.write_str(name)?;
        }
    }
    w.write_cint(c.method_location as i32)?;
    w.write_cint(c.stack_longs.len() as i32)?;
    for l in &c.stack_longs {
        w.write_clong(*l)?;
    }
    w.write_cint(c.stack_objects.len() as i32)?;
    for o in &c.stack_objects {
        w.write_value(o)?;
    }
    Ok(())
}

fn read_frame(r: &mut CheckpointReader<'_>, innermost: bool) -> RunResult<Continuation> {
    let tag = r.read_u8()?;
    if innermost != (tag == FRAME_SUSPENSION_POINT) {
        return Err(RuntimeError::msg(
            "Corrupt checkpoint: misplaced suspension point frame",
        ));
    }
    let handle = match tag {
        FRAME_SUSPENSION_POINT => ResumeHandle::SuspensionPoint,
        FRAME_ITER_HAS_NEXT => ResumeHandle::IterHasNext,
        FRAME_ITER_NEXT => ResumeHandle::IterNext,
        FRAME_CALLBACK => ResumeHandle::Callback,
        FRAME_NAMED => ResumeHandle::Named(Arc::from(r.read_str()?)),
        other => {
            return Err(RuntimeError::msg(format!(
                "Corrupt checkpoint: unknown frame tag {}",
                other
            )))
        }
    };
    let location = r.read_cint()? as u32;
    let n_longs = r.read_cint()?;
    let mut longs = Vec::with_capacity(n_longs.max(0) as usize);
    for _ in 0..n_longs {
        longs.push(r.read_clong()?);
    }
    let n_objs = r.read_cint()?;
    let mut objs = Vec::with_capacity(n_objs.max(0) as usize);
    for _ in 0..n_objs {
        objs.push(r.read_value()?);
    }
    if innermost {
        Ok(Continuation::restored_suspension_point())
    } else {
        Ok(Continuation::frame(handle, location, longs, objs))
    }
}
