//! Suspension protocol: steps, continuations, async tasks
//!
//! A running script either completes on the caller thread or yields a
//! [`Continuation`] chain describing how to re-enter every frame that was
//! live at the point of suspension. Suspension is a *return value*
//! ([`Step::Suspended`]), never a panic or error.
//!
//! Every suspendable library function is a state machine keyed by an
//! integer location: even locations perform a potentially-suspending step,
//! odd locations receive that step's delivered result. When an inner call
//! suspends, the function pushes one frame (its resume handle, its location
//! + 1, and its scratch locals) onto the chain and returns `Suspended`. On
//! resume the chain is walked from the suspension point outward
//! ([`resume_chain`]): each frame re-enters its owner, which reads its
//! scratch back, takes the delivered result, and continues as if the step
//! had returned synchronously.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::Mutex;

use crate::checkpoint::CheckpointWriter;
use crate::error::{RunResult, RuntimeError, SourceLoc};
use crate::registry;
use crate::value::Value;

/// Result of a potentially-suspending operation
pub enum Step<T> {
    /// The operation completed with a value
    Ready(T),
    /// The operation suspended; the chain describes how to resume it
    Suspended(Continuation),
}

/// Result alias for suspendable operations
pub type StepResult<T = Value> = Result<Step<T>, RuntimeError>;

impl<T> Step<T> {
    /// Map the ready value, passing suspensions through
    pub fn map_ready<U>(self, f: impl FnOnce(T) -> U) -> Step<U> {
        match self {
            Step::Ready(v) => Step::Ready(f(v)),
            Step::Suspended(c) => Step::Suspended(c),
        }
    }
}

// ============================================================================
// Resume handles
// ============================================================================

/// Identifies which kind of frame a continuation re-enters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeHandle {
    /// The innermost marker frame created by a suspend call; carries the
    /// async task and is skipped on resume (the delivered value passes
    /// straight through to the first real frame)
    SuspensionPoint,
    /// Re-enter `has_next` on the iterator stored in `stack_objects[0]`
    IterHasNext,
    /// Re-enter `next` on the iterator stored in `stack_objects[0]`
    IterNext,
    /// Re-enter the callback stored in `stack_objects[0]`
    Callback,
    /// Re-enter a named resume function registered in the global registry
    /// (terminal drivers and host extensions)
    Named(Arc<str>),
}

// ============================================================================
// Async tasks
// ============================================================================

/// Work executed on a worker thread for a blocking suspension
pub type BlockingWork = Box<dyn FnOnce() -> RunResult<Value> + Send>;

/// Initiator for a non-blocking suspension; arranges for the [`Resumer`]
/// to be called exactly once when the awaited event completes
pub type InitiateFn = Box<dyn FnOnce(Resumer) + Send>;

/// Callback handed the checkpoint bytes; its return value becomes the
/// result of the `checkpoint` call
pub type CommitFn = Box<dyn FnOnce(&[u8]) -> RunResult<Value> + Send>;

/// What a suspension is waiting for
pub enum TaskKind {
    /// Run a thunk on a worker; the fiber is not runnable until it finishes
    Blocking(BlockingWork),
    /// Host-arranged asynchronous event delivering a value via a resumer
    NonBlocking(InitiateFn),
    /// Snapshot the live fiber; `commit` receives the bytes, `recover`
    /// (a serializable function value) runs first on restore
    Checkpoint {
        /// Invoked with the serialized fiber image
        commit: Option<CommitFn>,
        /// Must be a `Value::Function` registered for restore
        recover: Option<Value>,
    },
}

/// An asynchronous task with source-location metadata for error reporting
pub struct AsyncTask {
    /// Where in the script the suspension happened
    pub loc: SourceLoc,
    /// The work the host must perform
    pub kind: TaskKind,
}

impl std::fmt::Debug for AsyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            TaskKind::Blocking(_) => "Blocking",
            TaskKind::NonBlocking(_) => "NonBlocking",
            TaskKind::Checkpoint { .. } => "Checkpoint",
        };
        write!(f, "AsyncTask({})", kind)
    }
}

// ============================================================================
// Resumer
// ============================================================================

/// Delivers the result of a non-blocking task back to its fiber.
///
/// May be invoked at most once; a second call is detected and rejected.
#[derive(Clone)]
pub struct Resumer {
    inner: Arc<ResumerShared>,
}

struct ResumerShared {
    fired: AtomicBool,
    tx: Sender<RunResult<Value>>,
}

impl Resumer {
    pub(crate) fn new(tx: Sender<RunResult<Value>>) -> Self {
        Self {
            inner: Arc::new(ResumerShared {
                fired: AtomicBool::new(false),
                tx,
            }),
        }
    }

    /// Deliver the awaited result. Fails if already delivered.
    pub fn resume(&self, result: RunResult<Value>) -> RunResult<()> {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::msg("Resumer invoked more than once"));
        }
        self.inner
            .tx
            .send(result)
            .map_err(|_| RuntimeError::msg("Fiber is no longer waiting for this result"))
    }
}

// ============================================================================
// Continuation
// ============================================================================

/// One captured frame of a paused fiber.
///
/// Frames chain from the innermost suspension point outward through
/// `parent`. The innermost frame carries the [`AsyncTask`]; every other
/// frame records how to re-enter one suspended function: its resume
/// handle, its `method_location` (always odd when captured: the location
/// that receives the pending result), and its scratch locals.
pub struct Continuation {
    /// Which function/object this frame re-enters
    pub handle: ResumeHandle,
    /// State-machine location to resume at (odd = awaiting a result)
    pub method_location: u32,
    /// Scratch primitive locals
    pub stack_longs: Vec<i64>,
    /// Scratch object locals; by convention `stack_objects[0]` is the
    /// receiver for `IterHasNext`/`IterNext`/`Callback` frames
    pub stack_objects: Vec<Value>,
    /// Delivered result, filled just before the frame is re-entered
    pub result: Option<Value>,
    /// Next outer frame
    pub parent: Option<Box<Continuation>>,
    task: Option<AsyncTask>,
}

impl Continuation {
    /// Create the innermost frame for a blocking suspension
    pub fn suspend_blocking(loc: SourceLoc, work: BlockingWork) -> Self {
        Self::suspension_point(AsyncTask {
            loc,
            kind: TaskKind::Blocking(work),
        })
    }

    /// Create the innermost frame for a non-blocking suspension
    pub fn suspend_non_blocking(loc: SourceLoc, initiate: InitiateFn) -> Self {
        Self::suspension_point(AsyncTask {
            loc,
            kind: TaskKind::NonBlocking(initiate),
        })
    }

    /// Create the innermost frame for a checkpoint request
    pub fn checkpoint_request(
        loc: SourceLoc,
        commit: Option<CommitFn>,
        recover: Option<Value>,
    ) -> Self {
        Self::suspension_point(AsyncTask {
            loc,
            kind: TaskKind::Checkpoint { commit, recover },
        })
    }

    fn suspension_point(task: AsyncTask) -> Self {
        Self {
            handle: ResumeHandle::SuspensionPoint,
            method_location: 0,
            stack_longs: Vec::new(),
            stack_objects: Vec::new(),
            result: None,
            parent: None,
            task: Some(task),
        }
    }

    /// Create a restored suspension-point marker (no task; the synthetic
    /// result is supplied by the restorer)
    pub fn restored_suspension_point() -> Self {
        Self {
            handle: ResumeHandle::SuspensionPoint,
            method_location: 0,
            stack_longs: Vec::new(),
            stack_objects: Vec::new(),
            result: None,
            parent: None,
            task: None,
        }
    }

    /// Create a plain (non-innermost) frame
    pub fn frame(
        handle: ResumeHandle,
        method_location: u32,
        stack_longs: Vec<i64>,
        stack_objects: Vec<Value>,
    ) -> Self {
        Self {
            handle,
            method_location,
            stack_longs,
            stack_objects,
            result: None,
            parent: None,
            task: None,
        }
    }

    /// Push `frame` as the new outermost frame of this chain and return
    /// the chain (the "rethrow with added frame" helper)
    pub fn push_frame(mut self, frame: Continuation) -> Self {
        self.attach_outer(Box::new(frame));
        self
    }

    fn attach_outer(&mut self, frame: Box<Continuation>) {
        match self.parent {
            Some(ref mut p) => p.attach_outer(frame),
            None => self.parent = Some(frame),
        }
    }

    /// Take the async task from the innermost frame
    pub fn take_task(&mut self) -> Option<AsyncTask> {
        self.task.take()
    }

    /// Number of frames in the chain (including the suspension point)
    pub fn frame_count(&self) -> usize {
        let mut n = 1;
        let mut node = self.parent.as_deref();
        while let Some(c) = node {
            n += 1;
            node = c.parent.as_deref();
        }
        n
    }

    /// Take the delivered result out of this frame
    pub fn take_result(&mut self) -> Value {
        self.result.take().unwrap_or(Value::Null)
    }

    /// Read a scratch long, defaulting to 0
    pub fn long_at(&self, i: usize) -> i64 {
        self.stack_longs.get(i).copied().unwrap_or(0)
    }

    /// Take a scratch object out of the frame (replaced with null)
    pub fn obj_at(&mut self, i: usize) -> Value {
        if i < self.stack_objects.len() {
            std::mem::replace(&mut self.stack_objects[i], Value::Null)
        } else {
            Value::Null
        }
    }

    /// Fill the receiver slot (`stack_objects[0]`) of the outermost frame
    /// if it matches `expected` and has no receiver yet.
    ///
    /// Wrappers call this after a call through them suspends: the frame
    /// the callee just pushed is the outermost one, and the callee cannot
    /// name its own shared handle.
    pub fn fill_receiver(mut self, expected: &ResumeHandle, receiver: Value) -> Self {
        self.fill_outermost(expected, receiver);
        self
    }

    fn fill_outermost(&mut self, expected: &ResumeHandle, receiver: Value) {
        match self.parent {
            Some(ref mut p) => p.fill_outermost(expected, receiver),
            None => {
                if self.handle == *expected
                    && matches!(self.stack_objects.first(), Some(Value::Null))
                {
                    self.stack_objects[0] = receiver;
                }
            }
        }
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Continuation({:?}@{}, {} frames)",
            self.handle,
            self.method_location,
            self.frame_count()
        )
    }
}

// ============================================================================
// Suspendable callbacks and iterators
// ============================================================================

/// A user callback that may suspend mid-invocation.
///
/// `invoke` starts a call; if it suspends, `resume` continues it with the
/// frame the callback pushed and the delivered result. `write_state` and
/// the factory registered under `name()` make suspended callbacks
/// serializable for checkpoints.
pub trait Callback: Send {
    /// Registered name, used for dispatch and checkpoint restore
    fn name(&self) -> &str;

    /// Begin an invocation
    fn invoke(&mut self, args: &[Value]) -> StepResult<Value>;

    /// Continue a suspended invocation
    fn resume(&mut self, frame: Continuation, result: Value) -> StepResult<Value> {
        let _ = (frame, result);
        Err(RuntimeError::msg(format!(
            "Function '{}' cannot be resumed: it never suspends",
            self.name()
        )))
    }

    /// Serialize callback state for a checkpoint (default: stateless)
    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        let _ = w;
        Ok(())
    }
}

/// A pull iterator whose `has_next`/`next` may suspend.
///
/// Iterators are single-pass and finite unless documented otherwise.
/// Durable state (positions, ring buffers, materialized lists) lives in
/// the iterator itself; in-flight state of a suspended call lives in the
/// continuation frame handed to the matching `resume_*` method.
pub trait ValueIter: Send {
    /// Checkpoint kind tag, also used to look up the restore factory
    fn kind(&self) -> &'static str;

    /// True if another element is available; may suspend
    fn has_next(&mut self) -> StepResult<bool>;

    /// Produce the next element; may suspend
    fn next(&mut self) -> StepResult<Value>;

    /// Continue a suspended `has_next`
    fn resume_has_next(&mut self, frame: Continuation, result: Value) -> StepResult<bool> {
        let _ = (frame, result);
        Err(RuntimeError::msg(format!(
            "Iterator '{}' cannot resume has_next: it never suspends",
            self.kind()
        )))
    }

    /// Continue a suspended `next`
    fn resume_next(&mut self, frame: Continuation, result: Value) -> StepResult<Value> {
        let _ = (frame, result);
        Err(RuntimeError::msg(format!(
            "Iterator '{}' cannot resume next: it never suspends",
            self.kind()
        )))
    }

    /// Serialize iterator state for a checkpoint
    fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()>;
}

/// Shared handle to a callable function value
#[derive(Clone)]
pub struct FunctionValue {
    inner: Arc<Mutex<Box<dyn Callback>>>,
}

impl FunctionValue {
    /// Wrap a callback
    pub fn new(cb: impl Callback + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(cb))),
        }
    }

    /// Wrap an already-boxed callback
    pub fn from_box(cb: Box<dyn Callback>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(cb)),
        }
    }

    /// Registered name of the underlying callback
    pub fn name(&self) -> String {
        self.inner.lock().name().to_string()
    }

    /// Identity key for the codec
    pub fn identity_key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const u8 as usize
    }

    /// Invoke the callback, tagging the receiver slot on suspension
    pub fn invoke(&self, args: &[Value]) -> StepResult<Value> {
        match self.inner.lock().invoke(args)? {
            Step::Suspended(c) => Ok(Step::Suspended(c.fill_receiver(
                &ResumeHandle::Callback,
                Value::Function(self.clone()),
            ))),
            ready => Ok(ready),
        }
    }

    /// Resume the callback, tagging the receiver slot on re-suspension
    pub fn resume(&self, frame: Continuation, result: Value) -> StepResult<Value> {
        match self.inner.lock().resume(frame, result)? {
            Step::Suspended(c) => Ok(Step::Suspended(c.fill_receiver(
                &ResumeHandle::Callback,
                Value::Function(self.clone()),
            ))),
            ready => Ok(ready),
        }
    }

    /// Serialize the callback's state
    pub fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        self.inner.lock().write_state(w)
    }
}

/// Shared handle to a lazy iterator value
#[derive(Clone)]
pub struct IterValue {
    inner: Arc<Mutex<Box<dyn ValueIter>>>,
}

impl IterValue {
    /// Wrap an iterator
    pub fn new(it: impl ValueIter + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(it))),
        }
    }

    /// Wrap an already-boxed iterator
    pub fn from_box(it: Box<dyn ValueIter>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(it)),
        }
    }

    /// Checkpoint kind tag of the underlying iterator
    pub fn kind(&self) -> &'static str {
        self.inner.lock().kind()
    }

    /// Identity key for the codec
    pub fn identity_key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const u8 as usize
    }

    /// Pull availability, tagging the receiver slot on suspension
    pub fn has_next(&self) -> StepResult<bool> {
        match self.inner.lock().has_next()? {
            Step::Suspended(c) => Ok(Step::Suspended(c.fill_receiver(
                &ResumeHandle::IterHasNext,
                Value::Iterator(self.clone()),
            ))),
            ready => Ok(ready),
        }
    }

    /// Pull the next element, tagging the receiver slot on suspension
    pub fn next(&self) -> StepResult<Value> {
        match self.inner.lock().next()? {
            Step::Suspended(c) => Ok(Step::Suspended(c.fill_receiver(
                &ResumeHandle::IterNext,
                Value::Iterator(self.clone()),
            ))),
            ready => Ok(ready),
        }
    }

    /// Resume a suspended `has_next`
    pub fn resume_has_next(&self, frame: Continuation, result: Value) -> StepResult<bool> {
        match self.inner.lock().resume_has_next(frame, result)? {
            Step::Suspended(c) => Ok(Step::Suspended(c.fill_receiver(
                &ResumeHandle::IterHasNext,
                Value::Iterator(self.clone()),
            ))),
            ready => Ok(ready),
        }
    }

    /// Resume a suspended `next`
    pub fn resume_next(&self, frame: Continuation, result: Value) -> StepResult<Value> {
        match self.inner.lock().resume_next(frame, result)? {
            Step::Suspended(c) => Ok(Step::Suspended(c.fill_receiver(
                &ResumeHandle::IterNext,
                Value::Iterator(self.clone()),
            ))),
            ready => Ok(ready),
        }
    }

    /// Serialize the iterator's state
    pub fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        self.inner.lock().write_state(w)
    }
}

/// A plain native function that never suspends
pub struct NativeCallback {
    name: Arc<str>,
    f: Arc<dyn Fn(&[Value]) -> RunResult<Value> + Send + Sync>,
}

impl NativeCallback {
    /// Create a native callback
    pub fn new(
        name: impl Into<Arc<str>>,
        f: impl Fn(&[Value]) -> RunResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

impl Callback for NativeCallback {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&mut self, args: &[Value]) -> StepResult<Value> {
        Ok(Step::Ready((self.f)(args)?))
    }
}

/// Convenience constructor for a non-suspending function value
pub fn native_fn(
    name: impl Into<Arc<str>>,
    f: impl Fn(&[Value]) -> RunResult<Value> + Send + Sync + 'static,
) -> FunctionValue {
    FunctionValue::new(NativeCallback::new(name, f))
}

// ============================================================================
// Chain re-entry
// ============================================================================

/// Walk a continuation chain from the suspension point outward, delivering
/// `value` to the innermost frame and each frame's output to the next one
/// out. If a frame suspends again, the not-yet-re-entered outer frames are
/// grafted onto the new chain so no position is lost.
pub fn resume_chain(chain: Continuation, value: Value) -> StepResult<Value> {
    let mut value = value;
    let mut node = Some(Box::new(chain));
    while let Some(mut frame) = node {
        let parent = frame.parent.take();
        if frame.handle == ResumeHandle::SuspensionPoint {
            // The delivered value passes straight through the marker
            node = parent;
            continue;
        }
        frame.result = Some(value);
        match reenter(*frame)? {
            Step::Ready(v) => {
                value = v;
                node = parent;
            }
            Step::Suspended(mut new_chain) => {
                if let Some(p) = parent {
                    new_chain.attach_outer(p);
                }
                return Ok(Step::Suspended(new_chain));
            }
        }
    }
    Ok(Step::Ready(value))
}

fn reenter(mut frame: Continuation) -> StepResult<Value> {
    let delivered = frame.take_result();
    match frame.handle.clone() {
        ResumeHandle::SuspensionPoint => {
            Err(RuntimeError::msg("Cannot re-enter a suspension point"))
        }
        ResumeHandle::IterHasNext => {
            let it = receiver_iter(&mut frame)?;
            Ok(it
                .resume_has_next(frame, delivered)?
                .map_ready(Value::Bool))
        }
        ResumeHandle::IterNext => {
            let it = receiver_iter(&mut frame)?;
            it.resume_next(frame, delivered)
        }
        ResumeHandle::Callback => {
            let f = receiver_fn(&mut frame)?;
            f.resume(frame, delivered)
        }
        ResumeHandle::Named(name) => {
            let f = registry::lookup_resume_fn(&name)?;
            f(frame, delivered)
        }
    }
}

fn receiver_iter(frame: &mut Continuation) -> RunResult<IterValue> {
    match frame.stack_objects.first() {
        Some(Value::Iterator(it)) => Ok(it.clone()),
        _ => Err(RuntimeError::msg(
            "Corrupt continuation: iterator frame has no iterator receiver",
        )),
    }
}

fn receiver_fn(frame: &mut Continuation) -> RunResult<FunctionValue> {
    match frame.stack_objects.first() {
        Some(Value::Function(f)) => Ok(f.clone()),
        _ => Err(RuntimeError::msg(
            "Corrupt continuation: callback frame has no function receiver",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    fn blocking_noop() -> Continuation {
        Continuation::suspend_blocking(SourceLoc::internal(), Box::new(|| Ok(Value::Null)))
    }

    #[test]
    fn test_push_frame_appends_outward() {
        let chain = blocking_noop()
            .push_frame(Continuation::frame(
                ResumeHandle::Callback,
                1,
                vec![],
                vec![Value::Null],
            ))
            .push_frame(Continuation::frame(
                ResumeHandle::IterNext,
                3,
                vec![],
                vec![Value::Null],
            ));

        assert_eq!(chain.frame_count(), 3);
        // Head stays the suspension point
        assert_eq!(chain.handle, ResumeHandle::SuspensionPoint);
        let first = chain.parent.as_deref().unwrap();
        assert_eq!(first.handle, ResumeHandle::Callback);
        let second = first.parent.as_deref().unwrap();
        assert_eq!(second.handle, ResumeHandle::IterNext);
        assert_eq!(second.method_location, 3);
    }

    #[test]
    fn test_take_task_only_once() {
        let mut chain = blocking_noop();
        assert!(chain.take_task().is_some());
        assert!(chain.take_task().is_none());
    }

    #[test]
    fn test_fill_receiver_targets_outermost() {
        let me = Value::str("receiver");
        let chain = blocking_noop()
            .push_frame(Continuation::frame(
                ResumeHandle::Callback,
                1,
                vec![],
                vec![Value::Null],
            ))
            .fill_receiver(&ResumeHandle::Callback, me);

        let frame = chain.parent.as_deref().unwrap();
        assert_eq!(frame.stack_objects[0].as_str(), Some("receiver"));
    }

    #[test]
    fn test_fill_receiver_skips_mismatched_handle() {
        let chain = blocking_noop()
            .push_frame(Continuation::frame(
                ResumeHandle::IterNext,
                1,
                vec![],
                vec![Value::Null],
            ))
            .fill_receiver(&ResumeHandle::Callback, Value::str("x"));

        let frame = chain.parent.as_deref().unwrap();
        assert!(frame.stack_objects[0].is_null());
    }

    #[test]
    fn test_resumer_fires_once() {
        let (tx, rx) = unbounded();
        let resumer = Resumer::new(tx);
        resumer.resume(Ok(Value::Int(1))).unwrap();
        assert!(resumer.resume(Ok(Value::Int(2))).is_err());
        assert_eq!(rx.recv().unwrap().unwrap().as_int(), Some(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_native_fn_never_suspends() {
        let f = native_fn("double", |args| {
            Ok(Value::Int(args[0].as_int().unwrap_or(0) * 2))
        });
        match f.invoke(&[Value::Int(21)]).unwrap() {
            Step::Ready(v) => assert_eq!(v.as_int(), Some(42)),
            Step::Suspended(_) => panic!("native fn suspended"),
        }
        assert_eq!(f.name(), "double");
    }

    #[test]
    fn test_resume_chain_passes_through_suspension_point() {
        // A chain with only the suspension point marker delivers the value
        let mut chain = blocking_noop();
        chain.take_task();
        match resume_chain(chain, Value::Int(9)).unwrap() {
            Step::Ready(v) => assert_eq!(v.as_int(), Some(9)),
            Step::Suspended(_) => panic!("unexpected suspension"),
        }
    }
}
