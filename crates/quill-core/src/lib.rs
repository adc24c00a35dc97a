//! Quill core runtime
//!
//! This crate provides the core of the Quill embeddable scripting runtime:
//! - Script value model (tagged union with shared, identity-bearing heap
//!   values)
//! - Suspension/continuation protocol (`Step`, `Continuation`, async tasks)
//! - Fiber driver with a blocking worker pool
//! - Checkpoint/restore codec with object-identity preservation
//! - Process-wide function/method registry with argument binding
//! - Resumable regex matcher state
//!
//! The iterator pipeline and terminal drivers built on this live in
//! `quill-stdlib`.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod checkpoint;
pub mod error;
pub mod fiber;
pub mod num;
pub mod object;
pub mod registry;
pub mod rxmatch;
pub mod stringify;
pub mod suspend;
pub mod value;
pub mod workers;

pub use checkpoint::{CheckpointReader, CheckpointWriter};
pub use error::{ErrorKind, RunResult, RuntimeError, SourceLoc};
pub use fiber::Fiber;
pub use object::{ArrayData, ArrayKind, ClassShape, Instance, TypedArray};
pub use registry::{Args, FunctionDef, FunctionFlags, Invocation, ParamDef, ParamType};
pub use rxmatch::RegexMatcher;
pub use suspend::{
    resume_chain, AsyncTask, Callback, Continuation, FunctionValue, IterValue, ResumeHandle,
    Resumer, Step, StepResult, TaskKind, ValueIter,
};
pub use value::{resolve_bound, resolve_index, Value, ValueMap};
pub use workers::WorkerPool;
