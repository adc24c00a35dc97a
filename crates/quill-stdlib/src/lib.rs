//! Quill standard library
//!
//! The lazy, chainable, suspendable iterator pipeline and the terminal
//! drivers built on the quill-core suspension protocol, plus the
//! suspension built-ins (`sleep`, `die`, `checkpoint`). Call [`init`]
//! once before running scripts; it is idempotent.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod iter;
pub mod matching;
pub mod methods;
pub mod reduce;

/// Register the stdlib into the process-wide registry (idempotent)
pub fn init() {
    methods::register_all();
}
