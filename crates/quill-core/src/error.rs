//! Script error taxonomy
//!
//! All script-observable failures are a [`RuntimeError`] carrying a message,
//! the source text, and the offset of the failing construct. `NullAccess` and
//! `Die` are kinds of the same taxonomy rather than separate types so that
//! propagation never loses the location info. Suspension is *not* an error:
//! it is the `Step::Suspended` variant in [`crate::suspend`].

use std::fmt;
use std::sync::Arc;

/// Result alias for fallible runtime operations.
pub type RunResult<T> = Result<T, RuntimeError>;

/// A position inside a script source, used for error reporting and for
/// the source-location metadata carried by async tasks.
#[derive(Debug, Clone)]
pub struct SourceLoc {
    /// Full source text of the script (shared, cheap to clone)
    pub source: Arc<str>,
    /// Byte offset of the failing/suspending construct
    pub offset: usize,
}

impl SourceLoc {
    /// Create a source location
    pub fn new(source: impl Into<Arc<str>>, offset: usize) -> Self {
        Self {
            source: source.into(),
            offset,
        }
    }

    /// Location for runtime-internal operations with no script source
    pub fn internal() -> Self {
        Self {
            source: Arc::from(""),
            offset: 0,
        }
    }

    /// Compute the 1-based line and column of the offset
    pub fn line_col(&self) -> (usize, usize) {
        let mut line = 1;
        let mut col = 1;
        for (i, ch) in self.source.char_indices() {
            if i >= self.offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }
}

/// What kind of script error this is
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Ordinary runtime error (bad argument, index out of bounds, ...)
    General,
    /// Null value accessed where an object was required
    NullAccess,
    /// Explicit script-requested abort
    Die,
}

/// A script-observable runtime error
#[derive(Debug, Clone, thiserror::Error)]
pub struct RuntimeError {
    /// Error kind
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Where in the script the error happened (if known)
    pub loc: Option<SourceLoc>,
    /// Underlying cause, if the error wraps an unexpected failure
    pub cause: Option<Arc<RuntimeError>>,
}

impl RuntimeError {
    /// Create a general runtime error
    pub fn new(message: impl Into<String>, loc: SourceLoc) -> Self {
        Self {
            kind: ErrorKind::General,
            message: message.into(),
            loc: Some(loc),
            cause: None,
        }
    }

    /// Create a general runtime error with no source location
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::General,
            message: message.into(),
            loc: None,
            cause: None,
        }
    }

    /// Create a null-access error
    pub fn null_access(message: impl Into<String>, loc: SourceLoc) -> Self {
        Self {
            kind: ErrorKind::NullAccess,
            message: message.into(),
            loc: Some(loc),
            cause: None,
        }
    }

    /// Create an explicit script abort
    pub fn die(message: impl Into<String>, loc: SourceLoc) -> Self {
        Self {
            kind: ErrorKind::Die,
            message: message.into(),
            loc: Some(loc),
            cause: None,
        }
    }

    /// Wrap an unexpected failure, preserving it as the cause
    pub fn unexpected(cause: RuntimeError, loc: SourceLoc) -> Self {
        Self {
            kind: ErrorKind::General,
            message: "Unexpected error".to_string(),
            loc: Some(loc),
            cause: Some(Arc::new(cause)),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(loc) = &self.loc {
            if !loc.source.is_empty() {
                let (line, col) = loc.line_col();
                write!(f, " @ line {}, column {}", line, col)?;
            }
        }
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {})", cause)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col() {
        let loc = SourceLoc::new("ab\ncd\nef", 4);
        assert_eq!(loc.line_col(), (2, 2));

        let loc = SourceLoc::new("abc", 0);
        assert_eq!(loc.line_col(), (1, 1));
    }

    #[test]
    fn test_display_with_location() {
        let err = RuntimeError::new("Index out of bounds", SourceLoc::new("x = y[9]", 4));
        let text = err.to_string();
        assert!(text.contains("Index out of bounds"));
        assert!(text.contains("line 1"));
    }

    #[test]
    fn test_display_without_source() {
        let err = RuntimeError::msg("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_kinds() {
        let loc = SourceLoc::internal();
        assert_eq!(
            RuntimeError::null_access("Null value", loc.clone()).kind,
            ErrorKind::NullAccess
        );
        assert_eq!(RuntimeError::die("stop", loc.clone()).kind, ErrorKind::Die);
        assert_eq!(RuntimeError::new("x", loc).kind, ErrorKind::General);
    }

    #[test]
    fn test_unexpected_wraps_cause() {
        let inner = RuntimeError::msg("io failed");
        let outer = RuntimeError::unexpected(inner, SourceLoc::internal());
        assert_eq!(outer.message, "Unexpected error");
        assert!(outer.to_string().contains("io failed"));
    }
}
