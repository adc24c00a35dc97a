//! Regex matcher state with a per-thread compiled-pattern cache
//!
//! A matcher keeps the subject and pattern strings plus its cursor and
//! capture positions, so it can be checkpointed mid-iteration and resumed
//! after a restore; patterns are recompiled lazily through the cache.
//! The cache is per-thread to avoid cross-fiber contention and bounded so
//! pathological scripts cannot pin unbounded compiled patterns.

use std::cell::RefCell;
use std::sync::Arc;

use regex::Regex;

use crate::checkpoint::{CheckpointReader, CheckpointWriter};
use crate::error::{RunResult, RuntimeError, SourceLoc};

const PATTERN_CACHE_CAP: usize = 64;

thread_local! {
    static PATTERN_CACHE: RefCell<Vec<(String, Arc<Regex>)>> = const { RefCell::new(Vec::new()) };
}

/// Compile a pattern through the per-thread cache (most-recently-used first)
pub fn compile_pattern(pattern: &str, loc: &SourceLoc) -> RunResult<Arc<Regex>> {
    PATTERN_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if let Some(pos) = cache.iter().position(|(p, _)| p == pattern) {
            let entry = cache.remove(pos);
            let re = entry.1.clone();
            cache.insert(0, entry);
            return Ok(re);
        }
        let re = Arc::new(Regex::new(pattern).map_err(|e| {
            RuntimeError::new(format!("Invalid regex pattern: {}", e), loc.clone())
        })?);
        cache.insert(0, (pattern.to_string(), re.clone()));
        cache.truncate(PATTERN_CACHE_CAP);
        Ok(re)
    })
}

/// Prepend inline regex flags ("i", "m", "s") to a pattern.
///
/// Unrecognised flag characters are an error.
pub fn apply_flags(pattern: &str, flags: &str, loc: &SourceLoc) -> RunResult<String> {
    if flags.is_empty() {
        return Ok(pattern.to_string());
    }
    for ch in flags.chars() {
        if !matches!(ch, 'i' | 'm' | 's') {
            return Err(RuntimeError::new(
                format!("Unrecognised regex flag '{}'", ch),
                loc.clone(),
            ));
        }
    }
    Ok(format!("(?{}){}", flags, pattern))
}

/// Regex matcher with resumable cursor state.
///
/// Holds two match modes: a "global" cursor-bearing search that walks the
/// subject match by match, and a one-shot whole-subject match. The flag
/// `global_last` records which was used last so group lookups after a
/// restore read the right capture set.
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    pattern: String,
    subject: String,
    cursor: usize,
    last_match: Option<(usize, usize)>,
    captures: Vec<Option<(usize, usize)>>,
    global_last: bool,
}

impl RegexMatcher {
    /// Create a matcher over a subject and pattern
    pub fn new(subject: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            subject: subject.into(),
            cursor: 0,
            last_match: None,
            captures: Vec::new(),
            global_last: false,
        }
    }

    /// The pattern string
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The subject string
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Replace subject and pattern, resetting all cursor state
    pub fn reset(&mut self, subject: impl Into<String>, pattern: impl Into<String>) {
        self.subject = subject.into();
        self.pattern = pattern.into();
        self.cursor = 0;
        self.last_match = None;
        self.captures.clear();
        self.global_last = false;
    }

    /// Advance the global cursor to the next match
    pub fn find_next(&mut self, loc: &SourceLoc) -> RunResult<bool> {
        self.global_last = true;
        if self.cursor > self.subject.len() {
            self.last_match = None;
            self.captures.clear();
            return Ok(false);
        }
        let re = compile_pattern(&self.pattern, loc)?;
        match re.captures_at(&self.subject, self.cursor) {
            Some(caps) => {
                let whole = caps.get(0).unwrap();
                self.last_match = Some((whole.start(), whole.end()));
                self.captures = (0..caps.len())
                    .map(|i| caps.get(i).map(|m| (m.start(), m.end())))
                    .collect();
                // Empty matches still advance the cursor (to the next char
                // boundary, so the following search starts on a valid index)
                self.cursor = if whole.end() == whole.start() {
                    let mut next = whole.end() + 1;
                    while next < self.subject.len() && !self.subject.is_char_boundary(next) {
                        next += 1;
                    }
                    next
                } else {
                    whole.end()
                };
                Ok(true)
            }
            None => {
                self.last_match = None;
                self.captures.clear();
                self.cursor = self.subject.len() + 1;
                Ok(false)
            }
        }
    }

    /// One-shot whole-subject match
    pub fn matches(&mut self, loc: &SourceLoc) -> RunResult<bool> {
        self.global_last = false;
        let re = compile_pattern(&self.pattern, loc)?;
        match re.captures(&self.subject) {
            Some(caps) => {
                let whole = caps.get(0).unwrap();
                if whole.start() == 0 && whole.end() == self.subject.len() {
                    self.last_match = Some((whole.start(), whole.end()));
                    self.captures = (0..caps.len())
                        .map(|i| caps.get(i).map(|m| (m.start(), m.end())))
                        .collect();
                    return Ok(true);
                }
                self.last_match = None;
                self.captures.clear();
                Ok(false)
            }
            None => {
                self.last_match = None;
                self.captures.clear();
                Ok(false)
            }
        }
    }

    /// Text of capture group `i` from the last match (0 = whole match)
    pub fn group(&self, i: usize) -> Option<&str> {
        let (start, end) = (*self.captures.get(i)?)?;
        self.subject.get(start..end)
    }

    /// Start offset of the last match
    pub fn last_match_start(&self) -> Option<usize> {
        self.last_match.map(|(s, _)| s)
    }

    /// Serialize matcher state for a checkpoint
    pub fn write_state(&self, w: &mut CheckpointWriter) -> RunResult<()> {
        w.write_str(&self.pattern)?;
        w.write_str(&self.subject)?;
        w.write_clong(self.cursor as i64)?;
        match self.last_match {
            Some((s, e)) => {
                w.write_bool(true)?;
                w.write_clong(s as i64)?;
                w.write_clong(e as i64)?;
            }
            None => w.write_bool(false)?,
        }
        w.write_cint(self.captures.len() as i32)?;
        for cap in &self.captures {
            match cap {
                Some((s, e)) => {
                    w.write_bool(true)?;
                    w.write_clong(*s as i64)?;
                    w.write_clong(*e as i64)?;
                }
                None => w.write_bool(false)?,
            }
        }
        w.write_bool(self.global_last)
    }

    /// Restore matcher state from a checkpoint
    pub fn read_state(r: &mut CheckpointReader<'_>) -> RunResult<Self> {
        let pattern = r.read_str()?;
        let subject = r.read_str()?;
        let cursor = r.read_clong()? as usize;
        let last_match = if r.read_bool()? {
            Some((r.read_clong()? as usize, r.read_clong()? as usize))
        } else {
            None
        };
        let n = r.read_cint()?;
        if n < 0 {
            return Err(RuntimeError::msg("Corrupt checkpoint: negative capture count"));
        }
        let mut captures = Vec::with_capacity(n as usize);
        for _ in 0..n {
            if r.read_bool()? {
                captures.push(Some((r.read_clong()? as usize, r.read_clong()? as usize)));
            } else {
                captures.push(None);
            }
        }
        let global_last = r.read_bool()?;
        Ok(Self {
            pattern,
            subject,
            cursor,
            last_match,
            captures,
            global_last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> SourceLoc {
        SourceLoc::internal()
    }

    #[test]
    fn test_find_next_walks_matches() {
        let mut m = RegexMatcher::new("a1b22c333", r"\d+");
        assert!(m.find_next(&loc()).unwrap());
        assert_eq!(m.group(0), Some("1"));
        assert!(m.find_next(&loc()).unwrap());
        assert_eq!(m.group(0), Some("22"));
        assert!(m.find_next(&loc()).unwrap());
        assert_eq!(m.group(0), Some("333"));
        assert!(!m.find_next(&loc()).unwrap());
    }

    #[test]
    fn test_matches_is_whole_subject() {
        let mut m = RegexMatcher::new("abc123", r"[a-z]+\d+");
        assert!(m.matches(&loc()).unwrap());
        let mut m = RegexMatcher::new("abc123x", r"[a-z]+\d+");
        assert!(!m.matches(&loc()).unwrap());
    }

    #[test]
    fn test_capture_groups() {
        let mut m = RegexMatcher::new("key=value", r"(\w+)=(\w+)");
        assert!(m.matches(&loc()).unwrap());
        assert_eq!(m.group(1), Some("key"));
        assert_eq!(m.group(2), Some("value"));
        assert_eq!(m.group(3), None);
    }

    #[test]
    fn test_invalid_pattern_is_runtime_error() {
        let mut m = RegexMatcher::new("x", "(unclosed");
        assert!(m.find_next(&loc()).is_err());
    }

    #[test]
    fn test_apply_flags() {
        let p = apply_flags("abc", "i", &loc()).unwrap();
        let mut m = RegexMatcher::new("ABC", &p);
        assert!(m.matches(&loc()).unwrap());

        assert!(apply_flags("abc", "q", &loc()).is_err());
    }

    #[test]
    fn test_empty_match_advances() {
        let mut m = RegexMatcher::new("ab", "");
        let mut count = 0;
        while m.find_next(&loc()).unwrap() {
            count += 1;
            assert!(count < 10, "runaway matcher");
        }
        assert_eq!(count, 3); // positions 0, 1, 2
    }

    #[test]
    fn test_pattern_cache_reuses() {
        let a = compile_pattern(r"\d+", &loc()).unwrap();
        let b = compile_pattern(r"\d+", &loc()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
