//! Handle pattern matching.
//!
//! Patterns are globs over the full handle: `*` stands for one or more
//! arbitrary characters and everything else, `.` included, is literal.

use crate::error::{Result, SyncError};
use regex::{Regex, RegexSet};

/// Compiled set of handle patterns
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    set: RegexSet,
}

impl PatternMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Err(SyncError::Config(
                "At least one handle pattern is required".to_string(),
            ));
        }

        let sources = patterns
            .iter()
            .map(|p| glob_to_regex(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let set = RegexSet::new(&sources)
            .map_err(|e| SyncError::Config(format!("Invalid handle pattern: {}", e)))?;

        Ok(Self { set })
    }

    /// True if `handle` matches any configured pattern
    pub fn matches(&self, handle: &str) -> bool {
        self.set.is_match(handle)
    }
}

/// Translate one glob into an anchored regex source
fn glob_to_regex(pattern: &str) -> Result<String> {
    if pattern.is_empty() {
        return Err(SyncError::Config("Handle patterns must not be empty".to_string()));
    }

    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".+");
    let source = format!(r"\A{}\z", body);

    // Compile individually so a bad pattern is reported by name
    Regex::new(&source).map_err(|e| {
        SyncError::Config(format!("Invalid handle pattern '{}': {}", pattern, e))
    })?;

    Ok(source)
}
