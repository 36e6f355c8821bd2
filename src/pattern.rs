//! Channel pattern matching.
//!
//! Subscription patterns are globs over `/`-separated channel names:
//!
//! - `*` matches exactly one segment and never crosses `/`
//! - `**` matches any number of segments and must be a whole segment
//! - everything else matches literally, including `?`, `[` and `]`
//!
//! Empty segments are not allowed in patterns and never match, so
//! `/measurements/*` does not match `/measurements/`.
//!
//! # Example
//!
//! ```
//! use c8y_realtime::pattern::ChannelPattern;
//!
//! let pattern = ChannelPattern::compile("/measurements/*").unwrap();
//! assert!(pattern.matches("/measurements/12345"));
//! assert!(!pattern.matches("/measurements/12345/extra"));
//! ```

use std::fmt;

use glob::{MatchOptions, Pattern};

use crate::error::{RealtimeError, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A compiled subscription pattern.
#[derive(Clone)]
pub struct ChannelPattern {
    source: String,
    glob: Pattern,
}

impl ChannelPattern {
    /// Compile a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidPattern`] for empty patterns, patterns
    /// not starting with `/`, empty segments, and `**` that is not a whole
    /// segment.
    pub fn compile(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(RealtimeError::invalid_pattern(pattern, "pattern is empty"));
        }
        if !pattern.starts_with('/') {
            return Err(RealtimeError::invalid_pattern(
                pattern,
                "pattern must start with '/'",
            ));
        }

        if has_empty_segment(pattern) {
            return Err(RealtimeError::invalid_pattern(
                pattern,
                "pattern has an empty segment",
            ));
        }

        let glob = Pattern::new(&escape_literals(pattern))
            .map_err(|e| RealtimeError::invalid_pattern(pattern, e.msg))?;

        Ok(Self {
            source: pattern.to_string(),
            glob,
        })
    }

    /// Check whether a channel name matches this pattern.
    #[inline]
    pub fn matches(&self, channel: &str) -> bool {
        !has_empty_segment(channel) && self.glob.matches_with(channel, MATCH_OPTIONS)
    }

    /// The pattern as it was given to [`compile`](Self::compile).
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True if the pattern contains no wildcard.
    pub fn is_literal(&self) -> bool {
        !self.source.contains('*')
    }
}

/// Escape every glob metacharacter except `*`.
fn escape_literals(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for (i, literal) in pattern.split('*').enumerate() {
        if i > 0 {
            escaped.push('*');
        }
        escaped.push_str(&Pattern::escape(literal));
    }
    escaped
}

fn has_empty_segment(name: &str) -> bool {
    name.split('/').skip(1).any(str::is_empty)
}

impl fmt::Debug for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelPattern").field(&self.source).finish()
    }
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for ChannelPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for ChannelPattern {}
