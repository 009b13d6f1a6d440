//! Ant-style path patterns and the include/exclude filter.
//!
//! Supported wildcards: `?` (one character within a segment), `*` (any run
//! within a segment), `**` (any run across segments). Patterns compile to
//! anchored regexes once, at configuration time.
//!
//! Filter precedence: a path matching any exclude pattern always passes
//! through untouched; otherwise the path is processed when no include
//! patterns are configured or any include matches.

use crate::error::{FluxGateError, Result};
use regex::Regex;

/// One compiled Ant-style pattern.
#[derive(Debug, Clone)]
pub struct AntPathMatcher {
    pattern: String,
    regex: Regex,
}

impl AntPathMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = compile(pattern)?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' if i + 1 < chars.len() && chars[i + 1] == '*' => {
                let at_segment_start = i == 0 || chars[i - 1] == '/';
                if at_segment_start && i >= 1 && i + 2 == chars.len() {
                    // Trailing "/**" also matches the bare prefix.
                    re.truncate(re.len() - 1);
                    re.push_str("(?:/.*)?");
                } else if at_segment_start && i + 2 < chars.len() && chars[i + 2] == '/' {
                    // "**/" spans zero or more whole segments.
                    re.push_str("(?:.*/)?");
                    i += 3;
                    continue;
                } else {
                    re.push_str(".*");
                }
                i += 2;
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c if "\\.+()[]{}^$|".contains(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
        i += 1;
    }
    re.push('$');

    Regex::new(&re).map_err(|e| {
        FluxGateError::ConfigurationInvalid(format!("bad path pattern '{pattern}': {e}"))
    })
}

/// Include/exclude decision for the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    includes: Vec<AntPathMatcher>,
    excludes: Vec<AntPathMatcher>,
}

impl PathFilter {
    pub fn new(include_patterns: &[String], exclude_patterns: &[String]) -> Result<Self> {
        let includes = include_patterns
            .iter()
            .map(|p| AntPathMatcher::new(p))
            .collect::<Result<Vec<_>>>()?;
        let excludes = exclude_patterns
            .iter()
            .map(|p| AntPathMatcher::new(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { includes, excludes })
    }

    /// Whether the gate should evaluate this path.
    pub fn should_process(&self, path: &str) -> bool {
        if self.excludes.iter().any(|m| m.matches(path)) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|m| m.matches(path))
    }
}
