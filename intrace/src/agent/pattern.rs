//! Unit name matching
//!
//! A pattern is a `|`-separated list of globs: `*` matches any run of
//! characters, `?` matches exactly one, everything else is literal. A name
//! matches when it matches any alternative in full. The empty pattern matches
//! nothing.

use crate::domain::PatternError;
use regex::Regex;

/// A compiled `|`-separated glob list
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Option<Regex>,
}

impl GlobPattern {
    /// Compile a pattern
    ///
    /// # Errors
    /// Returns [`PatternError::Invalid`] if an alternative cannot be compiled
    pub fn new(source: &str) -> Result<Self, PatternError> {
        let alternatives: Vec<String> = source
            .split('|')
            .map(str::trim)
            .filter(|alt| !alt.is_empty())
            .map(glob_to_regex)
            .collect();

        if alternatives.is_empty() {
            return Ok(Self { source: source.to_string(), regex: None });
        }

        let regex = Regex::new(&format!("^(?:{})$", alternatives.join("|"))).map_err(|e| {
            PatternError::Invalid { pattern: source.to_string(), reason: e.to_string() }
        })?;
        Ok(Self { source: source.to_string(), regex: Some(regex) })
    }

    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.regex.as_ref().is_some_and(|re| re.is_match(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    let mut literal = String::new();
    for c in glob.chars() {
        match c {
            '*' | '?' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if c == '*' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    out.push_str(&regex::escape(&literal));
    out
}

/// Include/exclude selection of unit names
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    include: GlobPattern,
    exclude: GlobPattern,
}

impl PatternMatcher {
    /// # Errors
    /// Returns [`PatternError::Invalid`] if either pattern cannot be compiled
    pub fn new(include: &str, exclude: &str) -> Result<Self, PatternError> {
        Ok(Self { include: GlobPattern::new(include)?, exclude: GlobPattern::new(exclude)? })
    }

    /// Selected iff the name matches include and does not match exclude
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.include.matches(name) && !self.exclude.matches(name)
    }

    #[must_use]
    pub fn include(&self) -> &str {
        self.include.as_str()
    }

    #[must_use]
    pub fn exclude(&self) -> &str {
        self.exclude.as_str()
    }
}

impl Default for PatternMatcher {
    fn default() -> Self {
        let none = GlobPattern { source: String::new(), regex: None };
        Self { include: none.clone(), exclude: none }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_exclude_selection() {
        let matcher = PatternMatcher::new("com.*", "*Test").unwrap();
        assert!(matcher.matches("com.foo.Bar"));
        assert!(!matcher.matches("com.foo.BarTest"));
        assert!(!matcher.matches("org.foo.Bar"));
    }

    #[test]
    fn test_empty_pattern_matches_nothing() {
        let matcher = PatternMatcher::new("", "").unwrap();
        assert!(!matcher.matches("anything"));
        assert!(!matcher.matches(""));
        assert!(!PatternMatcher::default().matches("demo::Unit"));
    }

    #[test]
    fn test_alternatives_and_single_char() {
        let pattern = GlobPattern::new("demo::net::*|demo::Cache?").unwrap();
        assert!(pattern.matches("demo::net::Server"));
        assert!(pattern.matches("demo::Cache2"));
        assert!(!pattern.matches("demo::Cache"));
        assert!(!pattern.matches("demo::Cache22"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pattern = GlobPattern::new("a.b(c)").unwrap();
        assert!(pattern.matches("a.b(c)"));
        assert!(!pattern.matches("axb(c)"));
    }

    #[test]
    fn test_match_is_anchored() {
        let pattern = GlobPattern::new("Bar").unwrap();
        assert!(pattern.matches("Bar"));
        assert!(!pattern.matches("com.foo.Bar"));
    }
}
