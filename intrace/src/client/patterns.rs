//! Observer-side text filter patterns
//!
//! `.*` and the empty string are kept as explicit MATCH-ALL / MATCH-NONE
//! variants. Everything else compiles to a regex that must match the whole
//! line, with `.` also matching newlines.

use crate::domain::PatternError;
use regex::{Regex, RegexBuilder};

pub const MATCH_ALL_SOURCE: &str = ".*";
pub const MATCH_NONE_SOURCE: &str = "";

#[derive(Debug, Clone)]
pub enum FilterPattern {
    MatchAll,
    MatchNone,
    Regex { source: String, regex: Regex },
}

impl FilterPattern {
    /// # Errors
    /// Returns [`PatternError::Invalid`] for a malformed regex
    pub fn compile(source: &str) -> Result<Self, PatternError> {
        match source {
            MATCH_ALL_SOURCE => Ok(Self::MatchAll),
            MATCH_NONE_SOURCE => Ok(Self::MatchNone),
            _ => {
                let regex = RegexBuilder::new(&format!("^(?:{source})$"))
                    .dot_matches_new_line(true)
                    .build()
                    .map_err(|e| PatternError::Invalid {
                        pattern: source.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Self::Regex { source: source.to_string(), regex })
            }
        }
    }

    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        match self {
            Self::MatchAll => true,
            Self::MatchNone => false,
            Self::Regex { regex, .. } => regex.is_match(text),
        }
    }

    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Self::MatchAll => MATCH_ALL_SOURCE,
            Self::MatchNone => MATCH_NONE_SOURCE,
            Self::Regex { source, .. } => source,
        }
    }
}

/// Include/exclude pair applied to trace lines
#[derive(Debug, Clone)]
pub struct PatternPair {
    pub include: FilterPattern,
    pub exclude: FilterPattern,
}

impl Default for PatternPair {
    fn default() -> Self {
        Self { include: FilterPattern::MatchAll, exclude: FilterPattern::MatchNone }
    }
}

impl PatternPair {
    /// # Errors
    /// Returns [`PatternError`] if either side fails to compile
    pub fn compile(include: &str, exclude: &str) -> Result<Self, PatternError> {
        Ok(Self { include: FilterPattern::compile(include)?, exclude: FilterPattern::compile(exclude)? })
    }

    /// Exclude wins when both sides match
    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        self.include.matches(text) && !self.exclude.matches(text)
    }

    /// Textual equality of both sides
    #[must_use]
    pub fn same_source(&self, other: &PatternPair) -> bool {
        self.include.source() == other.include.source() && self.exclude.source() == other.exclude.source()
    }

    #[must_use]
    pub fn sources(&self) -> (String, String) {
        (self.include.source().to_string(), self.exclude.source().to_string())
    }
}

/// Pattern matching any line that contains `selection` literally
#[must_use]
pub fn pattern_from_selection(selection: &str) -> String {
    format!(".*{}.*", regex::escape(selection))
}

/// OR-append `addition` to an existing pattern; the sentinels are replaced
#[must_use]
pub fn extend_pattern(existing: &str, addition: &str) -> String {
    if existing == MATCH_ALL_SOURCE || existing == MATCH_NONE_SOURCE {
        addition.to_string()
    } else {
        format!("{existing}|{addition}")
    }
}
