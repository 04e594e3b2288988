//! Label matchers used to select series
//!
//! A matcher is a predicate over a [`Metric`]; a query ANDs all of its
//! matchers together. Absent labels are treated as having the empty value,
//! so `team=""` selects series without a `team` label.

use crate::{IngesterError, Metric, Result};
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Predicate over a metric's labels
pub trait Matcher: Send + Sync + fmt::Debug {
    fn matches(&self, metric: &Metric) -> bool;
}

/// Comparison performed by a [`LabelMatcher`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    Equal,
    NotEqual,
    RegexMatch,
    RegexNoMatch,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Equal => "=",
            MatchType::NotEqual => "!=",
            MatchType::RegexMatch => "=~",
            MatchType::RegexNoMatch => "!~",
        }
    }
}

impl FromStr for MatchType {
    type Err = IngesterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "=" => Ok(MatchType::Equal),
            "!=" => Ok(MatchType::NotEqual),
            "=~" => Ok(MatchType::RegexMatch),
            "!~" => Ok(MatchType::RegexNoMatch),
            other => Err(IngesterError::InvalidMatcher(format!(
                "unknown match type {:?}",
                other
            ))),
        }
    }
}

/// Matches one label against a literal or a fully anchored regex
#[derive(Clone)]
pub struct LabelMatcher {
    match_type: MatchType,
    name: String,
    value: String,
    regex: Option<Regex>,
}

impl LabelMatcher {
    /// Create a matcher, compiling the regex for `=~` and `!~`
    pub fn new(match_type: MatchType, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();

        if name.is_empty() {
            return Err(IngesterError::InvalidMatcher("empty label name".into()));
        }

        let regex = match match_type {
            MatchType::RegexMatch | MatchType::RegexNoMatch => {
                let anchored = format!("^(?:{})$", value);
                let re = Regex::new(&anchored).map_err(|e| {
                    IngesterError::InvalidMatcher(format!("{}{}{:?}: {}", name, match_type.as_str(), value, e))
                })?;
                Some(re)
            }
            MatchType::Equal | MatchType::NotEqual => None,
        };

        Ok(Self {
            match_type,
            name,
            value,
            regex,
        })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Self::new(MatchType::Equal, name, value)
    }

    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Result<Self> {
        Self::new(MatchType::RegexMatch, name, pattern)
    }

    pub fn match_type(&self) -> MatchType {
        self.match_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Test a single label value
    pub fn matches_value(&self, value: &str) -> bool {
        match (self.match_type, &self.regex) {
            (MatchType::Equal, _) => value == self.value,
            (MatchType::NotEqual, _) => value != self.value,
            (MatchType::RegexMatch, Some(re)) => re.is_match(value),
            (MatchType::RegexNoMatch, Some(re)) => !re.is_match(value),
            // regex variants are always built with a compiled pattern
            (_, None) => false,
        }
    }

    /// Whether series lacking the label satisfy this matcher.
    /// Matchers that do not can be answered from the label index alone.
    pub fn matches_empty(&self) -> bool {
        self.matches_value("")
    }
}

impl Matcher for LabelMatcher {
    fn matches(&self, metric: &Metric) -> bool {
        self.matches_value(metric.get(&self.name).unwrap_or_default())
    }
}

impl fmt::Debug for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.match_type.as_str(), self.value)
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Check a metric against every matcher
pub fn matches_all<M: Matcher>(matchers: &[M], metric: &Metric) -> bool {
    matchers.iter().all(|m| m.matches(metric))
}
