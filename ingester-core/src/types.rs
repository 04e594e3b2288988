//! Core types shared by the buffer, flush and query paths

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

/// Sample timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Label carrying the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Separator byte fed between label names and values when fingerprinting.
/// It never occurs in valid UTF-8.
const SEPARATOR: u8 = 0xff;

/// A single timestamped value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Timestamp in milliseconds
    pub timestamp: Timestamp,
    /// Sample value
    pub value: f64,
}

impl Sample {
    /// Create a new sample
    pub const fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Immutable label set identifying one series
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metric(BTreeMap<String, String>);

impl Metric {
    /// Create an empty metric
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Create a metric carrying only a name
    pub fn named(name: impl Into<String>) -> Self {
        Self::new().with_label(METRIC_NAME_LABEL, name)
    }

    /// Add a label to the metric
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Get a label value. Absent labels read as the empty string when matching.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Metric name, if set
    pub fn name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    /// Iterate over labels in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the metric carries no labels
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deterministic FNV-1a hash of the sorted label pairs
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = FnvHasher::default();
        for (name, value) in &self.0 {
            hasher.write(name.as_bytes());
            hasher.write_u8(SEPARATOR);
            hasher.write(value.as_bytes());
            hasher.write_u8(SEPARATOR);
        }
        Fingerprint(hasher.finish())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metric {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut labels = self.0.iter().filter(|(k, _)| k.as_str() != METRIC_NAME_LABEL);
        write!(f, "{}{{", self.name().unwrap_or_default())?;
        if let Some((k, v)) = labels.next() {
            write!(f, "{}={:?}", k, v)?;
        }
        for (k, v) in labels {
            write!(f, ", {}={:?}", k, v)?;
        }
        write!(f, "}}")
    }
}

/// Hash of a metric, used as the series key. Collisions are possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Time range for queries, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The whole timeline
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if the span `[start, end]` overlaps this range
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.start <= end && self.end >= start
    }

    /// Check if the range selects nothing
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// One series' samples as returned by a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleStream {
    /// Series labels
    pub metric: Metric,
    /// Samples in strictly increasing timestamp order
    pub samples: Vec<Sample>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = Metric::named("up").with_label("job", "api").with_label("instance", "a:1");
        let b: Metric = [("instance", "a:1"), ("job", "api"), (METRIC_NAME_LABEL, "up")]
            .into_iter()
            .collect();

        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_separates_pairs() {
        // "ab"="c" must not hash like "a"="bc"
        let a = Metric::new().with_label("ab", "c");
        let b = Metric::new().with_label("a", "bc");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_metric_display() {
        let m = Metric::named("testmetric_0").with_label("job", "testjob");
        assert_eq!(m.to_string(), "testmetric_0{job=\"testjob\"}");
        assert_eq!(Fingerprint(255).to_string(), "00000000000000ff");
    }

    #[test]
    fn test_time_range() {
        let range = TimeRange::new(100, 200);

        assert!(range.contains(100));
        assert!(range.contains(200));
        assert!(!range.contains(201));
        assert!(range.overlaps(150, 250));
        assert!(!range.overlaps(300, 400));
        assert!(TimeRange::new(5, 4).is_empty());
    }
}
