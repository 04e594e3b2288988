//! JSON wire format of the push and query endpoints

use ingester_core::matcher::{LabelMatcher, MatchType};
use ingester_core::{Metric, Result, Sample, SampleStream, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `POST /api/v1/push`
#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Debug, Deserialize)]
pub struct TimeSeries {
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<PushSample>,
}

#[derive(Debug, Deserialize)]
pub struct PushSample {
    /// Milliseconds since epoch; receive time when absent
    pub timestamp: Option<Timestamp>,
    pub value: f64,
}

impl PushRequest {
    /// Flatten into the `(metric, sample)` pairs the ingester appends,
    /// preserving request order
    pub fn into_samples(self) -> Vec<(Metric, Sample)> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut out = Vec::new();

        for series in self.timeseries {
            let metric: Metric = series.labels.into_iter().collect();
            for sample in series.samples {
                let timestamp = sample.timestamp.unwrap_or(now);
                out.push((metric.clone(), Sample::new(timestamp, sample.value)));
            }
        }
        out
    }
}

/// Body of `POST /api/v1/query`
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub from: Timestamp,
    pub through: Timestamp,
    #[serde(default)]
    pub matchers: Vec<MatcherParams>,
}

#[derive(Debug, Deserialize)]
pub struct MatcherParams {
    /// One of `=`, `!=`, `=~`, `!~`
    #[serde(rename = "type")]
    pub match_type: String,
    pub name: String,
    pub value: String,
}

impl MatcherParams {
    pub fn to_matcher(&self) -> Result<LabelMatcher> {
        let match_type: MatchType = self.match_type.parse()?;
        LabelMatcher::new(match_type, self.name.as_str(), self.value.as_str())
    }
}

impl QueryRequest {
    pub fn matchers(&self) -> Result<Vec<LabelMatcher>> {
        self.matchers.iter().map(MatcherParams::to_matcher).collect()
    }
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub series: Vec<SeriesResponse>,
}

#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    pub labels: Metric,
    pub samples: Vec<Sample>,
}

impl QueryResponse {
    /// Series sorted by labels for stable output
    pub fn from_streams(mut streams: Vec<SampleStream>) -> Self {
        streams.sort_by(|a, b| a.metric.cmp(&b.metric));
        Self {
            series: streams
                .into_iter()
                .map(|s| SeriesResponse {
                    labels: s.metric,
                    samples: s.samples,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingester_core::IngesterError;

    #[test]
    fn test_parse_push_request() {
        let body = r#"{"timeseries":[{"labels":{"__name__":"up","job":"api"},
            "samples":[{"timestamp":1000,"value":1.5},{"value":2}]}]}"#;
        let req: PushRequest = serde_json::from_str(body).unwrap();
        let samples = req.into_samples();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].0.get("job"), Some("api"));
        assert_eq!(samples[0].1, Sample::new(1000, 1.5));
        assert!(samples[1].1.timestamp > 1000);
    }

    #[test]
    fn test_parse_matchers() {
        let body = r#"{"from":0,"through":10,"matchers":[{"type":"=~","name":"job","value":".+"}]}"#;
        let req: QueryRequest = serde_json::from_str(body).unwrap();
        let matchers = req.matchers().unwrap();
        assert_eq!(matchers[0].match_type(), MatchType::RegexMatch);

        let bad = MatcherParams {
            match_type: "==".into(),
            name: "job".into(),
            value: "api".into(),
        };
        assert!(matches!(bad.to_matcher(), Err(IngesterError::InvalidMatcher(_))));
    }
}
