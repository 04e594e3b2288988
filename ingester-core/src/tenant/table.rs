//! Per-tenant series table

use crate::chunk::ChunkEncoding;
use crate::matcher::{matches_all, LabelMatcher, MatchType};
use crate::series::SeriesBuffer;
use crate::{Fingerprint, Metric};
use dashmap::DashMap;
use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type LabelIndex = FnvHashMap<String, FnvHashMap<String, FnvHashSet<Fingerprint>>>;

/// Series of one tenant
pub struct TenantTable {
    id: String,
    encoding: &'static dyn ChunkEncoding,
    /// Fingerprint -> series; more than one entry means a hash collision
    series: DashMap<Fingerprint, Vec<Arc<SeriesBuffer>>>,
    /// label name -> label value -> fingerprints
    index: RwLock<LabelIndex>,
    series_count: AtomicUsize,
}

impl TenantTable {
    pub fn new(id: impl Into<String>, encoding: &'static dyn ChunkEncoding) -> Self {
        Self {
            id: id.into(),
            encoding,
            series: DashMap::new(),
            index: RwLock::new(LabelIndex::default()),
            series_count: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of series
    pub fn len(&self) -> usize {
        self.series_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the series for `metric`, creating and indexing it on first use.
    /// Lookup is by fingerprint, confirmed by full label-set equality.
    pub fn get_or_create_series(&self, metric: &Metric) -> Arc<SeriesBuffer> {
        let fingerprint = metric.fingerprint();

        if let Some(existing) = self.lookup(fingerprint, metric) {
            return existing;
        }

        let series = {
            let mut bucket = self.series.entry(fingerprint).or_default();
            if let Some(existing) = bucket.iter().find(|s| s.metric() == metric) {
                return existing.clone();
            }
            if !bucket.is_empty() {
                debug!(tenant = %self.id, %fingerprint, "fingerprint collision");
            }
            // Index before publishing: anyone who can reach the series must
            // also find it through matchers
            self.index_series(metric, fingerprint);
            let series = Arc::new(SeriesBuffer::new(metric.clone(), self.encoding));
            bucket.push(series.clone());
            series
        };

        self.series_count.fetch_add(1, Ordering::Relaxed);
        series
    }

    /// Every series satisfying all matchers; no matchers selects everything
    pub fn match_series(&self, matchers: &[LabelMatcher]) -> Vec<Arc<SeriesBuffer>> {
        match self.index_candidates(matchers) {
            Some(fingerprints) => fingerprints
                .into_iter()
                .filter_map(|fp| self.series.get(&fp).map(|bucket| bucket.value().clone()))
                .flatten()
                .filter(|s| matches_all(matchers, s.metric()))
                .collect(),
            None => self
                .series
                .iter()
                .flat_map(|bucket| bucket.value().clone())
                .filter(|s| matches_all(matchers, s.metric()))
                .collect(),
        }
    }

    /// Every series of the tenant
    pub fn all_series(&self) -> Vec<Arc<SeriesBuffer>> {
        self.match_series(&[])
    }

    /// Sorted distinct values of a label
    pub fn label_values(&self, name: &str) -> Vec<String> {
        let index = self.index.read();
        let mut values: Vec<String> = index
            .get(name)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default();
        values.sort();
        values
    }

    /// Sorted label names in use
    pub fn label_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup(&self, fingerprint: Fingerprint, metric: &Metric) -> Option<Arc<SeriesBuffer>> {
        self.series
            .get(&fingerprint)
            .and_then(|bucket| bucket.iter().find(|s| s.metric() == metric).cloned())
    }

    fn index_series(&self, metric: &Metric, fingerprint: Fingerprint) {
        let mut index = self.index.write();
        for (name, value) in metric.iter() {
            index
                .entry(name.to_string())
                .or_default()
                .entry(value.to_string())
                .or_default()
                .insert(fingerprint);
        }
    }

    /// Narrow the search with the index. Only matchers that reject the empty
    /// value can be answered from it, since series without the label never
    /// appear under that name. `None` means a full scan is needed.
    fn index_candidates(&self, matchers: &[LabelMatcher]) -> Option<FnvHashSet<Fingerprint>> {
        let index = self.index.read();
        let mut candidates: Option<FnvHashSet<Fingerprint>> = None;

        for matcher in matchers.iter().filter(|m| !m.matches_empty()) {
            let mut hits = FnvHashSet::default();
            if let Some(values) = index.get(matcher.name()) {
                if matcher.match_type() == MatchType::Equal {
                    if let Some(fps) = values.get(matcher.value()) {
                        hits.extend(fps.iter().copied());
                    }
                } else {
                    for (value, fps) in values {
                        if matcher.matches_value(value) {
                            hits.extend(fps.iter().copied());
                        }
                    }
                }
            }

            candidates = Some(match candidates {
                None => hits,
                Some(prev) => prev.intersection(&hits).copied().collect(),
            });
        }

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::EncodingKind;

    fn table() -> TenantTable {
        TenantTable::new("1", EncodingKind::Gorilla.codec())
    }

    fn populate(table: &TenantTable) {
        for (name, job, env) in [
            ("http_requests", "api", "prod"),
            ("http_requests", "web", "prod"),
            ("http_requests", "api", "dev"),
            ("up", "api", "prod"),
        ] {
            table.get_or_create_series(&Metric::named(name).with_label("job", job).with_label("env", env));
        }
        table.get_or_create_series(&Metric::named("up"));
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let table = table();
        let metric = Metric::named("up").with_label("job", "api");

        let a = table.get_or_create_series(&metric);
        let b = table.get_or_create_series(&metric.clone());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
        assert!(table.lookup(Metric::named("down").fingerprint(), &Metric::named("down")).is_none());
    }

    #[test]
    fn test_match_series() {
        let table = table();
        populate(&table);

        let count = |matchers: Vec<LabelMatcher>| table.match_series(&matchers).len();

        assert_eq!(count(vec![]), 5);
        assert_eq!(count(vec![LabelMatcher::equal("job", "api").unwrap()]), 3);
        assert_eq!(
            count(vec![
                LabelMatcher::equal("__name__", "http_requests").unwrap(),
                LabelMatcher::equal("env", "prod").unwrap(),
            ]),
            2
        );
        assert_eq!(count(vec![LabelMatcher::regex("job", ".+").unwrap()]), 4);
        assert_eq!(count(vec![LabelMatcher::regex("job", "w.*").unwrap()]), 1);
        // scan path: matches empty, so also the series without a job label
        assert_eq!(count(vec![LabelMatcher::new(MatchType::NotEqual, "job", "api").unwrap()]), 2);
        assert_eq!(count(vec![LabelMatcher::equal("job", "").unwrap()]), 1);
        assert_eq!(count(vec![LabelMatcher::equal("job", "none").unwrap()]), 0);
    }

    #[test]
    fn test_label_values_sorted() {
        let table = table();
        populate(&table);

        assert_eq!(table.label_values("job"), vec!["api", "web"]);
        assert_eq!(table.label_values("missing"), Vec::<String>::new());
        assert_eq!(table.label_names(), vec!["__name__", "env", "job"]);
    }

    #[test]
    fn test_concurrent_creation_yields_one_series() {
        let table = Arc::new(table());
        let metric = Metric::named("contended").with_label("job", "x");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let metric = metric.clone();
                std::thread::spawn(move || table.get_or_create_series(&metric))
            })
            .collect();

        let created: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(created.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reachable_series_is_always_matchable() {
        let table = Arc::new(table());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let job = format!("job-{}", i);
                        let series = table.get_or_create_series(&Metric::named("up").with_label("job", job.as_str()));
                        let matcher = LabelMatcher::equal("job", job).unwrap();
                        let hits = table.match_series(&[matcher]);
                        assert!(hits.iter().any(|s| Arc::ptr_eq(s, &series)));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), 200);
    }
}
