//! Read path over buffered series
//!
//! Queries only see what is still held in memory. Flushed chunks stay in
//! their series' closed-chunk sequence, so everything appended since the
//! process started is visible here without touching the durable store.

use crate::matcher::LabelMatcher;
use crate::tenant::TenantRegistry;
use crate::{Result, SampleStream, TimeRange, Timestamp};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub struct QueryEngine {
    registry: Arc<TenantRegistry>,
}

impl QueryEngine {
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self { registry }
    }

    /// Samples in `[from, through]` of every series of `tenant` matching
    /// all `matchers`. Series with no samples in range are left out; the
    /// order of series is unspecified.
    pub fn query(
        &self,
        tenant: &str,
        from: Timestamp,
        through: Timestamp,
        matchers: &[LabelMatcher],
    ) -> Result<Vec<SampleStream>> {
        let start = Instant::now();

        let Some(table) = self.registry.get(tenant)? else {
            return Ok(Vec::new());
        };

        let range = TimeRange::new(from, through);
        let candidates = table.match_series(matchers);
        let mut streams = Vec::with_capacity(candidates.len());

        for series in &candidates {
            let samples = series.snapshot(&range)?;
            if samples.is_empty() {
                continue;
            }
            streams.push(SampleStream {
                metric: series.metric().clone(),
                samples,
            });
        }

        debug!(
            tenant,
            candidates = candidates.len(),
            series = streams.len(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "Query executed"
        );
        Ok(streams)
    }

    /// Sorted distinct values of label `name` for `tenant`
    pub fn label_values(&self, tenant: &str, name: &str) -> Result<Vec<String>> {
        Ok(self
            .registry
            .get(tenant)?
            .map(|table| table.label_values(name))
            .unwrap_or_default())
    }

    /// Sorted label names in use by `tenant`
    pub fn label_names(&self, tenant: &str) -> Result<Vec<String>> {
        Ok(self
            .registry
            .get(tenant)?
            .map(|table| table.label_names())
            .unwrap_or_default())
    }
}
