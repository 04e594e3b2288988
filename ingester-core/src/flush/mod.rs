//! Background flush of closed chunks to the durable store
//!
//! A [`FlushScheduler`] sweeps every tenant on a fixed period. Each sweep
//! harvests the pending chunks of every series (one series lock at a time),
//! sends one `put` per tenant and only then acknowledges the chunks back to
//! their series. A failed `put` leaves the chunks pending, so the next
//! sweep sends them again.

use crate::clock::Clock;
use crate::series::{ChunkLimits, SeriesBuffer};
use crate::store::ChunkStore;
use crate::tenant::{TenantRegistry, TenantTable};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use crate::series::FlushMode;

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tenants visited
    pub tenants: usize,
    /// Series visited
    pub series: usize,
    /// Chunks the store accepted
    pub chunks_flushed: usize,
    /// Tenants whose `put` failed; their chunks stay pending
    pub failed_tenants: Vec<String>,
}

impl SweepReport {
    pub fn is_success(&self) -> bool {
        self.failed_tenants.is_empty()
    }
}

/// Lifetime counters
#[derive(Debug, Default)]
pub struct FlushStats {
    pub sweeps: AtomicU64,
    pub chunks_flushed: AtomicU64,
    pub failed_puts: AtomicU64,
}

/// Periodic sweeper over a [`TenantRegistry`]
pub struct FlushScheduler {
    registry: Arc<TenantRegistry>,
    store: Arc<dyn ChunkStore>,
    clock: Arc<dyn Clock>,
    limits: ChunkLimits,
    /// Serializes timer, manual and shutdown sweeps
    sweep_lock: Mutex<()>,
    stats: FlushStats,
}

impl FlushScheduler {
    pub fn new(
        registry: Arc<TenantRegistry>,
        store: Arc<dyn ChunkStore>,
        clock: Arc<dyn Clock>,
        limits: ChunkLimits,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            limits,
            sweep_lock: Mutex::new(()),
            stats: FlushStats::default(),
        }
    }

    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    /// Run one sweep over every tenant
    pub async fn sweep(&self, mode: FlushMode) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);

        let mut report = SweepReport::default();
        for table in self.registry.tenants() {
            report.tenants += 1;
            report.series += table.len();
            self.flush_tenant(&table, mode, &mut report).await;
        }

        if report.chunks_flushed > 0 || !report.is_success() {
            info!(
                ?mode,
                tenants = report.tenants,
                series = report.series,
                chunks = report.chunks_flushed,
                failed = report.failed_tenants.len(),
                "Flush sweep complete"
            );
        } else {
            debug!(?mode, tenants = report.tenants, "Flush sweep found nothing to flush");
        }
        report
    }

    /// Forced sweep repeated while any tenant's `put` keeps failing
    pub async fn drain(&self, retries: usize, backoff: Duration) -> SweepReport {
        let mut report = self.sweep(FlushMode::Force).await;
        let mut flushed = report.chunks_flushed;

        for attempt in 1..=retries {
            if report.is_success() {
                break;
            }
            warn!(
                attempt,
                tenants = ?report.failed_tenants,
                "Retrying final flush"
            );
            tokio::time::sleep(backoff).await;
            report = self.sweep(FlushMode::Force).await;
            flushed += report.chunks_flushed;
        }

        report.chunks_flushed = flushed;
        report
    }

    async fn flush_tenant(&self, table: &TenantTable, mode: FlushMode, report: &mut SweepReport) {
        let now = self.clock.now();
        let mut chunks = Vec::new();
        let mut acks: Vec<(Arc<SeriesBuffer>, u64)> = Vec::new();

        for series in table.all_series() {
            let harvest = series.harvest_flushable(&self.limits, mode, now);
            if harvest.is_empty() {
                continue;
            }
            acks.push((series, harvest.through));
            chunks.extend(harvest.chunks);
        }

        if chunks.is_empty() {
            return;
        }

        // No series lock is held here
        match self.store.put(table.id(), &chunks).await {
            Ok(()) => {
                for (series, through) in &acks {
                    series.mark_flushed(*through);
                }
                report.chunks_flushed += chunks.len();
                self.stats
                    .chunks_flushed
                    .fetch_add(chunks.len() as u64, Ordering::Relaxed);
                debug!(tenant = table.id(), chunks = chunks.len(), "Flushed chunks");
            }
            Err(e) => {
                self.stats.failed_puts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    tenant = table.id(),
                    chunks = chunks.len(),
                    error = %e,
                    "Failed to flush chunks, will retry next sweep"
                );
                report.failed_tenants.push(table.id().to_string());
            }
        }
    }

    /// Start the periodic loop. The loop exits once `shutdown` flips to
    /// `true` or its sender is dropped; it never runs the final sweep itself.
    pub fn spawn(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_ms = period.as_millis() as u64, "Flush scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep(FlushMode::Regular).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Flush scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::EncodingKind;
    use crate::clock::MockClock;
    use crate::store::MemoryChunkStore;
    use crate::{Metric, Sample};

    struct Fixture {
        registry: Arc<TenantRegistry>,
        store: Arc<MemoryChunkStore>,
        clock: Arc<MockClock>,
        scheduler: Arc<FlushScheduler>,
    }

    fn fixture(limits: ChunkLimits) -> Fixture {
        let registry = Arc::new(TenantRegistry::new(EncodingKind::Gorilla.codec()));
        let store = Arc::new(MemoryChunkStore::new());
        let clock = Arc::new(MockClock::new());
        let scheduler = Arc::new(FlushScheduler::new(
            registry.clone(),
            store.clone(),
            clock.clone(),
            limits,
        ));
        Fixture {
            registry,
            store,
            clock,
            scheduler,
        }
    }

    fn small_limits() -> ChunkLimits {
        ChunkLimits {
            max_samples: 10,
            max_age: Duration::from_secs(3600),
            max_idle: None,
        }
    }

    fn append(fx: &Fixture, tenant: &str, job: &str, range: std::ops::Range<i64>) {
        let table = fx.registry.get_or_create(tenant).unwrap();
        let series = table.get_or_create_series(&Metric::named("up").with_label("job", job));
        for t in range {
            series
                .append(Sample::new(t, t as f64), &small_limits(), fx.clock.now())
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_sweep_flushes_closed_chunks_once() {
        let fx = fixture(small_limits());
        append(&fx, "1", "api", 0..25);

        let report = fx.scheduler.sweep(FlushMode::Regular).await;
        assert_eq!(report.chunks_flushed, 2);
        assert_eq!(fx.store.put_count(), 1);

        let again = fx.scheduler.sweep(FlushMode::Regular).await;
        assert_eq!(again.chunks_flushed, 0);
        assert_eq!(fx.store.put_count(), 1);
        assert_eq!(fx.store.chunks("1").len(), 2);
    }

    #[tokio::test]
    async fn test_one_put_per_tenant() {
        let fx = fixture(small_limits());
        append(&fx, "1", "api", 0..15);
        append(&fx, "1", "web", 0..15);
        append(&fx, "2", "api", 0..15);

        let report = fx.scheduler.sweep(FlushMode::Regular).await;
        assert_eq!(report.tenants, 2);
        assert_eq!(report.series, 3);
        assert_eq!(report.chunks_flushed, 3);
        assert_eq!(fx.store.put_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_put_is_retried() {
        let fx = fixture(small_limits());
        append(&fx, "1", "api", 0..15);

        fx.store.set_failing(true);
        let report = fx.scheduler.sweep(FlushMode::Regular).await;
        assert_eq!(report.failed_tenants, vec!["1".to_string()]);
        assert_eq!(fx.scheduler.stats().failed_puts.load(Ordering::Relaxed), 1);

        fx.store.set_failing(false);
        let report = fx.scheduler.sweep(FlushMode::Regular).await;
        assert!(report.is_success());
        assert_eq!(report.chunks_flushed, 1);
        assert_eq!(fx.store.chunks("1").len(), 1);
    }

    #[tokio::test]
    async fn test_age_and_idle_close_open_chunk() {
        let limits = ChunkLimits {
            max_samples: 100,
            max_age: Duration::from_secs(3600),
            max_idle: Some(Duration::from_secs(300)),
        };
        let fx = fixture(limits);
        append(&fx, "1", "api", 0..5);

        assert_eq!(fx.scheduler.sweep(FlushMode::Regular).await.chunks_flushed, 0);

        fx.clock.advance(Duration::from_secs(301));
        assert_eq!(fx.scheduler.sweep(FlushMode::Regular).await.chunks_flushed, 1);
    }

    #[tokio::test]
    async fn test_force_sweep_closes_everything() {
        let fx = fixture(small_limits());
        append(&fx, "1", "api", 0..5);
        append(&fx, "2", "api", 0..5);

        let report = fx.scheduler.drain(2, Duration::from_millis(1)).await;
        assert!(report.is_success());
        assert_eq!(report.chunks_flushed, 2);

        let decoded = fx.store.decode_tenant("1").unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].samples.len(), 5);
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_retries() {
        let fx = fixture(small_limits());
        append(&fx, "1", "api", 0..5);
        fx.store.set_failing(true);

        let report = fx.scheduler.drain(2, Duration::from_millis(1)).await;
        assert!(!report.is_success());
        assert_eq!(fx.scheduler.stats().failed_puts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_loop_sweeps_and_stops() {
        let fx = fixture(small_limits());
        append(&fx, "1", "api", 0..15);

        let (tx, rx) = watch::channel(false);
        let handle = fx.scheduler.clone().spawn(Duration::from_secs(60), rx);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fx.store.put_count(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
