//! Ingester facade: append, query, flush and shutdown for all tenants

use crate::chunk::EncodingKind;
use crate::clock::{Clock, SystemClock};
use crate::flush::{FlushMode, FlushScheduler, SweepReport};
use crate::matcher::LabelMatcher;
use crate::query::QueryEngine;
use crate::series::ChunkLimits;
use crate::store::ChunkStore;
use crate::tenant::TenantRegistry;
use crate::{config, IngesterError, Metric, Result, Sample, SampleStream, Timestamp};
use serde::Serialize;
use parking_lot::RwLock;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Ingester configuration
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Interval between regular flush sweeps
    pub flush_check_period: Duration,
    /// Open chunks older than this are closed
    pub max_chunk_age: Duration,
    /// Open chunks without appends for this long are closed by a sweep
    pub max_chunk_idle: Option<Duration>,
    /// Sample-count bound of a chunk
    pub max_samples_per_chunk: usize,
    /// Chunk codec
    pub encoding: EncodingKind,
    /// Extra attempts of the final sweep when the store keeps failing
    pub shutdown_flush_retries: usize,
    /// Pause between final sweep attempts
    pub retry_backoff: Duration,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            flush_check_period: config::FLUSH_CHECK_PERIOD,
            max_chunk_age: config::MAX_CHUNK_AGE,
            max_chunk_idle: Some(config::MAX_CHUNK_IDLE),
            max_samples_per_chunk: config::MAX_SAMPLES_PER_CHUNK,
            encoding: EncodingKind::default(),
            shutdown_flush_retries: config::SHUTDOWN_FLUSH_RETRIES,
            retry_backoff: config::RETRY_BACKOFF,
        }
    }
}

impl IngesterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flush_check_period.is_zero() {
            return Err(IngesterError::Config("flush_check_period must be positive".into()));
        }
        if self.max_chunk_age.is_zero() {
            return Err(IngesterError::Config("max_chunk_age must be positive".into()));
        }
        if self.max_chunk_idle.is_some_and(|idle| idle.is_zero()) {
            return Err(IngesterError::Config("max_chunk_idle must be positive".into()));
        }
        if self.max_samples_per_chunk == 0 {
            return Err(IngesterError::Config("max_samples_per_chunk must be positive".into()));
        }
        Ok(())
    }

    pub fn chunk_limits(&self) -> ChunkLimits {
        ChunkLimits {
            max_samples: self.max_samples_per_chunk,
            max_age: self.max_chunk_age,
            max_idle: self.max_chunk_idle,
        }
    }
}

/// Ingester statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngesterStats {
    pub tenants: usize,
    pub series: usize,
    pub open_chunks: usize,
    pub open_samples: usize,
    /// Closed chunks the store has not accepted yet
    pub pending_chunks: usize,
    pub flushed_chunks: u64,
    pub failed_puts: u64,
    pub sweeps: u64,
}

/// Multi-tenant in-memory ingester
pub struct Ingester {
    config: IngesterConfig,
    limits: ChunkLimits,
    clock: Arc<dyn Clock>,
    registry: Arc<TenantRegistry>,
    engine: QueryEngine,
    scheduler: Arc<FlushScheduler>,
    /// Set once `stop` begins. Appends hold the read side for their whole
    /// run, so the final drain never misses an acknowledged sample.
    stopped: RwLock<bool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown: Mutex<Shutdown>,
}

#[derive(Default)]
struct Shutdown {
    /// Timer loop handle, taken by the first `stop`
    flush_loop: Option<JoinHandle<()>>,
    /// A final drain has succeeded
    drained: bool,
}

impl Ingester {
    /// Create an ingester and start its flush loop. Must be called from
    /// within a tokio runtime.
    pub fn new(config: IngesterConfig, store: Arc<dyn ChunkStore>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(config: IngesterConfig, store: Arc<dyn ChunkStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        tokio::runtime::Handle::try_current()
            .map_err(|e| IngesterError::Config(format!("ingester needs a tokio runtime: {}", e)))?;

        let limits = config.chunk_limits();
        let registry = Arc::new(TenantRegistry::new(config.encoding.codec()));
        let engine = QueryEngine::new(registry.clone());
        let scheduler = Arc::new(FlushScheduler::new(registry.clone(), store, clock.clone(), limits));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flush_loop = scheduler.clone().spawn(config.flush_check_period, shutdown_rx);

        info!(
            encoding = ?config.encoding,
            max_samples = config.max_samples_per_chunk,
            max_age_secs = config.max_chunk_age.as_secs(),
            "Ingester started"
        );

        Ok(Self {
            config,
            limits,
            clock,
            registry,
            engine,
            scheduler,
            stopped: RwLock::new(false),
            shutdown_tx,
            shutdown: Mutex::new(Shutdown {
                flush_loop: Some(flush_loop),
                drained: false,
            }),
        })
    }

    pub fn config(&self) -> &IngesterConfig {
        &self.config
    }

    /// Append samples for one tenant, in order. Stops at the first rejected
    /// sample; samples before it stay applied.
    pub fn append(&self, tenant: &str, samples: &[(Metric, Sample)]) -> Result<()> {
        let stopped = self.stopped.read();
        if *stopped {
            return Err(IngesterError::Stopped);
        }

        let table = self.registry.get_or_create(tenant)?;
        let now = self.clock.now();
        for (metric, sample) in samples {
            table
                .get_or_create_series(metric)
                .append(*sample, &self.limits, now)?;
        }
        Ok(())
    }

    /// Buffered samples of `tenant` in `[from, through]` for every series
    /// matching all `matchers`
    pub fn query(
        &self,
        tenant: &str,
        from: Timestamp,
        through: Timestamp,
        matchers: &[LabelMatcher],
    ) -> Result<Vec<SampleStream>> {
        self.engine.query(tenant, from, through, matchers)
    }

    pub fn label_values(&self, tenant: &str, name: &str) -> Result<Vec<String>> {
        self.engine.label_values(tenant, name)
    }

    pub fn label_names(&self, tenant: &str) -> Result<Vec<String>> {
        self.engine.label_names(tenant)
    }

    /// Run one regular sweep now
    pub async fn flush(&self) -> SweepReport {
        self.scheduler.sweep(FlushMode::Regular).await
    }

    /// Stop the flush loop and force every buffered sample into the store.
    /// If the store keeps failing the call errors and may be repeated; once a
    /// drain has succeeded, later calls return immediately.
    pub async fn stop(&self) -> Result<()> {
        let mut shutdown = self.shutdown.lock().await;
        if shutdown.drained {
            return Ok(());
        }

        // Waits for in-flight appends
        *self.stopped.write() = true;

        if let Some(handle) = shutdown.flush_loop.take() {
            // The loop may already be gone if the runtime is shutting down
            let _ = self.shutdown_tx.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Flush loop ended abnormally");
            }
        }

        let report = self
            .scheduler
            .drain(self.config.shutdown_flush_retries, self.config.retry_backoff)
            .await;

        if !report.is_success() {
            return Err(IngesterError::StoreUnavailable(format!(
                "final flush failed for tenants {:?}",
                report.failed_tenants
            )));
        }

        shutdown.drained = true;
        info!(chunks = report.chunks_flushed, tenants = report.tenants, "Ingester stopped");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.read()
    }

    pub fn stats(&self) -> IngesterStats {
        let mut stats = IngesterStats {
            tenants: self.registry.len(),
            ..Default::default()
        };

        for table in self.registry.tenants() {
            for series in table.all_series() {
                let s = series.stats();
                stats.series += 1;
                stats.pending_chunks += s.pending_chunks;
                stats.open_samples += s.open_samples;
                if s.has_open_chunk {
                    stats.open_chunks += 1;
                }
            }
        }

        let flush = self.scheduler.stats();
        stats.flushed_chunks = flush.chunks_flushed.load(Ordering::Relaxed);
        stats.failed_puts = flush.failed_puts.load(Ordering::Relaxed);
        stats.sweeps = flush.sweeps.load(Ordering::Relaxed);
        stats
    }
}
