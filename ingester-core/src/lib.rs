//! Ingester Core - multi-tenant in-memory time-series ingestion
//!
//! Accepts samples per tenant, buffers them as compressed per-series
//! chunks, answers range queries from the buffer and periodically hands
//! closed chunks to a durable [`store::ChunkStore`].
//!
//! # Architecture
//!
//! - **Tenant registry / table**: tenant id -> series map with an inverted
//!   label index for matcher evaluation
//! - **Series buffer**: closed chunks plus one open chunk per series, each
//!   series behind its own lock
//! - **Chunk encoding**: pluggable codecs, Gorilla (delta-of-delta + XOR)
//!   by default
//! - **Flush scheduler**: timer-driven sweeps with at-least-once handoff and
//!   a forced final sweep on stop
//! - **Query engine**: matcher selection and in-order snapshots of buffered
//!   samples

pub mod chunk;
pub mod clock;
pub mod flush;
pub mod ingester;
pub mod matcher;
pub mod query;
pub mod series;
pub mod store;
pub mod tenant;

mod error;
mod types;

pub use error::{IngesterError, Result};
pub use ingester::{Ingester, IngesterConfig, IngesterStats};
pub use types::*;

/// Ingester version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Samples per chunk before it is closed
    pub const MAX_SAMPLES_PER_CHUNK: usize = 1024;

    /// Open chunk age that forces closing (1h)
    pub const MAX_CHUNK_AGE: Duration = Duration::from_secs(60 * 60);

    /// Open chunk idle time that lets a sweep close it (5m)
    pub const MAX_CHUNK_IDLE: Duration = Duration::from_secs(5 * 60);

    /// Interval between flush sweeps (1m)
    pub const FLUSH_CHECK_PERIOD: Duration = Duration::from_secs(60);

    /// Extra final-sweep attempts on stop
    pub const SHUTDOWN_FLUSH_RETRIES: usize = 3;

    /// Pause between final-sweep attempts
    pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

    /// Chunk store segment size (16MB)
    pub const STORE_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
}
