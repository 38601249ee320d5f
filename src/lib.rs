//! Multi-core hash table micro-benchmark harness.
//!
//! Generates socket-local workloads, fans one operation at a time out to a
//! set of pinned workers, times each worker's run with the cycle counter and
//! averages the per-worker metrics into one CSV row per measurement.
//!
//! ```text
//!  Experiment ──► Dispatcher ──► worker threads ──► Operation::run
//!      │              │                                  │
//!  workloads      StartGate                         HashTable
//!  (per socket)   TaskReport arena                  (per worker)
//!      │              │
//!      └──────────────┴──► aggregate ──► RowSink (CSV)
//! ```
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod key;
pub mod numa;
pub mod occupancy;
pub mod ops;
pub mod stats;
pub mod table;
pub mod topology;
pub mod workload;

pub use error::{BenchError, Result};

/// Logs go to stderr, filtered by `RUST_LOG` (default `info`). Stdout is
/// reserved for results.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_target(false)
        .with_filter(filter);
    let _ = tracing_subscriber::registry().with(layer).try_init();
}
