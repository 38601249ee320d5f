//! Error types shared by the harness.
//!
//! Every variant is fatal for the run that produced it. Correctness anomalies
//! in the table under test are not errors; see [`crate::table::IntegrityError`].

use std::io;

pub type Result<T> = std::result::Result<T, BenchError>;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    /// A configuration value outside its accepted range.
    #[error("invalid {param}: {value} ({min}-{max})")]
    OutOfRange {
        param: &'static str,
        value: String,
        min: String,
        max: String,
    },

    #[error("invalid {param}: `{value}` is not a number")]
    NotANumber { param: &'static str, value: String },

    #[error("unknown implementation `{name}` (known: {known})")]
    UnknownVariant { name: String, known: String },

    #[error("please run this program as root")]
    NotPrivileged,

    /// Socket-local allocation failed. Never retried on another socket.
    #[error("could not allocate {bytes} bytes on socket {socket}")]
    Alloc { bytes: usize, socket: usize },

    #[error(
        "not enough available cores to run benchmarks on {requested} cores \
         ({available} worker contexts plus the coordinator)"
    )]
    NotEnoughCores { requested: usize, available: usize },

    #[error(
        "failed to create hash table for worker {worker} on socket {socket}: \
         check that CPU and memory are on the same socket"
    )]
    TableCreate {
        worker: usize,
        socket: usize,
        #[source]
        source: Box<BenchError>,
    },

    #[error("worker {worker} failed: {reason}")]
    WorkerFailed { worker: usize, reason: String },

    #[error("topology: {0}")]
    Topology(String),

    #[error("invalid cpu list `{0}`")]
    CpuList(String),

    #[error("invalid invocation: {0}")]
    Invocation(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl BenchError {
    pub(crate) fn out_of_range<T: ToString>(param: &'static str, value: T, min: T, max: T) -> Self {
        Self::OutOfRange {
            param,
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_diagnostic_names_size_and_socket() {
        let err = BenchError::Alloc {
            bytes: 4096,
            socket: 1,
        };
        assert_eq!(err.to_string(), "could not allocate 4096 bytes on socket 1");
    }

    #[test]
    fn out_of_range_lists_bounds() {
        let err = BenchError::out_of_range("load factor", 1.5, 0.0, 1.0);
        assert_eq!(err.to_string(), "invalid load factor: 1.5 (0-1)");
    }
}
