//! Command-line configuration.
//!
//! The command line has two parts separated by `--`: runtime options (core
//! set, coordinator core, pinning) and harness options. Without a `--` every
//! argument belongs to the harness.
//!
//! ```text
//! hperf [RUNTIME OPTIONS --] [-c CAPS] [-l LFS] [-t CORES] [-i MISS] IMPLEMENTATION [OUT_FILE]
//! ```

use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

use crate::error::{BenchError, Result};
use crate::ops::MAX_BATCH;
use crate::table::Variant;
use crate::workload::BATCH_SIZE;

const MAX_CAPACITY: usize = 1_000_000_000;
const MAX_CORES: usize = 1000;

/// Options consumed by runtime initialization, before the `--`.
#[derive(Parser, Debug, Clone, Default, PartialEq, Eq)]
#[command(name = "runtime", no_binary_name = true)]
pub struct RuntimeArgs {
    /// Cores the run may use, as a list like `0-3,8`. Defaults to every
    /// core the process is allowed on.
    #[arg(short = 'l', long)]
    pub lcores: Option<String>,

    /// Core reserved for the coordinator. Defaults to the first core.
    #[arg(long)]
    pub main_lcore: Option<usize>,

    /// Do not pin threads to their cores.
    #[arg(long)]
    pub no_pin: bool,
}

/// Harness options.
#[derive(Parser, Debug, Clone)]
#[command(name = "hperf", version, about = "Multi-core hash table micro-benchmark")]
pub struct Cli {
    /// Hash table implementation: bloom4, bloom8, std or hashbrown.
    #[arg(value_parser = Variant::from_name)]
    pub implementation: Variant,

    /// Output file; `-` or nothing writes to stdout.
    pub output: Option<PathBuf>,

    /// Table capacities, comma separated (1-1000000000).
    #[arg(short = 'c', long = "capacity", value_delimiter = ',', value_parser = parse_capacity, default_value = "1000000")]
    pub capacities: Vec<usize>,

    /// Load factors, comma separated (0-1, exclusive of 0).
    #[arg(short = 'l', long = "load-factor", value_delimiter = ',', value_parser = parse_load_factor, default_value = "0.5")]
    pub load_factors: Vec<f64>,

    /// Core counts, comma separated (1-1000).
    #[arg(short = 't', long = "cores", value_delimiter = ',', value_parser = parse_core_count, default_value = "1")]
    pub core_counts: Vec<usize>,

    /// Lookup miss rates, comma separated (0-1).
    #[arg(short = 'i', long = "miss-rate", value_delimiter = ',', value_parser = parse_miss_rate, default_value = "0.0")]
    pub miss_rates: Vec<f64>,

    /// Hash operations per worker.
    #[arg(long, default_value_t = 10_000_000)]
    pub hash_ops: u64,

    /// Lookups per worker.
    #[arg(long, default_value_t = 10_000_000)]
    pub lookup_ops: u64,

    /// Batched lookups per worker, counted in keys.
    #[arg(long, default_value_t = 100_000_000)]
    pub batch_ops: u64,

    /// Keys per batched lookup (1-64).
    #[arg(long, value_parser = parse_batch_size, default_value_t = BATCH_SIZE)]
    pub batch_size: usize,

    /// Extra insert rounds of the same keys after the first, reported as
    /// `insert_redo` rows.
    #[arg(long, default_value_t = 0)]
    pub insert_redo: usize,

    /// Seed of the workload generator.
    #[arg(long, default_value_t = 5489)]
    pub seed: u64,
}

/// The immutable experiment plan.
#[derive(Clone, Debug, PartialEq)]
pub struct ExperimentConfig {
    pub variant: Variant,
    pub output: Option<PathBuf>,
    pub capacities: Vec<usize>,
    pub load_factors: Vec<f64>,
    pub core_counts: Vec<usize>,
    pub miss_rates: Vec<f64>,
    pub hash_ops: u64,
    pub lookup_ops: u64,
    pub batch_ops: u64,
    pub batch_size: usize,
    pub insert_redo: usize,
    pub seed: u64,
}

impl ExperimentConfig {
    /// Entries inserted for one capacity and load factor.
    pub fn table_size(capacity: usize, load_factor: f64) -> usize {
        (capacity as f64 * load_factor).floor() as usize
    }

    pub fn max_cores(&self) -> usize {
        self.core_counts.iter().copied().max().unwrap_or(0)
    }

    /// Largest key set any combination needs.
    pub fn max_size(&self) -> usize {
        self.capacities
            .iter()
            .flat_map(|&c| self.load_factors.iter().map(move |&lf| Self::table_size(c, lf)))
            .max()
            .unwrap_or(0)
    }
}

impl From<Cli> for ExperimentConfig {
    fn from(cli: Cli) -> Self {
        Self {
            variant: cli.implementation,
            output: cli.output,
            capacities: cli.capacities,
            load_factors: cli.load_factors,
            core_counts: cli.core_counts,
            miss_rates: cli.miss_rates,
            hash_ops: cli.hash_ops,
            lookup_ops: cli.lookup_ops,
            batch_ops: cli.batch_ops,
            batch_size: cli.batch_size,
            insert_redo: cli.insert_redo,
            seed: cli.seed,
        }
    }
}

/// Splits `argv` at the first `--` into runtime arguments (without the
/// program name) and harness arguments (with it).
pub fn split_runtime_args(args: Vec<OsString>) -> (Vec<OsString>, Vec<OsString>) {
    let mut args = args.into_iter();
    let program = args.next();
    let rest: Vec<OsString> = args.collect();
    let harness_with = |tail: &[OsString]| -> Vec<OsString> {
        program.iter().chain(tail).cloned().collect()
    };

    match rest.iter().position(|a| a == "--") {
        Some(pos) => (rest[..pos].to_vec(), harness_with(&rest[pos + 1..])),
        None => (Vec::new(), harness_with(&rest)),
    }
}

/// Refuses to run without root: pinning and memory policy need it.
pub fn ensure_privileged() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } != 0 {
        return Err(BenchError::NotPrivileged);
    }
    Ok(())
}

fn parse_number<T: FromStr>(param: &'static str, s: &str) -> Result<T> {
    s.trim().parse().map_err(|_| BenchError::NotANumber {
        param,
        value: s.to_owned(),
    })
}

pub fn parse_capacity(s: &str) -> Result<usize> {
    let v: usize = parse_number("capacity", s)?;
    if !(1..=MAX_CAPACITY).contains(&v) {
        return Err(BenchError::out_of_range("capacity", v, 1, MAX_CAPACITY));
    }
    Ok(v)
}

pub fn parse_load_factor(s: &str) -> Result<f64> {
    let v: f64 = parse_number("load factor", s)?;
    if !(v > 0.0 && v <= 1.0) {
        return Err(BenchError::out_of_range("load factor", v, 0.0, 1.0));
    }
    Ok(v)
}

pub fn parse_core_count(s: &str) -> Result<usize> {
    let v: usize = parse_number("core count", s)?;
    if !(1..=MAX_CORES).contains(&v) {
        return Err(BenchError::out_of_range("core count", v, 1, MAX_CORES));
    }
    Ok(v)
}

pub fn parse_miss_rate(s: &str) -> Result<f64> {
    let v: f64 = parse_number("miss rate", s)?;
    if !(0.0..=1.0).contains(&v) {
        return Err(BenchError::out_of_range("miss rate", v, 0.0, 1.0));
    }
    Ok(v)
}

pub fn parse_batch_size(s: &str) -> Result<usize> {
    let v: usize = parse_number("batch size", s)?;
    if !(1..=MAX_BATCH).contains(&v) {
        return Err(BenchError::out_of_range("batch size", v, 1, MAX_BATCH));
    }
    Ok(v)
}
