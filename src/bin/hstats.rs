//! Secondary-bucket occupancy report for the bucketized tables.
//!
//! ```text
//! hstats [RUNTIME OPTIONS --] [-c CAPS] [-r RATIOS] [--rounds N] [IMPLEMENTATION...]
//! ```
use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use hperf::config::{self, RuntimeArgs};
use hperf::occupancy::{self, OccupancyPlan};
use hperf::table::Variant;
use hperf::topology::Topology;

#[derive(Parser, Debug)]
#[command(name = "hstats", version, about = "Secondary bucket occupancy of bucketized hash tables")]
struct Cli {
    /// Implementations to report on. Defaults to every bucketized one.
    #[arg(value_parser = Variant::from_name)]
    implementations: Vec<Variant>,

    /// Table capacities, comma separated.
    #[arg(short = 'c', long = "capacity", value_delimiter = ',', value_parser = config::parse_capacity, default_value = "33554432")]
    capacities: Vec<usize>,

    /// Fill ratios, comma separated.
    #[arg(
        short = 'r',
        long = "ratio",
        value_delimiter = ',',
        value_parser = config::parse_load_factor,
        default_value = "0.1,0.2,0.3,0.4,0.5,0.6,0.7,0.75"
    )]
    ratios: Vec<f64>,

    /// Tables filled per data point.
    #[arg(long, default_value_t = 1)]
    rounds: u32,

    #[arg(long, default_value_t = 5489)]
    seed: u64,
}

fn main() -> ExitCode {
    hperf::init_tracing();

    let (runtime, harness) = config::split_runtime_args(std::env::args_os().collect());
    let runtime = RuntimeArgs::parse_from(runtime);
    let cli = Cli::parse_from(harness);

    match run(runtime, cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "occupancy report failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(runtime: RuntimeArgs, cli: Cli) -> hperf::Result<()> {
    let topology = Topology::discover(&runtime)?;
    topology.pin_coordinator()?;
    let socket = topology.coordinator().socket;

    let variants = if cli.implementations.is_empty() {
        Variant::ALL
            .into_iter()
            .filter(|v| v.slots_per_bucket().is_some())
            .collect()
    } else {
        cli.implementations
    };
    let plan = OccupancyPlan {
        variants,
        capacities: cli.capacities,
        filling_ratios: cli.ratios,
        rounds: cli.rounds,
        seed: cli.seed,
    };
    info!(?plan, socket, "occupancy report");

    let rows = occupancy::report(&plan, socket)?;
    occupancy::write_tsv(io::stdout().lock(), &rows)
}
