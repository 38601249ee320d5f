use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use hperf::config::{self, Cli, ExperimentConfig, RuntimeArgs};
use hperf::driver::Experiment;
use hperf::stats::ResultSink;
use hperf::topology::Topology;

fn main() -> ExitCode {
    hperf::init_tracing();

    let (runtime, harness) = config::split_runtime_args(std::env::args_os().collect());
    let runtime = RuntimeArgs::parse_from(runtime);
    let config = ExperimentConfig::from(Cli::parse_from(harness));

    match run(runtime, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "benchmark failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(runtime: RuntimeArgs, config: ExperimentConfig) -> hperf::Result<()> {
    config::ensure_privileged()?;

    let topology = Topology::discover(&runtime)?;
    topology.pin_coordinator()?;

    let mut sink = ResultSink::open(config.output.as_deref())?;
    Experiment::new(config, topology)?.run(&mut sink)?;
    sink.into_inner()?;
    Ok(())
}
