//! The experiment plan.
//!
//! Workloads are generated once, up front, for the largest key count and
//! core count of the plan. Every (capacity, load factor, core count)
//! combination then runs, strictly one after the other:
//!
//! ```text
//! create tables -> hash -> insert -> [insert_redo x N] -> shuffle keys
//!               -> per miss rate: lookup, batched lookup
//!               -> stats + integrity check -> reset -> drop tables
//! ```

use rand::prelude::*;
use tracing::{debug, info, warn};

use crate::config::ExperimentConfig;
use crate::dispatch::{Dispatcher, Invocation};
use crate::error::Result;
use crate::ops::Operation;
use crate::stats::{BenchDescriptor, ResultRow, RowSink};
use crate::table::HashTable;
use crate::topology::Topology;
use crate::workload::{self, KeySet, PatternSet, WorkloadRng};

pub struct Experiment {
    config: ExperimentConfig,
    dispatcher: Dispatcher,
    rng: WorkloadRng,
    /// One key set per worker ordinal.
    keys: Vec<KeySet>,
    /// Per miss-rate tier, one pattern set per worker ordinal.
    patterns: Vec<Vec<PatternSet>>,
}

impl Experiment {
    /// Checks that the plan fits the topology and generates every workload
    /// on the socket of the worker that will use it.
    pub fn new(config: ExperimentConfig, topology: Topology) -> Result<Self> {
        let max_cores = config.max_cores();
        let max_size = config.max_size();
        let placement = topology.place(max_cores)?;
        let sockets: Vec<usize> = placement.slots().iter().map(|s| s.context().socket).collect();

        info!(
            implementation = %config.variant,
            max_cores,
            max_size,
            miss_rates = config.miss_rates.len(),
            seed = config.seed,
            "generating workloads"
        );

        let mut rng = workload::seeded(config.seed);
        let keys = sockets
            .iter()
            .map(|&socket| workload::generate(max_size, 1.0, socket, &mut rng))
            .collect::<Result<Vec<_>>>()?;
        let patterns = config
            .miss_rates
            .iter()
            .map(|&miss_rate| {
                sockets
                    .iter()
                    .map(|&socket| workload::generate_patterns(miss_rate, socket, &mut rng))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            dispatcher: Dispatcher::new(topology, max_cores),
            rng,
            keys,
            patterns,
        })
    }

    /// Runs the whole plan, emitting one row per measured invocation.
    pub fn run(&mut self, sink: &mut impl RowSink) -> Result<()> {
        let capacities = self.config.capacities.clone();
        let load_factors = self.config.load_factors.clone();
        let core_counts = self.config.core_counts.clone();

        for &capacity in &capacities {
            for &load_factor in &load_factors {
                let size = ExperimentConfig::table_size(capacity, load_factor);
                if size == 0 {
                    warn!(capacity, load_factor, "no keys to insert, skipping");
                    continue;
                }
                for &core_count in &core_counts {
                    self.run_combination(capacity, load_factor, size, core_count, sink)?;
                }
            }
        }
        info!(sink = self.dispatcher.sink(), "experiment complete");
        Ok(())
    }

    fn run_combination(
        &mut self,
        capacity: usize,
        load_factor: f64,
        size: usize,
        core_count: usize,
        sink: &mut impl RowSink,
    ) -> Result<()> {
        let variant = self.config.variant;
        info!(
            implementation = %variant,
            capacity,
            load_factor,
            size,
            core_count,
            "running combination"
        );

        let mut tables = self
            .dispatcher
            .build_tables(core_count, |ctx| variant.create(capacity, ctx.socket))?;

        let combo = Combination {
            capacity,
            load_factor,
            size,
            core_count,
        };

        let row = self.invoke(&combo, &mut tables, Operation::Hash, None, self.config.hash_ops)?;
        sink.emit(&row)?;

        let row = self.invoke(&combo, &mut tables, Operation::Insert, None, size as u64)?;
        sink.emit(&row)?;

        // Same keys again: measures the update path of a populated table.
        for _ in 0..self.config.insert_redo {
            let mut row = self.invoke(&combo, &mut tables, Operation::Insert, None, size as u64)?;
            row.operation = INSERT_REDO.to_owned();
            sink.emit(&row)?;
        }

        self.shuffle_keys(core_count, size);

        let batch = Operation::LookupBatch(self.config.batch_size);
        for tier in 0..self.config.miss_rates.len() {
            let miss_rate = self.config.miss_rates[tier];

            let row = self.invoke(&combo, &mut tables, Operation::Lookup, Some(tier), self.config.lookup_ops)?;
            check_lookup_rate(&row, miss_rate);
            sink.emit(&row)?;

            let row = self.invoke(&combo, &mut tables, batch, Some(tier), self.config.batch_ops)?;
            check_lookup_rate(&row, miss_rate);
            sink.emit(&row)?;
        }

        for (worker, table) in tables.iter_mut().enumerate() {
            let stats = table.stats();
            info!(
                worker,
                entries = stats.entries,
                capacity = stats.capacity,
                slots_per_bucket = ?stats.slots_per_bucket,
                secondary = stats.secondary,
                secondary_ratio = stats.secondary_ratio(),
                "table stats"
            );
            if let Err(e) = table.check_integrity() {
                warn!(worker, error = %e, "integrity check failed");
            }
            table.reset();
        }
        Ok(())
    }

    /// Permutes the first `size` keys of the first `core_count` workers, so
    /// lookups do not replay the insertion order.
    fn shuffle_keys(&mut self, core_count: usize, size: usize) {
        for keys in &mut self.keys[..core_count] {
            keys[..size].shuffle(&mut self.rng);
        }
    }

    /// Runs `op` on the combination's workers. `tier` selects the pattern
    /// sets of one miss rate; operations without patterns pass `None`.
    fn invoke(
        &mut self,
        combo: &Combination,
        tables: &mut [Box<dyn HashTable>],
        op: Operation,
        tier: Option<usize>,
        op_count: u64,
    ) -> Result<ResultRow> {
        let patterns: &[PatternSet] = match tier {
            Some(t) => &self.patterns[t],
            None => &[],
        };
        let inv = Invocation {
            op,
            keys: &self.keys,
            patterns,
            key_count: combo.size,
            op_count,
        };
        let desc = BenchDescriptor {
            implementation: self.config.variant.name().to_owned(),
            operation: op.name(),
            capacity: combo.capacity,
            load_factor: combo.load_factor,
        };
        let row = self.dispatcher.run(&inv, tables, &desc, combo.core_count)?;
        debug!(
            operation = %op,
            success_rate = row.success_rate,
            op_cycles = row.op_cycles,
            op_rate = row.op_rate,
            "invocation complete"
        );
        Ok(row)
    }
}

/// Row label of the repeated insert rounds.
const INSERT_REDO: &str = "insert_redo";

struct Combination {
    capacity: usize,
    load_factor: f64,
    /// Keys inserted, and the key prefix every operation walks.
    size: usize,
    core_count: usize,
}

/// Lookups with no misses should all hit, lookups with only misses none.
fn check_lookup_rate(row: &ResultRow, miss_rate: f64) {
    if miss_rate == 0.0 && row.success_rate < 1.0 {
        warn!(
            operation = %row.operation,
            success_rate = row.success_rate,
            "lookups missed with a miss rate of 0"
        );
    } else if miss_rate == 1.0 && row.success_rate > 0.0 {
        warn!(
            operation = %row.operation,
            success_rate = row.success_rate,
            "lookups hit with a miss rate of 1"
        );
    }
}
