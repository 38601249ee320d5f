//! Secondary-bucket occupancy of the bucketized tables.
//!
//! For each variant, capacity and fill ratio, a fresh table is filled with
//! random keys and the fraction of entries that ended up outside their
//! primary bucket is recorded, averaged over a number of rounds.

use std::io::Write;

use rand::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::key::Key;
use crate::ops::PAYLOAD;
use crate::table::{InsertStatus, Variant};
use crate::workload::{self, WorkloadRng};

/// One line of the report. Field names are the TSV header.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OccupancyRow {
    pub name: &'static str,
    pub slots_per_bucket: usize,
    pub hash_table_capacity: usize,
    pub filling_ratio: f64,
    pub stats_in_secondary: f64,
}

#[derive(Clone, Debug)]
pub struct OccupancyPlan {
    pub variants: Vec<Variant>,
    pub capacities: Vec<usize>,
    pub filling_ratios: Vec<f64>,
    pub rounds: u32,
    pub seed: u64,
}

/// Fills a fresh table to `ratio` and returns the fraction of its entries
/// stored outside their primary bucket.
pub fn secondary_fraction(
    variant: Variant,
    capacity: usize,
    ratio: f64,
    socket: usize,
    rng: &mut WorkloadRng,
) -> Result<f64> {
    let mut table = variant.create(capacity, socket)?;
    let inserts = ExperimentConfig::table_size(capacity, ratio);
    let mut failures = 0usize;
    for _ in 0..inserts {
        let key = Key::new(rng.random(), rng.random());
        if table.add_key_with_data(key, PAYLOAD) != InsertStatus::Inserted {
            failures += 1;
        }
    }
    if failures > 0 {
        warn!(
            implementation = %variant,
            capacity,
            ratio,
            failures,
            "failed insertions"
        );
    }
    Ok(table.stats().secondary_ratio())
}

/// Runs `plan` with every table on `socket`.
///
/// Variants without buckets are ignored, as are fill ratios above what a
/// variant supports.
pub fn report(plan: &OccupancyPlan, socket: usize) -> Result<Vec<OccupancyRow>> {
    let mut rng = workload::seeded(plan.seed);
    let rounds = plan.rounds.max(1);
    let mut rows = Vec::new();

    for &variant in &plan.variants {
        let Some(slots_per_bucket) = variant.slots_per_bucket() else {
            debug!(implementation = %variant, "not bucketized, skipping");
            continue;
        };
        for &capacity in &plan.capacities {
            for &ratio in &plan.filling_ratios {
                if ratio > variant.max_fill_ratio() {
                    debug!(implementation = %variant, ratio, "above supported fill ratio");
                    continue;
                }
                let mut total = 0.0;
                for _ in 0..rounds {
                    total += secondary_fraction(variant, capacity, ratio, socket, &mut rng)?;
                }
                rows.push(OccupancyRow {
                    name: variant.name(),
                    slots_per_bucket,
                    hash_table_capacity: capacity,
                    filling_ratio: ratio,
                    stats_in_secondary: total / rounds as f64,
                });
            }
        }
    }
    Ok(rows)
}

/// Writes `rows` as tab-separated values with a header line.
pub fn write_tsv<W: Write>(out: W, rows: &[OccupancyRow]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(out);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
