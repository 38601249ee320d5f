//! The benchmark operations.
//!
//! Each operation runs inside one worker against that worker's table, key set
//! and pattern set, and reports what it did in an [`OpOutcome`].

use std::fmt;
use std::hint::black_box;

use crate::error::{BenchError, Result};
use crate::key::{Key, Payload, hash_key};
use crate::table::{HashTable, InsertStatus};

/// Largest supported lookup batch (one bit per key in the hit mask).
pub const MAX_BATCH: usize = 64;

/// The value stored with every inserted key.
pub const PAYLOAD: Payload = Payload::splat(16);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Hash,
    Insert,
    Lookup,
    LookupBatch(usize),
}

/// What one operation run did.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct OpOutcome {
    /// Operations requested; the denominator of the rate and timing metrics.
    pub ops: u64,
    pub success_rate: f64,
    /// Accumulated hash values, so the hashing cannot be optimised out.
    pub sink: u64,
    /// Inserts rejected by a full table.
    pub failures: u64,
}

/// Index into a buffer of `bound` elements, advancing `stride` at a time and
/// returning to 0 whenever a whole stride would no longer fit.
#[derive(Copy, Clone, Debug)]
pub struct Cursor {
    pos: usize,
    bound: usize,
    stride: usize,
}

impl Cursor {
    pub fn new(bound: usize, stride: usize) -> Self {
        Self {
            pos: 0,
            bound,
            stride,
        }
    }

    #[inline(always)]
    pub fn get(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn advance(&mut self) {
        self.pos += self.stride;
        if self.pos + self.stride > self.bound {
            self.pos = 0;
        }
    }
}

impl Operation {
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Runs the operation.
    ///
    /// `key_count` is the prefix of `keys` in play. For [`Operation::Insert`]
    /// every one of them is inserted once and `op_count` is ignored; the
    /// other operations run `op_count` iterations, wrapping over the prefix.
    pub fn run(
        &self,
        table: &mut dyn HashTable,
        keys: &[Key],
        key_count: usize,
        patterns: &[Key],
        op_count: u64,
    ) -> Result<OpOutcome> {
        if key_count > keys.len() {
            return Err(BenchError::Invocation(format!(
                "key count {key_count} exceeds the {} generated keys",
                keys.len()
            )));
        }
        let keys = &keys[..key_count];

        match *self {
            Operation::Hash => {
                require_keys(keys)?;
                Ok(hash(keys, op_count))
            }
            Operation::Insert => Ok(insert(table, keys)),
            Operation::Lookup => {
                require_keys(keys)?;
                require_patterns(patterns, 1)?;
                Ok(lookup(table, keys, patterns, op_count))
            }
            Operation::LookupBatch(batch) => {
                if batch == 0 || batch > MAX_BATCH {
                    return Err(BenchError::out_of_range("batch size", batch, 1, MAX_BATCH));
                }
                require_keys(keys)?;
                require_patterns(patterns, 1)?;
                Ok(lookup_batch(table, keys, patterns, op_count, batch))
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Hash => f.write_str("hash"),
            Operation::Insert => f.write_str("insert"),
            Operation::Lookup => f.write_str("lookup"),
            Operation::LookupBatch(b) => write!(f, "lookup_batch_{b}"),
        }
    }
}

fn require_keys(keys: &[Key]) -> Result<()> {
    if keys.is_empty() {
        return Err(BenchError::Invocation("operation needs at least one key".into()));
    }
    Ok(())
}

fn require_patterns(patterns: &[Key], min: usize) -> Result<()> {
    if patterns.len() < min {
        return Err(BenchError::Invocation("lookup needs a pattern set".into()));
    }
    Ok(())
}

fn hash(keys: &[Key], op_count: u64) -> OpOutcome {
    let mut cursor = Cursor::new(keys.len(), 1);
    let mut sink = 0u64;
    for _ in 0..op_count {
        sink = sink.wrapping_add(hash_key(keys[cursor.get()]));
        cursor.advance();
    }
    OpOutcome {
        ops: op_count,
        success_rate: 1.0,
        sink,
        failures: 0,
    }
}

fn insert(table: &mut dyn HashTable, keys: &[Key]) -> OpOutcome {
    let mut failures = 0;
    for key in keys {
        if table.add_key_with_data(*key, PAYLOAD) == InsertStatus::Full {
            failures += 1;
        }
    }
    OpOutcome {
        ops: keys.len() as u64,
        success_rate: 1.0,
        sink: 0,
        failures,
    }
}

fn lookup(table: &dyn HashTable, keys: &[Key], patterns: &[Key], op_count: u64) -> OpOutcome {
    let mut key_i = Cursor::new(keys.len(), 1);
    let mut pattern_i = Cursor::new(patterns.len(), 1);
    let mut hits = 0u64;
    for _ in 0..op_count {
        let probe = keys[key_i.get()] ^ patterns[pattern_i.get()];
        if black_box(table.lookup(&probe)).is_some() {
            hits += 1;
        }
        key_i.advance();
        pattern_i.advance();
    }
    OpOutcome {
        ops: op_count,
        success_rate: ratio(hits, op_count),
        sink: 0,
        failures: 0,
    }
}

fn lookup_batch(
    table: &dyn HashTable,
    keys: &[Key],
    patterns: &[Key],
    op_count: u64,
    batch: usize,
) -> OpOutcome {
    // The last batch runs whole, so up to `batch - 1` extra probes are issued.
    let batches = op_count.div_ceil(batch as u64);
    let mut probes = [Key::ZERO; MAX_BATCH];
    let mut out = [Payload::default(); MAX_BATCH];
    let mut hits = 0u64;

    if keys.len() >= batch && patterns.len() >= batch {
        let mut key_i = Cursor::new(keys.len(), batch);
        let mut pattern_i = Cursor::new(patterns.len(), batch);
        for _ in 0..batches {
            let (k, p) = (key_i.get(), pattern_i.get());
            for j in 0..batch {
                probes[j] = keys[k + j] ^ patterns[p + j];
            }
            hits += table.lookup_bulk(&probes[..batch], &mut out[..batch]).count_ones() as u64;
            key_i.advance();
            pattern_i.advance();
        }
    } else {
        // Fewer keys than one batch: gather modulo the set sizes.
        let (mut k, mut p) = (0, 0);
        for _ in 0..batches {
            for probe in &mut probes[..batch] {
                *probe = keys[k] ^ patterns[p];
                k = (k + 1) % keys.len();
                p = (p + 1) % patterns.len();
            }
            hits += table.lookup_bulk(&probes[..batch], &mut out[..batch]).count_ones() as u64;
        }
    }
    black_box(&out);

    OpOutcome {
        ops: op_count,
        success_rate: ratio(hits, op_count),
        sink: 0,
        failures: 0,
    }
}

fn ratio(hits: u64, ops: u64) -> f64 {
    if ops == 0 { 0.0 } else { hits as f64 / ops as f64 }
}
