//! Key-set and pattern-set generation.
//!
//! Every worker gets its own key set and, per miss-rate tier, its own pattern
//! set, both allocated on the worker's socket. All of them are drawn from one
//! seeded generator so a run is reproducible for a fixed seed and plan.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use crate::error::Result;
use crate::key::Key;
use crate::numa::SocketBuffer;

/// The generator shared by every generation call of a run.
pub type WorkloadRng = ChaCha8Rng;

pub type KeySet = SocketBuffer<Key>;

/// A key set used only as XOR material for lookup probes.
pub type PatternSet = SocketBuffer<Key>;

/// Canonical lookup batch width.
pub const BATCH_SIZE: usize = 32;

/// Prime factor of the pattern-set length, so pattern and key cursors drift
/// relative to each other instead of repeating in lockstep.
pub const PATTERN_PRIME: usize = 6131;

pub const PATTERN_SIZE: usize = BATCH_SIZE * PATTERN_PRIME;

pub fn seeded(seed: u64) -> WorkloadRng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Fills `keys` in place: the first `floor(len * non_zero_fraction)` entries
/// get two random halves, the rest are zero; the whole slice is then
/// shuffled unless the fraction is 1.0.
pub fn fill_keys(keys: &mut [Key], non_zero_fraction: f64, rng: &mut WorkloadRng) {
    let count = keys.len();
    let non_zero = non_zero_count(count, non_zero_fraction);

    for key in &mut keys[..non_zero] {
        *key = Key::new(rng.random::<u64>(), rng.random::<u64>());
    }
    for key in &mut keys[non_zero..] {
        *key = Key::ZERO;
    }

    if non_zero_fraction < 1.0 {
        keys.shuffle(rng);
    }
}

/// Allocates `count` keys on `socket` and fills them with [`fill_keys`].
pub fn generate(
    count: usize,
    non_zero_fraction: f64,
    socket: usize,
    rng: &mut WorkloadRng,
) -> Result<KeySet> {
    let mut keys = SocketBuffer::new(count, socket, Key::ZERO)?;
    fill_keys(&mut keys, non_zero_fraction, rng);
    Ok(keys)
}

/// Pattern set for one worker at one miss rate: a `miss_rate` fraction of
/// probes XOR with a random key (and miss), the rest XOR with zero (and hit).
pub fn generate_patterns(miss_rate: f64, socket: usize, rng: &mut WorkloadRng) -> Result<PatternSet> {
    generate(PATTERN_SIZE, miss_rate, socket, rng)
}

fn non_zero_count(count: usize, fraction: f64) -> usize {
    let fraction = fraction.clamp(0.0, 1.0);
    ((count as f64 * fraction).floor() as usize).min(count)
}
