//! The hash tables under test.
//!
//! The harness only talks to tables through [`HashTable`]. Each variant is
//! one implementation of the trait, picked at runtime by name through
//! [`Variant`].

pub mod bloom;
pub mod map;

use std::fmt;

use crate::error::{BenchError, Result};
use crate::key::{Key, Payload};

pub use bloom::BloomTable;
pub use map::{StdTable, SwissTable};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsertStatus {
    Inserted,
    /// The key was already present; its payload was replaced.
    Updated,
    /// No free slot was found.
    Full,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TableStats {
    pub entries: usize,
    pub capacity: usize,
    /// `None` for tables that are not bucketized.
    pub slots_per_bucket: Option<usize>,
    /// Entries stored outside their primary bucket.
    pub secondary: usize,
}

impl TableStats {
    pub fn secondary_ratio(&self) -> f64 {
        if self.entries == 0 {
            0.0
        } else {
            self.secondary as f64 / self.entries as f64
        }
    }
}

/// A structural problem found by [`HashTable::check_integrity`].
///
/// Reported and logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("bucket {bucket}: key not covered by the bloom word of its primary bucket {primary}")]
    BloomMiss { bucket: usize, primary: usize },

    #[error("bucket {bucket}: key overflowed past a bucket with a free slot")]
    BrokenChain { bucket: usize },

    #[error("entry count mismatch: recorded {recorded}, found {found}")]
    CountMismatch { recorded: usize, found: usize },

    #[error("{entries} entries exceed capacity {capacity}")]
    OverCapacity { entries: usize, capacity: usize },
}

/// Capability interface of one table instance.
///
/// Instances are owned by one worker at a time; none of the methods need to
/// be safe for concurrent use.
pub trait HashTable: Send {
    fn name(&self) -> &'static str;

    fn add_key_with_data(&mut self, key: Key, data: Payload) -> InsertStatus;

    fn lookup(&self, key: &Key) -> Option<Payload>;

    /// Looks up every key of `keys`, storing payloads of hits in `out` at the
    /// same index. Returns the hit bitmask (bit `i` set if `keys[i]` hit).
    ///
    /// `keys.len()` must not exceed 64 or `out.len()`.
    fn lookup_bulk(&self, keys: &[Key], out: &mut [Payload]) -> u64 {
        let mut hits = 0u64;
        for (i, (key, slot)) in keys.iter().zip(out.iter_mut()).enumerate() {
            if let Some(payload) = self.lookup(key) {
                *slot = payload;
                hits |= 1 << i;
            }
        }
        hits
    }

    /// Removes every entry, keeping the allocation.
    fn reset(&mut self);

    fn check_integrity(&self) -> std::result::Result<(), IntegrityError>;

    fn stats(&self) -> TableStats;
}

/// The registry of known implementations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Variant {
    Bloom4,
    Bloom8,
    Std,
    Swiss,
}

impl Variant {
    pub const ALL: [Variant; 4] = [Variant::Bloom4, Variant::Bloom8, Variant::Std, Variant::Swiss];

    pub fn name(self) -> &'static str {
        match self {
            Variant::Bloom4 => "bloom4",
            Variant::Bloom8 => "bloom8",
            Variant::Std => "std",
            Variant::Swiss => "hashbrown",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.name() == name)
            .ok_or_else(|| BenchError::UnknownVariant {
                name: name.to_owned(),
                known: Self::ALL.map(Variant::name).join(", "),
            })
    }

    pub fn slots_per_bucket(self) -> Option<usize> {
        match self {
            Variant::Bloom4 => Some(4),
            Variant::Bloom8 => Some(8),
            Variant::Std | Variant::Swiss => None,
        }
    }

    /// Highest fill ratio the variant is expected to sustain.
    pub fn max_fill_ratio(self) -> f64 {
        match self {
            Variant::Bloom4 => 0.92,
            Variant::Bloom8 | Variant::Std | Variant::Swiss => 1.0,
        }
    }

    /// Creates a table holding up to `capacity` entries, with its storage on
    /// `socket` where the variant controls its own allocation.
    pub fn create(self, capacity: usize, socket: usize) -> Result<Box<dyn HashTable>> {
        Ok(match self {
            Variant::Bloom4 => Box::new(BloomTable::<4>::new(capacity, socket)?),
            Variant::Bloom8 => Box::new(BloomTable::<8>::new(capacity, socket)?),
            Variant::Std => Box::new(StdTable::new(capacity)),
            Variant::Swiss => Box::new(SwissTable::new(capacity)),
        })
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for v in Variant::ALL {
            assert_eq!(Variant::from_name(v.name()).unwrap(), v);
        }
    }

    #[test]
    fn unknown_name_lists_known() {
        let err = Variant::from_name("bogus").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bogus"));
        assert!(msg.contains("bloom4") && msg.contains("hashbrown"));
    }

    #[test]
    fn every_variant_behaves_like_a_map() {
        for v in Variant::ALL {
            let mut t = v.create(1000, 0).unwrap();
            assert_eq!(t.name(), v.name());
            for i in 1..=500u64 {
                assert_eq!(
                    t.add_key_with_data(Key::new(i, !i), Payload::splat(i as u16)),
                    InsertStatus::Inserted,
                    "{v}"
                );
            }
            assert_eq!(
                t.add_key_with_data(Key::new(1, !1), Payload::splat(7)),
                InsertStatus::Updated
            );
            assert_eq!(t.lookup(&Key::new(1, !1)), Some(Payload::splat(7)));
            assert_eq!(t.lookup(&Key::new(250, !250)), Some(Payload::splat(250)));
            assert_eq!(t.lookup(&Key::new(501, !501)), None);
            assert_eq!(t.stats().entries, 500);
            t.check_integrity().unwrap();

            t.reset();
            assert_eq!(t.stats().entries, 0);
            assert_eq!(t.lookup(&Key::new(1, !1)), None);
        }
    }

    #[test]
    fn bulk_lookup_bitmask() {
        for v in Variant::ALL {
            let mut t = v.create(100, 0).unwrap();
            let keys: Vec<Key> = (1..=32u64).map(|i| Key::new(i, i * 3)).collect();
            for k in keys.iter().step_by(2) {
                t.add_key_with_data(*k, Payload::splat(1));
            }
            let mut out = [Payload::default(); 32];
            let hits = t.lookup_bulk(&keys, &mut out);
            assert_eq!(hits, 0x5555_5555, "{v}");
            assert_eq!(out[0], Payload::splat(1));
            assert_eq!(out[1], Payload::default());
        }
    }

    #[test]
    fn secondary_ratio_of_empty_table() {
        assert_eq!(TableStats::default().secondary_ratio(), 0.0);
    }
}
