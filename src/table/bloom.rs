//! Bucketized hash table with a 16-bit Bloom word per bucket.
//!
//! # Layout
//!
//! ```text
//!  buckets (SocketBuffer<Bucket<S>>, one cache-line-aligned block each)
//! ┌──────────────────────────────────────────────────────┐
//! │ bloom: u16 │ len: u16 │ keys: [Key; S] │ data: [..; S]│  bucket 0
//! ├──────────────────────────────────────────────────────┤
//! │ ...                                                  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! A key's primary bucket is picked by reducing the high hash bits into the
//! bucket count. When the primary bucket is full the key goes to the next
//! bucket with a free slot (wrapping), and its tag is still set in the
//! primary bucket's Bloom word. Buckets are only ever emptied all at once, so
//! a probe can stop at the first bucket that is not full.
//!
//! Every tag has exactly four of the sixteen bits set, so a probe whose tag
//! is not covered by the primary bucket's Bloom word never touches the keys.

use crate::error::Result;
use crate::key::{HashPair, Key, Payload};
use crate::numa::SocketBuffer;

use super::{HashTable, InsertStatus, IntegrityError, TableStats};

// ===========================================================================
// Bloom filter
// ===========================================================================

const TAG_COUNT: usize = 1820; // C(16, 4)

/// All 16-bit masks with popcount 4, in increasing order.
static BLOOM_TAGS: [u16; TAG_COUNT] = build_tags();

const fn build_tags() -> [u16; TAG_COUNT] {
    let mut tags = [0u16; TAG_COUNT];
    let mut n = 0;
    let mut mask: u32 = 0;
    while mask <= u16::MAX as u32 {
        if mask.count_ones() == 4 {
            tags[n] = mask as u16;
            n += 1;
        }
        mask += 1;
    }
    tags
}

#[inline(always)]
fn bloom_get_tag(filter: u32) -> u16 {
    BLOOM_TAGS[((filter as u64 * TAG_COUNT as u64) >> 32) as usize]
}

#[inline(always)]
fn bloom_check_tag(tag: u16, entry: u16) -> bool {
    (entry & tag) == tag
}

/// Maps a 64-bit hash uniformly onto `0..n` without a division.
#[inline(always)]
fn fastrange(hash: u64, n: usize) -> usize {
    ((hash as u128 * n as u128) >> 64) as usize
}

// ===========================================================================
// Buckets
// ===========================================================================

#[derive(Copy, Clone)]
#[repr(C, align(64))]
struct Bucket<const S: usize> {
    bloom: u16,
    len: u16,
    keys: [Key; S],
    data: [Payload; S],
}

impl<const S: usize> Bucket<S> {
    const EMPTY: Self = Self {
        bloom: 0,
        len: 0,
        keys: [Key::ZERO; S],
        data: [Payload::splat(0); S],
    };

    #[inline(always)]
    fn is_full(&self) -> bool {
        self.len as usize == S
    }

    #[inline(always)]
    fn find(&self, key: &Key) -> Option<usize> {
        self.keys[..self.len as usize].iter().position(|k| k == key)
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn prefetch<T>(ptr: *const T) {
    use std::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
    // SAFETY: prefetch never faults, even on an invalid address.
    unsafe { _mm_prefetch::<_MM_HINT_T0>(ptr as *const i8) }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn prefetch<T>(_ptr: *const T) {}

// ===========================================================================
// Table
// ===========================================================================

pub struct BloomTable<const S: usize> {
    buckets: SocketBuffer<Bucket<S>>,
    capacity: usize,
    entries: usize,
    secondary: usize,
}

impl<const S: usize> BloomTable<S> {
    /// A table for `capacity` entries, `capacity / S` buckets (rounded up)
    /// allocated on `socket`.
    pub fn new(capacity: usize, socket: usize) -> Result<Self> {
        let bucket_count = capacity.div_ceil(S).max(1);
        Ok(Self {
            buckets: SocketBuffer::new(bucket_count, socket, Bucket::EMPTY)?,
            capacity,
            entries: 0,
            secondary: 0,
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline(always)]
    fn primary(&self, h: HashPair) -> usize {
        fastrange(h.slot, self.buckets.len())
    }

    #[inline(always)]
    fn next(&self, bucket: usize) -> usize {
        if bucket + 1 == self.buckets.len() { 0 } else { bucket + 1 }
    }

    /// Walks the overflow chain of `primary`, returning the bucket and slot
    /// of `key` if present.
    #[inline(always)]
    fn locate(&self, primary: usize, key: &Key) -> Option<(usize, usize)> {
        let mut b = primary;
        for _ in 0..self.buckets.len() {
            let bucket = &self.buckets[b];
            if let Some(slot) = bucket.find(key) {
                return Some((b, slot));
            }
            if !bucket.is_full() {
                return None;
            }
            b = self.next(b);
        }
        None
    }
}

impl<const S: usize> HashTable for BloomTable<S> {
    fn name(&self) -> &'static str {
        match S {
            4 => "bloom4",
            8 => "bloom8",
            _ => "bloom",
        }
    }

    fn add_key_with_data(&mut self, key: Key, data: Payload) -> InsertStatus {
        let h = HashPair::hash(key);
        let primary = self.primary(h);

        if let Some((b, slot)) = self.locate(primary, &key) {
            self.buckets[b].data[slot] = data;
            return InsertStatus::Updated;
        }

        let mut b = primary;
        for _ in 0..self.buckets.len() {
            if !self.buckets[b].is_full() {
                let bucket = &mut self.buckets[b];
                let slot = bucket.len as usize;
                bucket.keys[slot] = key;
                bucket.data[slot] = data;
                bucket.len += 1;

                self.buckets[primary].bloom |= bloom_get_tag(h.filter);
                self.entries += 1;
                if b != primary {
                    self.secondary += 1;
                }
                return InsertStatus::Inserted;
            }
            b = self.next(b);
        }
        InsertStatus::Full
    }

    #[inline(always)]
    fn lookup(&self, key: &Key) -> Option<Payload> {
        let h = HashPair::hash(*key);
        let primary = self.primary(h);
        if !bloom_check_tag(bloom_get_tag(h.filter), self.buckets[primary].bloom) {
            return None;
        }
        self.locate(primary, key)
            .map(|(b, slot)| self.buckets[b].data[slot])
    }

    fn lookup_bulk(&self, keys: &[Key], out: &mut [Payload]) -> u64 {
        debug_assert!(keys.len() <= 64 && keys.len() <= out.len());

        let mut primaries = [0usize; 64];
        let mut tags = [0u16; 64];
        for (i, key) in keys.iter().enumerate() {
            let h = HashPair::hash(*key);
            primaries[i] = self.primary(h);
            tags[i] = bloom_get_tag(h.filter);
            prefetch(&self.buckets[primaries[i]]);
        }

        let mut hits = 0u64;
        for (i, key) in keys.iter().enumerate() {
            let primary = primaries[i];
            if !bloom_check_tag(tags[i], self.buckets[primary].bloom) {
                continue;
            }
            if let Some((b, slot)) = self.locate(primary, key) {
                out[i] = self.buckets[b].data[slot];
                hits |= 1 << i;
            }
        }
        hits
    }

    fn reset(&mut self) {
        self.buckets.fill(Bucket::EMPTY);
        self.entries = 0;
        self.secondary = 0;
    }

    fn check_integrity(&self) -> std::result::Result<(), IntegrityError> {
        let mut found = 0;
        for (b, bucket) in self.buckets.iter().enumerate() {
            found += bucket.len as usize;
            for key in &bucket.keys[..bucket.len as usize] {
                let h = HashPair::hash(*key);
                let primary = self.primary(h);
                if !bloom_check_tag(bloom_get_tag(h.filter), self.buckets[primary].bloom) {
                    return Err(IntegrityError::BloomMiss { bucket: b, primary });
                }
                let mut walk = primary;
                while walk != b {
                    if !self.buckets[walk].is_full() {
                        return Err(IntegrityError::BrokenChain { bucket: b });
                    }
                    walk = self.next(walk);
                }
            }
        }
        if found != self.entries {
            return Err(IntegrityError::CountMismatch {
                recorded: self.entries,
                found,
            });
        }
        let slots = self.buckets.len() * S;
        if found > slots {
            return Err(IntegrityError::OverCapacity {
                entries: found,
                capacity: slots,
            });
        }
        Ok(())
    }

    fn stats(&self) -> TableStats {
        TableStats {
            entries: self.entries,
            capacity: self.capacity,
            slots_per_bucket: Some(S),
            secondary: self.secondary,
        }
    }
}
