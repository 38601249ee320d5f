//! Fixed-width keys, payloads and the standalone key hash.
use std::ops::BitXor;

/// A 128-bit key made of two 64-bit halves, compared as one unit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(C, align(16))]
pub struct Key {
    pub a: u64,
    pub b: u64,
}

impl Key {
    pub const ZERO: Self = Self { a: 0, b: 0 };

    #[inline(always)]
    pub const fn new(a: u64, b: u64) -> Self {
        Self { a, b }
    }

    #[inline(always)]
    pub fn is_zero(&self) -> bool {
        (self.a | self.b) == 0
    }
}

impl BitXor for Key {
    type Output = Key;

    #[inline(always)]
    fn bitxor(self, rhs: Key) -> Key {
        Key {
            a: self.a ^ rhs.a,
            b: self.b ^ rhs.b,
        }
    }
}

/// Fixed-size value stored next to every inserted key.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Payload(pub [u16; 8]);

impl Payload {
    pub const fn splat(v: u16) -> Self {
        Self([v; 8])
    }
}

/// Bucket selector and Bloom filter bits derived from one key.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HashPair {
    pub slot: u64,
    pub filter: u32,
}

impl HashPair {
    const FIBONACCI: u64 = 11_400_714_819_323_198_485;
    const MIX: u64 = 0xbf58_476d_1ce4_e5b9;

    #[inline(always)]
    pub fn hash(key: Key) -> Self {
        let folded = key.a ^ key.b.wrapping_mul(Self::MIX).rotate_left(31);
        let v = folded.wrapping_mul(Self::FIBONACCI);
        Self {
            slot: v,
            // High bits pick the bucket, so the filter takes a mix of the low ones.
            filter: (v ^ (v >> 29)) as u32,
        }
    }
}

/// The hash measured by the hash-only operation.
#[inline(always)]
pub fn hash_key(key: Key) -> u64 {
    HashPair::hash(key).slot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_with_zero_is_identity() {
        let k = Key::new(0xdead_beef, 42);
        assert_eq!(k ^ Key::ZERO, k);
        assert!((k ^ k).is_zero());
    }

    #[test]
    fn zero_key() {
        assert!(Key::ZERO.is_zero());
        assert!(Key::default().is_zero());
        assert!(!Key::new(0, 1).is_zero());
        assert!(!Key::new(1, 0).is_zero());
    }

    #[test]
    fn hash_zero() {
        let h = HashPair::hash(Key::ZERO);
        assert_eq!(h.slot, 0);
        assert_eq!(h.filter, 0);
    }

    #[test]
    fn hash_uses_both_halves() {
        assert_ne!(hash_key(Key::new(1, 0)), hash_key(Key::new(0, 1)));
        assert_ne!(hash_key(Key::new(7, 3)), hash_key(Key::new(7, 4)));
    }

    #[test]
    fn hash_no_catastrophic_collisions() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..10_000_u64 {
            seen.insert(hash_key(Key::new(i, i >> 3)) >> 44);
        }
        assert!(seen.len() > 9_800);
    }

    #[test]
    fn layout() {
        assert_eq!(std::mem::size_of::<Key>(), 16);
        assert_eq!(std::mem::size_of::<Payload>(), 16);
    }
}
