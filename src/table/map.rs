//! Map-backed variants: `std::collections::HashMap` and `hashbrown`.
//!
//! Both reserve `capacity` up front and refuse inserts beyond it, so they
//! never rehash during a measurement. Their storage comes from the global
//! allocator, so they must be created on the worker thread that uses them
//! for their pages to be first touched on its socket.

use std::collections::HashMap as StdHashMap;

use hashbrown::HashMap as SwissMap;

use crate::key::{Key, Payload};

use super::{HashTable, InsertStatus, IntegrityError, TableStats};

macro_rules! map_table {
    ($(#[$meta:meta])* $name:ident, $map:ident, $label:literal) => {
        $(#[$meta])*
        pub struct $name {
            map: $map<Key, Payload>,
            capacity: usize,
        }

        impl $name {
            pub fn new(capacity: usize) -> Self {
                Self {
                    map: $map::with_capacity(capacity),
                    capacity,
                }
            }
        }

        impl HashTable for $name {
            fn name(&self) -> &'static str {
                $label
            }

            fn add_key_with_data(&mut self, key: Key, data: Payload) -> InsertStatus {
                if let Some(slot) = self.map.get_mut(&key) {
                    *slot = data;
                    return InsertStatus::Updated;
                }
                if self.map.len() >= self.capacity {
                    return InsertStatus::Full;
                }
                self.map.insert(key, data);
                InsertStatus::Inserted
            }

            #[inline(always)]
            fn lookup(&self, key: &Key) -> Option<Payload> {
                self.map.get(key).copied()
            }

            fn reset(&mut self) {
                self.map.clear();
            }

            fn check_integrity(&self) -> std::result::Result<(), IntegrityError> {
                if self.map.len() > self.capacity {
                    return Err(IntegrityError::OverCapacity {
                        entries: self.map.len(),
                        capacity: self.capacity,
                    });
                }
                Ok(())
            }

            fn stats(&self) -> TableStats {
                TableStats {
                    entries: self.map.len(),
                    capacity: self.capacity,
                    slots_per_bucket: None,
                    secondary: 0,
                }
            }
        }
    };
}

map_table!(
    /// `std::collections::HashMap` with SipHash.
    StdTable,
    StdHashMap,
    "std"
);

map_table!(
    /// `hashbrown::HashMap` with its default hasher.
    SwissTable,
    SwissMap,
    "hashbrown"
);
