// Short-string intern table.
//
// Maps content hash -> candidate refs; equal short strings share one object,
// so short-string equality elsewhere is reference equality. Long strings
// never enter the table. The sweeper unlinks dead entries via `remove`.

use ahash::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};

use crate::gc::pool::StrRef;

// Fixed seeds: string hashes must stay stable for the life of a state (they
// are cached in string objects and baked into table node positions).
const SEED: (u64, u64, u64, u64) = (
    0x9e37_79b9_7f4a_7c15,
    0xd1b5_4a32_d192_ed03,
    0xaef1_7502_b3a9_8ba9,
    0x2545_f491_4f6c_dd1d,
);

/// Content hash used for interning and for string table keys.
#[inline]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let state = RandomState::with_seeds(SEED.0, SEED.1, SEED.2, SEED.3);
    let mut hasher = state.build_hasher();
    hasher.write(bytes);
    hasher.finish()
}

pub struct StringTable {
    map: HashMap<u64, Vec<StrRef>, RandomState>,
    used: usize,
}

impl StringTable {
    pub fn new() -> Self {
        StringTable {
            map: HashMap::with_capacity_and_hasher(
                256,
                RandomState::with_seeds(SEED.0, SEED.1, SEED.2, SEED.3),
            ),
            used: 0,
        }
    }

    /// Candidates sharing `hash`; caller byte-compares to find the match.
    #[inline]
    pub fn bucket(&self, hash: u64) -> &[StrRef] {
        self.map.get(&hash).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn insert(&mut self, hash: u64, r: StrRef) {
        self.map.entry(hash).or_default().push(r);
        self.used += 1;
    }

    /// Unlink a dead short string; called from the sweep.
    pub fn remove(&mut self, hash: u64, r: StrRef) {
        if let Some(bucket) = self.map.get_mut(&hash) {
            bucket.retain(|&x| x != r);
            if bucket.is_empty() {
                self.map.remove(&hash);
            }
            self.used -= 1;
        }
    }

    pub fn len(&self) -> usize {
        self.used
    }

    /// Give memory back after a sweep removed many entries.
    pub fn shrink_if_sparse(&mut self) {
        if self.map.capacity() > 64 && self.map.len() * 4 < self.map.capacity() {
            self.map.shrink_to_fit();
        }
    }
}
