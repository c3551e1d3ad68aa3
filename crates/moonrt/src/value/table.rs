// Hybrid table: array part for a dense integer prefix, open-addressed node
// part for everything else.
//
// The node part is a power-of-two array with collision chains threaded
// through an in-node `next` index. Every used key sits either in its own
// main position or in a free node reachable from that position; inserts
// that find the main position taken by an out-of-place key relocate that
// key instead. When no free node is left the table rehashes, choosing the
// array size as the largest power of two with more than half of the slots
// `1..2^n` occupied by integer keys.
//
// Array slots distinguish "empty" from a stored value (`None` vs `Some`);
// a stored value is never Nil. Node entries whose value is Nil are dead:
// the key stays behind to keep chains and `next` traversal intact, and is
// dropped at the next rehash.

use crate::gc::pool::{ObjectPool, TableRef};
use crate::limits::{MAX_ARRAY_BITS, MAX_HASH_BITS};
use crate::value::{float_to_exact_int, Value};

/// Fast-metamethod cache: bit N set means "event N is known absent when this
/// table is used as a metatable". Cleared on every string-keyed write.
pub const FAST_TM_COUNT: u32 = 6;

#[derive(Clone, Copy)]
pub(crate) struct Node {
    pub key: Value,
    pub val: Value,
    /// Absolute index of the next node in this chain, -1 at the end.
    pub next: i32,
}

const FREE_NODE: Node = Node {
    key: Value::Nil,
    val: Value::Nil,
    next: -1,
};

pub struct Table {
    pub(crate) array: Vec<Option<Value>>,
    /// Empty, or a power of two.
    pub(crate) nodes: Vec<Node>,
    /// Free-node search cursor: all nodes at or above it are known used.
    lastfree: usize,
    pub(crate) flags: u8,
    pub(crate) metatable: Option<TableRef>,
}

/// Key rejected by normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    NilKey,
    NanKey,
}

impl Table {
    pub fn new(narr: usize, nrec: usize) -> Self {
        let mut t = Table {
            array: Vec::new(),
            nodes: Vec::new(),
            lastfree: 0,
            flags: !0 >> (8 - FAST_TM_COUNT),
            metatable: None,
        };
        if narr > 0 {
            t.array.resize(narr, None);
        }
        if nrec > 0 {
            t.resize_nodes(nrec.next_power_of_two());
        }
        t
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable
    }

    #[inline]
    pub(crate) fn mainposition(&self, hash: u64) -> usize {
        debug_assert!(!self.nodes.is_empty());
        (hash as usize) & (self.nodes.len() - 1)
    }

    fn resize_nodes(&mut self, size: usize) {
        debug_assert!(size.is_power_of_two());
        debug_assert!(size.trailing_zeros() as u8 <= MAX_HASH_BITS);
        self.nodes.clear();
        self.nodes.resize(size, FREE_NODE);
        self.lastfree = size;
    }

    fn find_free_node(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if self.nodes[self.lastfree].key.is_nil() {
                return Some(self.lastfree);
            }
        }
        None
    }

    /// Estimated heap footprint for GC accounting.
    pub fn footprint(&self) -> u32 {
        (std::mem::size_of::<Table>()
            + self.array.capacity() * std::mem::size_of::<Option<Value>>()
            + self.nodes.capacity() * std::mem::size_of::<Node>()) as u32
    }

    /// All live pairs, array part first. Used by rehash and the collector.
    pub(crate) fn live_entries(&self) -> Vec<(Value, Value)> {
        let mut out = Vec::with_capacity(self.len_hint());
        for (i, slot) in self.array.iter().enumerate() {
            if let Some(v) = slot {
                out.push((Value::Int(i as i64 + 1), *v));
            }
        }
        for node in &self.nodes {
            if !node.key.is_nil() && !node.val.is_nil() {
                out.push((node.key, node.val));
            }
        }
        out
    }

    fn len_hint(&self) -> usize {
        self.array.len() + self.nodes.len()
    }
}

/// Normalize a table key: floats with an exact integer value become that
/// integer; Nil and NaN are rejected.
pub fn normalize_key(key: Value) -> Result<Value, KeyError> {
    match key {
        Value::Nil => Err(KeyError::NilKey),
        Value::Float(f) => {
            if f.is_nan() {
                Err(KeyError::NanKey)
            } else if let Some(i) = float_to_exact_int(f) {
                Ok(Value::Int(i))
            } else {
                Ok(Value::Float(f))
            }
        }
        k => Ok(k),
    }
}

#[inline]
fn mix64(mut x: u64) -> u64 {
    // splitmix64 finalizer
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

impl ObjectPool {
    /// Hash of a normalized key.
    pub(crate) fn key_hash(&self, key: Value) -> u64 {
        match key {
            Value::Int(i) => mix64(i as u64),
            Value::Float(f) => {
                // Exact-integer floats were normalized away; -0.0 became 0.
                mix64(f.to_bits())
            }
            Value::Bool(b) => mix64(if b { 1 } else { 2 }),
            Value::Str(r) => self.str_(r).hash(),
            Value::Nil => unreachable!("nil table key"),
            other => mix64(other.ident_bits() ^ ((other.type_tag() as u64) << 56)),
        }
    }

    /// Raw read. Returns Nil for an absent key (including un-normalizable
    /// keys: indexing with nil or NaN reads as absent, only writes reject).
    pub fn table_rawget(&self, t: TableRef, key: Value) -> Value {
        let key = match normalize_key(key) {
            Ok(k) => k,
            Err(_) => return Value::Nil,
        };
        if let Value::Int(i) = key {
            let table = self.table(t);
            if i >= 1 && (i as usize) <= table.array.len() {
                return table.array[i as usize - 1].unwrap_or(Value::Nil);
            }
        }
        self.hash_get(t, key)
    }

    fn hash_get(&self, t: TableRef, key: Value) -> Value {
        let hash = self.key_hash(key);
        let table = self.table(t);
        if table.nodes.is_empty() {
            return Value::Nil;
        }
        let mut n = table.mainposition(hash) as i32;
        loop {
            let node = self.table(t).nodes[n as usize];
            if self.raw_eq(node.key, key) {
                return node.val;
            }
            n = node.next;
            if n < 0 {
                return Value::Nil;
            }
        }
    }

    /// Raw write. The caller runs the write barrier afterwards.
    pub fn table_rawset(&mut self, t: TableRef, key: Value, val: Value) -> Result<(), KeyError> {
        let key = normalize_key(key)?;
        // Writing a string key may shadow a metamethod; drop the cache.
        if matches!(key, Value::Str(_)) {
            self.table_mut(t).flags = 0;
        }
        if let Value::Int(i) = key {
            let table = self.table_mut(t);
            if i >= 1 && (i as usize) <= table.array.len() {
                table.array[i as usize - 1] = if val.is_nil() { None } else { Some(val) };
                return Ok(());
            }
        }
        self.hash_set(t, key, val);
        Ok(())
    }

    fn hash_set(&mut self, t: TableRef, key: Value, val: Value) {
        let hash = self.key_hash(key);
        // Overwrite in place when the key already has a node (live or dead).
        if !self.table(t).nodes.is_empty() {
            let mut n = self.table(t).mainposition(hash) as i32;
            loop {
                let node = self.table(t).nodes[n as usize];
                if self.raw_eq(node.key, key) {
                    self.table_mut(t).nodes[n as usize].val = val;
                    return;
                }
                n = node.next;
                if n < 0 {
                    break;
                }
            }
        }
        if val.is_nil() {
            // Removing an absent key is a no-op.
            return;
        }
        self.insert_new_key(t, key, hash, val);
    }

    fn insert_new_key(&mut self, t: TableRef, key: Value, hash: u64, val: Value) {
        if self.table(t).nodes.is_empty() {
            self.rehash(t, Some(key));
            // The rehash may have grown the array over this key.
            let table = self.table_mut(t);
            if let Value::Int(i) = key {
                if i >= 1 && (i as usize) <= table.array.len() {
                    table.array[i as usize - 1] = Some(val);
                    return;
                }
            }
            self.insert_new_key(t, key, hash, val);
            return;
        }
        let mp = self.table(t).mainposition(hash);
        if self.table(t).nodes[mp].key.is_nil() {
            // Main position free: take it.
            let table = self.table_mut(t);
            table.nodes[mp] = Node {
                key,
                val,
                next: -1,
            };
            return;
        }
        let Some(free) = self.table_mut(t).find_free_node() else {
            self.rehash(t, Some(key));
            // Everything moved; start over.
            let table = self.table_mut(t);
            if let Value::Int(i) = key {
                if i >= 1 && (i as usize) <= table.array.len() {
                    table.array[i as usize - 1] = Some(val);
                    return;
                }
            }
            self.insert_new_key(t, key, hash, val);
            return;
        };
        let colliding = self.table(t).nodes[mp];
        let other_main = self.table(t).mainposition(self.key_hash(colliding.key));
        if other_main != mp {
            // The occupant is not in its own main position: move it to the
            // free node and put the new key where it belongs.
            let mut prev = other_main as i32;
            loop {
                let next = self.table(t).nodes[prev as usize].next;
                if next == mp as i32 {
                    break;
                }
                prev = next;
                debug_assert!(prev >= 0, "broken collision chain");
            }
            let table = self.table_mut(t);
            table.nodes[free] = colliding;
            table.nodes[prev as usize].next = free as i32;
            table.nodes[mp] = Node {
                key,
                val,
                next: -1,
            };
        } else {
            // The occupant owns this spot; chain the new key behind it.
            let table = self.table_mut(t);
            table.nodes[free] = Node {
                key,
                val,
                next: table.nodes[mp].next,
            };
            table.nodes[mp].next = free as i32;
        }
    }

    /// Rebuild both parts around the current contents plus one pending key.
    /// Array size: largest 2^n such that more than half of 1..2^n is used.
    fn rehash(&mut self, t: TableRef, pending: Option<Value>) {
        let mut entries = self.table(t).live_entries();
        if let Some(k) = pending {
            entries.push((k, Value::Nil)); // placeholder, only counted
        }
        // nums[i] = number of integer keys in (2^(i-1), 2^i]
        let mut nums = [0usize; MAX_ARRAY_BITS as usize + 1];
        let mut int_total = 0usize;
        for (k, _) in &entries {
            if let Value::Int(i) = k {
                let i = *i;
                if i >= 1 && i <= (1i64 << MAX_ARRAY_BITS) {
                    let bin =
                        64 - (i as u64).leading_zeros() - u32::from((i as u64).is_power_of_two());
                    nums[bin as usize] += 1;
                    int_total += 1;
                }
            }
        }
        let _ = int_total;
        // Optimal array size: largest 2^bin with more than half of 1..2^bin
        // occupied by integer keys.
        let mut asize = 0usize;
        let mut below = 0usize;
        for (bin, &count) in nums.iter().enumerate() {
            below += count;
            if count > 0 && below > (1usize << bin) / 2 {
                asize = 1usize << bin;
            }
        }
        let in_array = |k: &Value| match k {
            Value::Int(i) => *i >= 1 && (*i as usize) <= asize,
            _ => false,
        };
        let hash_count = entries.iter().filter(|(k, _)| !in_array(k)).count();
        // Rebuild.
        if let Some(k) = pending {
            // Drop the placeholder before reinserting.
            let pos = entries
                .iter()
                .rposition(|(ek, _)| self.raw_eq(*ek, k))
                .expect("pending key placeholder");
            entries.remove(pos);
        }
        let table = self.table_mut(t);
        table.array.clear();
        table.array.resize(asize, None);
        if hash_count == 0 {
            table.nodes.clear();
            table.lastfree = 0;
        } else {
            table.resize_nodes(hash_count.next_power_of_two());
        }
        for (k, v) in entries {
            if let Value::Int(i) = k {
                if i >= 1 && (i as usize) <= asize {
                    self.table_mut(t).array[i as usize - 1] = Some(v);
                    continue;
                }
            }
            let h = self.key_hash(k);
            self.insert_new_key(t, k, h, v);
        }
    }

    /// A border: `n` with slot n non-empty (or n == 0) and slot n+1 empty.
    pub fn table_length(&self, t: TableRef) -> i64 {
        let table = self.table(t);
        let asize = table.array.len();
        if asize > 0 && table.array[asize - 1].is_none() {
            // Boundary is inside the array part: binary search with the
            // invariant array[lo-1] non-empty (or lo == 0), array[hi-1] empty.
            let (mut lo, mut hi) = (0usize, asize);
            while hi - lo > 1 {
                let m = (lo + hi) / 2;
                if table.array[m - 1].is_some() {
                    lo = m;
                } else {
                    hi = m;
                }
            }
            return lo as i64;
        }
        if table.nodes.is_empty() {
            return asize as i64;
        }
        // Array part ends full: search the hash part above it.
        let present = |i: i64| !self.hash_get(t, Value::Int(i)).is_nil();
        let mut i = asize as i64;
        let mut j = i.saturating_add(1);
        while present(j) {
            i = j;
            if j > i64::MAX / 2 {
                // Pathological key set; fall back to a linear scan.
                let mut k = asize as i64 + 1;
                while present(k) {
                    k += 1;
                }
                return k - 1;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if present(m) {
                i = m;
            } else {
                j = m;
            }
        }
        i
    }

    /// Stable traversal: array slots in ascending order, then nodes in
    /// bucket order. `None` key starts; returns `Ok(None)` at the end and
    /// `Err(())` for a key not present in the table.
    pub fn table_next(
        &self,
        t: TableRef,
        key: Option<Value>,
    ) -> Result<Option<(Value, Value)>, ()> {
        let table = self.table(t);
        let asize = table.array.len();
        // Position *after* the given key in traversal order.
        let start = match key {
            None => 0,
            Some(k) => {
                let k = normalize_key(k).map_err(|_| ())?;
                if let Value::Int(i) = k {
                    if i >= 1 && (i as usize) <= asize {
                        i as usize
                    } else {
                        asize + self.find_node_index(t, k)? + 1
                    }
                } else {
                    asize + self.find_node_index(t, k)? + 1
                }
            }
        };
        for pos in start..asize {
            if let Some(v) = table.array[pos] {
                return Ok(Some((Value::Int(pos as i64 + 1), v)));
            }
        }
        let nstart = start.saturating_sub(asize);
        for node in table.nodes.iter().skip(nstart) {
            if !node.key.is_nil() && !node.val.is_nil() {
                return Ok(Some((node.key, node.val)));
            }
        }
        Ok(None)
    }

    /// Node index of a key that has a node (live or dead); `Err` otherwise.
    fn find_node_index(&self, t: TableRef, key: Value) -> Result<usize, ()> {
        let table = self.table(t);
        if table.nodes.is_empty() {
            return Err(());
        }
        let hash = self.key_hash(key);
        let mut n = table.mainposition(hash) as i32;
        loop {
            let node = table.nodes[n as usize];
            if self.raw_eq(node.key, key) {
                return Ok(n as usize);
            }
            n = node.next;
            if n < 0 {
                return Err(());
            }
        }
    }
}
