// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lock-free concurrent hash map.
//!
//! Each bucket is a Harris-Michael list: a node is removed in two steps, a
//! CAS that tags its `next` pointer as logically deleted, followed by a
//! best-effort physical unlink. Readers and writers that encounter a tagged
//! node while traversing simply skip it (or finish unlinking it for free),
//! so a reader is never blocked by a concurrent writer. Reclamation goes
//! through [`crossbeam_epoch`]: a node is `defer_destroy`-ed only once it
//! has actually been unlinked, so a thread that is mid-traversal through it
//! never has it freed out from under it.
//!
//! A looked-up value comes back as an [`ember_rc::Shared<V>`] rather than a
//! borrow: the caller's clone keeps the value alive independent of the
//! epoch guard and independent of whether the entry is concurrently
//! removed, which is the "shared double-reference guard" this map's values
//! are built on. `remove` only drops the bucket's reference; any reader
//! already holding a cloned handle keeps the value alive until it drops
//! that handle too.
//!
//! The table itself resizes cooperatively: whichever thread notices the
//! load factor crossed the threshold builds the next table and publishes it
//! with a single `Release` store, so concurrent readers always see either
//! the old table or the new one, never a half-built one.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared as EpochShared};
use ember_rc::Shared;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const MIN_CAPACITY: usize = 16;
const LOAD_FACTOR_NUM: usize = 3;
const LOAD_FACTOR_DEN: usize = 4;

struct Node<K, V> {
    key: K,
    value: Shared<V>,
    next: Atomic<Node<K, V>>,
}

struct Table<K, V> {
    buckets: Box<[Atomic<Node<K, V>>]>,
}

impl<K, V> Table<K, V> {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(MIN_CAPACITY);
        Self {
            buckets: (0..capacity)
                .map(|_| Atomic::null())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    fn capacity(&self) -> usize {
        self.buckets.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn bucket_for(&self, hash: u64) -> &Atomic<Node<K, V>> {
        // Folding the hash down to a bucket index is the intended mixing
        // step, not a lossy bug.
        let index = (hash as usize) & (self.buckets.len() - 1);
        &self.buckets[index]
    }

    /// Inserts a node built from an already-hashed, known-unique key into an
    /// empty bucket chain. Only used while rehashing into a fresh table that
    /// isn't published yet, so there is no concurrent writer to race.
    fn insert_fresh(&self, key: K, value: Shared<V>, hash: u64, guard: &Guard) {
        let bucket = self.bucket_for(hash);
        let head = bucket.load(Ordering::Relaxed, guard);
        let new_node = Owned::new(Node {
            key,
            value,
            next: Atomic::null(),
        });
        new_node.next.store(head, Ordering::Relaxed);
        bucket.store(new_node, Ordering::Relaxed);
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // Exclusive access: nothing can be pinned against a table that is
        // itself being dropped.
        let guard = unsafe { epoch::unprotected() };
        for bucket in self.buckets.iter() {
            let mut current = bucket.load(Ordering::Relaxed, guard);
            while let Some(node) = (unsafe { current.as_ref() }) {
                let next = node.next.load(Ordering::Relaxed, guard).with_tag(0);
                drop(unsafe { current.into_owned() });
                current = next;
            }
        }
    }
}

/// Walks `bucket`'s chain for `key`, physically unlinking any logically
/// deleted nodes it passes over along the way.
///
/// Returns the link that currently holds the matching node (either the
/// bucket head or a predecessor's `next`) together with that node, or a
/// null node if `key` isn't present, so the caller can CAS against exactly
/// what it just observed.
fn find<'g, K: Eq, V>(
    bucket: &'g Atomic<Node<K, V>>,
    key: &K,
    guard: &'g Guard,
) -> (&'g Atomic<Node<K, V>>, EpochShared<'g, Node<K, V>>) {
    'retry: loop {
        let mut prev = bucket;
        let mut curr = prev.load(Ordering::Acquire, guard);

        loop {
            let Some(curr_node) = (unsafe { curr.as_ref() }) else {
                return (prev, curr);
            };
            let next = curr_node.next.load(Ordering::Acquire, guard);

            if next.tag() == 1 {
                match prev.compare_exchange(
                    curr,
                    next.with_tag(0),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => {
                        unsafe { guard.defer_destroy(curr) };
                        curr = next.with_tag(0);
                        continue;
                    }
                    // A concurrent unlink raced us; restart the scan for
                    // `key` from the bucket head rather than resume from a
                    // `prev` that may itself now be stale.
                    Err(_) => continue 'retry,
                }
            }

            if &curr_node.key == key {
                return (prev, curr);
            }

            prev = &curr_node.next;
            curr = next;
        }
    }
}

/// A lock-free hash map keyed by `K`, with lookups returning a cloned,
/// reference-counted handle to the stored value rather than a borrow.
///
/// Reads never block behind a writer. Writers contend only with each other,
/// at the granularity of a single bucket link.
pub struct ConcurrentMap<K, V, S = RandomState> {
    table: Atomic<Table<K, V>>,
    len: AtomicUsize,
    resizing: AtomicBool,
    hash_builder: S,
}

impl<K, V> ConcurrentMap<K, V, RandomState>
where
    K: Hash + Eq + Clone,
{
    /// Builds an empty map with a small default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }

    /// Builds an empty map sized to hold at least `capacity` entries before
    /// its first resize.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V> Default for ConcurrentMap<K, V, RandomState>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    /// Builds an empty map using `hash_builder` for key hashing.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_capacity_and_hasher(MIN_CAPACITY, hash_builder)
    }

    /// Builds an empty map using `hash_builder`, sized to hold at least
    /// `capacity` entries before its first resize.
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        Self {
            table: Atomic::new(Table::with_capacity(capacity)),
            len: AtomicUsize::new(0),
            resizing: AtomicBool::new(false),
            hash_builder,
        }
    }

    fn hash(&self, key: &K) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Inserts `key` with `value`. Returns `true` if this replaced a live
    /// entry for `key`, `false` if `key` was not already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        let guard = &epoch::pin();
        let hash = self.hash(&key);
        let value = Shared::new(value);

        loop {
            let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
            let bucket = table.bucket_for(hash);
            let (prev, curr) = find(bucket, &key, guard);

            let next = match unsafe { curr.as_ref() } {
                Some(curr_node) => curr_node.next.load(Ordering::Acquire, guard).with_tag(0),
                None => curr,
            };

            let new_node = Owned::new(Node {
                key: key.clone(),
                value: value.clone(),
                next: Atomic::null(),
            });
            new_node.next.store(next, Ordering::Relaxed);

            match prev.compare_exchange(curr, new_node, Ordering::AcqRel, Ordering::Acquire, guard) {
                Ok(_) => {
                    let replaced = !curr.is_null();
                    if replaced {
                        unsafe { guard.defer_destroy(curr) };
                    } else {
                        self.len.fetch_add(1, Ordering::Relaxed);
                        self.maybe_grow(guard);
                    }
                    return replaced;
                }
                Err(_) => continue,
            }
        }
    }

    /// Removes `key`, releasing the bucket's reference to its value. Any
    /// handle a reader already cloned out via [`get`](Self::get) stays
    /// valid until that handle itself is dropped.
    pub fn remove(&self, key: &K) -> bool {
        let guard = &epoch::pin();
        let hash = self.hash(key);

        loop {
            let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
            let bucket = table.bucket_for(hash);
            let (prev, curr) = find(bucket, key, guard);

            let Some(curr_node) = (unsafe { curr.as_ref() }) else {
                return false;
            };

            let next = curr_node.next.load(Ordering::Acquire, guard);
            if next.tag() == 1 {
                continue;
            }

            if curr_node
                .next
                .compare_exchange(
                    next,
                    next.with_tag(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                )
                .is_err()
            {
                continue;
            }

            self.len.fetch_sub(1, Ordering::Relaxed);

            // Best-effort: if this loses the race, `find` cleans it up the
            // next time anyone walks this bucket.
            if prev
                .compare_exchange(curr, next, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                unsafe { guard.defer_destroy(curr) };
            }

            return true;
        }
    }

    /// Returns `true` if `key` currently has a live entry.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Looks up `key`, returning a cloned handle to its value. The clone is
    /// a reference-count bump, independent of the map's own bucket
    /// traversal and safe to hold past this call.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Shared<V>> {
        let guard = &epoch::pin();
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        let hash = self.hash(key);
        let bucket = table.bucket_for(hash);
        let (_, curr) = find(bucket, key, guard);
        unsafe { curr.as_ref() }.map(|node| node.value.clone())
    }

    /// Current entry count. Approximate under concurrent writers: a
    /// logically deleted entry that hasn't been physically unlinked yet is
    /// already excluded, but a resize in progress may transiently
    /// undercount entries mid-rehash.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry. Concurrent readers mid-traversal of a bucket
    /// this clears still see a consistent (if suddenly empty-tailed) chain;
    /// nothing is freed until they unpin.
    pub fn clear(&self) {
        let guard = &epoch::pin();
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        for bucket in table.buckets.iter() {
            let mut curr = bucket.swap(EpochShared::null(), Ordering::AcqRel, guard);
            while let Some(node) = (unsafe { curr.as_ref() }) {
                let next = node.next.load(Ordering::Acquire, guard).with_tag(0);
                if curr.tag() == 0 {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                }
                unsafe { guard.defer_destroy(curr) };
                curr = next;
            }
        }
    }

    /// Grows the table once the load factor crosses the threshold. Only one
    /// thread actually resizes at a time; everyone else's call is a no-op.
    fn maybe_grow(&self, guard: &Guard) {
        let table_ptr = self.table.load(Ordering::Acquire, guard);
        let table = unsafe { table_ptr.deref() };
        let len = self.len.load(Ordering::Relaxed);
        if len * LOAD_FACTOR_DEN < table.capacity() * LOAD_FACTOR_NUM {
            return;
        }

        if self
            .resizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        // Someone else may have already grown the table while we were
        // deciding to; re-check now that we hold the right to resize.
        let current = self.table.load(Ordering::Acquire, guard);
        if current != table_ptr {
            self.resizing.store(false, Ordering::Release);
            return;
        }

        let old = unsafe { current.deref() };
        let new_table = Table::with_capacity(old.capacity() * 2);
        for bucket in old.buckets.iter() {
            let mut cursor = bucket.load(Ordering::Acquire, guard);
            while let Some(node) = (unsafe { cursor.as_ref() }) {
                let next = node.next.load(Ordering::Acquire, guard);
                if next.tag() == 0 {
                    let hash = self.hash(&node.key);
                    new_table.insert_fresh(node.key.clone(), node.value.clone(), hash, guard);
                }
                cursor = next.with_tag(0);
            }
        }

        let new_shared = Owned::new(new_table).into_shared(guard);
        self.table.store(new_shared, Ordering::Release);
        unsafe { guard.defer_destroy(current) };
        self.resizing.store(false, Ordering::Release);
    }
}

impl<K, V, S> fmt::Debug for ConcurrentMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMap")
            .field("len", &self.len.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<K, V, S> Drop for ConcurrentMap<K, V, S> {
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        let table = self.table.load(Ordering::Relaxed, guard);
        if !table.is_null() {
            drop(unsafe { table.into_owned() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_then_get_roundtrips() {
        let map: ConcurrentMap<String, i32> = ConcurrentMap::new();
        assert!(!map.insert("a".to_string(), 1));
        assert_eq!(*map.get(&"a".to_string()).unwrap(), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn insert_replaces_existing_key() {
        let map: ConcurrentMap<&str, i32> = ConcurrentMap::new();
        assert!(!map.insert("k", 1));
        assert!(map.insert("k", 2));
        assert_eq!(*map.get(&"k").unwrap(), 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_drops_entry_but_not_held_handles() {
        let map: ConcurrentMap<&str, i32> = ConcurrentMap::new();
        map.insert("k", 7);
        let handle = map.get(&"k").unwrap();
        assert!(map.remove(&"k"));
        assert!(!map.contains(&"k"));
        assert_eq!(*handle, 7);
    }

    #[test]
    fn clear_empties_the_map() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::new();
        for i in 0..32 {
            map.insert(i, i * 2);
        }
        map.clear();
        assert_eq!(map.len(), 0);
        assert!(!map.contains(&5));
    }

    #[test]
    fn grows_past_the_load_factor_without_losing_entries() {
        let map: ConcurrentMap<i32, i32> = ConcurrentMap::with_capacity(16);
        for i in 0..500 {
            map.insert(i, i);
        }
        assert_eq!(map.len(), 500);
        for i in 0..500 {
            assert_eq!(*map.get(&i).unwrap(), i);
        }
    }

    #[test]
    fn concurrent_inserts_and_removes_stay_consistent() {
        let map = Arc::new(ConcurrentMap::<i32, i32>::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let map = map.clone();
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    let key = t * 1000 + i;
                    map.insert(key, key);
                    assert_eq!(*map.get(&key).unwrap(), key);
                    if i % 2 == 0 {
                        map.remove(&key);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 8 * 100);
    }

    proptest::proptest! {
        #[test]
        fn matches_a_reference_std_map(ops in proptest::collection::vec(
            (0i32..20, proptest::bool::ANY),
            0..200,
        )) {
            let map: ConcurrentMap<i32, i32> = ConcurrentMap::with_capacity(4);
            let mut model = std::collections::HashMap::new();
            for (key, should_insert) in ops {
                if should_insert {
                    map.insert(key, key);
                    model.insert(key, key);
                } else {
                    map.remove(&key);
                    model.remove(&key);
                }
            }
            proptest::prop_assert_eq!(map.len(), model.len());
            for key in 0i32..20 {
                proptest::prop_assert_eq!(map.get(&key).map(|v| *v), model.get(&key).copied());
            }
        }
    }
}
