// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use node_data::ledger::{Hash, LedgerObject};
use parking_lot::RwLock;

#[derive(Default, Clone)]
struct SeqBlob {
    seq: u32,
    blob: Vec<u8>,
}

/// Two versions per key. `recent` always has the higher sequence; an empty
/// `recent` blob marks a key scheduled for deletion.
#[derive(Default, Clone)]
struct CacheEntry {
    recent: SeqBlob,
    old: SeqBlob,
}

#[derive(Default)]
struct CacheInner {
    map: BTreeMap<Hash, CacheEntry>,
    pending_sweeps: Vec<Hash>,
    pending_deletes: Vec<Hash>,
    most_recent: u32,
}

impl CacheInner {
    fn insert(&mut self, key: Hash, blob: &[u8], seq: u32) {
        let entry = self.map.entry(key).or_default();
        // stale insert, do nothing
        if seq <= entry.recent.seq && entry.recent.seq != 0 {
            return;
        }
        entry.old = std::mem::replace(
            &mut entry.recent,
            SeqBlob {
                seq,
                blob: blob.to_vec(),
            },
        );
        if blob.is_empty() {
            self.pending_deletes.push(key);
        }
        if !entry.old.blob.is_empty() {
            self.pending_sweeps.push(key);
        }
    }

    fn select(entry: &CacheEntry, seq: u32) -> Option<&[u8]> {
        if seq < entry.old.seq {
            return None;
        }
        if seq < entry.recent.seq && !entry.old.blob.is_empty() {
            return Some(&entry.old.blob);
        }
        if !entry.recent.blob.is_empty() {
            return Some(&entry.recent.blob);
        }
        None
    }

    /// Only near-tip sequences are answerable: older reads must fall
    /// through to the backend.
    fn covers(&self, seq: u32) -> bool {
        seq + 1 >= self.most_recent
    }
}

/// Sorted in-memory view of the latest account state. One writer (the
/// transformer or the reader-mode poller) applies complete per-sequence
/// diffs; readers overlap freely.
#[derive(Default)]
pub struct LayeredCache {
    inner: RwLock<CacheInner>,
    full: AtomicBool,
}

impl LayeredCache {
    /// Apply the complete diff of one sequence.
    pub fn update(&self, diffs: &[LedgerObject], seq: u32) {
        let mut inner = self.inner.write();
        if seq > inner.most_recent {
            inner.most_recent = seq;
        }
        for key in std::mem::take(&mut inner.pending_sweeps) {
            if let Some(entry) = inner.map.get_mut(&key) {
                entry.old = SeqBlob::default();
            }
        }
        for key in std::mem::take(&mut inner.pending_deletes) {
            // Re-created keys must survive their stale tombstone.
            let recreated = inner
                .map
                .get(&key)
                .is_some_and(|e| !e.recent.blob.is_empty());
            if !recreated {
                inner.map.remove(&key);
            }
        }
        for diff in diffs {
            inner.insert(diff.key, &diff.blob, seq);
        }
    }

    pub fn get(&self, key: &Hash, seq: u32) -> Option<Vec<u8>> {
        let inner = self.inner.read();
        if !inner.covers(seq) {
            return None;
        }
        let entry = inner.map.get(key)?;
        CacheInner::select(entry, seq).map(<[u8]>::to_vec)
    }

    /// The smallest cached key strictly greater than `key` that is live at
    /// `seq`.
    pub fn successor(&self, key: &Hash, seq: u32) -> Option<LedgerObject> {
        let inner = self.inner.read();
        if !inner.covers(seq) {
            return None;
        }
        let range = inner
            .map
            .range((Bound::Excluded(*key), Bound::Unbounded));
        for (next, entry) in range {
            if let Some(blob) = CacheInner::select(entry, seq) {
                return Some(LedgerObject::new(*next, blob.to_vec()));
            }
        }
        None
    }

    /// The largest cached key strictly smaller than `key` that is live at
    /// `seq`.
    pub fn predecessor(&self, key: &Hash, seq: u32) -> Option<LedgerObject> {
        let inner = self.inner.read();
        if !inner.covers(seq) {
            return None;
        }
        let range = inner
            .map
            .range((Bound::Unbounded, Bound::Excluded(*key)))
            .rev();
        for (prev, entry) in range {
            if let Some(blob) = CacheInner::select(entry, seq) {
                return Some(LedgerObject::new(*prev, blob.to_vec()));
            }
        }
        None
    }

    /// Every key live at the cache tip, ascending. Feeds flag-ledger
    /// snapshots.
    pub fn live_keys(&self) -> Vec<Hash> {
        let inner = self.inner.read();
        let tip = inner.most_recent;
        inner
            .map
            .iter()
            .filter(|(_, entry)| CacheInner::select(entry, tip).is_some())
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn most_recent_sequence(&self) -> u32 {
        self.inner.read().most_recent
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().map.is_empty()
    }

    /// Whether the cache holds the complete live set (loader finished or
    /// the writer built it from an initial ledger).
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    pub fn set_full(&self) {
        self.full.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(key: u8, blob: &[u8]) -> LedgerObject {
        LedgerObject::new([key; 32], blob.to_vec())
    }

    #[test]
    fn select_rule() {
        let cache = LayeredCache::default();
        cache.update(&[obj(1, b"v1")], 10);
        cache.update(&[obj(1, b"v2")], 11);

        // Old version still answerable one sequence behind the tip.
        assert_eq!(cache.get(&[1; 32], 10).unwrap(), b"v1");
        assert_eq!(cache.get(&[1; 32], 11).unwrap(), b"v2");
        assert_eq!(cache.get(&[1; 32], 12).unwrap(), b"v2");

        // Below the cover window the cache refuses to answer.
        assert!(cache.get(&[1; 32], 5).is_none());
    }

    #[test]
    fn deletion_scheduling() {
        let cache = LayeredCache::default();
        cache.update(&[obj(1, b"v1")], 10);
        cache.update(&[obj(1, b"")], 11);

        // Tombstoned at 11; the old version still serves reads at 10.
        assert!(cache.get(&[1; 32], 11).is_none());
        assert_eq!(cache.get(&[1; 32], 10).unwrap(), b"v1");

        // The next update cycle erases the key entirely.
        cache.update(&[], 12);
        assert!(cache.get(&[1; 32], 12).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn recreated_key_survives_pending_delete() {
        let cache = LayeredCache::default();
        cache.update(&[obj(1, b"v1")], 10);
        cache.update(&[obj(1, b"")], 11);
        cache.update(&[obj(1, b"v2")], 12);
        cache.update(&[], 13);

        assert_eq!(cache.get(&[1; 32], 13).unwrap(), b"v2");
    }

    #[test]
    fn successor_skips_dead_entries() {
        let cache = LayeredCache::default();
        cache.update(
            &[obj(1, b"a"), obj(2, b"b"), obj(3, b"c")],
            10,
        );
        cache.update(&[obj(2, b"")], 11);

        let next = cache.successor(&[1; 32], 11).unwrap();
        assert_eq!(next.key, [3; 32]);

        // At 10 the middle entry was still live.
        let next = cache.successor(&[1; 32], 10).unwrap();
        assert_eq!(next.key, [2; 32]);

        assert!(cache.successor(&[3; 32], 11).is_none());
    }

    #[test]
    fn predecessor_walk() {
        let cache = LayeredCache::default();
        cache.update(&[obj(1, b"a"), obj(5, b"b")], 10);

        let prev = cache.predecessor(&[5; 32], 10).unwrap();
        assert_eq!(prev.key, [1; 32]);
        assert!(cache.predecessor(&[1; 32], 10).is_none());
    }

    #[test]
    fn live_keys_excludes_tombstones() {
        let cache = LayeredCache::default();
        cache.update(&[obj(1, b"a"), obj(2, b"b")], 10);
        cache.update(&[obj(1, b"")], 11);

        assert_eq!(cache.live_keys(), vec![[2; 32]]);
    }
}
