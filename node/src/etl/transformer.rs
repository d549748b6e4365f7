// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! Decomposes a fetched ledger into storage writes: header, object diffs,
//! transactions with their account index, successor-pointer maintenance,
//! and flag-ledger key snapshots.

use std::sync::Arc;

use node_data::ledger::{
    is_flag_ledger, key_index_of, Hash, LedgerObject, FIRST_KEY, LAST_KEY,
};
use tracing::{debug, warn};

use crate::database::{Backend, Result};
use crate::peer::FetchedLedger;
use crate::storage::cache::LayeredCache;
use crate::storage::Store;

/// Outcome of writing one ledger through the store.
pub struct TransformOutcome {
    /// The diff batch as applied to the cache.
    pub objects: Vec<LedgerObject>,
    /// True once every write was durably acknowledged.
    pub committed: bool,
}

/// Successor-pointer maintenance rows for one diff batch.
///
/// A created key `k` splices itself between its neighbors at `seq`:
/// `(p -> k)` and `(k -> n)`. A deleted key heals the chain with
/// `(p -> n)`. Neighbors come from the peer when provided, otherwise from
/// the full cache at the previous sequence.
pub fn successor_rows(
    cache: &LayeredCache,
    ledger: &FetchedLedger,
) -> Vec<(Hash, Hash)> {
    let seq = ledger.header.sequence;
    let prev = seq.saturating_sub(1);
    let mut rows = vec![];

    for diff in &ledger.diffs {
        let predecessor = diff.predecessor.or_else(|| {
            cache.is_full().then(|| {
                cache
                    .predecessor(&diff.key, prev)
                    .map_or(FIRST_KEY, |object| object.key)
            })
        });
        let successor = diff.successor.or_else(|| {
            cache.is_full().then(|| {
                cache
                    .successor(&diff.key, prev)
                    .map_or(LAST_KEY, |object| object.key)
            })
        });
        // Without neighbor info from either source the chain cannot be
        // maintained for this key; fetches request neighbors exactly
        // when the cache cannot answer, so this only skips no-ops.
        let (Some(predecessor), Some(successor)) = (predecessor, successor)
        else {
            continue;
        };

        if diff.is_deleted() {
            rows.push((predecessor, successor));
        } else {
            rows.push((predecessor, diff.key));
            rows.push((diff.key, successor));
        }
    }
    rows
}

/// Write one fetched ledger through the store and fence it.
///
/// On a false `committed` the sequence is abandoned: nothing was
/// published, the range row is untouched, and the caller re-extracts.
pub async fn transform<B: Backend>(
    store: &Arc<Store<B>>,
    ledger: &FetchedLedger,
    is_first: bool,
) -> Result<TransformOutcome> {
    let sequence = ledger.header.sequence;
    let key_shift = store.key_shift();

    store.start_writes(sequence);
    store.write_ledger(ledger.header.clone(), is_first).await?;

    let objects: Vec<LedgerObject> =
        ledger.diffs.iter().map(|diff| diff.as_object()).collect();
    let rows = successor_rows(store.cache(), ledger);

    store.write_ledger_objects(sequence, objects.clone()).await?;
    store.write_successors(sequence, rows).await?;
    store
        .write_transactions(sequence, ledger.transactions.clone())
        .await?;

    // The cache sees the diff before the fence: successor queries for the
    // next sequence need it, and an abandoned ledger is re-extracted with
    // identical content.
    store.update_cache(&objects, sequence);

    // Crossing a flag boundary seeds the next window's keys row with the
    // full live set, so scans there never replay history from genesis.
    if is_flag_ledger(sequence, key_shift) && store.cache().is_full() {
        let snapshot = store.cache().live_keys();
        let next_window = key_index_of(sequence + 1, key_shift);
        store
            .write_key_snapshot(sequence, next_window, snapshot)
            .await?;
    }

    let committed = store.finish_writes(sequence).await;
    if committed {
        debug!(
            event = "ledger transformed",
            sequence,
            objects = objects.len(),
            txs = ledger.transactions.len(),
        );
    } else {
        warn!(event = "ledger abandoned", sequence);
        metrics::counter!("quill_abandoned_ledgers").increment(1);
    }

    Ok(TransformOutcome { objects, committed })
}

/// Build the full successor chain for an initial-load ledger from its
/// sorted key set.
pub fn initial_chain(diffs: &[LedgerObject]) -> Vec<(Hash, Hash)> {
    let mut rows = Vec::with_capacity(diffs.len() + 1);
    let mut prev = FIRST_KEY;
    for diff in diffs {
        if diff.blob.is_empty() {
            continue;
        }
        rows.push((prev, diff.key));
        prev = diff.key;
    }
    rows.push((prev, LAST_KEY));
    rows
}

#[cfg(test)]
mod tests {
    use node_data::faker;
    use node_data::ledger::ObjectDiff;

    use super::*;
    use crate::database::rocksdb::RocksBackend;
    use crate::database::DatabaseOptions;
    use crate::storage;

    fn open_store(dir: &tempfile::TempDir) -> Arc<Store<RocksBackend>> {
        let backend = Arc::new(RocksBackend::create_or_open(
            dir.path(),
            DatabaseOptions::default(),
        ));
        Arc::new(
            Store::open(
                backend,
                storage::Params {
                    key_shift: 16,
                    ..storage::Params::default()
                },
            )
            .unwrap(),
        )
    }

    fn fetched(
        sequence: u32,
        diffs: Vec<ObjectDiff>,
    ) -> crate::peer::FetchedLedger {
        crate::peer::FetchedLedger {
            header: faker::gen_dummy_header(sequence),
            diffs,
            transactions: vec![faker::gen_dummy_tx(sequence, 0)],
        }
    }

    #[tokio::test]
    async fn transform_commits_a_ledger() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);

        let diff = ObjectDiff {
            key: faker::gen_key(1),
            blob: vec![1, 2, 3],
            predecessor: Some(FIRST_KEY),
            successor: Some(LAST_KEY),
        };
        let ledger = fetched(70_000, vec![diff.clone()]);

        let outcome = transform(&store, &ledger, true).await.unwrap();
        assert!(outcome.committed);

        store.advance_published(70_000);
        assert_eq!(
            store
                .fetch_ledger_object(diff.key, 70_000)
                .await
                .unwrap()
                .unwrap(),
            diff.blob
        );
        let tx = store
            .fetch_transaction(ledger.transactions[0].hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.ledger_sequence, 70_000);

        // Successor chain reaches the new key from the zero anchor.
        let next = store
            .fetch_successor(FIRST_KEY, 70_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.key, diff.key);
    }

    #[tokio::test]
    async fn deletion_heals_the_chain() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);

        let a = faker::gen_key(1);
        let b = faker::gen_key(2);
        let (a, b) = if a < b { (a, b) } else { (b, a) };

        let mut objects = vec![
            LedgerObject::new(a, vec![1]),
            LedgerObject::new(b, vec![2]),
        ];
        objects.sort_by_key(|o| o.key);

        let ledger = crate::peer::FetchedLedger {
            header: faker::gen_dummy_header(100),
            diffs: objects
                .iter()
                .map(|o| ObjectDiff {
                    key: o.key,
                    blob: o.blob.clone(),
                    predecessor: None,
                    successor: None,
                })
                .collect(),
            transactions: vec![],
        };

        // Initial load path: chain built from the sorted key set.
        let outcome = transform(&store, &ledger, true).await.unwrap();
        assert!(outcome.committed);
        store
            .write_successors(100, initial_chain(&objects))
            .await
            .unwrap();
        assert!(store.finish_writes(100).await);
        store.cache().set_full();
        store.advance_published(100);

        // Delete `a` at 101; neighbors resolved from the cache.
        let ledger = crate::peer::FetchedLedger {
            header: faker::gen_dummy_header(101),
            diffs: vec![ObjectDiff {
                key: a,
                blob: vec![],
                predecessor: None,
                successor: None,
            }],
            transactions: vec![],
        };
        let outcome = transform(&store, &ledger, false).await.unwrap();
        assert!(outcome.committed);
        store.advance_published(101);

        let next = store
            .fetch_successor(FIRST_KEY, 101)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.key, b);

        // History at 100 is untouched.
        let next = store
            .fetch_successor(FIRST_KEY, 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.key, a);
    }

    #[test]
    fn initial_chain_skips_tombstones() {
        let objects = vec![
            LedgerObject::new([1; 32], vec![1]),
            LedgerObject::new([2; 32], vec![]),
            LedgerObject::new([3; 32], vec![3]),
        ];
        let rows = initial_chain(&objects);
        assert_eq!(
            rows,
            vec![
                (FIRST_KEY, [1; 32]),
                ([1; 32], [3; 32]),
                ([3; 32], LAST_KEY),
            ]
        );
    }
}
