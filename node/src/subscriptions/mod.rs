// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! Fan-out of ledger, transaction, account and book events to long-lived
//! sessions. Signals hold weak handles only; emits snapshot the handle set
//! under the lock, release it, then dispatch. Unsubscription therefore
//! never deadlocks against an in-flight emit, and an unsubscribed session
//! can at worst receive events whose emit was already snapshotted.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use node_data::events::{self, Fees, StreamKind};
use node_data::ledger::{
    book_of, AccountId, Book, LedgerHeader, LedgerRange, Transaction,
};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// A session able to receive subscription frames. `send` must not block:
/// real sessions enqueue onto their strand's outgoing buffer.
pub trait FeedSink: Send + Sync {
    fn session_id(&self) -> u64;
    fn send(&self, msg: Arc<Value>);
}

/// Token returned by `connect`; `disconnect` consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

type Slot = (HandleId, u64, Weak<dyn FeedSink>);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_handle() -> HandleId {
    HandleId(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

/// A multi-subscriber event source safe against concurrent
/// subscribe/unsubscribe.
#[derive(Default)]
pub struct TrackableSignal {
    slots: Mutex<Vec<Slot>>,
}

impl TrackableSignal {
    pub fn connect(&self, sink: &Arc<dyn FeedSink>) -> HandleId {
        let id = next_handle();
        let mut slots = self.slots.lock();
        // One live handle per session and stream.
        slots.retain(|(_, session, slot)| {
            *session != sink.session_id() || slot.strong_count() == 0
        });
        slots.push((id, sink.session_id(), Arc::downgrade(sink)));
        id
    }

    pub fn disconnect(&self, handle: HandleId) {
        self.slots.lock().retain(|(id, _, _)| *id != handle);
    }

    pub fn disconnect_session(&self, session_id: u64) {
        self.slots
            .lock()
            .retain(|(_, session, _)| *session != session_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|(_, _, slot)| slot.strong_count() > 0)
            .count()
    }

    /// Deliver `msg` to every live subscriber. Dead handles found along
    /// the way are pruned opportunistically.
    pub fn emit(&self, msg: Arc<Value>) {
        let snapshot: Vec<Slot> = {
            let mut slots = self.slots.lock();
            slots.retain(|(_, _, slot)| slot.strong_count() > 0);
            slots.clone()
        };

        // The lock is released: a subscriber calling back into
        // disconnect from its send path cannot deadlock.
        for (_, _, slot) in snapshot {
            if let Some(sink) = slot.upgrade() {
                sink.send(msg.clone());
            }
        }
    }
}

/// Keyed family of trackable signals (per account, per book).
pub struct TrackableSignalMap<K: Ord> {
    slots: Mutex<BTreeMap<K, Vec<Slot>>>,
}

impl<K: Ord> Default for TrackableSignalMap<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord + Copy> TrackableSignalMap<K> {
    pub fn connect(&self, key: K, sink: &Arc<dyn FeedSink>) -> HandleId {
        let id = next_handle();
        let mut slots = self.slots.lock();
        let entry = slots.entry(key).or_default();
        entry.retain(|(_, session, slot)| {
            *session != sink.session_id() || slot.strong_count() == 0
        });
        entry.push((id, sink.session_id(), Arc::downgrade(sink)));
        id
    }

    pub fn disconnect(&self, key: &K, handle: HandleId) {
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(key) {
            entry.retain(|(id, _, _)| *id != handle);
            if entry.is_empty() {
                slots.remove(key);
            }
        }
    }

    pub fn disconnect_session(&self, session_id: u64) {
        let mut slots = self.slots.lock();
        slots.retain(|_, entry| {
            entry.retain(|(_, session, _)| *session != session_id);
            !entry.is_empty()
        });
    }

    pub fn emit(&self, key: &K, msg: Arc<Value>) {
        let snapshot: Vec<Slot> = {
            let mut slots = self.slots.lock();
            let Some(entry) = slots.get_mut(key) else { return };
            entry.retain(|(_, _, slot)| slot.strong_count() > 0);
            if entry.is_empty() {
                slots.remove(key);
                return;
            }
            entry.clone()
        };

        for (_, _, slot) in snapshot {
            if let Some(sink) = slot.upgrade() {
                sink.send(msg.clone());
            }
        }
    }
}

/// Process-wide hub: one signal per stream plus account- and book-scoped
/// signal maps.
pub struct SubscriptionManager {
    streams: HashMap<StreamKind, TrackableSignal>,
    accounts: TrackableSignalMap<AccountId>,
    books: TrackableSignalMap<Book>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        let mut streams = HashMap::new();
        for kind in StreamKind::all() {
            streams.insert(*kind, TrackableSignal::default());
        }
        Self {
            streams,
            accounts: TrackableSignalMap::default(),
            books: TrackableSignalMap::default(),
        }
    }
}

impl SubscriptionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn stream(&self, kind: StreamKind) -> &TrackableSignal {
        self.streams
            .get(&kind)
            .expect("every stream kind is registered at construction")
    }

    pub fn subscribe_stream(
        &self,
        kind: StreamKind,
        sink: &Arc<dyn FeedSink>,
    ) -> HandleId {
        debug!(
            event = "subscribe",
            stream = kind.as_str(),
            session = sink.session_id(),
        );
        self.stream(kind).connect(sink)
    }

    /// After this returns, no event emitted later reaches the session on
    /// this stream.
    pub fn unsubscribe_stream(&self, kind: StreamKind, session_id: u64) {
        self.stream(kind).disconnect_session(session_id);
    }

    pub fn subscribe_account(
        &self,
        account: AccountId,
        sink: &Arc<dyn FeedSink>,
    ) -> HandleId {
        self.accounts.connect(account, sink)
    }

    pub fn unsubscribe_account(&self, account: AccountId, session_id: u64) {
        self.accounts.disconnect_session_key(&account, session_id);
    }

    pub fn subscribe_book(
        &self,
        book: Book,
        sink: &Arc<dyn FeedSink>,
    ) -> HandleId {
        self.books.connect(book, sink)
    }

    pub fn unsubscribe_book(&self, book: Book, session_id: u64) {
        self.books.disconnect_session_key(&book, session_id);
    }

    /// Session teardown: drop every handle the session holds anywhere.
    pub fn clear_session(&self, session_id: u64) {
        for signal in self.streams.values() {
            signal.disconnect_session(session_id);
        }
        self.accounts.disconnect_session(session_id);
        self.books.disconnect_session(session_id);
    }

    pub fn subscriber_count(&self, kind: StreamKind) -> usize {
        self.stream(kind).subscriber_count()
    }

    // ---- Publish side (driven by the ETL publisher) ----

    pub fn publish_ledger(
        &self,
        header: &LedgerHeader,
        fees: &Fees,
        range: &LedgerRange,
        txn_count: usize,
    ) {
        let msg = Arc::new(events::ledger_closed(header, fees, range, txn_count));
        metrics::counter!("quill_published_ledgers").increment(1);
        self.stream(StreamKind::Ledger).emit(msg);
    }

    pub fn publish_transaction(
        &self,
        tx: &Transaction,
        header: &LedgerHeader,
    ) {
        let msg = Arc::new(events::transaction(tx, header));
        self.stream(StreamKind::Transactions).emit(msg.clone());
        for account in &tx.accounts {
            self.accounts.emit(account, msg.clone());
        }
    }

    pub fn publish_book_changes(
        &self,
        header: &LedgerHeader,
        changed: &[Book],
    ) {
        if changed.is_empty() {
            return;
        }
        let msg = Arc::new(events::book_changes(header, changed.len()));
        self.stream(StreamKind::BookChanges).emit(msg.clone());
        for book in changed {
            self.books.emit(book, msg.clone());
        }
    }

    /// Raw passthrough for frames mirrored from the upstream peer streams
    /// (proposed transactions, manifests, validations).
    pub fn publish_upstream(&self, kind: StreamKind, frame: Value) {
        self.stream(kind).emit(Arc::new(frame));
    }

    /// Books touched by a diff batch.
    pub fn books_of_diff(
        diffs: &[node_data::ledger::LedgerObject],
    ) -> Vec<Book> {
        let mut books: Vec<Book> =
            diffs.iter().map(|d| book_of(&d.key)).collect();
        books.sort();
        books.dedup();
        books
    }
}

impl<K: Ord + Copy> TrackableSignalMap<K> {
    fn disconnect_session_key(&self, key: &K, session_id: u64) {
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(key) {
            entry.retain(|(_, session, _)| *session != session_id);
            if entry.is_empty() {
                slots.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use node_data::faker;
    use parking_lot::Mutex as PlMutex;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        id: u64,
        frames: PlMutex<Vec<Arc<Value>>>,
    }

    impl RecordingSink {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                frames: PlMutex::new(vec![]),
            })
        }

        fn sequences(&self) -> Vec<u64> {
            self.frames
                .lock()
                .iter()
                .filter_map(|f| f["ledger_index"].as_u64())
                .collect()
        }
    }

    impl FeedSink for RecordingSink {
        fn session_id(&self) -> u64 {
            self.id
        }

        fn send(&self, msg: Arc<Value>) {
            self.frames.lock().push(msg);
        }
    }

    fn fan_out_fixture() -> (Arc<SubscriptionManager>, Vec<Arc<RecordingSink>>)
    {
        let manager = SubscriptionManager::new();
        let sinks: Vec<_> = (1..=5u64).map(RecordingSink::new).collect();
        for sink in &sinks {
            let dyn_sink: Arc<dyn FeedSink> = sink.clone();
            manager.subscribe_stream(StreamKind::Ledger, &dyn_sink);
        }
        (manager, sinks)
    }

    #[test]
    fn each_subscriber_sees_each_ledger_once() {
        let (manager, sinks) = fan_out_fixture();
        let range = LedgerRange {
            min_sequence: 1,
            max_sequence: 1,
        };

        for seq in 1..=20u32 {
            let header = faker::gen_dummy_header(seq);
            manager.publish_ledger(&header, &Fees::default(), &range, 0);
        }

        for sink in sinks {
            let got = sink.sequences();
            assert_eq!(got, (1..=20u64).collect::<Vec<_>>());
        }
    }

    #[test]
    fn unsubscribe_stops_future_events() {
        let (manager, sinks) = fan_out_fixture();
        let range = LedgerRange {
            min_sequence: 1,
            max_sequence: 1,
        };

        let header = faker::gen_dummy_header(1);
        manager.publish_ledger(&header, &Fees::default(), &range, 0);

        manager.unsubscribe_stream(StreamKind::Ledger, sinks[0].id);

        let header = faker::gen_dummy_header(2);
        manager.publish_ledger(&header, &Fees::default(), &range, 0);

        assert_eq!(sinks[0].sequences(), vec![1]);
        assert_eq!(sinks[1].sequences(), vec![1, 2]);
    }

    #[test]
    fn dropped_sessions_are_pruned_on_emit() {
        let manager = SubscriptionManager::new();
        let keep = RecordingSink::new(1);
        {
            let transient = RecordingSink::new(2);
            let dyn_keep: Arc<dyn FeedSink> = keep.clone();
            let dyn_transient: Arc<dyn FeedSink> = transient.clone();
            manager.subscribe_stream(StreamKind::Ledger, &dyn_keep);
            manager.subscribe_stream(StreamKind::Ledger, &dyn_transient);
            assert_eq!(manager.subscriber_count(StreamKind::Ledger), 2);
        }

        let range = LedgerRange {
            min_sequence: 1,
            max_sequence: 1,
        };
        let header = faker::gen_dummy_header(9);
        manager.publish_ledger(&header, &Fees::default(), &range, 0);

        assert_eq!(manager.subscriber_count(StreamKind::Ledger), 1);
        assert_eq!(keep.sequences(), vec![9]);
    }

    #[test]
    fn account_scoped_dispatch() {
        let manager = SubscriptionManager::new();
        let sink = RecordingSink::new(7);
        let dyn_sink: Arc<dyn FeedSink> = sink.clone();

        let watched = faker::gen_account(1);
        manager.subscribe_account(watched, &dyn_sink);

        let header = faker::gen_dummy_header(5);
        let mut hit = faker::gen_dummy_tx(5, 0);
        hit.accounts = vec![watched];
        let mut miss = faker::gen_dummy_tx(5, 1);
        miss.accounts = vec![faker::gen_account(2)];

        manager.publish_transaction(&hit, &header);
        manager.publish_transaction(&miss, &header);

        assert_eq!(sink.frames.lock().len(), 1);

        manager.clear_session(7);
        manager.publish_transaction(&hit, &header);
        assert_eq!(sink.frames.lock().len(), 1);
    }

    #[test]
    fn resubscribe_does_not_duplicate() {
        let manager = SubscriptionManager::new();
        let sink = RecordingSink::new(3);
        let dyn_sink: Arc<dyn FeedSink> = sink.clone();

        manager.subscribe_stream(StreamKind::Ledger, &dyn_sink);
        manager.subscribe_stream(StreamKind::Ledger, &dyn_sink);
        assert_eq!(manager.subscriber_count(StreamKind::Ledger), 1);

        let range = LedgerRange {
            min_sequence: 1,
            max_sequence: 1,
        };
        let header = faker::gen_dummy_header(4);
        manager.publish_ledger(&header, &Fees::default(), &range, 0);
        assert_eq!(sink.sequences(), vec![4]);
    }

    #[test]
    fn unsubscribe_during_dispatch_does_not_deadlock() {
        // A sink that unsubscribes itself from inside send(): the emit
        // snapshot must already have released the signal lock.
        struct SelfRemovingSink {
            id: u64,
            manager: Mutex<Option<Arc<SubscriptionManager>>>,
        }

        impl FeedSink for SelfRemovingSink {
            fn session_id(&self) -> u64 {
                self.id
            }

            fn send(&self, _msg: Arc<Value>) {
                if let Some(manager) = self.manager.lock().take() {
                    manager.unsubscribe_stream(StreamKind::Ledger, self.id);
                }
            }
        }

        let manager = SubscriptionManager::new();
        let sink = Arc::new(SelfRemovingSink {
            id: 11,
            manager: Mutex::new(Some(manager.clone())),
        });
        let dyn_sink: Arc<dyn FeedSink> = sink.clone();
        manager.subscribe_stream(StreamKind::Ledger, &dyn_sink);

        let range = LedgerRange {
            min_sequence: 1,
            max_sequence: 1,
        };
        let header = faker::gen_dummy_header(1);
        manager.publish_ledger(&header, &Fees::default(), &range, 0);
        assert_eq!(manager.subscriber_count(StreamKind::Ledger), 0);
    }
}
