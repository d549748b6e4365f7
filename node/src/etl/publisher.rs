// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use std::sync::Arc;

use node_data::events::Fees;
use node_data::ledger::{Book, LedgerHeader, Transaction};
use node_data::queue::AsyncQueue;
use tracing::info;

use crate::database::Backend;
use crate::exec::StopToken;
use crate::peer::pool::LoadBalancer;
use crate::storage::Store;
use crate::subscriptions::SubscriptionManager;

/// A committed ledger queued for publication.
#[derive(Clone)]
pub struct CommittedLedger {
    pub header: LedgerHeader,
    pub transactions: Vec<Transaction>,
    pub books: Vec<Book>,
}

/// Make one committed ledger visible: advance the published range, then
/// fan out to subscribers and drop ledger-sensitive forwards. Shared by
/// the writer pipeline and the reader-mode poller.
pub fn publish_one<B: Backend>(
    store: &Arc<Store<B>>,
    subscriptions: &Arc<SubscriptionManager>,
    balancer: &Arc<LoadBalancer>,
    committed: &CommittedLedger,
) {
    let sequence = committed.header.sequence;
    store.advance_published(sequence);
    let range = store
        .ledger_range()
        .expect("the range exists after an advance");

    subscriptions.publish_ledger(
        &committed.header,
        &Fees::default(),
        &range,
        committed.transactions.len(),
    );
    for tx in &committed.transactions {
        subscriptions.publish_transaction(tx, &committed.header);
    }
    subscriptions.publish_book_changes(&committed.header, &committed.books);

    balancer.on_ledger_published();

    info!(
        event = "ledger published",
        sequence,
        txs = committed.transactions.len(),
        range = %range,
    );
}

/// The writer-mode publisher stage: pops committed ledgers strictly in
/// order and publishes each exactly once.
pub async fn run<B: Backend>(
    queue: AsyncQueue<CommittedLedger>,
    store: Arc<Store<B>>,
    subscriptions: Arc<SubscriptionManager>,
    balancer: Arc<LoadBalancer>,
    token: StopToken,
) {
    loop {
        let committed = tokio::select! {
            _ = token.cancelled() => break,
            committed = queue.recv() => match committed {
                Ok(committed) => committed,
                Err(_) => break,
            },
        };
        publish_one(&store, &subscriptions, &balancer, &committed);
    }
    info!(event = "publisher stopped");
}
