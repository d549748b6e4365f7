// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ledger::{LedgerHeader, LedgerRange, Transaction};

/// The live streams a session can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Ledger,
    Transactions,
    TransactionsProposed,
    Manifests,
    Validations,
    BookChanges,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Ledger => "ledger",
            StreamKind::Transactions => "transactions",
            StreamKind::TransactionsProposed => "transactions_proposed",
            StreamKind::Manifests => "manifests",
            StreamKind::Validations => "validations",
            StreamKind::BookChanges => "book_changes",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ledger" => Some(StreamKind::Ledger),
            "transactions" => Some(StreamKind::Transactions),
            "transactions_proposed" => Some(StreamKind::TransactionsProposed),
            "manifests" => Some(StreamKind::Manifests),
            "validations" => Some(StreamKind::Validations),
            "book_changes" => Some(StreamKind::BookChanges),
            _ => None,
        }
    }

    pub fn all() -> &'static [StreamKind] {
        &[
            StreamKind::Ledger,
            StreamKind::Transactions,
            StreamKind::TransactionsProposed,
            StreamKind::Manifests,
            StreamKind::Validations,
            StreamKind::BookChanges,
        ]
    }
}

/// Fee settings published alongside each closed ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fees {
    pub base: u64,
    pub reserve_base: u64,
    pub reserve_inc: u64,
}

impl Default for Fees {
    fn default() -> Self {
        Self {
            base: 10,
            reserve_base: 10_000_000,
            reserve_inc: 2_000_000,
        }
    }
}

/// The `ledgerClosed` notification frame.
pub fn ledger_closed(
    header: &LedgerHeader,
    fees: &Fees,
    range: &LedgerRange,
    txn_count: usize,
) -> Value {
    json!({
        "type": "ledgerClosed",
        "ledger_index": header.sequence,
        "ledger_hash": hex::encode(header.hash).to_uppercase(),
        "ledger_time": header.close_time,
        "fee_base": fees.base,
        "reserve_base": fees.reserve_base,
        "reserve_inc": fees.reserve_inc,
        "validated_ledgers": range.to_string(),
        "txn_count": txn_count,
    })
}

/// A validated-transaction notification frame.
pub fn transaction(tx: &Transaction, header: &LedgerHeader) -> Value {
    json!({
        "type": "transaction",
        "validated": true,
        "ledger_index": header.sequence,
        "ledger_hash": hex::encode(header.hash).to_uppercase(),
        "transaction": {
            "hash": hex::encode(tx.hash).to_uppercase(),
            "tx_blob": hex::encode(&tx.transaction_blob).to_uppercase(),
            "date": tx.date,
        },
        "meta_blob": hex::encode(&tx.metadata_blob).to_uppercase(),
    })
}

/// A `bookChanges` notification frame.
pub fn book_changes(header: &LedgerHeader, changed_books: usize) -> Value {
    json!({
        "type": "bookChanges",
        "ledger_index": header.sequence,
        "ledger_hash": hex::encode(header.hash).to_uppercase(),
        "ledger_time": header.close_time,
        "changes": changed_books,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faker;

    #[test]
    fn ledger_closed_frame() {
        let header = faker::gen_dummy_header(77);
        let range = LedgerRange {
            min_sequence: 1,
            max_sequence: 77,
        };
        let msg = ledger_closed(&header, &Fees::default(), &range, 3);

        assert_eq!(msg["type"], "ledgerClosed");
        assert_eq!(msg["ledger_index"], 77);
        assert_eq!(msg["validated_ledgers"], "1-77");
        assert_eq!(msg["txn_count"], 3);
    }

    #[test]
    fn stream_kind_round_trip() {
        for kind in StreamKind::all() {
            assert_eq!(StreamKind::from_str(kind.as_str()), Some(*kind));
        }
        assert_eq!(StreamKind::from_str("nope"), None);
    }
}
