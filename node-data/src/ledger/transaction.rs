// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use std::io::{self, Read, Write};

use super::{to_str, AccountId, Hash};
use crate::Serializable;

/// Width of the transaction-index field inside the composite account-tx
/// ordinal. Bounds a ledger to `2^20` transactions.
const TX_INDEX_BITS: u32 = 20;

/// A validated transaction with its metadata, keyed by hash and secondary
/// indexed by every account it affects.
#[derive(Default, Eq, PartialEq, Clone)]
pub struct Transaction {
    pub hash: Hash,
    pub ledger_sequence: u32,
    pub transaction_index: u32,
    pub date: i64,
    pub transaction_blob: Vec<u8>,
    pub metadata_blob: Vec<u8>,
    pub accounts: Vec<AccountId>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("hash", &to_str(&self.hash))
            .field("ledger_sequence", &self.ledger_sequence)
            .field("transaction_index", &self.transaction_index)
            .field("accounts", &self.accounts.len())
            .finish()
    }
}

impl Transaction {
    pub fn cursor(&self) -> AccountTxCursor {
        AccountTxCursor {
            ledger_sequence: self.ledger_sequence,
            transaction_index: self.transaction_index,
        }
    }
}

impl Serializable for Transaction {
    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.hash)?;
        w.write_all(&self.ledger_sequence.to_le_bytes())?;
        w.write_all(&self.transaction_index.to_le_bytes())?;
        w.write_all(&self.date.to_le_bytes())?;
        Self::write_var_le_bytes32(w, &self.transaction_blob)?;
        Self::write_var_le_bytes32(w, &self.metadata_blob)?;

        let len = self.accounts.len() as u32;
        w.write_all(&len.to_le_bytes())?;
        for account in &self.accounts {
            w.write_all(account)?;
        }

        Ok(())
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self>
    where
        Self: Sized,
    {
        let hash = Self::read_bytes(r)?;
        let ledger_sequence = Self::read_u32_le(r)?;
        let transaction_index = Self::read_u32_le(r)?;
        let date = Self::read_i64_le(r)?;
        let transaction_blob = Self::read_var_le_bytes32(r)?;
        let metadata_blob = Self::read_var_le_bytes32(r)?;

        let len = Self::read_u32_le(r)?;
        let mut accounts = Vec::with_capacity(len as usize);
        for _ in 0..len {
            accounts.push(Self::read_bytes(r)?);
        }

        Ok(Self {
            hash,
            ledger_sequence,
            transaction_index,
            date,
            transaction_blob,
            metadata_blob,
            accounts,
        })
    }
}

/// Position of a transaction inside an account's history. Iteration order is
/// lexicographically descending on `(ledger_sequence, transaction_index)`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AccountTxCursor {
    pub ledger_sequence: u32,
    pub transaction_index: u32,
}

impl AccountTxCursor {
    /// Pack into the 64-bit composite ordinal used as the storage key.
    pub fn seq_idx(&self) -> u64 {
        ((self.ledger_sequence as u64) << TX_INDEX_BITS)
            | (self.transaction_index as u64 & ((1 << TX_INDEX_BITS) - 1))
    }

    pub fn from_seq_idx(seq_idx: u64) -> Self {
        Self {
            ledger_sequence: (seq_idx >> TX_INDEX_BITS) as u32,
            transaction_index: (seq_idx & ((1 << TX_INDEX_BITS) - 1)) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faker;

    #[test]
    fn tx_round_trip() {
        let tx = faker::gen_dummy_tx(4242, 7);
        let decoded = Transaction::from_bytes(&tx.to_bytes()).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn seq_idx_composite() {
        let cursor = AccountTxCursor {
            ledger_sequence: 10_000_000,
            transaction_index: 37,
        };
        let packed = cursor.seq_idx();
        assert_eq!(AccountTxCursor::from_seq_idx(packed), cursor);
    }

    #[test]
    fn seq_idx_orders_by_ledger_first() {
        let early = AccountTxCursor {
            ledger_sequence: 5,
            transaction_index: 1 << 19,
        };
        let late = AccountTxCursor {
            ledger_sequence: 6,
            transaction_index: 0,
        };
        assert!(early.seq_idx() < late.seq_idx());
        assert!(early < late);
    }
}
