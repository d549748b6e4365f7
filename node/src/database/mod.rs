// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

pub mod rocksdb;

use node_data::ledger::{
    AccountId, AccountTxCursor, Book, Hash, LedgerHeader, LedgerObject,
    LedgerRange, Transaction,
};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StorageError {
    /// A driver-level failure; the execution strategy retries these.
    #[error("storage driver: {0}")]
    Driver(String),

    /// Retries exhausted; surfaced to handlers as an internal error.
    #[error("storage unavailable")]
    Unavailable,

    /// A consistency check failed; the writer stops its pipeline.
    #[error("storage corruption: {0}")]
    Corruption(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Driver(_))
    }
}

/// The writer-lease row used for leader election among replicas sharing one
/// store. Mutated only through compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRow {
    pub owner_id: u64,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub create_if_missing: bool,
    pub blocks_cf_max_write_buffer_size: usize,
    pub enable_debug: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            blocks_cf_max_write_buffer_size: 1024 * 1024,
            enable_debug: false,
        }
    }
}

/// Typed contract over the wide-column store. Calls are synchronous; the
/// execution strategy owns threading, batching and retries.
pub trait Backend: Send + Sync + 'static {
    // Ledger headers

    fn ledger_header(&self, sequence: u32) -> Result<Option<LedgerHeader>>;
    fn ledger_header_by_hash(&self, hash: &Hash)
        -> Result<Option<LedgerHeader>>;
    fn ledger_range(&self) -> Result<Option<LedgerRange>>;

    // Objects, diffs and successor pointers

    /// The object blob as of `sequence`. `Ok(None)` means the key has no
    /// row at or before `sequence`, or its newest such row is a deletion.
    fn ledger_object(
        &self,
        key: &Hash,
        sequence: u32,
    ) -> Result<Option<Vec<u8>>>;

    fn ledger_objects(
        &self,
        keys: &[Hash],
        sequence: u32,
    ) -> Result<Vec<Option<Vec<u8>>>>;

    /// The raw successor pointer recorded for `key` as of `sequence`.
    fn successor_key(&self, key: &Hash, sequence: u32)
        -> Result<Option<Hash>>;

    /// The complete diff written at `sequence`, deletions included.
    fn diff_objects(&self, sequence: u32) -> Result<Vec<LedgerObject>>;

    /// Keys recorded in the flag row `flag_sequence`, ascending, starting
    /// strictly after `from` when given.
    fn keys_at(
        &self,
        flag_sequence: u32,
        from: Option<Hash>,
        limit: usize,
    ) -> Result<Vec<Hash>>;

    /// Same as [`Backend::keys_at`] restricted to one book prefix.
    fn book_keys_at(
        &self,
        flag_sequence: u32,
        book: &Book,
        from: Option<Hash>,
        limit: usize,
    ) -> Result<Vec<Hash>>;

    // Transactions

    fn transaction(&self, hash: &Hash) -> Result<Option<Transaction>>;
    fn transactions(&self, hashes: &[Hash])
        -> Result<Vec<Option<Transaction>>>;
    fn ledger_transaction_hashes(&self, sequence: u32) -> Result<Vec<Hash>>;

    /// One page of an account's history, newest first unless `forward`.
    fn account_transactions(
        &self,
        account: &AccountId,
        limit: usize,
        cursor: Option<AccountTxCursor>,
        forward: bool,
    ) -> Result<(Vec<Hash>, Option<AccountTxCursor>)>;

    // Writes. Batching and durability fencing happen a layer above.

    fn write_ledger(&self, header: &LedgerHeader) -> Result<()>;
    fn write_objects(
        &self,
        sequence: u32,
        diffs: &[LedgerObject],
    ) -> Result<()>;
    fn write_successors(
        &self,
        sequence: u32,
        rows: &[(Hash, Hash)],
    ) -> Result<()>;
    fn write_transactions(&self, txs: &[Transaction]) -> Result<()>;
    fn write_account_transactions(&self, txs: &[Transaction]) -> Result<()>;
    fn write_keys(&self, flag_sequence: u32, keys: &[Hash]) -> Result<()>;

    fn write_ledger_range(&self, range: LedgerRange) -> Result<()>;
    fn write_max_sequence(&self, sequence: u32) -> Result<()>;
    fn write_min_sequence(&self, sequence: u32) -> Result<()>;

    // Writer lease

    /// Claim or renew the lease. Succeeds iff the row is absent, expired,
    /// or already owned by `owner_id`. Linearizable within the store.
    fn try_acquire_lease(
        &self,
        owner_id: u64,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<bool>;

    /// Drop the lease iff still owned by `owner_id`.
    fn release_lease(&self, owner_id: u64) -> Result<bool>;

    fn lease_owner(&self) -> Result<Option<LeaseRow>>;

    // Online delete

    /// Remove every ledger-scoped row with sequence strictly below
    /// `sequence`. Returns the number of deleted rows.
    fn delete_ledgers_before(&self, sequence: u32) -> Result<u64>;
}
