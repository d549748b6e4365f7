// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use std::path::Path;
use std::sync::Arc;

use node_data::ledger::{
    AccountId, AccountTxCursor, Book, Hash, LedgerHeader, LedgerObject,
    LedgerRange, Transaction, BOOK_LEN,
};
use node_data::Serializable;
use rocksdb::{
    BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, Direction,
    IteratorMode, LogLevel, OptimisticTransactionDB, Options,
};
use tracing::info;

use super::{
    Backend, DatabaseOptions, LeaseRow, Result, StorageError,
};

const CF_LEDGERS: &str = "cf_ledgers";
const CF_LEDGER_HASHES: &str = "cf_ledger_hashes";
const CF_LEDGER_RANGE: &str = "cf_ledger_range";
const CF_OBJECTS: &str = "cf_objects";
const CF_SUCCESSOR: &str = "cf_successor";
const CF_DIFF: &str = "cf_diff";
const CF_TRANSACTIONS: &str = "cf_transactions";
const CF_LEDGER_TRANSACTIONS: &str = "cf_ledger_transactions";
const CF_ACCOUNT_TX: &str = "cf_account_tx";
const CF_KEYS: &str = "cf_keys";
const CF_WRITER: &str = "cf_writer";

const DB_FOLDER_NAME: &str = "quill.db";

/// Key of the range row holding the lowest fully persisted sequence.
const RANGE_MIN_KEY: &[u8] = &[0u8];
/// Key of the range row holding the highest fully persisted sequence.
const RANGE_MAX_KEY: &[u8] = &[1u8];

/// Key of the singleton writer-lease row.
const WRITER_LOCK_KEY: &[u8] = b"master";

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Driver(e.to_string())
    }
}

fn corrupt(what: &str) -> StorageError {
    StorageError::Corruption(what.into())
}

#[derive(Clone)]
pub struct RocksBackend {
    rocksdb: Arc<OptimisticTransactionDB>,
}

impl RocksBackend {
    /// Creates or opens a database located under `path`.
    ///
    /// Panics if opening the db or creating one fails.
    pub fn create_or_open<T>(path: T, db_opts: DatabaseOptions) -> Self
    where
        T: AsRef<Path>,
    {
        let path = path.as_ref().join(DB_FOLDER_NAME);
        info!("Opening database in {path:?}, {db_opts:?}");

        let mut cf_opts = Options::default();
        cf_opts.create_if_missing(db_opts.create_if_missing);
        cf_opts.create_missing_column_families(true);
        cf_opts.set_level_compaction_dynamic_level_bytes(true);
        cf_opts
            .set_write_buffer_size(db_opts.blocks_cf_max_write_buffer_size);

        if db_opts.enable_debug {
            cf_opts.set_log_level(LogLevel::Info);
            cf_opts.set_dump_malloc_stats(true);
            cf_opts.enable_statistics();
        }

        // Point lookups dominate the objects CF; favor bloom filters.
        let mut objects_opts = cf_opts.clone();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        objects_opts.set_block_based_table_factory(&block_opts);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_LEDGERS, cf_opts.clone()),
            ColumnFamilyDescriptor::new(CF_LEDGER_HASHES, cf_opts.clone()),
            ColumnFamilyDescriptor::new(CF_LEDGER_RANGE, cf_opts.clone()),
            ColumnFamilyDescriptor::new(CF_OBJECTS, objects_opts.clone()),
            ColumnFamilyDescriptor::new(CF_SUCCESSOR, objects_opts.clone()),
            ColumnFamilyDescriptor::new(CF_DIFF, cf_opts.clone()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, cf_opts.clone()),
            ColumnFamilyDescriptor::new(
                CF_LEDGER_TRANSACTIONS,
                cf_opts.clone(),
            ),
            ColumnFamilyDescriptor::new(CF_ACCOUNT_TX, objects_opts),
            ColumnFamilyDescriptor::new(CF_KEYS, cf_opts.clone()),
            ColumnFamilyDescriptor::new(CF_WRITER, cf_opts.clone()),
        ];

        Self {
            rocksdb: Arc::new(
                OptimisticTransactionDB::open_cf_descriptors(
                    &cf_opts, path, cfs,
                )
                .expect("should be a valid database in {path}"),
            ),
        }
    }

    fn cf(&self, name: &str) -> &ColumnFamily {
        self.rocksdb
            .cf_handle(name)
            .expect("column family must exist")
    }
}

/// `(key, sequence)` rows are stored as `key || !sequence` so a forward
/// seek lands on the newest row at or before the wanted sequence.
fn object_key(key: &Hash, sequence: u32) -> [u8; 36] {
    let mut buf = [0u8; 36];
    buf[..32].copy_from_slice(key);
    buf[32..].copy_from_slice(&(!sequence).to_be_bytes());
    buf
}

fn split_object_key(raw: &[u8]) -> Option<(Hash, u32)> {
    if raw.len() != 36 {
        return None;
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&raw[..32]);
    let mut seq = [0u8; 4];
    seq.copy_from_slice(&raw[32..]);
    Some((key, !u32::from_be_bytes(seq)))
}

/// `(sequence, key)` rows, sequence big-endian for ordered range scans.
fn seq_key(sequence: u32, key: &Hash) -> [u8; 36] {
    let mut buf = [0u8; 36];
    buf[..4].copy_from_slice(&sequence.to_be_bytes());
    buf[4..].copy_from_slice(key);
    buf
}

/// `(account, !seq_idx)` rows; forward iteration yields newest first.
fn account_tx_key(account: &AccountId, seq_idx: u64) -> [u8; 28] {
    let mut buf = [0u8; 28];
    buf[..20].copy_from_slice(account);
    buf[20..].copy_from_slice(&(!seq_idx).to_be_bytes());
    buf
}

fn split_account_tx_key(raw: &[u8]) -> Option<(AccountId, u64)> {
    if raw.len() != 28 {
        return None;
    }
    let mut account = [0u8; 20];
    account.copy_from_slice(&raw[..20]);
    let mut idx = [0u8; 8];
    idx.copy_from_slice(&raw[20..]);
    Some((account, !u64::from_be_bytes(idx)))
}

fn decode_seq_be(raw: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| corrupt("malformed sequence row"))?;
    Ok(u32::from_be_bytes(bytes))
}

impl RocksBackend {
    /// Newest `(key, seq')` row with `seq' <= sequence`, if any.
    fn newest_row_at(
        &self,
        cf: &ColumnFamily,
        key: &Hash,
        sequence: u32,
    ) -> Result<Option<(u32, Vec<u8>)>> {
        let start = object_key(key, sequence);
        let mut iter = self.rocksdb.raw_iterator_cf(cf);
        iter.seek(start);
        if !iter.valid() {
            iter.status()?;
            return Ok(None);
        }
        match (iter.key(), iter.value()) {
            (Some(raw), Some(value)) => match split_object_key(raw) {
                Some((row_key, seq)) if row_key == *key => {
                    Ok(Some((seq, value.to_vec())))
                }
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Maintenance: recompute the range row from the headers actually
    /// present. Used by the `rebuild_ledger_range` migration after a
    /// partial restore.
    pub fn rebuild_ledger_range(&self) -> Result<Option<LedgerRange>> {
        let cf = self.cf(CF_LEDGERS);

        let mut iter = self.rocksdb.raw_iterator_cf(cf);
        iter.seek_to_first();
        let min = match iter.key() {
            Some(raw) => decode_seq_be(raw)?,
            None => return Ok(None),
        };
        iter.seek_to_last();
        let max = match iter.key() {
            Some(raw) => decode_seq_be(raw)?,
            None => return Ok(None),
        };
        iter.status()?;

        let range = LedgerRange {
            min_sequence: min,
            max_sequence: max,
        };
        self.write_ledger_range(range)?;
        Ok(Some(range))
    }

    fn keys_in_flag_row(
        &self,
        flag_sequence: u32,
        prefix: &[u8],
        from: Option<Hash>,
        limit: usize,
    ) -> Result<Vec<Hash>> {
        let mut start = flag_sequence.to_be_bytes().to_vec();
        start.extend_from_slice(prefix);
        let exclusive = from.is_some();
        if let Some(from) = from {
            start.truncate(4);
            start.extend_from_slice(&from);
        }

        let mut keys = Vec::with_capacity(limit.min(1024));
        let iter = self.rocksdb.iterator_cf(
            self.cf(CF_KEYS),
            IteratorMode::From(&start, Direction::Forward),
        );
        for row in iter {
            let (raw, _) = row?;
            if raw.len() != 36 {
                return Err(corrupt("malformed keys row"));
            }
            if decode_seq_be(&raw[..4])? != flag_sequence
                || !raw[4..].starts_with(prefix)
            {
                break;
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&raw[4..]);
            if exclusive && keys.is_empty() && raw[4..] == start[4..] {
                continue;
            }
            keys.push(key);
            if keys.len() >= limit {
                break;
            }
        }
        Ok(keys)
    }
}

impl Backend for RocksBackend {
    fn ledger_header(&self, sequence: u32) -> Result<Option<LedgerHeader>> {
        self.rocksdb
            .get_cf(self.cf(CF_LEDGERS), sequence.to_be_bytes())?
            .map(|blob| {
                LedgerHeader::from_bytes(&blob)
                    .map_err(|_| corrupt("undecodable ledger header"))
            })
            .transpose()
    }

    fn ledger_header_by_hash(
        &self,
        hash: &Hash,
    ) -> Result<Option<LedgerHeader>> {
        match self.rocksdb.get_cf(self.cf(CF_LEDGER_HASHES), hash)? {
            Some(raw) => self.ledger_header(decode_seq_be(&raw)?),
            None => Ok(None),
        }
    }

    fn ledger_range(&self) -> Result<Option<LedgerRange>> {
        let cf = self.cf(CF_LEDGER_RANGE);
        let min = self.rocksdb.get_cf(cf, RANGE_MIN_KEY)?;
        let max = self.rocksdb.get_cf(cf, RANGE_MAX_KEY)?;
        match (min, max) {
            (Some(min), Some(max)) => Ok(Some(LedgerRange {
                min_sequence: decode_seq_be(&min)?,
                max_sequence: decode_seq_be(&max)?,
            })),
            (None, None) => Ok(None),
            _ => Err(corrupt("half-written ledger range")),
        }
    }

    fn ledger_object(
        &self,
        key: &Hash,
        sequence: u32,
    ) -> Result<Option<Vec<u8>>> {
        let row = self.newest_row_at(self.cf(CF_OBJECTS), key, sequence)?;
        Ok(row.and_then(|(_, blob)| (!blob.is_empty()).then_some(blob)))
    }

    fn ledger_objects(
        &self,
        keys: &[Hash],
        sequence: u32,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        // No native multi-seek; point seeks over the bloom-filtered CF.
        keys.iter()
            .map(|key| self.ledger_object(key, sequence))
            .collect()
    }

    fn successor_key(
        &self,
        key: &Hash,
        sequence: u32,
    ) -> Result<Option<Hash>> {
        let row = self.newest_row_at(self.cf(CF_SUCCESSOR), key, sequence)?;
        match row {
            Some((_, raw)) => {
                let next: Hash = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| corrupt("malformed successor row"))?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }

    fn diff_objects(&self, sequence: u32) -> Result<Vec<LedgerObject>> {
        let prefix = sequence.to_be_bytes();
        let mut objects = vec![];
        let iter = self.rocksdb.iterator_cf(
            self.cf(CF_DIFF),
            IteratorMode::From(&prefix, Direction::Forward),
        );
        for row in iter {
            let (raw, blob) = row?;
            if raw.len() != 36 || raw[..4] != prefix {
                break;
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&raw[4..]);
            objects.push(LedgerObject::new(key, blob.to_vec()));
        }
        Ok(objects)
    }

    fn keys_at(
        &self,
        flag_sequence: u32,
        from: Option<Hash>,
        limit: usize,
    ) -> Result<Vec<Hash>> {
        self.keys_in_flag_row(flag_sequence, &[], from, limit)
    }

    fn book_keys_at(
        &self,
        flag_sequence: u32,
        book: &Book,
        from: Option<Hash>,
        limit: usize,
    ) -> Result<Vec<Hash>> {
        let from = match from {
            Some(from) if from[..BOOK_LEN] == book[..] => Some(from),
            Some(_) => return Ok(vec![]),
            None => None,
        };
        self.keys_in_flag_row(flag_sequence, &book[..], from, limit)
    }

    fn transaction(&self, hash: &Hash) -> Result<Option<Transaction>> {
        self.rocksdb
            .get_cf(self.cf(CF_TRANSACTIONS), hash)?
            .map(|blob| {
                Transaction::from_bytes(&blob)
                    .map_err(|_| corrupt("undecodable transaction"))
            })
            .transpose()
    }

    fn transactions(
        &self,
        hashes: &[Hash],
    ) -> Result<Vec<Option<Transaction>>> {
        let cf = self.cf(CF_TRANSACTIONS);
        let queries: Vec<_> = hashes.iter().map(|h| (cf, h)).collect();

        let mut txs = Vec::with_capacity(hashes.len());
        for blob in self.rocksdb.multi_get_cf(queries) {
            let tx = blob?
                .map(|blob| {
                    Transaction::from_bytes(&blob)
                        .map_err(|_| corrupt("undecodable transaction"))
                })
                .transpose()?;
            txs.push(tx);
        }
        Ok(txs)
    }

    fn ledger_transaction_hashes(&self, sequence: u32) -> Result<Vec<Hash>> {
        let prefix = sequence.to_be_bytes();
        let mut entries = vec![];
        let iter = self.rocksdb.iterator_cf(
            self.cf(CF_LEDGER_TRANSACTIONS),
            IteratorMode::From(&prefix, Direction::Forward),
        );
        for row in iter {
            let (raw, value) = row?;
            if raw.len() != 36 || raw[..4] != prefix {
                break;
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&raw[4..]);
            entries.push((decode_seq_be(&value)?, hash));
        }
        entries.sort_by_key(|(index, _)| *index);
        Ok(entries.into_iter().map(|(_, hash)| hash).collect())
    }

    fn account_transactions(
        &self,
        account: &AccountId,
        limit: usize,
        cursor: Option<AccountTxCursor>,
        forward: bool,
    ) -> Result<(Vec<Hash>, Option<AccountTxCursor>)> {
        let mut iter =
            self.rocksdb.raw_iterator_cf(self.cf(CF_ACCOUNT_TX));

        match (cursor, forward) {
            (Some(cursor), false) => {
                iter.seek(account_tx_key(account, cursor.seq_idx()))
            }
            (Some(cursor), true) => iter
                .seek_for_prev(account_tx_key(account, cursor.seq_idx())),
            (None, false) => iter.seek(&account[..]),
            (None, true) => {
                // Jump past the account's slice, then step back onto its
                // oldest row.
                iter.seek_for_prev(account_tx_key(account, 0));
            }
        }

        let mut hashes = Vec::with_capacity(limit);
        let mut last = None;
        while iter.valid() && hashes.len() < limit {
            let Some(raw) = iter.key() else { break };
            let Some((row_account, seq_idx)) = split_account_tx_key(raw)
            else {
                return Err(corrupt("malformed account_tx row"));
            };
            if row_account != *account {
                break;
            }
            let hash: Hash = iter
                .value()
                .and_then(|v| v.try_into().ok())
                .ok_or_else(|| corrupt("malformed account_tx value"))?;
            hashes.push(hash);
            last = Some(AccountTxCursor::from_seq_idx(seq_idx));
            if forward {
                iter.prev();
            } else {
                iter.next();
            }
        }
        iter.status()?;

        // Only report a resume cursor if the slice continues.
        let next_cursor = match last {
            Some(last) if hashes.len() >= limit => {
                let probe = last.seq_idx();
                let next = if forward {
                    probe.checked_add(1)
                } else {
                    probe.checked_sub(1)
                };
                next.map(AccountTxCursor::from_seq_idx)
            }
            _ => None,
        };

        Ok((hashes, next_cursor))
    }

    fn write_ledger(&self, header: &LedgerHeader) -> Result<()> {
        let txn = self.rocksdb.transaction();
        txn.put_cf(
            self.cf(CF_LEDGERS),
            header.sequence.to_be_bytes(),
            header.to_bytes(),
        )?;
        txn.put_cf(
            self.cf(CF_LEDGER_HASHES),
            header.hash,
            header.sequence.to_be_bytes(),
        )?;
        txn.commit()?;
        Ok(())
    }

    fn write_objects(
        &self,
        sequence: u32,
        diffs: &[LedgerObject],
    ) -> Result<()> {
        let objects_cf = self.cf(CF_OBJECTS);
        let diff_cf = self.cf(CF_DIFF);

        let txn = self.rocksdb.transaction();
        for diff in diffs {
            txn.put_cf(
                objects_cf,
                object_key(&diff.key, sequence),
                &diff.blob,
            )?;
            txn.put_cf(diff_cf, seq_key(sequence, &diff.key), &diff.blob)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn write_successors(
        &self,
        sequence: u32,
        rows: &[(Hash, Hash)],
    ) -> Result<()> {
        let cf = self.cf(CF_SUCCESSOR);
        let txn = self.rocksdb.transaction();
        for (key, next) in rows {
            txn.put_cf(cf, object_key(key, sequence), next)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn write_transactions(&self, txs: &[Transaction]) -> Result<()> {
        let tx_cf = self.cf(CF_TRANSACTIONS);
        let lt_cf = self.cf(CF_LEDGER_TRANSACTIONS);

        let txn = self.rocksdb.transaction();
        for tx in txs {
            txn.put_cf(tx_cf, tx.hash, tx.to_bytes())?;
            txn.put_cf(
                lt_cf,
                seq_key(tx.ledger_sequence, &tx.hash),
                tx.transaction_index.to_be_bytes(),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    fn write_account_transactions(&self, txs: &[Transaction]) -> Result<()> {
        let cf = self.cf(CF_ACCOUNT_TX);
        let txn = self.rocksdb.transaction();
        for tx in txs {
            let seq_idx = tx.cursor().seq_idx();
            for account in &tx.accounts {
                txn.put_cf(cf, account_tx_key(account, seq_idx), tx.hash)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn write_keys(&self, flag_sequence: u32, keys: &[Hash]) -> Result<()> {
        let cf = self.cf(CF_KEYS);
        let txn = self.rocksdb.transaction();
        for key in keys {
            txn.put_cf(cf, seq_key(flag_sequence, key), b"")?;
        }
        txn.commit()?;
        Ok(())
    }

    fn write_ledger_range(&self, range: LedgerRange) -> Result<()> {
        let cf = self.cf(CF_LEDGER_RANGE);
        let txn = self.rocksdb.transaction();
        txn.put_cf(cf, RANGE_MIN_KEY, range.min_sequence.to_be_bytes())?;
        txn.put_cf(cf, RANGE_MAX_KEY, range.max_sequence.to_be_bytes())?;
        txn.commit()?;
        Ok(())
    }

    fn write_max_sequence(&self, sequence: u32) -> Result<()> {
        let cf = self.cf(CF_LEDGER_RANGE);
        let txn = self.rocksdb.transaction();
        if txn.get_cf(cf, RANGE_MIN_KEY)?.is_none() {
            txn.put_cf(cf, RANGE_MIN_KEY, sequence.to_be_bytes())?;
        }
        txn.put_cf(cf, RANGE_MAX_KEY, sequence.to_be_bytes())?;
        txn.commit()?;
        Ok(())
    }

    fn write_min_sequence(&self, sequence: u32) -> Result<()> {
        self.rocksdb.put_cf(
            self.cf(CF_LEDGER_RANGE),
            RANGE_MIN_KEY,
            sequence.to_be_bytes(),
        )?;
        Ok(())
    }

    fn try_acquire_lease(
        &self,
        owner_id: u64,
        now_ms: u64,
        lease_ms: u64,
    ) -> Result<bool> {
        let cf = self.cf(CF_WRITER);
        let txn = self.rocksdb.transaction();

        let current = txn.get_for_update_cf(cf, WRITER_LOCK_KEY, true)?;
        if let Some(raw) = current {
            let row = decode_lease(&raw)?;
            if row.owner_id != owner_id && row.expires_at_ms > now_ms {
                return Ok(false);
            }
        }

        txn.put_cf(
            cf,
            WRITER_LOCK_KEY,
            encode_lease(&LeaseRow {
                owner_id,
                expires_at_ms: now_ms + lease_ms,
            }),
        )?;

        // A lost optimistic commit means another replica raced us.
        Ok(txn.commit().is_ok())
    }

    fn release_lease(&self, owner_id: u64) -> Result<bool> {
        let cf = self.cf(CF_WRITER);
        let txn = self.rocksdb.transaction();

        match txn.get_for_update_cf(cf, WRITER_LOCK_KEY, true)? {
            Some(raw) if decode_lease(&raw)?.owner_id == owner_id => {
                txn.delete_cf(cf, WRITER_LOCK_KEY)?;
                Ok(txn.commit().is_ok())
            }
            _ => Ok(false),
        }
    }

    fn lease_owner(&self) -> Result<Option<LeaseRow>> {
        self.rocksdb
            .get_cf(self.cf(CF_WRITER), WRITER_LOCK_KEY)?
            .map(|raw| decode_lease(&raw))
            .transpose()
    }

    fn delete_ledgers_before(&self, sequence: u32) -> Result<u64> {
        let mut deleted = 0u64;

        // Ledger-scoped rows are strictly before the floor.
        let floor = sequence.to_be_bytes();
        for (cf_name, key_len) in [
            (CF_LEDGERS, 4usize),
            (CF_DIFF, 36),
            (CF_LEDGER_TRANSACTIONS, 36),
        ] {
            let cf = self.cf(cf_name);
            let iter = self.rocksdb.iterator_cf(cf, IteratorMode::Start);
            for row in iter {
                let (raw, value) = row?;
                if raw.len() != key_len || raw[..4] >= floor[..] {
                    break;
                }
                if cf_name == CF_LEDGERS {
                    // Drop the hash index alongside the header.
                    let header = LedgerHeader::from_bytes(&value)
                        .map_err(|_| corrupt("undecodable ledger header"))?;
                    self.rocksdb
                        .delete_cf(self.cf(CF_LEDGER_HASHES), header.hash)?;
                }
                self.rocksdb.delete_cf(cf, &raw)?;
                deleted += 1;
            }
        }

        // Flag rows whose window lies entirely below the floor.
        let keys_cf = self.cf(CF_KEYS);
        let iter = self.rocksdb.iterator_cf(keys_cf, IteratorMode::Start);
        for row in iter {
            let (raw, _) = row?;
            if raw.len() != 36 || raw[..4] >= floor[..] {
                break;
            }
            self.rocksdb.delete_cf(keys_cf, &raw)?;
            deleted += 1;
        }

        // Per-key versioned rows: drop everything below the floor except
        // the newest row per key, which seeds reads at the floor itself.
        for cf_name in [CF_OBJECTS, CF_SUCCESSOR] {
            let cf = self.cf(cf_name);
            let iter = self.rocksdb.iterator_cf(cf, IteratorMode::Start);
            let mut newest_kept: Option<Hash> = None;
            for row in iter {
                let (raw, _) = row?;
                let Some((key, seq)) = split_object_key(&raw) else {
                    return Err(corrupt("malformed versioned row"));
                };
                if seq >= sequence {
                    // Row still inside the kept window; the newest older
                    // row (the next one we meet for this key) survives.
                    newest_kept = None;
                    continue;
                }
                if newest_kept == Some(key) {
                    self.rocksdb.delete_cf(cf, &raw)?;
                    deleted += 1;
                } else {
                    newest_kept = Some(key);
                }
            }
        }

        // Transactions and their account index.
        let tx_cf = self.cf(CF_TRANSACTIONS);
        let iter = self.rocksdb.iterator_cf(tx_cf, IteratorMode::Start);
        for row in iter {
            let (raw, blob) = row?;
            let tx = Transaction::from_bytes(&blob)
                .map_err(|_| corrupt("undecodable transaction"))?;
            if tx.ledger_sequence >= sequence {
                continue;
            }
            let seq_idx = tx.cursor().seq_idx();
            for account in &tx.accounts {
                self.rocksdb.delete_cf(
                    self.cf(CF_ACCOUNT_TX),
                    account_tx_key(account, seq_idx),
                )?;
            }
            self.rocksdb.delete_cf(tx_cf, &raw)?;
            deleted += 1;
        }

        Ok(deleted)
    }
}

fn encode_lease(row: &LeaseRow) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&row.owner_id.to_le_bytes());
    buf[8..].copy_from_slice(&row.expires_at_ms.to_le_bytes());
    buf
}

fn decode_lease(raw: &[u8]) -> Result<LeaseRow> {
    if raw.len() != 16 {
        return Err(corrupt("malformed writer lease row"));
    }
    let mut owner = [0u8; 8];
    owner.copy_from_slice(&raw[..8]);
    let mut expires = [0u8; 8];
    expires.copy_from_slice(&raw[8..]);
    Ok(LeaseRow {
        owner_id: u64::from_le_bytes(owner),
        expires_at_ms: u64::from_le_bytes(expires),
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use node_data::faker;
    use node_data::ledger::{is_flag_ledger, key_index_of};

    use super::*;

    #[test]
    fn test_store_and_fetch_header() {
        TestWrapper::new("store_header").run(|path| {
            let db =
                RocksBackend::create_or_open(path, DatabaseOptions::default());

            let header = faker::gen_dummy_header(32570);
            db.write_ledger(&header).unwrap();

            let by_seq = db.ledger_header(32570).unwrap().unwrap();
            assert_eq!(by_seq, header);

            let by_hash =
                db.ledger_header_by_hash(&header.hash).unwrap().unwrap();
            assert_eq!(by_hash, header);

            assert!(db.ledger_header(32571).unwrap().is_none());
        });
    }

    #[test]
    fn test_object_versions() {
        TestWrapper::new("object_versions").run(|path| {
            let db =
                RocksBackend::create_or_open(path, DatabaseOptions::default());

            let key = faker::gen_key(1);
            let v1 = LedgerObject::new(key, vec![1, 1, 1]);
            let v2 = LedgerObject::new(key, vec![2, 2]);
            let gone = LedgerObject::new(key, vec![]);

            db.write_objects(10, std::slice::from_ref(&v1)).unwrap();
            db.write_objects(20, std::slice::from_ref(&v2)).unwrap();
            db.write_objects(30, std::slice::from_ref(&gone)).unwrap();

            assert!(db.ledger_object(&key, 9).unwrap().is_none());
            assert_eq!(db.ledger_object(&key, 10).unwrap().unwrap(), vec![1, 1, 1]);
            assert_eq!(db.ledger_object(&key, 19).unwrap().unwrap(), vec![1, 1, 1]);
            assert_eq!(db.ledger_object(&key, 25).unwrap().unwrap(), vec![2, 2]);
            // Deleted at 30: reads at or past the tombstone see nothing.
            assert!(db.ledger_object(&key, 30).unwrap().is_none());
            assert!(db.ledger_object(&key, 99).unwrap().is_none());
        });
    }

    #[test]
    fn test_successor_rows() {
        TestWrapper::new("successor_rows").run(|path| {
            let db =
                RocksBackend::create_or_open(path, DatabaseOptions::default());

            let a = [1u8; 32];
            let b = [2u8; 32];
            let c = [3u8; 32];

            db.write_successors(10, &[(a, b), (b, c)]).unwrap();
            // b is deleted at 20; a now points past it.
            db.write_successors(20, &[(a, c)]).unwrap();

            assert_eq!(db.successor_key(&a, 10).unwrap(), Some(b));
            assert_eq!(db.successor_key(&a, 19).unwrap(), Some(b));
            assert_eq!(db.successor_key(&a, 20).unwrap(), Some(c));
            assert_eq!(db.successor_key(&b, 15).unwrap(), Some(c));
            assert!(db.successor_key(&c, 20).unwrap().is_none());
        });
    }

    #[test]
    fn test_range_row() {
        TestWrapper::new("range_row").run(|path| {
            let db =
                RocksBackend::create_or_open(path, DatabaseOptions::default());

            assert!(db.ledger_range().unwrap().is_none());

            db.write_max_sequence(100).unwrap();
            // First write seeds min as well.
            assert_eq!(
                db.ledger_range().unwrap().unwrap(),
                LedgerRange { min_sequence: 100, max_sequence: 100 }
            );

            db.write_max_sequence(101).unwrap();
            db.write_min_sequence(99).unwrap();
            assert_eq!(
                db.ledger_range().unwrap().unwrap(),
                LedgerRange { min_sequence: 99, max_sequence: 101 }
            );
        });
    }

    #[test]
    fn test_transactions_and_ledger_index() {
        TestWrapper::new("transactions").run(|path| {
            let db =
                RocksBackend::create_or_open(path, DatabaseOptions::default());

            let txs: Vec<_> =
                (0..4).map(|i| faker::gen_dummy_tx(500, i)).collect();
            db.write_transactions(&txs).unwrap();

            let fetched = db.transaction(&txs[2].hash).unwrap().unwrap();
            assert_eq!(fetched, txs[2]);

            let hashes = db.ledger_transaction_hashes(500).unwrap();
            assert_eq!(
                hashes,
                txs.iter().map(|t| t.hash).collect::<Vec<_>>()
            );

            let multi = db
                .transactions(&[txs[0].hash, faker::gen_key(999)])
                .unwrap();
            assert_eq!(multi[0].as_ref().unwrap(), &txs[0]);
            assert!(multi[1].is_none());
        });
    }

    #[test]
    fn test_account_tx_paging() {
        TestWrapper::new("account_tx").run(|path| {
            let db =
                RocksBackend::create_or_open(path, DatabaseOptions::default());

            let account = faker::gen_account(1);
            let mut txs = vec![];
            for seq in [100u32, 101, 102] {
                for idx in 0..3u32 {
                    let mut tx = faker::gen_dummy_tx(seq, idx);
                    tx.accounts = vec![account];
                    txs.push(tx);
                }
            }
            db.write_account_transactions(&txs).unwrap();

            // Newest first, two pages.
            let (page1, cursor) =
                db.account_transactions(&account, 5, None, false).unwrap();
            assert_eq!(page1.len(), 5);
            assert_eq!(page1[0], txs[8].hash);
            let cursor = cursor.unwrap();

            let (page2, end) = db
                .account_transactions(&account, 5, Some(cursor), false)
                .unwrap();
            assert_eq!(page2.len(), 4);
            assert!(end.is_none());
            assert_eq!(page2.last().unwrap(), &txs[0].hash);

            // Forward iteration yields oldest first.
            let (forward, _) =
                db.account_transactions(&account, 3, None, true).unwrap();
            assert_eq!(
                forward,
                vec![txs[0].hash, txs[1].hash, txs[2].hash]
            );
        });
    }

    #[test]
    fn test_flag_row_keys() {
        TestWrapper::new("flag_keys").run(|path| {
            let db =
                RocksBackend::create_or_open(path, DatabaseOptions::default());

            let flag = key_index_of(5, 16);
            assert!(is_flag_ledger(flag, 16));

            let mut keys: Vec<Hash> =
                (0..10).map(|i| [i as u8 + 1; 32]).collect();
            db.write_keys(flag, &keys).unwrap();
            keys.sort();

            let first = db.keys_at(flag, None, 4).unwrap();
            assert_eq!(first, keys[..4]);

            let rest = db.keys_at(flag, Some(keys[3]), 100).unwrap();
            assert_eq!(rest, keys[4..]);

            // Rows from other flag windows are invisible.
            assert!(db.keys_at(flag + (1 << 16), None, 10).unwrap().is_empty());
        });
    }

    #[test]
    fn test_book_scoped_keys() {
        TestWrapper::new("book_keys").run(|path| {
            let db =
                RocksBackend::create_or_open(path, DatabaseOptions::default());

            let mut in_book = [7u8; 32];
            in_book[31] = 1;
            let mut in_book2 = [7u8; 32];
            in_book2[31] = 9;
            let other = [9u8; 32];

            db.write_keys(0, &[in_book, in_book2, other]).unwrap();

            let book = node_data::ledger::book_of(&in_book);
            let keys = db.book_keys_at(0, &book, None, 10).unwrap();
            assert_eq!(keys, vec![in_book, in_book2]);

            let keys =
                db.book_keys_at(0, &book, Some(in_book), 10).unwrap();
            assert_eq!(keys, vec![in_book2]);
        });
    }

    #[test]
    fn test_lease_cas() {
        TestWrapper::new("lease_cas").run(|path| {
            let db =
                RocksBackend::create_or_open(path, DatabaseOptions::default());

            // First claim wins.
            assert!(db.try_acquire_lease(1, 1_000, 10_000).unwrap());
            // A competing claim before expiry loses.
            assert!(!db.try_acquire_lease(2, 2_000, 10_000).unwrap());
            // The owner renews its own row.
            assert!(db.try_acquire_lease(1, 5_000, 10_000).unwrap());
            // After expiry anyone may steal.
            assert!(db.try_acquire_lease(2, 20_000, 10_000).unwrap());

            let row = db.lease_owner().unwrap().unwrap();
            assert_eq!(row.owner_id, 2);

            // Release only succeeds for the current owner.
            assert!(!db.release_lease(1).unwrap());
            assert!(db.release_lease(2).unwrap());
            assert!(db.lease_owner().unwrap().is_none());
        });
    }

    #[test]
    fn test_online_delete_floor() {
        TestWrapper::new("online_delete").run(|path| {
            let db =
                RocksBackend::create_or_open(path, DatabaseOptions::default());

            let key = faker::gen_key(3);
            for seq in [10u32, 20, 30] {
                db.write_ledger(&faker::gen_dummy_header(seq)).unwrap();
                db.write_objects(
                    seq,
                    &[LedgerObject::new(key, vec![seq as u8])],
                )
                .unwrap();
            }
            let untouched = faker::gen_key(4);
            db.write_objects(10, &[LedgerObject::new(untouched, vec![42])])
                .unwrap();

            let deleted = db.delete_ledgers_before(25).unwrap();
            assert!(deleted > 0);

            assert!(db.ledger_header(10).unwrap().is_none());
            assert!(db.ledger_header(20).unwrap().is_none());
            assert!(db.ledger_header(30).unwrap().is_some());

            // The newest below-floor version survives to seed floor reads.
            assert_eq!(db.ledger_object(&key, 25).unwrap().unwrap(), vec![20]);
            assert_eq!(db.ledger_object(&key, 30).unwrap().unwrap(), vec![30]);
            assert_eq!(
                db.ledger_object(&untouched, 25).unwrap().unwrap(),
                vec![42]
            );
            // The 10-version of `key` is gone.
            assert!(db.ledger_object(&key, 15).unwrap().is_none());
        });
    }

    struct TestWrapper(tempfile::TempDir);

    impl TestWrapper {
        fn new(path: &'static str) -> Self {
            Self(
                tempfile::TempDir::with_prefix(path)
                    .expect("Temp directory to be created"),
            )
        }

        pub fn run<F>(&self, test_func: F)
        where
            F: FnOnce(&Path),
        {
            test_func(self.0.path());
        }
    }
}
