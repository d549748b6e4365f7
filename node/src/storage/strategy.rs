// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! Bounded-concurrency bridge between async callers and the synchronous
//! storage driver. Reads coalesce behind a permit pool and retry retryable
//! driver errors; writes run detached per sequence and are fenced by
//! [`ExecutionStrategy::finish_writes`]. Write backpressure is the only
//! place the ETL extractor can be throttled by storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::database::{Backend, Result, StorageError};

/// Authoritative retry schedule: base 100 ms, factor 2, cap 5 s.
pub const RETRY_BASE: Duration = Duration::from_millis(100);
pub const RETRY_CAP: Duration = Duration::from_secs(5);
pub const RETRY_ATTEMPTS: u32 = 8;

pub fn backoff_delay(attempt: u32) -> Duration {
    RETRY_BASE
        .saturating_mul(1u32 << attempt.min(16))
        .min(RETRY_CAP)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Maximum in-flight read requests against the driver.
    pub max_requests_outstanding: usize,

    /// Maximum in-flight asynchronous writes.
    pub max_write_requests_outstanding: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            max_requests_outstanding: 1024,
            max_write_requests_outstanding: 256,
        }
    }
}

pub struct ExecutionStrategy<B> {
    backend: Arc<B>,
    read_permits: Arc<Semaphore>,
    write_permits: Arc<Semaphore>,
    pending_writes: Mutex<HashMap<u32, Vec<JoinHandle<bool>>>>,
}

impl<B: Backend> ExecutionStrategy<B> {
    pub fn new(backend: Arc<B>, params: Params) -> Self {
        Self {
            backend,
            read_permits: Arc::new(Semaphore::new(
                params.max_requests_outstanding.max(1),
            )),
            write_permits: Arc::new(Semaphore::new(
                params.max_write_requests_outstanding.max(1),
            )),
            pending_writes: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Run a read against the driver, retrying retryable errors with
    /// exponential backoff before surfacing `StorageUnavailable`.
    pub async fn read<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&B) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let op = Arc::new(op);
        for attempt in 0..RETRY_ATTEMPTS {
            let _permit = self
                .read_permits
                .acquire()
                .await
                .map_err(|_| StorageError::Cancelled)?;

            let backend = self.backend.clone();
            let op = op.clone();
            let outcome =
                tokio::task::spawn_blocking(move || op(&backend))
                    .await
                    .map_err(|_| {
                        StorageError::Driver("read task died".into())
                    })?;

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    warn!(
                        event = "storage read retry",
                        attempt,
                        err = %err,
                    );
                    metrics::counter!("quill_storage_read_retries")
                        .increment(1);
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }

        metrics::counter!("quill_storage_read_exhausted").increment(1);
        Err(StorageError::Unavailable)
    }

    /// Run a write and suspend until it is durable.
    pub async fn write_sync<F>(&self, op: F) -> Result<()>
    where
        F: Fn(&B) -> Result<()> + Send + Sync + 'static,
    {
        self.read(op).await
    }

    /// Queue a write for `sequence` and return immediately. The op retries
    /// retryable errors in the background; its fate is collected by
    /// [`ExecutionStrategy::finish_writes`]. Suspends when the in-flight
    /// write budget is exhausted.
    pub async fn write_async<F>(&self, sequence: u32, op: F) -> Result<()>
    where
        F: Fn(&B) -> Result<()> + Send + Sync + 'static,
    {
        let permit = self
            .write_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Cancelled)?;

        let backend = self.backend.clone();
        let op = Arc::new(op);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            for attempt in 0..RETRY_ATTEMPTS {
                let backend = backend.clone();
                let op = op.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || op(&backend)).await;

                match outcome {
                    Ok(Ok(())) => return true,
                    Ok(Err(err)) if err.is_retryable() => {
                        warn!(
                            event = "storage write retry",
                            sequence,
                            attempt,
                            err = %err,
                        );
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                    Ok(Err(err)) => {
                        error!(
                            event = "storage write failed",
                            sequence,
                            err = %err,
                        );
                        return false;
                    }
                    Err(_) => return false,
                }
            }
            false
        });

        self.pending_writes
            .lock()
            .entry(sequence)
            .or_default()
            .push(handle);
        Ok(())
    }

    /// Await the drain of every write queued for `sequence`; true iff all
    /// of them reported durable success.
    pub async fn finish_writes(&self, sequence: u32) -> bool {
        let handles = self
            .pending_writes
            .lock()
            .remove(&sequence)
            .unwrap_or_default();

        let mut all_ok = true;
        for handle in handles {
            all_ok &= handle.await.unwrap_or(false);
        }
        all_ok
    }

    /// Writes currently queued, across all sequences.
    pub fn pending_write_count(&self) -> usize {
        self.pending_writes.lock().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use node_data::ledger::{
        AccountId, AccountTxCursor, Book, Hash, LedgerHeader, LedgerObject,
        LedgerRange, Transaction,
    };

    use super::*;
    use crate::database::LeaseRow;

    /// A driver double that fails a configurable number of times before
    /// succeeding. Only the methods the tests touch do anything.
    #[derive(Default)]
    struct FlakyBackend {
        failures_left: AtomicU32,
        reads: AtomicU32,
        writes: AtomicU32,
    }

    impl FlakyBackend {
        fn failing(n: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(n),
                ..Default::default()
            }
        }

        fn tick(&self) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    n.checked_sub(1)
                })
                .is_ok()
            {
                return Err(StorageError::Driver("transient".into()));
            }
            Ok(())
        }
    }

    impl Backend for FlakyBackend {
        fn ledger_header(&self, _: u32) -> Result<Option<LedgerHeader>> {
            self.tick()?;
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
        fn ledger_header_by_hash(
            &self,
            _: &Hash,
        ) -> Result<Option<LedgerHeader>> {
            unreachable!()
        }
        fn ledger_range(&self) -> Result<Option<LedgerRange>> {
            unreachable!()
        }
        fn ledger_object(
            &self,
            _: &Hash,
            _: u32,
        ) -> Result<Option<Vec<u8>>> {
            unreachable!()
        }
        fn ledger_objects(
            &self,
            _: &[Hash],
            _: u32,
        ) -> Result<Vec<Option<Vec<u8>>>> {
            unreachable!()
        }
        fn successor_key(&self, _: &Hash, _: u32) -> Result<Option<Hash>> {
            unreachable!()
        }
        fn diff_objects(&self, _: u32) -> Result<Vec<LedgerObject>> {
            unreachable!()
        }
        fn keys_at(
            &self,
            _: u32,
            _: Option<Hash>,
            _: usize,
        ) -> Result<Vec<Hash>> {
            unreachable!()
        }
        fn book_keys_at(
            &self,
            _: u32,
            _: &Book,
            _: Option<Hash>,
            _: usize,
        ) -> Result<Vec<Hash>> {
            unreachable!()
        }
        fn transaction(&self, _: &Hash) -> Result<Option<Transaction>> {
            unreachable!()
        }
        fn transactions(
            &self,
            _: &[Hash],
        ) -> Result<Vec<Option<Transaction>>> {
            unreachable!()
        }
        fn ledger_transaction_hashes(&self, _: u32) -> Result<Vec<Hash>> {
            unreachable!()
        }
        fn account_transactions(
            &self,
            _: &AccountId,
            _: usize,
            _: Option<AccountTxCursor>,
            _: bool,
        ) -> Result<(Vec<Hash>, Option<AccountTxCursor>)> {
            unreachable!()
        }
        fn write_ledger(&self, _: &LedgerHeader) -> Result<()> {
            self.tick()?;
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn write_objects(&self, _: u32, _: &[LedgerObject]) -> Result<()> {
            unreachable!()
        }
        fn write_successors(
            &self,
            _: u32,
            _: &[(Hash, Hash)],
        ) -> Result<()> {
            unreachable!()
        }
        fn write_transactions(&self, _: &[Transaction]) -> Result<()> {
            unreachable!()
        }
        fn write_account_transactions(
            &self,
            _: &[Transaction],
        ) -> Result<()> {
            unreachable!()
        }
        fn write_keys(&self, _: u32, _: &[Hash]) -> Result<()> {
            unreachable!()
        }
        fn write_ledger_range(&self, _: LedgerRange) -> Result<()> {
            unreachable!()
        }
        fn write_max_sequence(&self, _: u32) -> Result<()> {
            unreachable!()
        }
        fn write_min_sequence(&self, _: u32) -> Result<()> {
            unreachable!()
        }
        fn try_acquire_lease(&self, _: u64, _: u64, _: u64) -> Result<bool> {
            unreachable!()
        }
        fn release_lease(&self, _: u64) -> Result<bool> {
            unreachable!()
        }
        fn lease_owner(&self) -> Result<Option<LeaseRow>> {
            unreachable!()
        }
        fn delete_ledgers_before(&self, _: u32) -> Result<u64> {
            unreachable!()
        }
    }

    fn strategy(backend: FlakyBackend) -> ExecutionStrategy<FlakyBackend> {
        ExecutionStrategy::new(Arc::new(backend), Params::default())
    }

    #[tokio::test(start_paused = true)]
    async fn read_retries_then_succeeds() {
        let strategy = strategy(FlakyBackend::failing(3));
        strategy.read(|b| b.ledger_header(1)).await.unwrap();
        assert_eq!(strategy.backend().reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_exhaustion_surfaces_unavailable() {
        let strategy = strategy(FlakyBackend::failing(u32::MAX));
        let err = strategy.read(|b| b.ledger_header(1)).await.unwrap_err();
        assert_eq!(err, StorageError::Unavailable);
    }

    #[tokio::test]
    async fn non_retryable_errors_pass_through() {
        let strategy = strategy(FlakyBackend::default());
        let err = strategy
            .read(|_| -> Result<()> {
                Err(StorageError::Corruption("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn finish_writes_reports_cumulative_success() {
        let strategy = strategy(FlakyBackend::failing(1));
        let header = LedgerHeader::default();

        for _ in 0..4 {
            let header = header.clone();
            strategy
                .write_async(7, move |b| b.write_ledger(&header))
                .await
                .unwrap();
        }
        assert_eq!(strategy.pending_write_count(), 4);

        assert!(strategy.finish_writes(7).await);
        assert_eq!(strategy.pending_write_count(), 0);
        assert_eq!(strategy.backend().writes.load(Ordering::SeqCst), 4);

        // A second drain of the same sequence is a no-op success.
        assert!(strategy.finish_writes(7).await);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_fails_the_fence() {
        let strategy = strategy(FlakyBackend::default());
        strategy
            .write_async(9, |_| -> Result<()> {
                Err(StorageError::Corruption("bad batch".into()))
            })
            .await
            .unwrap();
        assert!(!strategy.finish_writes(9).await);
    }
}
