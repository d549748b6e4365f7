// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! Writer-leader election: one lease row in the backend, mutated only by
//! compare-and-set. Exactly one replica holds the lease at any moment;
//! everyone else is a strict reader.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{info, warn};

use crate::database::{Backend, Result};
use crate::storage::Store;

pub struct WriterLease<B> {
    store: Arc<Store<B>>,
    owner_id: u64,
    lease: Duration,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl<B: Backend> WriterLease<B> {
    pub fn new(store: Arc<Store<B>>, lease: Duration) -> Self {
        Self {
            store,
            owner_id: rand::thread_rng().gen(),
            lease,
        }
    }

    pub fn owner_id(&self) -> u64 {
        self.owner_id
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease
    }

    /// Renewal cadence: a third of the lease, so two renewals may fail
    /// before the row expires.
    pub fn renew_interval(&self) -> Duration {
        self.lease / 3
    }

    /// Claim or renew the lease row. False means another replica owns an
    /// unexpired lease. A CAS miss is a clean false, never a driver error,
    /// so going through the retrying read path cannot double-claim.
    pub async fn try_acquire(&self) -> Result<bool> {
        let owner_id = self.owner_id;
        let lease_ms = self.lease.as_millis() as u64;
        self.store
            .strategy()
            .read(move |b| {
                b.try_acquire_lease(owner_id, now_ms(), lease_ms)
            })
            .await
    }

    /// Drop the lease on clean shutdown so a peer replica can take over
    /// without waiting out the expiry.
    pub async fn release(&self) {
        let owner_id = self.owner_id;
        let released = self
            .store
            .strategy()
            .read(move |b| b.release_lease(owner_id))
            .await;
        match released {
            Ok(true) => info!(event = "writer lease released", owner_id),
            Ok(false) => {
                warn!(event = "lease already lost at release", owner_id)
            }
            Err(err) => {
                warn!(event = "lease release failed", owner_id, err = %err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::rocksdb::RocksBackend;
    use crate::database::DatabaseOptions;
    use crate::storage;

    fn open_store(dir: &tempfile::TempDir) -> Arc<Store<RocksBackend>> {
        let backend = Arc::new(RocksBackend::create_or_open(
            dir.path(),
            DatabaseOptions::default(),
        ));
        Arc::new(Store::open(backend, storage::Params::default()).unwrap())
    }

    #[tokio::test]
    async fn exactly_one_holder() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = open_store(&dir);

        let a = WriterLease::new(store.clone(), Duration::from_secs(10));
        let b = WriterLease::new(store.clone(), Duration::from_secs(10));

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());

        // Renewal by the holder keeps working.
        assert!(a.try_acquire().await.unwrap());

        // Release hands the row over.
        a.release().await;
        assert!(b.try_acquire().await.unwrap());
        assert!(!a.try_acquire().await.unwrap());
    }
}
