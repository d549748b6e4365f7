// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! The extract/transform/load pipeline. In writer mode (one replica,
//! elected through the backend lease row) extractor workers race ahead
//! fetching validated ledgers, the transformer writes each in order
//! through the store, and the publisher makes them visible. Reader-mode
//! replicas follow the writer's published sequence instead.

pub mod lease;

mod extractor;
mod pipe;
mod publisher;
mod transformer;

pub use publisher::CommittedLedger;
pub use transformer::{initial_chain, successor_rows};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use node_data::ledger::LedgerObject;
use node_data::queue::AsyncQueue;
use serde::Deserialize;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::database::{Backend, StorageError};
use crate::exec::StopToken;
use crate::peer::pool::LoadBalancer;
use crate::peer::NetworkValidatedLedgers;
use crate::storage::Store;
use crate::subscriptions::SubscriptionManager;
use crate::LongLivedService;
use lease::WriterLease;
use pipe::ExtractionDataPipe;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Params {
    pub extractor_threads: usize,

    /// Per-lane depth of the extraction data pipe.
    pub queue_depth: usize,

    /// First sequence to ingest when the store is empty.
    pub start_sequence: Option<u32>,

    /// Stop after ingesting this sequence.
    pub finish_sequence: Option<u32>,

    /// Never contend for the writer lease.
    pub read_only: bool,

    /// Parallel cursors for the initial full-ledger download.
    pub initial_load_markers: usize,

    #[serde(with = "humantime_serde")]
    pub lease_duration: Duration,

    #[serde(with = "humantime_serde")]
    pub reader_poll_interval: Duration,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            extractor_threads: 2,
            queue_depth: 8,
            start_sequence: None,
            finish_sequence: None,
            read_only: false,
            initial_load_markers: 16,
            lease_duration: Duration::from_secs(10),
            reader_poll_interval: Duration::from_millis(250),
        }
    }
}

/// Set once the pipeline meets a ledger it cannot decompose. A blocked
/// node stops writing; the RPC layer answers `amendmentBlocked` for
/// everything it cannot forward.
#[derive(Default)]
pub struct AmendmentBlock {
    blocked: AtomicBool,
}

impl AmendmentBlock {
    pub fn block(&self, reason: &str) {
        if !self.blocked.swap(true, Ordering::AcqRel) {
            error!(event = "amendment blocked", reason);
            metrics::counter!("quill_amendment_blocked").increment(1);
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }
}

/// Observable ETL state, shared with the RPC layer.
#[derive(Default)]
pub struct State {
    writer: AtomicBool,
    amendment: AmendmentBlock,
}

impl State {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_writer(&self) -> bool {
        self.writer.load(Ordering::Acquire)
    }

    fn set_writer(&self, writer: bool) {
        self.writer.store(writer, Ordering::Release);
        metrics::gauge!("quill_writer_mode")
            .set(if writer { 1.0 } else { 0.0 });
    }

    pub fn amendment(&self) -> &AmendmentBlock {
        &self.amendment
    }
}

pub struct EtlService<B> {
    params: Params,
    store: Arc<Store<B>>,
    balancer: Arc<LoadBalancer>,
    validated: Arc<NetworkValidatedLedgers>,
    subscriptions: Arc<SubscriptionManager>,
    state: Arc<State>,
    keep_ledgers: Option<u32>,
    online_delete_interval: Duration,
}

#[async_trait]
impl<B: Backend> LongLivedService for EtlService<B> {
    async fn execute(&mut self, token: StopToken) -> anyhow::Result<usize> {
        self.run(token).await?;
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "etl"
    }
}

enum WriterExit {
    Demoted,
    Finished,
    Stopped,
}

impl<B: Backend> EtlService<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: Params,
        store: Arc<Store<B>>,
        balancer: Arc<LoadBalancer>,
        validated: Arc<NetworkValidatedLedgers>,
        subscriptions: Arc<SubscriptionManager>,
        state: Arc<State>,
        keep_ledgers: Option<u32>,
        online_delete_interval: Duration,
    ) -> Self {
        Self {
            params,
            store,
            balancer,
            validated,
            subscriptions,
            state,
            keep_ledgers,
            online_delete_interval,
        }
    }

    async fn run(&self, token: StopToken) -> anyhow::Result<()> {
        let lease = Arc::new(WriterLease::new(
            self.store.clone(),
            self.params.lease_duration,
        ));

        let reclaimer = self.keep_ledgers.map(|keep| {
            let store = self.store.clone();
            let state = self.state.clone();
            let interval = self.online_delete_interval;
            let token = token.child_token();
            tokio::spawn(async move {
                online_delete_loop(store, state, keep, interval, token)
                    .await;
            })
        });

        while !token.is_cancelled() {
            let is_writer = !self.params.read_only
                && !self.state.amendment().is_blocked()
                && lease.try_acquire().await.unwrap_or(false);

            if is_writer {
                self.state.set_writer(true);
                let exit = self.run_writer(&lease, &token).await;
                self.state.set_writer(false);

                match exit {
                    Ok(WriterExit::Demoted) => {
                        warn!(event = "writer lease lost, demoting");
                    }
                    Ok(WriterExit::Finished) => {
                        lease.release().await;
                        break;
                    }
                    Ok(WriterExit::Stopped) => {
                        // Drain happened inside; free the row for the
                        // next leader.
                        lease.release().await;
                        break;
                    }
                    Err(err) => {
                        error!(event = "writer pipeline failed", err = %err);
                        lease.release().await;
                        if self.state.amendment().is_blocked() {
                            // Keep serving reads; never write again.
                            self.run_reader(&lease, &token).await;
                            break;
                        }
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            } else {
                self.run_reader(&lease, &token).await;
            }
        }

        if let Some(reclaimer) = reclaimer {
            reclaimer.abort();
            let _ = reclaimer.await;
        }
        Ok(())
    }

    /// The full writer pipeline; returns when stopped, demoted, finished,
    /// or broken.
    async fn run_writer(
        &self,
        lease: &Arc<WriterLease<B>>,
        token: &StopToken,
    ) -> anyhow::Result<WriterExit> {
        info!(
            event = "assuming writer mode",
            owner_id = lease.owner_id(),
        );

        // Resume behind whatever is already persisted; an empty store
        // bootstraps from one full ledger download.
        let range = self.store.refresh_range().await?;
        let start = match range {
            Some(range) => range.max_sequence + 1,
            None => {
                let first = match self.params.start_sequence {
                    Some(first) => first,
                    None => {
                        if !self.validated.wait_for(1, token).await {
                            return Ok(WriterExit::Stopped);
                        }
                        self.validated.latest()
                    }
                };
                if !self.initial_load(first, token).await? {
                    return Ok(WriterExit::Stopped);
                }
                first + 1
            }
        };

        let pipeline = token.child_token();
        let pipe = Arc::new(ExtractionDataPipe::new(
            self.params.extractor_threads,
            self.params.queue_depth,
            start,
        ));

        let mut workers = vec![];
        for index in 0..pipe.num_lanes() {
            workers.push(tokio::spawn(extractor::run(
                index,
                pipe.num_lanes(),
                start,
                self.params.finish_sequence,
                pipe.clone(),
                self.balancer.clone(),
                self.validated.clone(),
                self.store.clone(),
                pipeline.child_token(),
            )));
        }

        let publish_queue: AsyncQueue<CommittedLedger> =
            AsyncQueue::bounded(self.params.queue_depth);
        let publisher = tokio::spawn(publisher::run(
            publish_queue.clone(),
            self.store.clone(),
            self.subscriptions.clone(),
            self.balancer.clone(),
            pipeline.child_token(),
        ));

        // Lease renewal; losing the row demotes the whole pipeline.
        let demoted = Arc::new(AtomicBool::new(false));
        let renewal = {
            let lease = lease.clone();
            let demoted = demoted.clone();
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = pipeline.cancelled() => break,
                        _ = sleep(lease.renew_interval()) => {}
                    }
                    match lease.try_acquire().await {
                        Ok(true) => {}
                        Ok(false) => {
                            demoted.store(true, Ordering::Release);
                            pipeline.cancel();
                            break;
                        }
                        Err(err) => {
                            warn!(event = "lease renewal failed", err = %err);
                            demoted.store(true, Ordering::Release);
                            pipeline.cancel();
                            break;
                        }
                    }
                }
            })
        };

        let outcome = self
            .transformer_loop(start, &pipe, &publish_queue, &pipeline)
            .await;

        // Teardown in drain order: extractors, pipe, publisher.
        pipeline.cancel();
        pipe.close();
        for worker in workers {
            let _ = worker.await;
        }
        publish_queue.close();
        let _ = publisher.await;
        renewal.abort();
        let _ = renewal.await;

        match outcome {
            Err(err) => Err(err.into()),
            Ok(()) if demoted.load(Ordering::Acquire) => {
                Ok(WriterExit::Demoted)
            }
            Ok(())
                if matches!(
                    self.params.finish_sequence,
                    Some(finish)
                        if self.store.ledger_range()
                            .is_some_and(|r| r.max_sequence >= finish)
                ) =>
            {
                Ok(WriterExit::Finished)
            }
            Ok(()) => Ok(WriterExit::Stopped),
        }
    }

    /// Pull strictly in order, write, and hand over for publication.
    async fn transformer_loop(
        &self,
        start: u32,
        pipe: &Arc<ExtractionDataPipe>,
        publish_queue: &AsyncQueue<CommittedLedger>,
        pipeline: &StopToken,
    ) -> Result<(), StorageError> {
        let mut sequence = start;
        loop {
            if pipeline.is_cancelled() {
                return Ok(());
            }
            if matches!(
                self.params.finish_sequence,
                Some(finish) if sequence > finish
            ) {
                return Ok(());
            }

            let pulled = tokio::select! {
                _ = pipeline.cancelled() => return Ok(()),
                pulled = pipe.pull(sequence) => pulled,
            };
            let Some(mut item) = pulled else {
                return Ok(());
            };

            loop {
                match transformer::transform(
                    &self.store,
                    &item.ledger,
                    false,
                )
                .await
                {
                    Ok(outcome) if outcome.committed => {
                        let books = SubscriptionManager::books_of_diff(
                            &outcome.objects,
                        );
                        let committed = CommittedLedger {
                            header: item.ledger.header.clone(),
                            transactions: item.ledger.transactions.clone(),
                            books,
                        };
                        let sent = tokio::select! {
                            _ = pipeline.cancelled() => return Ok(()),
                            sent = publish_queue.send(committed) => sent,
                        };
                        if sent.is_err() {
                            return Ok(());
                        }
                        break;
                    }
                    Ok(_) => {
                        // Abandoned: this sequence is re-extracted until
                        // it commits; nothing later may overtake it.
                        warn!(
                            event = "re-extracting abandoned ledger",
                            sequence,
                        );
                        match self
                            .refetch(sequence, pipeline)
                            .await
                        {
                            Some(ledger) => item.ledger = ledger,
                            None => return Ok(()),
                        }
                    }
                    Err(StorageError::Corruption(reason)) => {
                        self.state.amendment().block(&reason);
                        return Err(StorageError::Corruption(reason));
                    }
                    Err(StorageError::Cancelled) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }

            sequence += 1;
        }
    }

    async fn refetch(
        &self,
        sequence: u32,
        pipeline: &StopToken,
    ) -> Option<crate::peer::FetchedLedger> {
        loop {
            if pipeline.is_cancelled() {
                return None;
            }
            let neighbors = !self.store.cache().is_full();
            match self
                .balancer
                .fetch_ledger(sequence, true, neighbors)
                .await
            {
                Ok(ledger) => return Some(ledger),
                Err(err) => {
                    warn!(event = "refetch failed", sequence, err = %err);
                    tokio::select! {
                        _ = pipeline.cancelled() => return None,
                        _ = sleep(Duration::from_millis(250)) => {}
                    }
                }
            }
        }
    }

    /// Bootstrap an empty store from one complete ledger.
    async fn initial_load(
        &self,
        sequence: u32,
        token: &StopToken,
    ) -> anyhow::Result<bool> {
        info!(event = "initial ledger load", sequence);

        let fetched = loop {
            if token.is_cancelled() {
                return Ok(false);
            }
            match self.balancer.fetch_ledger(sequence, false, false).await {
                Ok(fetched) => break fetched,
                Err(err) => {
                    warn!(
                        event = "initial header fetch failed",
                        sequence,
                        err = %err,
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Ok(false),
                        _ = sleep(Duration::from_millis(500)) => {}
                    }
                }
            }
        };

        let diffs = loop {
            if token.is_cancelled() {
                return Ok(false);
            }
            match self
                .balancer
                .load_initial_ledger(
                    sequence,
                    self.params.initial_load_markers,
                )
                .await
            {
                Ok(diffs) => break diffs,
                Err(err) => {
                    warn!(
                        event = "initial state download failed",
                        sequence,
                        err = %err,
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Ok(false),
                        _ = sleep(Duration::from_millis(500)) => {}
                    }
                }
            }
        };

        let objects: Vec<LedgerObject> = diffs
            .iter()
            .filter(|diff| !diff.is_deleted())
            .map(|diff| diff.as_object())
            .collect();
        info!(
            event = "initial ledger downloaded",
            sequence,
            objects = objects.len(),
            txs = fetched.transactions.len(),
        );

        self.store.start_writes(sequence);
        self.store
            .write_ledger(fetched.header.clone(), true)
            .await?;
        self.store
            .write_ledger_objects(sequence, objects.clone())
            .await?;
        self.store
            .write_successors(sequence, initial_chain(&objects))
            .await?;
        self.store
            .write_transactions(sequence, fetched.transactions.clone())
            .await?;

        if !self.store.finish_writes(sequence).await {
            anyhow::bail!("initial ledger {sequence} failed to commit");
        }

        self.store.update_cache(&objects, sequence);
        self.store.cache().set_full();

        publisher::publish_one(
            &self.store,
            &self.subscriptions,
            &self.balancer,
            &CommittedLedger {
                books: SubscriptionManager::books_of_diff(&objects),
                header: fetched.header,
                transactions: fetched.transactions,
            },
        );
        Ok(true)
    }

    /// Follow the writer replica: poll the shared range row, re-read each
    /// newly published sequence, refresh the cache, publish locally.
    /// Returns when promotion looks possible or the token fires.
    async fn run_reader(
        &self,
        lease: &Arc<WriterLease<B>>,
        token: &StopToken,
    ) {
        info!(event = "reader mode");
        let mut local_max =
            self.store.ledger_range().map(|r| r.max_sequence);
        let mut next_election = Instant::now() + lease.lease_duration();

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(self.params.reader_poll_interval) => {}
            }

            let fresh = match self.store.refresh_range().await {
                Ok(fresh) => fresh,
                Err(err) => {
                    warn!(event = "range refresh failed", err = %err);
                    continue;
                }
            };
            if let Some(range) = fresh {
                let from = match local_max {
                    // First observation: adopt, don't replay history.
                    None => range.max_sequence,
                    Some(local) => local,
                };
                for sequence in (from + 1)..=range.max_sequence {
                    if token.is_cancelled() {
                        return;
                    }
                    if let Err(err) = self.follow_one(sequence).await {
                        warn!(
                            event = "reader follow failed",
                            sequence,
                            err = %err,
                        );
                        break;
                    }
                }
                local_max = Some(range.max_sequence.max(from));
            }

            // Periodically probe the lease so a dead writer is replaced
            // within its expiry window.
            if !self.params.read_only
                && !self.state.amendment().is_blocked()
                && Instant::now() >= next_election
            {
                match lease.try_acquire().await {
                    Ok(true) => return,
                    _ => {
                        next_election =
                            Instant::now() + lease.renew_interval();
                    }
                }
            }
        }
    }

    async fn follow_one(&self, sequence: u32) -> anyhow::Result<()> {
        let header = self
            .store
            .fetch_ledger_by_sequence(sequence)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("published ledger {sequence} missing")
            })?;
        let diffs = self.store.fetch_diff_objects(sequence).await?;
        let transactions = self
            .store
            .fetch_all_transactions_in_ledger(sequence)
            .await?;

        self.store.update_cache(&diffs, sequence);
        publisher::publish_one(
            &self.store,
            &self.subscriptions,
            &self.balancer,
            &CommittedLedger {
                books: SubscriptionManager::books_of_diff(&diffs),
                header,
                transactions,
            },
        );
        Ok(())
    }
}

async fn online_delete_loop<B: Backend>(
    store: Arc<Store<B>>,
    state: Arc<State>,
    keep_ledgers: u32,
    interval: Duration,
    token: StopToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(interval) => {}
        }
        // Reclamation belongs to the writer leader alone.
        if !state.is_writer() {
            continue;
        }
        if let Err(err) = store.online_delete_pass(keep_ledgers).await {
            warn!(event = "online delete pass failed", err = %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amendment_block_latches() {
        let state = State::new();
        assert!(!state.amendment().is_blocked());
        state.amendment().block("unknown object type");
        state.amendment().block("again");
        assert!(state.amendment().is_blocked());
    }

    #[test]
    fn params_defaults() {
        let params = Params::default();
        assert_eq!(params.extractor_threads, 2);
        assert_eq!(params.queue_depth, 8);
        assert!(!params.read_only);
        assert_eq!(params.lease_duration, Duration::from_secs(10));
    }
}
