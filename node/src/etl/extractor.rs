// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::database::Backend;
use crate::etl::pipe::{ExtractedLedger, ExtractionDataPipe};
use crate::exec::StopToken;
use crate::peer::pool::{LoadBalancer, PoolError};
use crate::peer::NetworkValidatedLedgers;
use crate::storage::Store;

/// Pause between fetch attempts while no peer can serve us.
const NO_PEER_BACKOFF: Duration = Duration::from_millis(250);

/// One extractor worker. Worker `index` of `count` owns the sequences
/// with `(seq - start) % count == index` and fetches them in order, parked
/// on the network-validated watch until each exists upstream.
#[allow(clippy::too_many_arguments)]
pub async fn run<B: Backend>(
    index: usize,
    count: usize,
    start: u32,
    finish: Option<u32>,
    pipe: Arc<ExtractionDataPipe>,
    balancer: Arc<LoadBalancer>,
    validated: Arc<NetworkValidatedLedgers>,
    store: Arc<Store<B>>,
    token: StopToken,
) {
    let mut sequence = start + index as u32;
    info!(event = "extractor started", index, count, start);

    'outer: while !token.is_cancelled() {
        if matches!(finish, Some(finish) if sequence > finish) {
            break;
        }
        if !validated.wait_for(sequence, &token).await {
            break;
        }

        loop {
            // Neighbor pointers come from the peer until the local cache
            // can answer predecessor/successor queries itself.
            let neighbors = !store.cache().is_full();
            match balancer.fetch_ledger(sequence, true, neighbors).await {
                Ok(ledger) => {
                    metrics::counter!("quill_extracted_ledgers")
                        .increment(1);
                    debug!(
                        event = "ledger extracted",
                        index,
                        sequence,
                        diffs = ledger.diffs.len(),
                        txs = ledger.transactions.len(),
                    );
                    if !pipe
                        .push(ExtractedLedger { sequence, ledger })
                        .await
                    {
                        break 'outer;
                    }
                    break;
                }
                Err(PoolError::NoPeers) => {
                    tokio::select! {
                        _ = token.cancelled() => break 'outer,
                        _ = tokio::time::sleep(NO_PEER_BACKOFF) => {}
                    }
                }
                Err(PoolError::Failed(err)) => {
                    debug!(
                        event = "extract retry",
                        index,
                        sequence,
                        err,
                    );
                    tokio::select! {
                        _ = token.cancelled() => break 'outer,
                        _ = tokio::time::sleep(NO_PEER_BACKOFF) => {}
                    }
                }
            }
        }

        sequence += count as u32;
    }

    info!(event = "extractor stopped", index, last = sequence);
}
