// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! Startup cache population: the key space is split into equal prefix
//! partitions and each partition runs its own cursored page scan against
//! the store.

use std::sync::Arc;
use std::time::Instant;

use node_data::ledger::Hash;
use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::database::{Backend, Result, StorageError};
use crate::exec::StopToken;
use crate::storage::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    /// Block ledger publishing until the cache is warm.
    Sync,
    /// Warm in the background; misses fall through to storage meanwhile.
    Async,
    /// Cache loading disabled.
    None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Params {
    pub style: Style,

    /// Parallel scan partitions over the key space.
    pub num_markers: usize,

    /// Objects per page fetch.
    pub page_size: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            style: Style::Async,
            num_markers: 16,
            page_size: 512,
        }
    }
}

/// Scan every live object at `sequence` into the in-memory cache. Returns
/// the number of cached objects.
pub async fn load<B: Backend>(
    store: Arc<Store<B>>,
    sequence: u32,
    params: Params,
    token: StopToken,
) -> Result<usize> {
    let started = Instant::now();
    let num_markers = params.num_markers.clamp(1, 256);
    info!(event = "cache load started", sequence, num_markers);

    let mut tasks: JoinSet<Result<usize>> = JoinSet::new();
    for marker in 0..num_markers {
        let store = store.clone();
        let token = token.clone();
        let page_size = params.page_size.max(16);
        tasks.spawn(async move {
            scan_partition(
                store,
                sequence,
                marker,
                num_markers,
                page_size,
                token,
            )
            .await
        });
    }

    let mut total = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(count)) => total += count,
            Ok(Err(err)) => {
                warn!(event = "cache load failed", err = %err);
                return Err(err);
            }
            Err(_) => return Err(StorageError::Cancelled),
        }
    }

    store.cache().set_full();
    info!(
        event = "cache load finished",
        sequence,
        objects = total,
        elapsed_ms = started.elapsed().as_millis() as u64,
    );
    metrics::gauge!("quill_cache_objects").set(total as f64);
    Ok(total)
}

/// First key byte owned by partition `marker`.
fn partition_start(marker: usize, num_markers: usize) -> u8 {
    ((marker * 256) / num_markers) as u8
}

async fn scan_partition<B: Backend>(
    store: Arc<Store<B>>,
    sequence: u32,
    marker: usize,
    num_markers: usize,
    page_size: usize,
    token: StopToken,
) -> Result<usize> {
    let start = partition_start(marker, num_markers);
    let end = if marker + 1 == num_markers {
        None
    } else {
        Some(partition_start(marker + 1, num_markers))
    };

    // An exclusive cursor just below the partition start keeps its first
    // possible key in range.
    let mut cursor: Option<Hash> = (start > 0).then(|| {
        let mut from = [0xffu8; 32];
        from[0] = start - 1;
        from
    });

    let mut cached = 0usize;
    loop {
        if token.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let page = store
            .fetch_ledger_page(cursor, sequence, page_size)
            .await?;
        let mut objects = page.objects;
        if let Some(end) = end {
            objects.retain(|object| object.key[0] < end);
        }
        if objects.is_empty() {
            break;
        }

        cached += objects.len();
        cursor = objects.last().map(|object| object.key);
        store.cache().update(&objects, sequence);

        if page.next_cursor.is_none() {
            break;
        }
    }

    Ok(cached)
}
