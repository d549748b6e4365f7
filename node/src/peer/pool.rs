// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! Ordered pool of upstream peers with try-next fetch semantics, plus the
//! short-TTL cache fronting request forwarding.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash as _, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use node_data::ledger::ObjectDiff;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::{FetchedLedger, Peer};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no peer available")]
    NoPeers,

    #[error("peer request failed: {0}")]
    Failed(String),
}

/// Bounded map of `hash(request)` to cached forward responses.
pub struct ForwardingCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<u64, CachedResponse>>,
}

struct CachedResponse {
    response: Value,
    expires_at: Instant,
    ledger_sensitive: bool,
}

/// Request hash ignores the client-assigned `id`.
fn request_digest(request: &Value) -> u64 {
    let mut scrubbed = request.clone();
    if let Some(obj) = scrubbed.as_object_mut() {
        obj.remove("id");
    }
    let mut hasher = DefaultHasher::new();
    scrubbed.to_string().hash(&mut hasher);
    hasher.finish()
}

impl ForwardingCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, request: &Value) -> Option<Value> {
        let digest = request_digest(request);
        let now = Instant::now();
        let mut entries = self.entries.lock();
        // Expiry sweeps piggyback on access; there is no dedicated timer.
        entries.retain(|_, cached| cached.expires_at > now);
        entries.get(&digest).map(|cached| cached.response.clone())
    }

    pub fn put(
        &self,
        request: &Value,
        response: Value,
        ledger_sensitive: bool,
    ) {
        let digest = request_digest(request);
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries {
            let now = Instant::now();
            entries.retain(|_, cached| cached.expires_at > now);
        }
        if entries.len() >= self.max_entries {
            return;
        }
        entries.insert(
            digest,
            CachedResponse {
                response,
                expires_at: Instant::now() + self.ttl,
                ledger_sensitive,
            },
        );
    }

    /// Drop entries whose payload depends on the current ledger; called
    /// on every published advance.
    pub fn invalidate_ledger_sensitive(&self) {
        self.entries
            .lock()
            .retain(|_, cached| !cached.ledger_sensitive);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Ordered peer pool: fetches walk the peers least-recently-failed first,
/// forwards rotate round-robin over the eligible subset.
pub struct LoadBalancer {
    peers: Vec<Arc<Peer>>,
    round_robin: AtomicUsize,
    cache: ForwardingCache,
    local_network: RwLock<Option<u32>>,
}

impl LoadBalancer {
    pub fn new(
        peers: Vec<Arc<Peer>>,
        forward_ttl: Duration,
        forward_cache_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            peers,
            round_robin: AtomicUsize::new(0),
            cache: ForwardingCache::new(forward_ttl, forward_cache_size),
            local_network: RwLock::new(None),
        })
    }

    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    pub fn forwarding_cache(&self) -> &ForwardingCache {
        &self.cache
    }

    pub fn local_network(&self) -> Option<u32> {
        *self.local_network.read()
    }

    /// Adopt the network id advertised by the first subscribed peer; later
    /// peers on other networks become forwarding-ineligible.
    fn refresh_local_network(&self) {
        if self.local_network.read().is_some() {
            return;
        }
        for peer in &self.peers {
            if let Some(network) = peer.network_id() {
                *self.local_network.write() = Some(network);
                return;
            }
        }
    }

    /// Peers ordered for fetching: never-failed first, then by oldest
    /// failure.
    fn fetch_order(&self) -> Vec<Arc<Peer>> {
        let mut order = self.peers.clone();
        order.sort_by_key(|peer| peer.last_failure());
        order
    }

    pub async fn fetch_ledger(
        &self,
        sequence: u32,
        get_objects: bool,
        get_object_neighbors: bool,
    ) -> Result<FetchedLedger, PoolError> {
        for peer in self.fetch_order() {
            match peer
                .fetch_ledger(sequence, get_objects, get_object_neighbors)
                .await
            {
                Ok(fetched) => return Ok(fetched),
                Err(err) => {
                    peer.mark_failed();
                    debug!(
                        event = "fetch failed, trying next peer",
                        peer = peer.label(),
                        sequence,
                        err = %err,
                    );
                }
            }
        }
        Err(PoolError::NoPeers)
    }

    pub async fn load_initial_ledger(
        &self,
        sequence: u32,
        num_markers: usize,
    ) -> Result<Vec<ObjectDiff>, PoolError> {
        for peer in self.fetch_order() {
            match peer.load_initial_ledger(sequence, num_markers).await {
                Ok(diffs) => return Ok(diffs),
                Err(err) => {
                    peer.mark_failed();
                    warn!(
                        event = "initial load failed, trying next peer",
                        peer = peer.label(),
                        sequence,
                        err = %err,
                    );
                }
            }
        }
        Err(PoolError::NoPeers)
    }

    /// Forward a raw client request: cache first, then one eligible peer
    /// chosen round-robin. Successful responses are annotated
    /// `"forwarded": true` and cached.
    pub async fn forward(
        &self,
        request: &Value,
        ledger_sensitive: bool,
    ) -> Result<Value, PoolError> {
        if let Some(mut cached) = self.cache.get(request) {
            annotate_forwarded(&mut cached);
            return Ok(cached);
        }

        self.refresh_local_network();
        let local_network = self.local_network();
        let eligible: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .filter(|peer| peer.is_forwarding_eligible(local_network))
            .cloned()
            .collect();
        if eligible.is_empty() {
            return Err(PoolError::NoPeers);
        }

        let start = self.round_robin.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;
        for offset in 0..eligible.len() {
            let peer = &eligible[(start + offset) % eligible.len()];
            match peer.forward(request.clone()).await {
                Ok(mut response) => {
                    annotate_forwarded(&mut response);
                    self.cache.put(
                        request,
                        response.clone(),
                        ledger_sensitive,
                    );
                    return Ok(response);
                }
                Err(err) => {
                    peer.mark_failed();
                    last_error = Some(err.to_string());
                }
            }
        }
        Err(PoolError::Failed(
            last_error.unwrap_or_else(|| "no response".into()),
        ))
    }

    /// Hook for the publisher: a new ledger invalidates ledger-sensitive
    /// cached forwards.
    pub fn on_ledger_published(&self) {
        self.cache.invalidate_ledger_sensitive();
    }
}

fn annotate_forwarded(response: &mut Value) {
    if let Some(obj) = response.as_object_mut() {
        obj.insert("forwarded".into(), Value::Bool(true));
    }
}
