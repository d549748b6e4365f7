// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! Per-IP admission control: request and returned-byte counters, cleared
//! by a periodic sweep. Whitelisted addresses bypass everything.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::rpc::error::RpcError;
use node::exec::StopToken;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Returned bytes allowed per address per sweep window.
    pub max_fetches: u64,

    /// Requests allowed per address per sweep window.
    pub max_requests: u64,

    /// Counter reset cadence.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Addresses exempt from throttling.
    pub whitelist: Vec<IpAddr>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            max_fetches: 1024 * 1024,
            max_requests: 20,
            sweep_interval: Duration::from_secs(1),
            whitelist: vec![],
        }
    }
}

#[derive(Default)]
struct Counters {
    requests: u64,
    fetched_bytes: u64,
}

pub struct DosGuard {
    params: Params,
    whitelist: HashSet<IpAddr>,
    counters: Mutex<HashMap<IpAddr, Counters>>,
}

impl DosGuard {
    pub fn new(params: Params) -> Self {
        let whitelist = params.whitelist.iter().copied().collect();
        Self {
            params,
            whitelist,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.contains(ip)
    }

    /// Admission check for one incoming request; counts it.
    pub fn request(&self, ip: IpAddr) -> Result<(), RpcError> {
        if self.is_whitelisted(&ip) {
            return Ok(());
        }

        let mut counters = self.counters.lock();
        let entry = counters.entry(ip).or_default();
        entry.requests += 1;
        if entry.requests > self.params.max_requests
            || entry.fetched_bytes > self.params.max_fetches
        {
            debug!(event = "dos guard rejection", %ip);
            metrics::counter!("quill_dosguard_rejections").increment(1);
            return Err(RpcError::SlowDown);
        }
        Ok(())
    }

    /// Account bytes returned to `ip`; true while the address stays under
    /// its caps.
    pub fn add(&self, ip: IpAddr, bytes: u64) -> bool {
        if self.is_whitelisted(&ip) {
            return true;
        }

        let mut counters = self.counters.lock();
        let entry = counters.entry(ip).or_default();
        entry.fetched_bytes += bytes;
        entry.fetched_bytes <= self.params.max_fetches
    }

    pub fn is_ok(&self, ip: &IpAddr) -> bool {
        if self.is_whitelisted(ip) {
            return true;
        }
        let counters = self.counters.lock();
        match counters.get(ip) {
            Some(entry) => {
                entry.requests <= self.params.max_requests
                    && entry.fetched_bytes <= self.params.max_fetches
            }
            None => true,
        }
    }

    pub fn clear(&self) {
        self.counters.lock().clear();
    }

    /// The sweep timer: clears all counters every interval until stopped.
    pub async fn run_sweeper(&self, token: StopToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.params.sweep_interval) => {
                    self.clear();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn guard(max_requests: u64, max_fetches: u64) -> DosGuard {
        DosGuard::new(Params {
            max_requests,
            max_fetches,
            ..Params::default()
        })
    }

    #[test]
    fn request_cap_trips() {
        let guard = guard(3, u64::MAX);
        for _ in 0..3 {
            assert!(guard.request(ip(1)).is_ok());
        }
        assert_eq!(guard.request(ip(1)).unwrap_err(), RpcError::SlowDown);

        // Other addresses are unaffected.
        assert!(guard.request(ip(2)).is_ok());
    }

    #[test]
    fn byte_cap_trips_and_clears() {
        let guard = guard(u64::MAX, 1000);

        assert!(guard.add(ip(1), 600));
        assert!(guard.is_ok(&ip(1)));
        assert!(!guard.add(ip(1), 600));
        assert!(!guard.is_ok(&ip(1)));

        guard.clear();
        assert!(guard.is_ok(&ip(1)));
        assert!(guard.add(ip(1), 600));
    }

    #[test]
    fn whitelist_bypasses_everything() {
        let guard = DosGuard::new(Params {
            max_requests: 0,
            max_fetches: 0,
            whitelist: vec![ip(9)],
            ..Params::default()
        });

        assert!(guard.request(ip(9)).is_ok());
        assert!(guard.add(ip(9), u64::MAX));
        assert!(guard.is_ok(&ip(9)));

        // Whitelisted adds are a no-op after clear as well.
        guard.clear();
        assert!(guard.add(ip(9), 1));
        assert!(guard.is_ok(&ip(9)));
    }
}
