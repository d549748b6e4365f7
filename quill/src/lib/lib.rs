// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

pub mod http;
pub mod rpc;

use std::sync::Arc;

use node::database::rocksdb::RocksBackend;
use node::etl;
use node::peer::pool::LoadBalancer;
use node::peer::NetworkValidatedLedgers;
use node::storage::Store;
use node::subscriptions::SubscriptionManager;

/// The one backend this build ships. The storage layer stays generic; the
/// server pins it so handler plumbing needs no type parameters.
pub type NodeBackend = RocksBackend;

/// Applies a new log filter at runtime; wired to the subscriber's reload
/// handle by the binary.
pub type LogReloadFn =
    Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

/// Shared handles every RPC handler works against.
pub struct AppContext {
    pub store: Arc<Store<NodeBackend>>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub balancer: Arc<LoadBalancer>,
    pub etl_state: Arc<etl::State>,
    pub validated: Arc<NetworkValidatedLedgers>,
    pub log_reload: Option<LogReloadFn>,
}

impl AppContext {
    pub fn new(
        store: Arc<Store<NodeBackend>>,
        subscriptions: Arc<SubscriptionManager>,
        balancer: Arc<LoadBalancer>,
        etl_state: Arc<etl::State>,
        validated: Arc<NetworkValidatedLedgers>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            subscriptions,
            balancer,
            etl_state,
            validated,
            log_reload: None,
        })
    }

    /// Same as [`AppContext::new`] with runtime log reloading wired in.
    pub fn with_log_reload(
        store: Arc<Store<NodeBackend>>,
        subscriptions: Arc<SubscriptionManager>,
        balancer: Arc<LoadBalancer>,
        etl_state: Arc<etl::State>,
        validated: Arc<NetworkValidatedLedgers>,
        log_reload: LogReloadFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            subscriptions,
            balancer,
            etl_state,
            validated,
            log_reload: Some(log_reload),
        })
    }
}
