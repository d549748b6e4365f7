// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! The RPC engine: a fixed-capacity work queue fronting a worker pool,
//! per-method handler dispatch with api-version clamping, DoS admission,
//! and forward-to-peer with its short-TTL cache.

pub mod dos_guard;
pub mod error;
pub mod forward;
pub mod handlers;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use node::exec::StopToken;
use node::subscriptions::FeedSink;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{error, info_span, Instrument};

use crate::AppContext;
use dos_guard::DosGuard;
use error::RpcError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Worker tasks draining the queue.
    pub workers: usize,

    /// Fixed capacity of the work queue; overflow answers `tooBusy`.
    pub queue_capacity: usize,

    pub api_version_min: u32,
    pub api_version_max: u32,
    pub api_version_default: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            api_version_min: 1,
            api_version_max: 2,
            api_version_default: 1,
        }
    }
}

/// One admitted request travelling to a worker.
pub struct RpcRequest {
    pub method: String,
    pub params: Value,
    pub id: Option<Value>,
    pub is_admin: bool,
    pub client_ip: IpAddr,
    pub session: Option<Arc<dyn FeedSink>>,
}

/// What a worker hands back to the transport.
#[derive(Debug)]
pub enum RpcOutcome {
    /// A locally produced `result` object; the transport wraps it.
    Result(Value),
    /// A peer's response envelope, passed through verbatim.
    Forwarded(Value),
}

/// Everything a handler gets to work with.
pub struct HandlerContext {
    pub app: Arc<AppContext>,
    pub params: Value,
    pub api_version: u32,
    pub is_admin: bool,
    pub session: Option<Arc<dyn FeedSink>>,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError>;
}

pub struct MethodEntry {
    pub handler: Box<dyn Handler>,
    pub admin_only: bool,
}

struct Job {
    request: RpcRequest,
    respond: oneshot::Sender<Result<RpcOutcome, RpcError>>,
}

pub struct RpcEngine {
    app: Arc<AppContext>,
    registry: HashMap<&'static str, MethodEntry>,
    dos: Arc<DosGuard>,
    params: Params,
    jobs_tx: async_channel::Sender<Job>,
    jobs_rx: async_channel::Receiver<Job>,
    next_span: AtomicU64,
}

impl RpcEngine {
    pub fn new(
        app: Arc<AppContext>,
        dos: Arc<DosGuard>,
        params: Params,
    ) -> Arc<Self> {
        let (jobs_tx, jobs_rx) =
            async_channel::bounded(params.queue_capacity.max(1));
        Arc::new(Self {
            registry: handlers::register(),
            app,
            dos,
            params,
            jobs_tx,
            jobs_rx,
            next_span: AtomicU64::new(1),
        })
    }

    pub fn dos_guard(&self) -> &Arc<DosGuard> {
        &self.dos
    }

    /// Spawn the worker pool and the DoS sweep timer.
    pub fn start(self: &Arc<Self>, token: StopToken) {
        for worker in 0..self.params.workers.max(1) {
            let engine = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                engine.worker_loop(worker, token).await;
            });
        }

        let dos = self.dos.clone();
        tokio::spawn(async move {
            dos.run_sweeper(token).await;
        });
    }

    /// Admission and queueing. Fails fast with `SlowDown` (DoS guard) or
    /// `TooBusy` (queue full); otherwise resolves once a worker finishes.
    pub async fn submit(
        &self,
        request: RpcRequest,
    ) -> Result<RpcOutcome, RpcError> {
        self.dos.request(request.client_ip)?;

        let (respond, ready) = oneshot::channel();
        let job = Job { request, respond };
        if self.jobs_tx.try_send(job).is_err() {
            metrics::counter!("quill_rpc_queue_full").increment(1);
            return Err(RpcError::TooBusy);
        }

        ready.await.map_err(|_| RpcError::Cancelled)?
    }

    /// Account bytes shipped back to a client.
    pub fn account_response(&self, ip: IpAddr, bytes: usize) {
        self.dos.add(ip, bytes as u64);
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, token: StopToken) {
        loop {
            let job = tokio::select! {
                _ = token.cancelled() => break,
                job = self.jobs_rx.recv() => match job {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };

            let span_id = self.next_span.fetch_add(1, Ordering::Relaxed);
            let span = info_span!("rpc", span_id, worker);
            let outcome =
                self.dispatch(job.request).instrument(span).await;
            let _ = job.respond.send(outcome);
        }
    }

    async fn dispatch(
        &self,
        request: RpcRequest,
    ) -> Result<RpcOutcome, RpcError> {
        metrics::counter!("quill_rpc_requests", "method" => request.method.clone())
            .increment(1);

        let api_version = self.parse_api_version(&request.params)?;

        // Raw passthrough to a peer when the request wants one.
        if forward::should_forward(&request.method, &request.params) {
            let mut raw = request.params.clone();
            if let Some(obj) = raw.as_object_mut() {
                obj.insert(
                    "command".into(),
                    Value::String(request.method.clone()),
                );
            }
            let response =
                forward::forward(&self.app, &request.method, &raw).await?;
            return Ok(RpcOutcome::Forwarded(response));
        }

        // An amendment-blocked node answers nothing it cannot forward.
        if self.app.etl_state.amendment().is_blocked() {
            return Err(RpcError::AmendmentBlocked);
        }

        let entry = self
            .registry
            .get(request.method.as_str())
            .ok_or_else(|| {
                RpcError::UnknownCommand(request.method.clone())
            })?;
        if entry.admin_only && !request.is_admin {
            return Err(RpcError::NoPermission);
        }

        let ctx = HandlerContext {
            app: self.app.clone(),
            params: request.params,
            api_version,
            is_admin: request.is_admin,
            session: request.session,
        };

        // Handler panics become internal errors; the server never dies
        // for one request.
        let called = std::panic::AssertUnwindSafe(entry.handler.call(ctx))
            .catch_unwind()
            .await;
        match called {
            Ok(result) => result.map(RpcOutcome::Result),
            Err(_) => {
                error!(
                    event = "handler panicked",
                    method = request.method,
                );
                Err(RpcError::Internal("handler panicked".into()))
            }
        }
    }

    fn parse_api_version(&self, params: &Value) -> Result<u32, RpcError> {
        match params.get("api_version") {
            None | Some(Value::Null) => Ok(self.params.api_version_default),
            Some(value) => {
                let version = value
                    .as_u64()
                    .ok_or(RpcError::InvalidApiVersion)?
                    as u32;
                if version < self.params.api_version_min
                    || version > self.params.api_version_max
                {
                    return Err(RpcError::InvalidApiVersion);
                }
                Ok(version)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use node::database::rocksdb::RocksBackend;
    use node::database::DatabaseOptions;
    use node::etl;
    use node::peer::pool::LoadBalancer;
    use node::peer::NetworkValidatedLedgers;
    use node::storage::{self, Store};
    use node::subscriptions::SubscriptionManager;
    use serde_json::json;

    use super::*;

    pub(crate) fn test_app(dir: &tempfile::TempDir) -> Arc<AppContext> {
        let backend = Arc::new(RocksBackend::create_or_open(
            dir.path(),
            DatabaseOptions::default(),
        ));
        let store = Arc::new(
            Store::open(
                backend,
                storage::Params {
                    key_shift: 16,
                    ..storage::Params::default()
                },
            )
            .unwrap(),
        );
        AppContext::new(
            store,
            SubscriptionManager::new(),
            LoadBalancer::new(vec![], Duration::from_secs(2), 64),
            etl::State::new(),
            NetworkValidatedLedgers::new(),
        )
    }

    fn engine(app: Arc<AppContext>, params: Params) -> Arc<RpcEngine> {
        RpcEngine::new(
            app,
            Arc::new(DosGuard::new(dos_guard::Params::default())),
            params,
        )
    }

    fn request(method: &str, params: Value) -> RpcRequest {
        RpcRequest {
            method: method.into(),
            params,
            id: None,
            is_admin: false,
            client_ip: IpAddr::from([127, 0, 0, 1]),
            session: None,
        }
    }

    #[tokio::test]
    async fn unknown_method() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine(test_app(&dir), Params::default());
        engine.start(StopToken::new());

        let err = engine
            .submit(request("definitely_not_a_method", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::UnknownCommand(_)));
    }

    #[tokio::test]
    async fn version_clamp() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine(test_app(&dir), Params::default());
        engine.start(StopToken::new());

        let err = engine
            .submit(request("ping", json!({"api_version": 99})))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::InvalidApiVersion);

        // In-range and absent versions both pass.
        assert!(engine
            .submit(request("ping", json!({"api_version": 2})))
            .await
            .is_ok());
        assert!(engine.submit(request("ping", json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn queue_overflow_answers_too_busy() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine(
            test_app(&dir),
            Params {
                workers: 1,
                queue_capacity: 1,
                ..Params::default()
            },
        );
        // No worker started: the queue only fills.

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.submit(request("ping", json!({}))).await
            })
        };
        tokio::task::yield_now().await;

        let err = engine
            .submit(request("ping", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::TooBusy);
        first.abort();
    }

    #[tokio::test]
    async fn admin_gate() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = engine(test_app(&dir), Params::default());
        engine.start(StopToken::new());

        let err = engine
            .submit(request("ledger_accept", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::NoPermission);

        let mut admin = request("ledger_accept", json!({}));
        admin.is_admin = true;
        assert!(engine.submit(admin).await.is_ok());
    }

    #[tokio::test]
    async fn amendment_block_rejects_local_methods() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = test_app(&dir);
        app.etl_state.amendment().block("test");
        let engine = engine(app, Params::default());
        engine.start(StopToken::new());

        let err = engine
            .submit(request("ping", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::AmendmentBlocked);

        // Forwardable methods still try to reach a peer (and fail with
        // NoPeers here, not AmendmentBlocked).
        let err = engine
            .submit(request("fee", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::NoPeers);
    }
}
