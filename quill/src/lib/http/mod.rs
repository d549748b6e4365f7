// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! The HTTP/1.1 front door: JSON POST requests, WebSocket upgrades with
//! per-session strands, admin-role verification and the metrics endpoint.

mod session;

pub use session::WsSession;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_tungstenite::{tungstenite::Message, HyperWebsocket};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use node::exec::StopToken;
use node::subscriptions::FeedSink;
use node::LongLivedService;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::rpc::error::RpcError;
use crate::rpc::{RpcEngine, RpcOutcome, RpcRequest};
use crate::AppContext;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen_address: SocketAddr,

    /// When set, requests bearing `Authorization: Password <sha256(pw)>`
    /// are admin.
    pub admin_password: Option<String>,

    /// Loopback clients are admin without a password.
    pub allow_local_admin: bool,

    /// Outgoing ring capacity per WebSocket session.
    pub ws_send_queue_capacity: usize,

    /// Expose `GET /metrics`.
    pub metrics_enabled: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_address: ([127, 0, 0, 1], 51233).into(),
            admin_password: None,
            allow_local_admin: true,
            ws_send_queue_capacity: 1000,
            metrics_enabled: false,
        }
    }
}

pub struct HttpServer {
    config: HttpConfig,
    app: Arc<AppContext>,
    engine: Arc<RpcEngine>,
    metrics: Option<PrometheusHandle>,
    /// Reports the actually bound address (for port 0 in tests).
    bound: tokio::sync::watch::Sender<Option<SocketAddr>>,
}

impl HttpServer {
    pub fn new(
        config: HttpConfig,
        app: Arc<AppContext>,
        engine: Arc<RpcEngine>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let (bound, _) = tokio::sync::watch::channel(None);
        Self {
            config,
            app,
            engine,
            metrics,
            bound,
        }
    }

    pub fn bound_address(
        &self,
    ) -> tokio::sync::watch::Receiver<Option<SocketAddr>> {
        self.bound.subscribe()
    }
}

#[async_trait]
impl LongLivedService for HttpServer {
    async fn execute(&mut self, token: StopToken) -> anyhow::Result<usize> {
        self.engine.start(token.clone());

        let listener =
            TcpListener::bind(self.config.listen_address).await?;
        let local = listener.local_addr()?;
        let _ = self.bound.send(Some(local));
        info!(event = "http server listening", address = %local);

        loop {
            let (stream, remote) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };

            let service = ConnectionService {
                app: self.app.clone(),
                engine: self.engine.clone(),
                config: Arc::new(self.config.clone()),
                metrics: self.metrics.clone(),
                remote: remote.ip(),
                token: token.child_token(),
            };

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let handler = hyper::service::service_fn({
                    let service = service.clone();
                    move |request| {
                        let service = service.clone();
                        async move { service.handle(request).await }
                    }
                });
                let connection = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, handler)
                    .with_upgrades();
                if let Err(err) = connection.await {
                    debug!(event = "connection error", err = %err);
                }
            });
        }

        info!(event = "http server stopped");
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[derive(Clone)]
struct ConnectionService {
    app: Arc<AppContext>,
    engine: Arc<RpcEngine>,
    config: Arc<HttpConfig>,
    metrics: Option<PrometheusHandle>,
    remote: IpAddr,
    token: StopToken,
}

impl ConnectionService {
    async fn handle(
        self,
        mut request: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        if hyper_tungstenite::is_upgrade_request(&request) {
            let is_admin = self.verify_admin(&request);
            match hyper_tungstenite::upgrade(&mut request, None) {
                Ok((response, websocket)) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        service.run_ws_session(websocket, is_admin).await;
                    });
                    return Ok(response);
                }
                Err(err) => {
                    warn!(event = "ws upgrade failed", err = %err);
                    return Ok(plain_response(
                        StatusCode::BAD_REQUEST,
                        "bad websocket upgrade",
                    ));
                }
            }
        }

        match (request.method(), request.uri().path()) {
            (&Method::GET, "/metrics") => Ok(self.metrics_response()),
            (&Method::GET, "/health") => Ok(json_response(
                StatusCode::OK,
                &json!({"status": "up"}),
            )),
            (&Method::POST, "/") => {
                let is_admin = self.verify_admin(&request);
                let body =
                    request.into_body().collect().await?.to_bytes();
                Ok(self.handle_post(&body, is_admin).await)
            }
            _ => Ok(plain_response(StatusCode::NOT_FOUND, "not found")),
        }
    }

    fn metrics_response(&self) -> Response<Full<Bytes>> {
        match (&self.metrics, self.config.metrics_enabled) {
            (Some(handle), true) => {
                let body = handle.render();
                Response::builder()
                    .status(StatusCode::OK)
                    .header(
                        "content-type",
                        "text/plain; version=0.0.4",
                    )
                    .body(Full::new(Bytes::from(body)))
                    .expect("static response is well formed")
            }
            _ => plain_response(
                StatusCode::NOT_FOUND,
                "metrics disabled",
            ),
        }
    }

    /// `POST /` carries `{"method": ..., "params": [{...}]}`.
    async fn handle_post(
        &self,
        body: &[u8],
        is_admin: bool,
    ) -> Response<Full<Bytes>> {
        let parsed: Value = match serde_json::from_slice(body) {
            Ok(parsed) => parsed,
            Err(_) => {
                let err = RpcError::InvalidParams(
                    "request body is not JSON".into(),
                );
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &json!({"result": err.to_json(None)}),
                );
            }
        };

        let method = parsed
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let Some(method) = method else {
            let err =
                RpcError::InvalidParams("missing 'method'".into());
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({"result": err.to_json(None)}),
            );
        };
        let params = parsed
            .get("params")
            .and_then(Value::as_array)
            .and_then(|params| params.first())
            .cloned()
            .unwrap_or_else(|| json!({}));

        let outcome = self
            .engine
            .submit(RpcRequest {
                method,
                params,
                id: None,
                is_admin,
                client_ip: self.remote,
                session: None,
            })
            .await;

        let body = match outcome {
            Ok(RpcOutcome::Result(mut result)) => {
                if let Some(obj) = result.as_object_mut() {
                    obj.insert("status".into(), "success".into());
                }
                json!({ "result": result })
            }
            Ok(RpcOutcome::Forwarded(envelope)) => {
                json!({ "result": flatten_forwarded(envelope) })
            }
            Err(err) => json!({ "result": err.to_json(None) }),
        };

        let rendered = json_response(StatusCode::OK, &body);
        self.engine
            .account_response(self.remote, response_len(&rendered));
        rendered
    }

    /// One WebSocket session: a reader loop feeding the engine and a
    /// writer loop draining the session ring.
    async fn run_ws_session(&self, websocket: HyperWebsocket, is_admin: bool) {
        let stream = match websocket.await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(event = "ws handshake failed", err = %err);
                return;
            }
        };
        let (mut sink, mut source) = stream.split();

        let session = WsSession::new(
            self.remote,
            self.config.ws_send_queue_capacity,
        );
        info!(
            event = "ws session opened",
            session = session.id(),
            remote = %self.remote,
        );

        let writer = {
            let session = session.clone();
            tokio::spawn(async move {
                while let Some(batch) = session.next_batch().await {
                    for frame in batch {
                        let rendered = frame.to_string();
                        if sink
                            .send(Message::Text(rendered))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
            })
        };

        loop {
            let message = tokio::select! {
                _ = self.token.cancelled() => break,
                message = source.next() => message,
            };
            let Some(Ok(message)) = message else { break };
            let text = match message {
                Message::Text(text) => text,
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => break,
                _ => continue,
            };

            let response = self
                .handle_ws_command(&text, &session, is_admin)
                .await;
            self.engine.account_response(
                self.remote,
                response.to_string().len(),
            );
            session.enqueue(Arc::new(response));
        }

        session.close();
        self.app.subscriptions.clear_session(session.id());
        let _ = writer.await;
        info!(event = "ws session closed", session = session.id());
    }

    /// WebSocket requests carry their parameters flat alongside
    /// `command` and `id`.
    async fn handle_ws_command(
        &self,
        text: &str,
        session: &Arc<WsSession>,
        is_admin: bool,
    ) -> Value {
        let parsed: Value = match serde_json::from_str(text) {
            Ok(parsed) => parsed,
            Err(_) => {
                return RpcError::InvalidParams(
                    "frame is not JSON".into(),
                )
                .to_json(None)
            }
        };
        let id = parsed.get("id").cloned();

        let method = parsed
            .get("command")
            .or_else(|| parsed.get("method"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        let Some(method) = method else {
            return RpcError::InvalidParams("missing 'command'".into())
                .to_json(id.as_ref());
        };

        let sink: Arc<dyn FeedSink> = session.clone();
        let outcome = self
            .engine
            .submit(RpcRequest {
                method,
                params: parsed,
                id: id.clone(),
                is_admin,
                client_ip: self.remote,
                session: Some(sink),
            })
            .await;

        match outcome {
            Ok(RpcOutcome::Result(result)) => {
                let mut envelope = json!({
                    "result": result,
                    "status": "success",
                    "type": "response",
                });
                if let Some(id) = id {
                    envelope["id"] = id;
                }
                envelope
            }
            Ok(RpcOutcome::Forwarded(mut envelope)) => {
                if let Some(id) = id {
                    envelope["id"] = id;
                }
                envelope
            }
            Err(err) => err.to_json(id.as_ref()),
        }
    }

    /// Admin iff the configured password digest matches, or the client is
    /// loopback and local admin is allowed.
    fn verify_admin(&self, request: &Request<Incoming>) -> bool {
        if let Some(password) = &self.config.admin_password {
            let expected = format!(
                "Password {}",
                hex::encode(Sha256::digest(password.as_bytes()))
            );
            return request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .map(|value| value.eq_ignore_ascii_case(&expected))
                .unwrap_or(false);
        }
        self.config.allow_local_admin && self.remote.is_loopback()
    }
}

fn plain_response(
    status: StatusCode,
    body: &'static str,
) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("static response is well formed")
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("json response is well formed")
}

fn response_len(response: &Response<Full<Bytes>>) -> usize {
    use hyper::body::Body;
    response.body().size_hint().exact().unwrap_or(0) as usize
}

/// Peers answer in WebSocket envelope shape; HTTP clients expect the
/// payload inside `result`.
fn flatten_forwarded(envelope: Value) -> Value {
    let forwarded = envelope
        .get("forwarded")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let mut result = match envelope.get("result") {
        Some(result) => result.clone(),
        None => envelope,
    };
    if let Some(obj) = result.as_object_mut() {
        obj.insert("forwarded".into(), Value::Bool(forwarded));
        obj.entry("status").or_insert_with(|| "success".into());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_flattening() {
        let envelope = json!({
            "result": {"fee": 10},
            "status": "success",
            "forwarded": true,
        });
        let flat = flatten_forwarded(envelope);
        assert_eq!(flat["fee"], 10);
        assert_eq!(flat["forwarded"], true);
        assert_eq!(flat["status"], "success");
    }

    #[test]
    fn default_config_is_local() {
        let config = HttpConfig::default();
        assert!(config.allow_local_admin);
        assert!(config.admin_password.is_none());
        assert_eq!(config.listen_address.port(), 51233);
    }
}
