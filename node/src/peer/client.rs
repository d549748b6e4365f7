// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! Id-correlated JSON requests over the peer WebSocket. One socket serves
//! both the subscription streams and request/response commands; frames
//! carrying a known `id` resolve a pending call, everything else is a
//! stream event for the peer's read loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

pub struct WsClient {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl Default for WsClient {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(None),
        }
    }
}

impl WsClient {
    /// Bind the client to a freshly connected socket's writer half.
    pub fn attach(&self, sender: mpsc::UnboundedSender<Message>) {
        *self.outgoing.lock() = Some(sender);
    }

    /// Tear down after a disconnect; every in-flight call fails fast.
    pub fn detach(&self) {
        *self.outgoing.lock() = None;
        self.pending.lock().clear();
    }

    pub fn is_attached(&self) -> bool {
        self.outgoing.lock().is_some()
    }

    /// Issue `request` (its `id` field is overwritten) and await the
    /// correlated response frame.
    pub async fn call(
        &self,
        mut request: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        request["id"] = Value::from(id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let sent = {
            let outgoing = self.outgoing.lock();
            match outgoing.as_ref() {
                Some(sender) => sender
                    .send(Message::Text(request.to_string()))
                    .is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending.lock().remove(&id);
            bail!("peer socket is not connected");
        }

        let response = tokio::time::timeout(timeout, rx).await;
        match response {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => bail!("peer connection lost mid-request"),
            Err(_) => {
                self.pending.lock().remove(&id);
                bail!("peer request timed out after {timeout:?}")
            }
        }
    }

    /// Route an incoming frame. Returns the frame back when it is not a
    /// response to a pending call.
    pub fn dispatch(&self, frame: Value) -> Option<Value> {
        let id = frame.get("id").and_then(Value::as_u64);
        if let Some(id) = id {
            if let Some(waiter) = self.pending.lock().remove(&id) {
                let _ = waiter.send(frame);
                return None;
            }
        }
        Some(frame)
    }
}

/// Unwrap the peer's JSON envelope, surfacing error responses.
pub fn unwrap_result(frame: Value) -> Result<Value> {
    match frame.get("status").and_then(Value::as_str) {
        Some("success") => frame
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("success frame without result")),
        _ => {
            let error = frame
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            bail!("peer returned error: {error}")
        }
    }
}
