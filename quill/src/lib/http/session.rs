// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use node::subscriptions::FeedSink;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One WebSocket client. Everything written to the socket passes through
/// the bounded outgoing ring: RPC responses and subscription frames share
/// it, which serializes them per session. Overflow drops the oldest frame
/// and flags the client.
pub struct WsSession {
    id: u64,
    remote: IpAddr,
    capacity: usize,
    outgoing: Mutex<VecDeque<Arc<Value>>>,
    overflowed: AtomicBool,
    closed: AtomicBool,
    notify: Notify,
}

impl WsSession {
    pub fn new(remote: IpAddr, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            capacity: capacity.max(1),
            outgoing: Mutex::new(VecDeque::new()),
            overflowed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> IpAddr {
        self.remote
    }

    pub fn enqueue(&self, frame: Arc<Value>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut outgoing = self.outgoing.lock();
            if outgoing.len() >= self.capacity {
                outgoing.pop_front();
                self.overflowed.store(true, Ordering::Release);
                metrics::counter!("quill_ws_dropped_frames").increment(1);
            }
            outgoing.push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Drain pending frames, waiting when there are none. `None` once the
    /// session has closed and emptied.
    pub async fn next_batch(&self) -> Option<Vec<Arc<Value>>> {
        loop {
            {
                let mut outgoing = self.outgoing.lock();
                if !outgoing.is_empty() {
                    let mut batch: Vec<Arc<Value>> =
                        outgoing.drain(..).collect();
                    if self.overflowed.swap(false, Ordering::AcqRel) {
                        batch.insert(
                            0,
                            Arc::new(json!({
                                "type": "warning",
                                "warning": "subscriptionBufferFull",
                            })),
                        );
                    }
                    return Some(batch);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl FeedSink for WsSession {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn send(&self, msg: Arc<Value>) {
        self.enqueue(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64) -> Arc<Value> {
        Arc::new(json!({ "n": n }))
    }

    #[tokio::test]
    async fn frames_flow_in_order() {
        let session = WsSession::new([127, 0, 0, 1].into(), 16);
        session.enqueue(frame(1));
        session.enqueue(frame(2));

        let batch = session.next_batch().await.unwrap();
        let ns: Vec<u64> =
            batch.iter().map(|f| f["n"].as_u64().unwrap()).collect();
        assert_eq!(ns, vec![1, 2]);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_warns() {
        let session = WsSession::new([127, 0, 0, 1].into(), 2);
        for n in 1..=4 {
            session.enqueue(frame(n));
        }

        let batch = session.next_batch().await.unwrap();
        assert_eq!(batch[0]["warning"], "subscriptionBufferFull");
        let ns: Vec<u64> = batch[1..]
            .iter()
            .map(|f| f["n"].as_u64().unwrap())
            .collect();
        // The two oldest frames died.
        assert_eq!(ns, vec![3, 4]);
    }

    #[tokio::test]
    async fn close_wakes_the_writer() {
        let session = WsSession::new([127, 0, 0, 1].into(), 4);
        let writer = {
            let session = session.clone();
            tokio::spawn(async move { session.next_batch().await })
        };
        tokio::task::yield_now().await;
        session.close();
        assert!(writer.await.unwrap().is_none());
    }
}
