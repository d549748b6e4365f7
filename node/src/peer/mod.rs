// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! A single upstream validator peer: WebSocket subscription to its
//! validated-ledger and transaction streams, id-correlated ledger fetch
//! commands over the same socket, and HTTP/WS request forwarding.

mod client;
pub mod pool;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use node_data::events::StreamKind;
use node_data::ledger::{
    account_from_base58, Hash, LedgerHeader, ObjectDiff, Transaction,
};
use node_data::Serializable;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::exec::StopToken;
use crate::subscriptions::SubscriptionManager;
use client::{unwrap_result, WsClient};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect backoff bounds.
const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub hostname: String,
    pub ws_port: u16,
    #[serde(default)]
    pub http_port: Option<u16>,
}

impl PeerConfig {
    fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.hostname, self.ws_port)
    }

    fn http_url(&self) -> Option<String> {
        self.http_port
            .map(|port| format!("http://{}:{}", self.hostname, port))
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.hostname, self.ws_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

/// Process-wide monotone record of the highest sequence any peer has seen
/// validated. Extractors park here until their next sequence exists.
pub struct NetworkValidatedLedgers {
    latest: watch::Sender<u32>,
}

impl Default for NetworkValidatedLedgers {
    fn default() -> Self {
        let (latest, _) = watch::channel(0);
        Self { latest }
    }
}

impl NetworkValidatedLedgers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notify(&self, sequence: u32) {
        self.latest.send_if_modified(|latest| {
            if sequence > *latest {
                *latest = sequence;
                true
            } else {
                false
            }
        });
    }

    pub fn latest(&self) -> u32 {
        *self.latest.borrow()
    }

    /// Suspend until some peer has validated `sequence` or the token
    /// fires. Returns false on cancellation.
    pub async fn wait_for(&self, sequence: u32, token: &StopToken) -> bool {
        let mut rx = self.latest.subscribe();
        loop {
            if *rx.borrow_and_update() >= sequence {
                return true;
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// A ledger fetched in full from a peer.
#[derive(Debug, Default)]
pub struct FetchedLedger {
    pub header: LedgerHeader,
    pub diffs: Vec<ObjectDiff>,
    pub transactions: Vec<Transaction>,
}

pub struct Peer {
    config: PeerConfig,
    state: RwLock<PeerState>,
    network_id: AtomicU32,
    has_network_id: AtomicU32,
    last_failure: Mutex<Option<Instant>>,
    client: WsClient,
    http: reqwest::Client,
    validated: Arc<NetworkValidatedLedgers>,
    subscriptions: Arc<SubscriptionManager>,
}

impl Peer {
    pub fn new(
        config: PeerConfig,
        validated: Arc<NetworkValidatedLedgers>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: RwLock::new(PeerState::Disconnected),
            network_id: AtomicU32::new(0),
            has_network_id: AtomicU32::new(0),
            last_failure: Mutex::new(None),
            client: WsClient::default(),
            http: reqwest::Client::new(),
            validated,
            subscriptions,
        })
    }

    pub fn label(&self) -> String {
        self.config.label()
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    pub fn network_id(&self) -> Option<u32> {
        (self.has_network_id.load(Ordering::Acquire) != 0)
            .then(|| self.network_id.load(Ordering::Acquire))
    }

    pub fn last_failure(&self) -> Option<Instant> {
        *self.last_failure.lock()
    }

    pub fn mark_failed(&self) {
        *self.last_failure.lock() = Some(Instant::now());
    }

    /// Subscribed peers on the right network may serve forwarded client
    /// requests.
    pub fn is_forwarding_eligible(&self, local_network: Option<u32>) -> bool {
        self.state() == PeerState::Subscribed
            && match (local_network, self.network_id()) {
                (Some(local), Some(peer)) => local == peer,
                _ => true,
            }
    }

    /// Drive the connection state machine until the token fires.
    pub async fn run(self: Arc<Self>, token: StopToken) {
        let mut backoff = RECONNECT_BASE;
        loop {
            if token.is_cancelled() {
                break;
            }

            *self.state.write() = PeerState::Connecting;
            let connected_at = Instant::now();
            match self.session(&token).await {
                Ok(()) => break,
                Err(err) => {
                    self.mark_failed();
                    warn!(
                        event = "peer connection lost",
                        peer = self.label(),
                        err = %err,
                    );
                }
            }
            self.client.detach();
            *self.state.write() = PeerState::Disconnected;

            // A connection that survived a while earns a fresh backoff.
            if connected_at.elapsed() > RECONNECT_CAP {
                backoff = RECONNECT_BASE;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_CAP);
        }

        self.client.detach();
        *self.state.write() = PeerState::Disconnected;
    }

    /// One connected session: handshake, subscribe, then pump frames.
    async fn session(&self, token: &StopToken) -> Result<()> {
        let url = self.config.ws_url();
        let (socket, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("connecting {url}"))?;
        let (mut writer, mut reader) = socket.split();
        *self.state.write() = PeerState::Connected;
        info!(event = "peer connected", peer = self.label());

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        self.client.attach(out_tx);

        let writer_token = token.child_token();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_token.cancelled() => break,
                    msg = out_rx.recv() => match msg {
                        Some(msg) => {
                            if writer.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let handshake = async {
            // Learn the peer's network and current validated tip.
            let info = self
                .client
                .call(json!({"command": "server_info"}), REQUEST_TIMEOUT);

            // The read loop is not running yet, so pump frames inline
            // until the handshake resolves.
            tokio::pin!(info);
            loop {
                tokio::select! {
                    outcome = &mut info => break outcome,
                    frame = reader.next() => {
                        self.consume_frame(frame).ok_or_else(|| {
                            anyhow!("peer closed during handshake")
                        })??;
                    }
                }
            }
        };
        let info = unwrap_result(handshake.await?)?;

        if let Some(network) = info
            .pointer("/info/network_id")
            .and_then(Value::as_u64)
        {
            self.network_id.store(network as u32, Ordering::Release);
            self.has_network_id.store(1, Ordering::Release);
        }
        if let Some(sequence) = info
            .pointer("/info/validated_ledger/seq")
            .and_then(Value::as_u64)
        {
            self.validated.notify(sequence as u32);
        }

        let subscribe = async {
            let req = self.client.call(
                json!({
                    "command": "subscribe",
                    "streams": [
                        "ledger",
                        "transactions_proposed",
                        "manifests",
                        "validations",
                    ],
                }),
                REQUEST_TIMEOUT,
            );
            tokio::pin!(req);
            loop {
                tokio::select! {
                    outcome = &mut req => break outcome,
                    frame = reader.next() => {
                        self.consume_frame(frame).ok_or_else(|| {
                            anyhow!("peer closed during subscribe")
                        })??;
                    }
                }
            }
        };
        unwrap_result(subscribe.await?)?;

        *self.state.write() = PeerState::Subscribed;
        info!(
            event = "peer subscribed",
            peer = self.label(),
            network_id = ?self.network_id(),
        );

        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                frame = reader.next() => {
                    match self.consume_frame(frame) {
                        Some(Ok(())) => {}
                        Some(Err(err)) => break Err(err),
                        None => {
                            break Err(anyhow!("peer closed the socket"))
                        }
                    }
                }
            }
        };

        writer_task.abort();
        outcome
    }

    /// Feed one raw frame through the client correlation map and the
    /// stream handlers. `None` means the socket ended.
    fn consume_frame(
        &self,
        frame: Option<
            std::result::Result<
                Message,
                tokio_tungstenite::tungstenite::Error,
            >,
        >,
    ) -> Option<Result<()>> {
        let frame = match frame? {
            Ok(frame) => frame,
            Err(err) => return Some(Err(err.into())),
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => return Some(Ok(())),
            Message::Close(_) => return None,
            _ => return Some(Ok(())),
        };
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                debug!(
                    event = "undecodable peer frame",
                    peer = self.label(),
                    err = %err,
                );
                return Some(Ok(()));
            }
        };
        if let Some(event) = self.client.dispatch(value) {
            self.on_stream_event(event);
        }
        Some(Ok(()))
    }

    fn on_stream_event(&self, event: Value) {
        match event.get("type").and_then(Value::as_str) {
            Some("ledgerClosed") => {
                if let Some(sequence) =
                    event.get("ledger_index").and_then(Value::as_u64)
                {
                    self.validated.notify(sequence as u32);
                }
            }
            Some("transaction") => self
                .subscriptions
                .publish_upstream(StreamKind::TransactionsProposed, event),
            Some("manifestReceived") => self
                .subscriptions
                .publish_upstream(StreamKind::Manifests, event),
            Some("validationReceived") => self
                .subscriptions
                .publish_upstream(StreamKind::Validations, event),
            _ => {}
        }
    }

    // ---- Fetch operations ----

    /// Fetch one validated ledger in full.
    pub async fn fetch_ledger(
        &self,
        sequence: u32,
        get_objects: bool,
        get_object_neighbors: bool,
    ) -> Result<FetchedLedger> {
        let result = self
            .client
            .call(
                json!({
                    "command": "ledger",
                    "ledger_index": sequence,
                    "binary": true,
                    "transactions": true,
                    "get_objects": get_objects,
                    "get_object_neighbors": get_object_neighbors,
                }),
                REQUEST_TIMEOUT,
            )
            .await?;
        let result = unwrap_result(result)?;
        parse_fetched_ledger(&result)
    }

    /// Marker-partitioned scan of one full ledger's state, used for the
    /// initial load. Markers run concurrently, each paging its slice.
    pub async fn load_initial_ledger(
        self: &Arc<Self>,
        sequence: u32,
        num_markers: usize,
    ) -> Result<Vec<ObjectDiff>> {
        let num_markers = num_markers.clamp(1, 256);
        let mut tasks = tokio::task::JoinSet::new();
        for marker in 0..num_markers {
            let peer = self.clone();
            tasks.spawn(async move {
                peer.scan_marker(sequence, marker, num_markers).await
            });
        }

        let mut diffs = vec![];
        while let Some(joined) = tasks.join_next().await {
            diffs.extend(joined.context("marker scan died")??);
        }
        diffs.sort_by_key(|diff| diff.key);
        Ok(diffs)
    }

    async fn scan_marker(
        &self,
        sequence: u32,
        marker: usize,
        num_markers: usize,
    ) -> Result<Vec<ObjectDiff>> {
        let start = ((marker * 256) / num_markers) as u8;
        let end = ((marker + 1) * 256 / num_markers).min(256);

        let mut cursor = hex::encode({
            let mut key = [0u8; 32];
            key[0] = start;
            key
        });
        let mut out = vec![];

        loop {
            let result = self
                .client
                .call(
                    json!({
                        "command": "ledger_data",
                        "ledger_index": sequence,
                        "binary": true,
                        "marker": cursor,
                    }),
                    REQUEST_TIMEOUT,
                )
                .await?;
            let result = unwrap_result(result)?;

            for entry in result
                .get("state")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let diff = parse_object_entry(entry)?;
                if (diff.key[0] as usize) < end {
                    out.push(diff);
                }
            }

            match result.get("marker").and_then(Value::as_str) {
                Some(marker_hex) => {
                    let probe = hex::decode(marker_hex)
                        .context("bad ledger_data marker")?;
                    if probe.first().map(|b| *b as usize >= end) == Some(true)
                    {
                        break;
                    }
                    cursor = marker_hex.to_string();
                }
                None => break,
            }
        }

        Ok(out)
    }

    // ---- Forwarding ----

    /// Pass a client request through verbatim; WebSocket first, HTTP when
    /// the socket is down and an HTTP port is configured.
    pub async fn forward(&self, request: Value) -> Result<Value> {
        if self.client.is_attached() {
            if let Ok(mut response) =
                self.client.call(request.clone(), FORWARD_TIMEOUT).await
            {
                // The correlation id belongs to us, not the caller.
                if let Some(obj) = response.as_object_mut() {
                    obj.remove("id");
                }
                return Ok(response);
            }
        }

        let url = self
            .config
            .http_url()
            .ok_or_else(|| anyhow!("peer has no http endpoint"))?;
        let response = self
            .http
            .post(url)
            .json(&request)
            .timeout(FORWARD_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Runs every configured peer's connection state machine.
pub struct PeerSrv {
    peers: Vec<Arc<Peer>>,
}

impl PeerSrv {
    pub fn new(peers: Vec<Arc<Peer>>) -> Self {
        Self { peers }
    }
}

#[async_trait::async_trait]
impl crate::LongLivedService for PeerSrv {
    async fn execute(
        &mut self,
        token: crate::exec::StopToken,
    ) -> anyhow::Result<usize> {
        let mut tasks = tokio::task::JoinSet::new();
        for peer in &self.peers {
            let peer = peer.clone();
            let token = token.child_token();
            tasks.spawn(peer.run(token));
        }

        token.cancelled().await;
        while tasks.join_next().await.is_some() {}
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "peers"
    }
}

fn hex_field(value: &Value, field: &str) -> Result<Vec<u8>> {
    let raw = value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing field {field}"))?;
    hex::decode(raw).with_context(|| format!("bad hex in {field}"))
}

fn hash_field(value: &Value, field: &str) -> Result<Hash> {
    hex_field(value, field)?
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("field {field} is not a 256-bit hash"))
}

fn parse_object_entry(entry: &Value) -> Result<ObjectDiff> {
    let key = hash_field(entry, "index")?;
    let blob = match entry.get("data").and_then(Value::as_str) {
        Some(raw) => hex::decode(raw).context("bad hex in data")?,
        None => vec![],
    };
    let predecessor = match entry.get("predecessor") {
        Some(_) => Some(hash_field(entry, "predecessor")?),
        None => None,
    };
    let successor = match entry.get("successor") {
        Some(_) => Some(hash_field(entry, "successor")?),
        None => None,
    };
    Ok(ObjectDiff {
        key,
        blob,
        predecessor,
        successor,
    })
}

fn parse_fetched_ledger(result: &Value) -> Result<FetchedLedger> {
    let header_blob = hex_field(result, "ledger_header")?;
    let header = LedgerHeader::from_bytes(&header_blob)
        .map_err(|err| anyhow!("undecodable ledger header: {err}"))?;

    let mut diffs = vec![];
    for entry in result
        .get("objects")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        diffs.push(parse_object_entry(entry)?);
    }

    let mut transactions = vec![];
    for (position, entry) in result
        .get("transactions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
    {
        let mut accounts = vec![];
        for account in entry
            .get("accounts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let account = account
                .as_str()
                .ok_or_else(|| anyhow!("account is not a string"))?;
            accounts.push(account_from_base58(account)?);
        }
        transactions.push(Transaction {
            hash: hash_field(entry, "hash")?,
            ledger_sequence: header.sequence,
            transaction_index: position as u32,
            date: header.close_time,
            transaction_blob: hex_field(entry, "tx_blob")?,
            metadata_blob: hex_field(entry, "meta_blob")?,
            accounts,
        });
    }

    Ok(FetchedLedger {
        header,
        diffs,
        transactions,
    })
}

#[cfg(test)]
mod tests {
    use node_data::faker;
    use node_data::ledger::account_to_base58;

    use super::*;

    #[tokio::test]
    async fn validated_ledgers_wake_waiters() {
        let validated = NetworkValidatedLedgers::new();
        let token = StopToken::new();

        let waiter = {
            let validated = validated.clone();
            let token = token.clone();
            tokio::spawn(async move { validated.wait_for(42, &token).await })
        };

        validated.notify(41);
        validated.notify(42);
        assert!(waiter.await.unwrap());

        // Monotone: lower notifications never regress the tip.
        validated.notify(7);
        assert_eq!(validated.latest(), 42);
    }

    #[tokio::test]
    async fn wait_for_cancels() {
        let validated = NetworkValidatedLedgers::new();
        let token = StopToken::new();
        let waiter = {
            let validated = validated.clone();
            let token = token.clone();
            tokio::spawn(async move {
                validated.wait_for(100, &token).await
            })
        };
        token.cancel();
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn parse_fetched_ledger_round_trip() {
        let header = faker::gen_dummy_header(900);
        let account = faker::gen_account(4);

        let payload = json!({
            "ledger_header": hex::encode(header.to_bytes()),
            "objects": [
                {
                    "index": hex::encode([1u8; 32]),
                    "data": "deadbeef",
                    "predecessor": hex::encode([0u8; 32]),
                    "successor": hex::encode([2u8; 32]),
                },
                {
                    "index": hex::encode([2u8; 32]),
                },
            ],
            "transactions": [
                {
                    "hash": hex::encode([9u8; 32]),
                    "tx_blob": "aa",
                    "meta_blob": "bb",
                    "accounts": [account_to_base58(&account)],
                },
            ],
        });

        let fetched = parse_fetched_ledger(&payload).unwrap();
        assert_eq!(fetched.header, header);
        assert_eq!(fetched.diffs.len(), 2);
        assert_eq!(fetched.diffs[0].blob, vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(fetched.diffs[1].is_deleted());
        assert_eq!(fetched.transactions.len(), 1);
        assert_eq!(fetched.transactions[0].ledger_sequence, 900);
        assert_eq!(fetched.transactions[0].accounts, vec![account]);
    }

    #[test]
    fn forwarding_eligibility() {
        let validated = NetworkValidatedLedgers::new();
        let subs = SubscriptionManager::new();
        let peer = Peer::new(
            PeerConfig {
                hostname: "localhost".into(),
                ws_port: 6006,
                http_port: None,
            },
            validated,
            subs,
        );

        // Disconnected peers never serve forwards.
        assert!(!peer.is_forwarding_eligible(None));

        *peer.state.write() = PeerState::Subscribed;
        assert!(peer.is_forwarding_eligible(None));

        peer.network_id.store(21337, Ordering::Release);
        peer.has_network_id.store(1, Ordering::Release);
        assert!(peer.is_forwarding_eligible(Some(21337)));
        assert!(!peer.is_forwarding_eligible(Some(1)));
    }
}
