// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{header_json, parse_hash, required_str, resolve_ledger};
use crate::rpc::error::RpcError;
use crate::rpc::{Handler, HandlerContext};

pub struct Ledger;

#[async_trait]
impl Handler for Ledger {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let header = resolve_ledger(&ctx.app, &ctx.params).await?;
        let mut ledger = header_json(&header);

        if ctx.params.get("transactions").and_then(Value::as_bool)
            == Some(true)
        {
            let hashes = ctx
                .app
                .store
                .fetch_all_transaction_hashes_in_ledger(header.sequence)
                .await?;
            ledger["transactions"] = hashes
                .iter()
                .map(|hash| {
                    Value::String(hex::encode(hash).to_uppercase())
                })
                .collect();
        }

        Ok(json!({
            "ledger": ledger,
            "ledger_index": header.sequence,
            "ledger_hash": hex::encode(header.hash).to_uppercase(),
            "validated": true,
        }))
    }
}

pub struct LedgerRange;

#[async_trait]
impl Handler for LedgerRange {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let range =
            ctx.app.store.ledger_range().ok_or(RpcError::LgrNotFound)?;
        Ok(json!({
            "ledger_index_min": range.min_sequence,
            "ledger_index_max": range.max_sequence,
        }))
    }
}

pub struct LedgerData;

#[async_trait]
impl Handler for LedgerData {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let header = resolve_ledger(&ctx.app, &ctx.params).await?;
        let cursor = ctx
            .params
            .get("marker")
            .and_then(Value::as_str)
            .map(|raw| parse_hash(raw, "marker"))
            .transpose()?;
        let limit = super::limit_of(&ctx.params, 256, 2048);

        let page = ctx
            .app
            .store
            .fetch_ledger_page(cursor, header.sequence, limit)
            .await?;

        let state: Vec<Value> = page
            .objects
            .iter()
            .map(|object| {
                json!({
                    "index": hex::encode(object.key).to_uppercase(),
                    "data": hex::encode(&object.blob).to_uppercase(),
                })
            })
            .collect();

        let mut body = json!({
            "ledger_index": header.sequence,
            "ledger_hash": hex::encode(header.hash).to_uppercase(),
            "state": state,
            "validated": true,
        });
        if let Some(marker) = page.next_cursor {
            body["marker"] = hex::encode(marker).to_uppercase().into();
        }
        if let Some(warning) = page.warning {
            body["warning"] = warning.into();
        }
        Ok(body)
    }
}

pub struct LedgerEntry;

#[async_trait]
impl Handler for LedgerEntry {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let header = resolve_ledger(&ctx.app, &ctx.params).await?;
        let key =
            parse_hash(required_str(&ctx.params, "index")?, "index")?;

        let blob = ctx
            .app
            .store
            .fetch_ledger_object(key, header.sequence)
            .await?
            .ok_or(RpcError::NotFound)?;

        Ok(json!({
            "index": hex::encode(key).to_uppercase(),
            "ledger_index": header.sequence,
            "ledger_hash": hex::encode(header.hash).to_uppercase(),
            "node_binary": hex::encode(blob).to_uppercase(),
            "validated": true,
        }))
    }
}
