// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use async_trait::async_trait;
use node_data::ledger::Transaction;
use serde_json::{json, Value};

use super::{parse_hash, required_str, resolve_ledger};
use crate::rpc::error::RpcError;
use crate::rpc::{Handler, HandlerContext};

fn tx_json(tx: &Transaction) -> Value {
    json!({
        "hash": hex::encode(tx.hash).to_uppercase(),
        "ledger_index": tx.ledger_sequence,
        "meta_blob": hex::encode(&tx.metadata_blob).to_uppercase(),
        "tx_blob": hex::encode(&tx.transaction_blob).to_uppercase(),
        "date": tx.date,
        "validated": true,
    })
}

pub struct Tx;

#[async_trait]
impl Handler for Tx {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let hash = parse_hash(
            required_str(&ctx.params, "transaction")?,
            "transaction",
        )?;
        let tx = ctx
            .app
            .store
            .fetch_transaction(hash)
            .await?
            .ok_or(RpcError::TxnNotFound)?;
        Ok(tx_json(&tx))
    }
}

pub struct TransactionEntry;

#[async_trait]
impl Handler for TransactionEntry {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let header = resolve_ledger(&ctx.app, &ctx.params).await?;
        let hash = parse_hash(
            required_str(&ctx.params, "tx_hash")?,
            "tx_hash",
        )?;

        let tx = ctx
            .app
            .store
            .fetch_transaction(hash)
            .await?
            .filter(|tx| tx.ledger_sequence == header.sequence)
            .ok_or(RpcError::TxnNotFound)?;

        let mut body = tx_json(&tx);
        body["ledger_hash"] =
            hex::encode(header.hash).to_uppercase().into();
        Ok(body)
    }
}
