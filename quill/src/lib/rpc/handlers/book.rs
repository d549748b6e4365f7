// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use async_trait::async_trait;
use node_data::ledger::{Book, BOOK_LEN};
use serde_json::{json, Value};

use super::{limit_of, parse_hash, required_str, resolve_ledger};
use crate::rpc::error::RpcError;
use crate::rpc::{Handler, HandlerContext};

fn parse_book(params: &Value) -> Result<Book, RpcError> {
    let raw = required_str(params, "book")?;
    let bytes = hex::decode(raw).map_err(|_| {
        RpcError::InvalidParams("'book' is not valid hex".into())
    })?;
    if bytes.len() != BOOK_LEN {
        return Err(RpcError::InvalidParams(format!(
            "'book' must be {} bits",
            BOOK_LEN * 8
        )));
    }
    let mut book = [0u8; BOOK_LEN];
    book.copy_from_slice(&bytes);
    Ok(book)
}

pub struct BookOffers;

#[async_trait]
impl Handler for BookOffers {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let header = resolve_ledger(&ctx.app, &ctx.params).await?;
        let book = parse_book(&ctx.params)?;
        let limit = limit_of(&ctx.params, 60, 100);
        let cursor = ctx
            .params
            .get("marker")
            .and_then(Value::as_str)
            .map(|raw| parse_hash(raw, "marker"))
            .transpose()?;

        let (offers, next) = ctx
            .app
            .store
            .fetch_book_offers(book, header.sequence, limit, cursor)
            .await?;

        let offers: Vec<Value> = offers
            .iter()
            .map(|offer| {
                json!({
                    "index": hex::encode(offer.key).to_uppercase(),
                    "data": hex::encode(&offer.blob).to_uppercase(),
                })
            })
            .collect();

        let mut body = json!({
            "ledger_index": header.sequence,
            "offers": offers,
            "validated": true,
        });
        if let Some(next) = next {
            body["marker"] = hex::encode(next).to_uppercase().into();
        }
        Ok(body)
    }
}
