// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use async_trait::async_trait;
use node_data::events::StreamKind;
use node_data::ledger::account_from_base58;
use serde_json::{json, Value};

use crate::rpc::error::RpcError;
use crate::rpc::{Handler, HandlerContext};

fn parse_streams(params: &Value) -> Result<Vec<StreamKind>, RpcError> {
    let mut kinds = vec![];
    for stream in params
        .get("streams")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let name = stream.as_str().ok_or_else(|| {
            RpcError::InvalidParams("streams must be strings".into())
        })?;
        let kind = StreamKind::from_str(name).ok_or_else(|| {
            RpcError::InvalidParams(format!("unknown stream '{name}'"))
        })?;
        kinds.push(kind);
    }
    Ok(kinds)
}

fn parse_accounts(
    params: &Value,
) -> Result<Vec<node_data::ledger::AccountId>, RpcError> {
    let mut accounts = vec![];
    for account in params
        .get("accounts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let raw = account.as_str().ok_or_else(|| {
            RpcError::InvalidParams("accounts must be strings".into())
        })?;
        accounts.push(account_from_base58(raw).map_err(|_| {
            RpcError::InvalidParams(format!("malformed account '{raw}'"))
        })?);
    }
    Ok(accounts)
}

fn parse_books(
    params: &Value,
) -> Result<Vec<node_data::ledger::Book>, RpcError> {
    let mut books = vec![];
    for book in params
        .get("books")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let raw = book.as_str().ok_or_else(|| {
            RpcError::InvalidParams("books must be hex strings".into())
        })?;
        let bytes = hex::decode(raw).map_err(|_| {
            RpcError::InvalidParams(format!("malformed book '{raw}'"))
        })?;
        let book: node_data::ledger::Book =
            bytes.as_slice().try_into().map_err(|_| {
                RpcError::InvalidParams(format!("malformed book '{raw}'"))
            })?;
        books.push(book);
    }
    Ok(books)
}

pub struct Subscribe;

#[async_trait]
impl Handler for Subscribe {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let session = ctx.session.clone().ok_or_else(|| {
            RpcError::InvalidParams(
                "subscriptions require a websocket session".into(),
            )
        })?;

        let streams = parse_streams(&ctx.params)?;
        let accounts = parse_accounts(&ctx.params)?;
        let books = parse_books(&ctx.params)?;
        if streams.is_empty() && accounts.is_empty() && books.is_empty() {
            return Err(RpcError::InvalidParams(
                "nothing to subscribe to".into(),
            ));
        }

        for kind in &streams {
            ctx.app.subscriptions.subscribe_stream(*kind, &session);
        }
        for account in accounts {
            ctx.app.subscriptions.subscribe_account(account, &session);
        }
        for book in books {
            ctx.app.subscriptions.subscribe_book(book, &session);
        }

        // Subscribing to the ledger stream answers with the current tip,
        // so clients can anchor before the first notification.
        let mut result = json!({});
        if streams.contains(&StreamKind::Ledger) {
            if let Some(range) = ctx.app.store.ledger_range() {
                if let Some(header) = ctx
                    .app
                    .store
                    .fetch_ledger_by_sequence(range.max_sequence)
                    .await?
                {
                    result = json!({
                        "ledger_index": header.sequence,
                        "ledger_hash":
                            hex::encode(header.hash).to_uppercase(),
                        "ledger_time": header.close_time,
                        "validated_ledgers": range.to_string(),
                    });
                }
            }
        }
        Ok(result)
    }
}

pub struct Unsubscribe;

#[async_trait]
impl Handler for Unsubscribe {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let session = ctx.session.clone().ok_or_else(|| {
            RpcError::InvalidParams(
                "subscriptions require a websocket session".into(),
            )
        })?;
        let session_id = session.session_id();

        for kind in parse_streams(&ctx.params)? {
            ctx.app.subscriptions.unsubscribe_stream(kind, session_id);
        }
        for account in parse_accounts(&ctx.params)? {
            ctx.app
                .subscriptions
                .unsubscribe_account(account, session_id);
        }
        for book in parse_books(&ctx.params)? {
            ctx.app.subscriptions.unsubscribe_book(book, session_id);
        }

        Ok(json!({}))
    }
}
