// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use async_trait::async_trait;
use rand::RngCore;
use serde_json::{json, Value};

use super::required_str;
use crate::rpc::error::RpcError;
use crate::rpc::{Handler, HandlerContext};

/// No-op acceptance: this server never closes ledgers itself, it reports
/// the tip it follows.
pub struct LedgerAccept;

#[async_trait]
impl Handler for LedgerAccept {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let range =
            ctx.app.store.ledger_range().ok_or(RpcError::LgrNotFound)?;
        Ok(json!({
            "ledger_current_index": range.max_sequence + 1,
        }))
    }
}

pub struct LogLevel;

#[async_trait]
impl Handler for LogLevel {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let severity = required_str(&ctx.params, "severity")?;
        let reload = ctx.app.log_reload.as_ref().ok_or_else(|| {
            RpcError::Internal("log level reloading not wired".into())
        })?;
        reload(severity).map_err(|err| {
            RpcError::InvalidParams(format!("bad severity: {err}"))
        })?;
        Ok(json!({ "severity": severity }))
    }
}

pub struct ValidationCreate;

#[async_trait]
impl Handler for ValidationCreate {
    async fn call(&self, _ctx: HandlerContext) -> Result<Value, RpcError> {
        let mut seed = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut seed);
        Ok(json!({
            "validation_seed": hex::encode(seed).to_uppercase(),
        }))
    }
}

pub struct Feature;

#[async_trait]
impl Handler for Feature {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        Ok(json!({
            "features": {},
            "amendment_blocked":
                ctx.app.etl_state.amendment().is_blocked(),
        }))
    }
}
