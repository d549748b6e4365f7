// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::rpc::error::RpcError;
use crate::rpc::{Handler, HandlerContext};

pub struct ServerInfo;

#[async_trait]
impl Handler for ServerInfo {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let range = ctx.app.store.ledger_range();
        let complete_ledgers = range
            .map(|range| range.to_string())
            .unwrap_or_else(|| "empty".into());

        let validated = match range {
            Some(range) => {
                let header = ctx
                    .app
                    .store
                    .fetch_ledger_by_sequence(range.max_sequence)
                    .await?;
                header.map(|header| {
                    json!({
                        "seq": header.sequence,
                        "hash": hex::encode(header.hash).to_uppercase(),
                        "close_time": header.close_time,
                    })
                })
            }
            None => None,
        };

        let mut info = json!({
            "complete_ledgers": complete_ledgers,
            "is_writer": ctx.app.etl_state.is_writer(),
            "amendment_blocked":
                ctx.app.etl_state.amendment().is_blocked(),
            "network_validated_sequence": ctx.app.validated.latest(),
            "cache": {
                "size": ctx.app.store.cache().len(),
                "is_full": ctx.app.store.cache().is_full(),
                "latest_ledger_seq":
                    ctx.app.store.cache().most_recent_sequence(),
            },
        });
        if let Some(validated) = validated {
            info["validated_ledger"] = validated;
        }
        if ctx.is_admin {
            info["forwarding_cache_size"] =
                ctx.app.balancer.forwarding_cache().len().into();
        }

        Ok(json!({ "info": info }))
    }
}
