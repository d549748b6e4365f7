// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use async_trait::async_trait;
use rand::RngCore;
use serde_json::{json, Value};

use crate::rpc::error::RpcError;
use crate::rpc::{Handler, HandlerContext};

pub struct Ping;

#[async_trait]
impl Handler for Ping {
    async fn call(&self, _ctx: HandlerContext) -> Result<Value, RpcError> {
        Ok(json!({}))
    }
}

pub struct Random;

#[async_trait]
impl Handler for Random {
    async fn call(&self, _ctx: HandlerContext) -> Result<Value, RpcError> {
        let mut random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut random);
        Ok(json!({ "random": hex::encode(random).to_uppercase() }))
    }
}
