// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use async_trait::async_trait;
use node_data::ledger::{
    account_to_base58, sha512_half, AccountId, AccountTxCursor, Hash,
};
use serde_json::{json, Value};

use super::{limit_of, parse_account, resolve_ledger};
use crate::rpc::error::RpcError;
use crate::rpc::{Handler, HandlerContext};

/// Keylet prefixes for account-scoped state-tree keys.
const ACCOUNT_ROOT_SPACE: [u8; 2] = [0x00, 0x61];
const OWNER_DIR_SPACE: [u8; 2] = [0x00, 0x64];

/// Leading type tag of a serialized ledger object, used for coarse
/// filtering without decoding the body.
fn object_type_code(name: &str) -> Option<[u8; 2]> {
    match name {
        "account" => Some([0x00, 0x61]),
        "offer" => Some([0x00, 0x6f]),
        "state" => Some([0x00, 0x72]),
        "ticket" => Some([0x00, 0x54]),
        "escrow" => Some([0x00, 0x75]),
        _ => None,
    }
}

pub(crate) fn account_root_key(account: &AccountId) -> Hash {
    let mut preimage = Vec::with_capacity(22);
    preimage.extend_from_slice(&ACCOUNT_ROOT_SPACE);
    preimage.extend_from_slice(account);
    sha512_half(&preimage)
}

pub(crate) fn owner_directory_key(account: &AccountId) -> Hash {
    let mut preimage = Vec::with_capacity(22);
    preimage.extend_from_slice(&OWNER_DIR_SPACE);
    preimage.extend_from_slice(account);
    sha512_half(&preimage)
}

pub struct AccountInfo;

#[async_trait]
impl Handler for AccountInfo {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let account = parse_account(&ctx.params)?;
        let header = resolve_ledger(&ctx.app, &ctx.params).await?;

        let key = account_root_key(&account);
        let blob = ctx
            .app
            .store
            .fetch_ledger_object(key, header.sequence)
            .await?
            .ok_or(RpcError::ActNotFound)?;

        Ok(json!({
            "account_data": {
                "Account": account_to_base58(&account),
                "index": hex::encode(key).to_uppercase(),
                "data": hex::encode(blob).to_uppercase(),
            },
            "ledger_index": header.sequence,
            "validated": true,
        }))
    }
}

pub struct AccountObjects;

#[async_trait]
impl Handler for AccountObjects {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let account = parse_account(&ctx.params)?;
        let header = resolve_ledger(&ctx.app, &ctx.params).await?;
        let limit = limit_of(&ctx.params, 200, 400);
        let type_filter = ctx
            .params
            .get("type")
            .and_then(Value::as_str)
            .map(|name| {
                object_type_code(name).ok_or_else(|| {
                    RpcError::InvalidParams(format!(
                        "unknown object type '{name}'"
                    ))
                })
            })
            .transpose()?;

        // The owner directory blob is the account's key list: packed
        // 32-byte keys of every object it owns.
        let directory = ctx
            .app
            .store
            .fetch_ledger_object(
                owner_directory_key(&account),
                header.sequence,
            )
            .await?
            .ok_or(RpcError::ActNotFound)?;
        if directory.len() % 32 != 0 {
            return Err(RpcError::Internal(
                "malformed owner directory".into(),
            ));
        }

        let keys: Vec<Hash> = directory
            .chunks_exact(32)
            .map(|chunk| {
                let mut key = [0u8; 32];
                key.copy_from_slice(chunk);
                key
            })
            .collect();
        let blobs = ctx
            .app
            .store
            .fetch_ledger_objects(&keys, header.sequence)
            .await?;

        let mut objects = vec![];
        for (key, blob) in keys.into_iter().zip(blobs) {
            let Some(blob) = blob else { continue };
            if let Some(code) = type_filter {
                if blob.len() < 2 || blob[..2] != code {
                    continue;
                }
            }
            objects.push(json!({
                "index": hex::encode(key).to_uppercase(),
                "data": hex::encode(&blob).to_uppercase(),
                "LedgerEntryType": type_name(&blob),
            }));
            if objects.len() >= limit {
                break;
            }
        }

        Ok(json!({
            "account": account_to_base58(&account),
            "account_objects": objects,
            "ledger_index": header.sequence,
            "validated": true,
        }))
    }
}

fn type_name(blob: &[u8]) -> &'static str {
    if blob.len() < 2 {
        return "Unknown";
    }
    match [blob[0], blob[1]] {
        [0x00, 0x61] => "AccountRoot",
        [0x00, 0x6f] => "Offer",
        [0x00, 0x72] => "RippleState",
        [0x00, 0x54] => "Ticket",
        [0x00, 0x75] => "Escrow",
        _ => "Unknown",
    }
}

pub struct AccountTx;

#[async_trait]
impl Handler for AccountTx {
    async fn call(&self, ctx: HandlerContext) -> Result<Value, RpcError> {
        let account = parse_account(&ctx.params)?;
        let limit = limit_of(&ctx.params, 200, 1000);
        let forward = ctx
            .params
            .get("forward")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let cursor = match ctx.params.get("marker") {
            None | Some(Value::Null) => None,
            Some(marker) => {
                let ledger_sequence = marker
                    .get("ledger")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        RpcError::InvalidParams(
                            "marker is missing 'ledger'".into(),
                        )
                    })? as u32;
                let transaction_index = marker
                    .get("seq")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        RpcError::InvalidParams(
                            "marker is missing 'seq'".into(),
                        )
                    })? as u32;
                Some(AccountTxCursor {
                    ledger_sequence,
                    transaction_index,
                })
            }
        };

        let (txs, next) = ctx
            .app
            .store
            .fetch_account_transactions(account, limit, cursor, forward)
            .await?;

        let transactions: Vec<Value> = txs
            .iter()
            .map(|tx| {
                json!({
                    "hash": hex::encode(tx.hash).to_uppercase(),
                    "ledger_index": tx.ledger_sequence,
                    "tx_blob":
                        hex::encode(&tx.transaction_blob).to_uppercase(),
                    "meta_blob":
                        hex::encode(&tx.metadata_blob).to_uppercase(),
                    "date": tx.date,
                    "validated": true,
                })
            })
            .collect();

        let mut body = json!({
            "account": account_to_base58(&account),
            "limit": limit,
            "transactions": transactions,
            "validated": true,
        });
        if let Some(next) = next {
            body["marker"] = json!({
                "ledger": next.ledger_sequence,
                "seq": next.transaction_index,
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keylets_are_distinct_per_account_and_space() {
        let a = [1u8; 20];
        let b = [2u8; 20];
        assert_ne!(account_root_key(&a), account_root_key(&b));
        assert_ne!(account_root_key(&a), owner_directory_key(&a));
    }

    #[test]
    fn type_codes() {
        assert_eq!(object_type_code("offer"), Some([0x00, 0x6f]));
        assert_eq!(object_type_code("bogus"), None);
        assert_eq!(type_name(&[0x00, 0x6f, 0xff]), "Offer");
        assert_eq!(type_name(&[0x12]), "Unknown");
    }
}
