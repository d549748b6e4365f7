// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! The per-method handlers. Each is a small request→response function
//! over the storage facade; the JSON schemas stay intentionally thin.

mod account;
mod admin;
mod book;
mod ledger;
mod misc;
mod server_info;
mod subscribe;
mod tx;

use std::collections::HashMap;

use node_data::ledger::{
    account_from_base58, AccountId, Hash, LedgerHeader,
};
use serde_json::Value;

use super::{Handler, MethodEntry};
use crate::rpc::error::RpcError;
use crate::AppContext;

/// Build the `(method) -> handler` registry.
pub fn register() -> HashMap<&'static str, MethodEntry> {
    fn entry<H: Handler + 'static>(
        handler: H,
        admin_only: bool,
    ) -> MethodEntry {
        MethodEntry {
            handler: Box::new(handler),
            admin_only,
        }
    }

    let mut registry = HashMap::new();

    registry.insert("ping", entry(misc::Ping, false));
    registry.insert("random", entry(misc::Random, false));
    registry.insert("server_info", entry(server_info::ServerInfo, false));

    registry.insert("ledger", entry(ledger::Ledger, false));
    registry.insert("ledger_range", entry(ledger::LedgerRange, false));
    registry.insert("ledger_data", entry(ledger::LedgerData, false));
    registry.insert("ledger_entry", entry(ledger::LedgerEntry, false));

    registry.insert("account_info", entry(account::AccountInfo, false));
    registry
        .insert("account_objects", entry(account::AccountObjects, false));
    registry.insert("account_tx", entry(account::AccountTx, false));

    registry.insert("tx", entry(tx::Tx, false));
    registry
        .insert("transaction_entry", entry(tx::TransactionEntry, false));

    registry.insert("book_offers", entry(book::BookOffers, false));

    registry.insert("subscribe", entry(subscribe::Subscribe, false));
    registry.insert("unsubscribe", entry(subscribe::Unsubscribe, false));

    registry.insert("ledger_accept", entry(admin::LedgerAccept, true));
    registry.insert("log_level", entry(admin::LogLevel, true));
    registry
        .insert("validation_create", entry(admin::ValidationCreate, true));
    registry.insert("feature", entry(admin::Feature, true));

    registry
}

// ---- Shared parameter helpers ----

pub(crate) fn required_str<'a>(
    params: &'a Value,
    field: &str,
) -> Result<&'a str, RpcError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            RpcError::InvalidParams(format!("missing field '{field}'"))
        })
}

pub(crate) fn parse_hash(raw: &str, field: &str) -> Result<Hash, RpcError> {
    let bytes = hex::decode(raw).map_err(|_| {
        RpcError::InvalidParams(format!("'{field}' is not valid hex"))
    })?;
    bytes.as_slice().try_into().map_err(|_| {
        RpcError::InvalidParams(format!("'{field}' must be 256 bits"))
    })
}

pub(crate) fn parse_account(params: &Value) -> Result<AccountId, RpcError> {
    let raw = required_str(params, "account")?;
    account_from_base58(raw).map_err(|_| {
        RpcError::InvalidParams("malformed account address".into())
    })
}

pub(crate) fn limit_of(
    params: &Value,
    default: usize,
    max: usize,
) -> usize {
    params
        .get("limit")
        .and_then(Value::as_u64)
        .map(|limit| (limit as usize).clamp(1, max))
        .unwrap_or(default)
}

/// Resolve the ledger a request addresses: by hash, by numeric index, or
/// the latest validated one. `"current"` / `"closed"` never get here;
/// those requests forward upstream.
pub(crate) async fn resolve_ledger(
    app: &AppContext,
    params: &Value,
) -> Result<LedgerHeader, RpcError> {
    if let Some(raw) = params.get("ledger_hash").and_then(Value::as_str) {
        let hash = parse_hash(raw, "ledger_hash")?;
        return app
            .store
            .fetch_ledger_by_hash(hash)
            .await?
            .ok_or(RpcError::LgrNotFound);
    }

    let sequence = match params.get("ledger_index") {
        Some(Value::Number(number)) => number
            .as_u64()
            .filter(|seq| *seq <= u32::MAX as u64)
            .map(|seq| seq as u32)
            .ok_or_else(|| {
                RpcError::InvalidParams("ledger_index out of range".into())
            })?,
        Some(Value::String(tag)) if tag == "validated" => latest(app)?,
        None => latest(app)?,
        Some(_) => {
            return Err(RpcError::InvalidParams(
                "unrecognized ledger_index".into(),
            ))
        }
    };

    app.store
        .fetch_ledger_by_sequence(sequence)
        .await?
        .ok_or(RpcError::LgrNotFound)
}

fn latest(app: &AppContext) -> Result<u32, RpcError> {
    app.store
        .ledger_range()
        .map(|range| range.max_sequence)
        .ok_or(RpcError::LgrNotFound)
}

/// Header fields as clients see them.
pub(crate) fn header_json(header: &LedgerHeader) -> Value {
    serde_json::json!({
        "ledger_index": header.sequence,
        "ledger_hash": hex::encode(header.hash).to_uppercase(),
        "parent_hash": hex::encode(header.parent_hash).to_uppercase(),
        "account_hash":
            hex::encode(header.state_tree_hash).to_uppercase(),
        "transaction_hash":
            hex::encode(header.tx_tree_hash).to_uppercase(),
        "total_coins": header.total_drops.to_string(),
        "close_time": header.close_time,
        "parent_close_time": header.parent_close_time,
        "close_time_resolution": header.close_time_resolution,
        "close_flags": header.close_flags,
        "closed": true,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn registry_is_complete() {
        let registry = register();
        for method in [
            "ping",
            "random",
            "server_info",
            "ledger",
            "ledger_range",
            "ledger_data",
            "ledger_entry",
            "account_info",
            "account_objects",
            "account_tx",
            "tx",
            "transaction_entry",
            "book_offers",
            "subscribe",
            "unsubscribe",
            "ledger_accept",
            "log_level",
            "validation_create",
            "feature",
        ] {
            assert!(registry.contains_key(method), "missing {method}");
        }

        // Subscription management is never admin-gated.
        assert!(!registry["subscribe"].admin_only);
        assert!(!registry["unsubscribe"].admin_only);
        // The §6 admin set is.
        for method in
            ["ledger_accept", "log_level", "validation_create", "feature"]
        {
            assert!(registry[method].admin_only, "{method} must be admin");
        }
    }

    #[test]
    fn hash_parsing() {
        let raw = "ab".repeat(32);
        assert!(parse_hash(&raw, "index").is_ok());
        assert!(parse_hash("zz", "index").is_err());
        assert!(parse_hash("abcd", "index").is_err());
    }

    #[test]
    fn limits_clamp() {
        assert_eq!(limit_of(&json!({}), 200, 1000), 200);
        assert_eq!(limit_of(&json!({"limit": 5}), 200, 1000), 5);
        assert_eq!(limit_of(&json!({"limit": 9999}), 200, 1000), 1000);
        assert_eq!(limit_of(&json!({"limit": 0}), 200, 1000), 1);
    }
}
