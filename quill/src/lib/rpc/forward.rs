// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! Which requests bypass local handling and go to an upstream peer, and
//! how their responses come back.

use node::peer::pool::PoolError;
use serde_json::Value;

use crate::rpc::error::RpcError;
use crate::AppContext;

/// Methods always served by a peer.
pub const FORWARD_SET: &[&str] = &[
    "submit",
    "submit_multisigned",
    "fee",
    "ripple_path_find",
    "manifest",
    "channel_authorize",
    "channel_verify",
];

/// Methods whose forwarded response changes with every ledger; their
/// cache entries die on publish.
const LEDGER_SENSITIVE: &[&str] = &["fee", "ripple_path_find"];

fn wants_current_ledger(params: &Value) -> bool {
    matches!(
        params.get("ledger_index").and_then(Value::as_str),
        Some("current") | Some("closed")
    )
}

/// A request is forwarded iff its method is in the forward set, it asks
/// for an open ledger, or it carries an explicit `"forward": true`.
pub fn should_forward(method: &str, params: &Value) -> bool {
    FORWARD_SET.contains(&method)
        || wants_current_ledger(params)
        || params.get("forward").and_then(Value::as_bool) == Some(true)
}

pub fn is_ledger_sensitive(method: &str, params: &Value) -> bool {
    LEDGER_SENSITIVE.contains(&method) || wants_current_ledger(params)
}

/// Ship the raw request upstream through the balancer and its cache.
pub async fn forward(
    app: &AppContext,
    method: &str,
    request: &Value,
) -> Result<Value, RpcError> {
    let sensitive = is_ledger_sensitive(method, request);
    match app.balancer.forward(request, sensitive).await {
        Ok(response) => Ok(response),
        Err(PoolError::NoPeers) => Err(RpcError::NoPeers),
        Err(PoolError::Failed(detail)) => Err(RpcError::Internal(detail)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn forward_set_members() {
        assert!(should_forward("submit", &json!({})));
        assert!(should_forward("fee", &json!({})));
        assert!(!should_forward("account_info", &json!({})));
    }

    #[test]
    fn current_ledger_requests_forward() {
        assert!(should_forward(
            "account_info",
            &json!({"ledger_index": "current"})
        ));
        assert!(should_forward(
            "ledger",
            &json!({"ledger_index": "closed"})
        ));
        assert!(!should_forward(
            "ledger",
            &json!({"ledger_index": "validated"})
        ));
        assert!(!should_forward("ledger", &json!({"ledger_index": 100})));
    }

    #[test]
    fn explicit_forward_flag() {
        assert!(should_forward("server_info", &json!({"forward": true})));
        assert!(!should_forward("server_info", &json!({"forward": false})));
    }

    #[test]
    fn sensitivity() {
        assert!(is_ledger_sensitive("fee", &json!({})));
        assert!(!is_ledger_sensitive("manifest", &json!({})));
        assert!(is_ledger_sensitive(
            "account_info",
            &json!({"ledger_index": "current"})
        ));
    }
}
