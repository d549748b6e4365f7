// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

use node::database::StorageError;
use serde_json::{json, Value};
use thiserror::Error;

/// Everything a handler or the engine can answer a client with, short of
/// a success.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("not found")]
    NotFound,

    #[error("ledger not found")]
    LgrNotFound,

    #[error("transaction not found")]
    TxnNotFound,

    #[error("account not found")]
    ActNotFound,

    #[error("unknown method: {0}")]
    UnknownCommand(String),

    #[error("storage unavailable")]
    StorageUnavailable,

    #[error("amendment blocked")]
    AmendmentBlocked,

    #[error("slow down")]
    SlowDown,

    #[error("too busy")]
    TooBusy,

    #[error("no peer available")]
    NoPeers,

    #[error("cancelled")]
    Cancelled,

    #[error("unsupported api version")]
    InvalidApiVersion,

    #[error("admin role required")]
    NoPermission,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    /// Wire identity: `(error, error_code, error_message)`.
    pub fn parts(&self) -> (&'static str, u32, String) {
        match self {
            RpcError::InvalidParams(detail) => {
                ("invalidParams", 31, detail.clone())
            }
            RpcError::NotFound => {
                ("entryNotFound", 40, "Entry not found.".into())
            }
            RpcError::LgrNotFound => {
                ("lgrNotFound", 21, "Ledger not found.".into())
            }
            RpcError::TxnNotFound => {
                ("txnNotFound", 29, "Transaction not found.".into())
            }
            RpcError::ActNotFound => {
                ("actNotFound", 19, "Account not found.".into())
            }
            RpcError::UnknownCommand(method) => {
                ("unknownCmd", 32, format!("Unknown method: {method}"))
            }
            RpcError::StorageUnavailable => (
                "internal",
                73,
                "Internal error; please retry shortly.".into(),
            ),
            RpcError::AmendmentBlocked => (
                "amendmentBlocked",
                14,
                "This server is amendment blocked.".into(),
            ),
            RpcError::SlowDown => (
                "slowDown",
                10,
                "You are placing too much load on the server.".into(),
            ),
            RpcError::TooBusy => {
                ("tooBusy", 9, "The server is too busy to help you now.".into())
            }
            RpcError::NoPeers => (
                "noNetwork",
                17,
                "Not synced to the network; no peer available.".into(),
            ),
            RpcError::Cancelled => {
                ("cancelled", 75, "Request cancelled.".into())
            }
            RpcError::InvalidApiVersion => (
                "invalid_API_version",
                6000,
                "The API version is not supported.".into(),
            ),
            RpcError::NoPermission => (
                "noPermission",
                6,
                "You don't have permission for this command.".into(),
            ),
            RpcError::Internal(detail) => ("internal", 73, detail.clone()),
        }
    }

    /// The §6 error envelope.
    pub fn to_json(&self, id: Option<&Value>) -> Value {
        let (error, code, message) = self.parts();
        let mut body = json!({
            "error": error,
            "error_code": code,
            "error_message": message,
            "status": "error",
            "type": "response",
        });
        if let Some(id) = id {
            body["id"] = id.clone();
        }
        body
    }
}

impl From<StorageError> for RpcError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable | StorageError::Driver(_) => {
                RpcError::StorageUnavailable
            }
            StorageError::Corruption(detail) => RpcError::Internal(detail),
            StorageError::Cancelled => RpcError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_shape() {
        let err = RpcError::SlowDown;
        let body = err.to_json(Some(&json!(7)));
        assert_eq!(body["error"], "slowDown");
        assert_eq!(body["status"], "error");
        assert_eq!(body["id"], 7);
        assert!(body["error_code"].is_u64());
    }

    #[test]
    fn storage_errors_map() {
        assert_eq!(
            RpcError::from(StorageError::Unavailable),
            RpcError::StorageUnavailable
        );
        assert_eq!(
            RpcError::from(StorageError::Cancelled),
            RpcError::Cancelled
        );
    }
}
