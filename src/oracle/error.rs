//! Error taxonomy for oracle access.
//!
//! RPC failures are classified once, where they leave alloy, into a
//! `TransportError`. Everything downstream matches on the variant instead of
//! inspecting messages.

use alloy::providers::PendingTransactionError;
use alloy::sol_types::decode_revert_reason;
use alloy::transports::RpcError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Node dropped a server-side log filter. Benign; the next poll recreates it.
    #[error("log filter expired on the node")]
    FilterExpired,
    #[error("{}", .reason.as_deref().unwrap_or("transaction reverted"))]
    Reverted { reason: Option<String> },
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("connection error: {0}")]
    Connection(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl TransportError {
    /// Benign errors are retried silently and never reach callers.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::FilterExpired)
    }
}

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("request denied: {0}")]
    Denied(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("oracle service stopped")]
    ServiceStopped,
}

/// Classify a JSON-RPC error response by code and message.
pub fn classify_error_response(code: i64, message: &str) -> TransportError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("filter not found") || lower.contains("filter does not exist") {
        return TransportError::FilterExpired;
    }
    if let Some(pos) = lower.find("execution reverted") {
        let rest = message[pos + "execution reverted".len()..]
            .trim_start_matches(':')
            .trim();
        let reason = if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        };
        return TransportError::Reverted { reason };
    }
    TransportError::Rpc {
        code,
        message: message.to_string(),
    }
}

/// Classify an error returned by an alloy provider call.
pub fn classify_rpc_error(err: &alloy::transports::TransportError) -> TransportError {
    if let Some(payload) = err.as_error_resp() {
        if let Some(data) = payload.as_revert_data() {
            return TransportError::Reverted {
                reason: decode_revert_reason(&data),
            };
        }
        return classify_error_response(payload.code, &payload.message);
    }
    match err {
        RpcError::Transport(kind) => TransportError::Connection(kind.to_string()),
        other => TransportError::Decode(other.to_string()),
    }
}

/// Classify an error from a `sol!` contract call or send.
pub fn classify_contract_error(err: &alloy::contract::Error) -> TransportError {
    match err {
        alloy::contract::Error::TransportError(e) => classify_rpc_error(e),
        other => TransportError::Decode(other.to_string()),
    }
}

/// Classify an error while waiting for a transaction receipt.
pub fn classify_pending_error(err: &PendingTransactionError) -> TransportError {
    match err {
        PendingTransactionError::TransportError(e) => classify_rpc_error(e),
        other => TransportError::Connection(other.to_string()),
    }
}
