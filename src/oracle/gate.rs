//! Request gate: may this wallet ask the oracle for a new valuation now?
//!
//! Wallet and cooldown are checked locally; authorization is asked of the
//! oracle contract (`canUserRequestValuation`).

use crate::oracle::transport::OracleTransport;
use crate::oracle::types::{GateDecision, OracleStatus};
use alloy::primitives::Address;
use std::sync::Arc;
use tracing::debug;

pub struct RequestGate<T: OracleTransport + ?Sized> {
    transport: Arc<T>,
}

impl<T: OracleTransport + ?Sized> RequestGate<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Full check: local conditions first, then the remote permission view.
    pub async fn check(&self, status: &OracleStatus) -> GateDecision {
        let wallet = self.transport.wallet();
        let local = local_decision(wallet, status);
        if !local.allowed {
            return local;
        }
        let Some(wallet) = wallet else {
            return GateDecision::deny("connect wallet");
        };

        match self
            .transport
            .can_user_request(wallet, status.property_id)
            .await
        {
            Ok(true) => GateDecision::allow(),
            Ok(false) => GateDecision::deny("not authorized"),
            Err(e) => {
                debug!(error = %e, property = %status.property_id, "authorization check failed");
                GateDecision::deny(format!("authorization check failed: {e}"))
            }
        }
    }
}

/// Wallet connection, in-flight request and cooldown.
pub fn local_decision(wallet: Option<Address>, status: &OracleStatus) -> GateDecision {
    if wallet.is_none() {
        return GateDecision::deny("connect wallet");
    }
    if status.has_pending_request {
        return GateDecision::deny("a valuation request is already pending for this property");
    }
    if status.cooldown_remaining_ms > 0 {
        return GateDecision::deny(format!(
            "cooldown active: next request allowed in {}",
            format_remaining(status.cooldown_remaining_ms)
        ));
    }
    GateDecision::allow()
}

/// Human-readable remaining time, rounded down: "59m 59s", "1h 5m", "42s".
pub fn format_remaining(ms: u64) -> String {
    let secs = ms / 1000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::error::TransportError;
    use crate::oracle::transport::mock::{MockTransport, WALLET};
    use alloy::primitives::U256;

    fn status(pending: bool, cooldown_ms: u64) -> OracleStatus {
        OracleStatus {
            property_id: U256::from(7),
            pending_requests: pending as usize,
            stale_requests: 0,
            has_pending_request: pending,
            latest_valuation: None,
            last_update_ms: None,
            last_resolution_ms: None,
            cooldown_remaining_ms: cooldown_ms,
            can_request_update: !pending && cooldown_ms == 0,
            last_request_time: None,
            last_error: None,
        }
    }

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(3_599_500), "59m 59s");
        assert_eq!(format_remaining(3_600_000), "1h 0m");
        assert_eq!(format_remaining(3_900_000), "1h 5m");
        assert_eq!(format_remaining(42_900), "42s");
        assert_eq!(format_remaining(0), "0s");
    }

    #[test]
    fn test_local_decision_order() {
        let d = local_decision(None, &status(true, 1_000));
        assert_eq!(d.reason.as_deref(), Some("connect wallet"));

        let d = local_decision(Some(WALLET), &status(true, 1_000));
        assert!(d.reason.unwrap().contains("pending"));

        let d = local_decision(Some(WALLET), &status(false, 3_599_500));
        assert!(!d.allowed);
        assert!(d.reason.unwrap().contains("59m"));

        assert!(local_decision(Some(WALLET), &status(false, 0)).allowed);
    }

    #[tokio::test]
    async fn test_remote_authorization() {
        let transport = Arc::new(MockTransport::new(Some(WALLET)));
        let gate = RequestGate::new(transport.clone());
        assert_eq!(gate.check(&status(false, 0)).await, GateDecision::allow());

        transport.with_state(|s| s.authorized = false);
        assert_eq!(
            gate.check(&status(false, 0)).await,
            GateDecision::deny("not authorized")
        );

        transport.with_state(|s| {
            s.authorization_error = Some(TransportError::Connection("timeout".into()))
        });
        let d = gate.check(&status(false, 0)).await;
        assert!(!d.allowed);
        assert!(d.reason.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_disconnected_wallet_skips_remote_check() {
        let transport = Arc::new(MockTransport::new(None));
        transport.with_state(|s| s.authorized = false);
        let gate = RequestGate::new(transport);
        assert_eq!(
            gate.check(&status(false, 0)).await,
            GateDecision::deny("connect wallet")
        );
    }
}
