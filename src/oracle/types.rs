//! Event, notice and status types shared by the oracle components.

use alloy::primitives::{B256, U256};
use rust_decimal::Decimal;

pub type PropertyId = U256;
pub type RequestId = B256;

/// Where a chain event came from. `(tx_hash, log_index)` identifies a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainMeta {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// `PropertyValuationRequested` as seen on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuationRequested {
    pub property_id: PropertyId,
    pub request_id: RequestId,
    pub timestamp_ms: u64,
    pub chain: ChainMeta,
}

/// `PropertyValuationUpdated`: terminal success for the property's open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuationUpdated {
    pub property_id: PropertyId,
    pub old_valuation: U256,
    pub new_valuation: U256,
    pub timestamp_ms: u64,
    pub chain: ChainMeta,
}

/// `RequestFailed`: terminal failure for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuationFailed {
    pub request_id: RequestId,
    pub error: String,
    pub timestamp_ms: u64,
    pub chain: ChainMeta,
}

/// Locally synthesized resolution for a request the oracle never answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedResolution {
    pub request_id: RequestId,
    pub property_id: PropertyId,
    pub new_valuation: U256,
    pub timestamp_ms: u64,
    pub resolved: bool,
}

/// Every record kept in the event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleEvent {
    Requested(ValuationRequested),
    Updated(ValuationUpdated),
    Failed(ValuationFailed),
    Simulated(SimulatedResolution),
}

impl OracleEvent {
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Self::Requested(e) => e.timestamp_ms,
            Self::Updated(e) => e.timestamp_ms,
            Self::Failed(e) => e.timestamp_ms,
            Self::Simulated(e) => e.timestamp_ms,
        }
    }

    /// `None` for failures, which only carry a request id.
    pub fn property_id(&self) -> Option<PropertyId> {
        match self {
            Self::Requested(e) => Some(e.property_id),
            Self::Updated(e) => Some(e.property_id),
            Self::Failed(_) => None,
            Self::Simulated(e) => Some(e.property_id),
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::Requested(e) => Some(e.request_id),
            Self::Updated(_) => None,
            Self::Failed(e) => Some(e.request_id),
            Self::Simulated(e) => Some(e.request_id),
        }
    }

    pub fn chain(&self) -> Option<ChainMeta> {
        match self {
            Self::Requested(e) => Some(e.chain),
            Self::Updated(e) => Some(e.chain),
            Self::Failed(e) => Some(e.chain),
            Self::Simulated(_) => None,
        }
    }

    /// Whether this event happened after `other`.
    ///
    /// Two chain events compare by `(block_number, log_index)`; their
    /// timestamps may come from different sources and only have second
    /// resolution. Against a simulated record the timestamp decides, and a
    /// simulated record is later than a chain event of the same millisecond.
    pub fn is_later_than(&self, other: &OracleEvent) -> bool {
        match (self.chain(), other.chain()) {
            (Some(a), Some(b)) => (a.block_number, a.log_index) > (b.block_number, b.log_index),
            (None, Some(_)) => self.timestamp_ms() >= other.timestamp_ms(),
            (_, None) => self.timestamp_ms() > other.timestamp_ms(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Requested(_) => "requested",
            Self::Updated(_) => "updated",
            Self::Failed(_) => "failed",
            Self::Simulated(_) => "simulated",
        }
    }
}

fn short(hash: &B256) -> String {
    format!("{hash}")[..10].to_string()
}

impl std::fmt::Display for OracleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested(e) => write!(
                f,
                "Requested(property={}, rid={}, block={})",
                e.property_id,
                short(&e.request_id),
                e.chain.block_number
            ),
            Self::Updated(e) => write!(
                f,
                "Updated(property={}, {} -> {})",
                e.property_id, e.old_valuation, e.new_valuation
            ),
            Self::Failed(e) => write!(f, "Failed(rid={}, error={})", short(&e.request_id), e.error),
            Self::Simulated(e) => write!(
                f,
                "Simulated(property={}, rid={}, valuation={})",
                e.property_id,
                short(&e.request_id),
                e.new_valuation
            ),
        }
    }
}

/// Messages from the listeners (live subscriber, log poller) to the service.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    Event(OracleEvent),
    /// Already classified; benign errors are dropped by the receiver.
    TransportError(crate::oracle::error::TransportError),
    Connected { source: &'static str },
    Disconnected { source: &'static str, reason: String },
}

/// User-facing notifications emitted by the reconciler.
#[derive(Debug, Clone)]
pub enum OracleNotice {
    RequestObserved {
        property_id: PropertyId,
        request_id: RequestId,
    },
    Resolved {
        property_id: PropertyId,
        request_id: RequestId,
        old_valuation: U256,
        new_valuation: U256,
        /// Percent change, `None` when the old valuation was zero or too large.
        change_pct: Option<Decimal>,
        latency_ms: u64,
    },
    Failed {
        property_id: PropertyId,
        request_id: RequestId,
        reason: String,
        latency_ms: u64,
    },
    /// The oracle did not answer in time; a placeholder valuation was recorded.
    SimulatedResolved {
        property_id: PropertyId,
        request_id: RequestId,
        placeholder_valuation: U256,
    },
    Error {
        message: String,
    },
    Summary {
        tracked_requests: usize,
        pending: usize,
        resolved: usize,
        failed: usize,
        simulated: usize,
        avg_latency_ms: f64,
    },
}

impl std::fmt::Display for OracleNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequestObserved { property_id, request_id } => {
                write!(f, "valuation requested for property {} ({})", property_id, short(request_id))
            }
            Self::Resolved { property_id, new_valuation, change_pct, .. } => match change_pct {
                Some(pct) => {
                    let sign = if pct.is_sign_negative() { "" } else { "+" };
                    write!(
                        f,
                        "property {} valuation updated to {} ({}{}%)",
                        property_id, new_valuation, sign, pct
                    )
                }
                None => write!(f, "property {} valuation updated to {}", property_id, new_valuation),
            },
            Self::Failed { property_id, reason, .. } => {
                write!(f, "valuation request for property {} failed: {}", property_id, reason)
            }
            Self::SimulatedResolved { property_id, placeholder_valuation, .. } => write!(
                f,
                "oracle did not answer for property {}; simulated valuation {}",
                property_id, placeholder_valuation
            ),
            Self::Error { message } => write!(f, "oracle error: {}", message),
            Self::Summary { tracked_requests, pending, resolved, failed, simulated, avg_latency_ms } => write!(
                f,
                "{} requests: {} pending, {} resolved, {} failed, {} simulated, avg latency {:.0}ms",
                tracked_requests, pending, resolved, failed, simulated, avg_latency_ms
            ),
        }
    }
}

/// Snapshot of one property's oracle state.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleStatus {
    pub property_id: PropertyId,
    /// Pending requests younger than the stale threshold.
    pub pending_requests: usize,
    /// Pending requests hidden from the count because they look abandoned.
    pub stale_requests: usize,
    /// A non-stale request is in flight and gates new ones.
    pub has_pending_request: bool,
    /// Most recent valuation, real or simulated.
    pub latest_valuation: Option<U256>,
    pub last_update_ms: Option<u64>,
    pub last_resolution_ms: Option<u64>,
    pub cooldown_remaining_ms: u64,
    pub can_request_update: bool,
    /// Remote `lastRequestTime`, seconds. Filled in by the service when the chain answers.
    pub last_request_time: Option<u64>,
    pub last_error: Option<String>,
}

/// Outcome of the request gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl GateDecision {
    pub fn allow() -> Self {
        Self { allowed: true, reason: None }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: Some(reason.into()) }
    }
}

/// Parameters of a new valuation request.
#[derive(Debug, Clone)]
pub struct ValuationRequest {
    pub property_id: PropertyId,
    pub location: String,
    pub size: U256,
    pub api_key: Option<String>,
}

/// What a confirmed request transaction produced.
#[derive(Debug, Clone)]
pub struct RequestReceipt {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
    /// Decoded from the receipt logs; `None` if the oracle emitted nothing we recognise.
    pub requested: Option<ValuationRequested>,
}
