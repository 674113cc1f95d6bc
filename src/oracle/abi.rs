//! Property valuation oracle ABI and event topic hashes.
//!
//! Only the surface we touch is declared: the three lifecycle events, the
//! two request entry points, and the two views used by the request gate.

use alloy::primitives::{b256, B256};
use alloy::sol_types::SolEvent;

alloy::sol! {
    #[sol(rpc)]
    interface IPropertyValuationOracle {
        event PropertyValuationRequested(uint256 indexed propertyId, bytes32 indexed requestId);
        event PropertyValuationUpdated(uint256 indexed propertyId, uint256 oldValuation, uint256 newValuation);
        event RequestFailed(bytes32 indexed requestId, bytes reason);

        function requestValuationUpdate(uint256 propertyId, string location, uint256 size) external returns (bytes32 requestId);
        function requestValuationUpdateWithKey(uint256 propertyId, string location, uint256 size, string apiKey) external returns (bytes32 requestId);
        function canUserRequestValuation(address user, uint256 propertyId) external view returns (bool);
        function lastRequestTime(uint256 propertyId) external view returns (uint256);
    }
}

pub use IPropertyValuationOracle::{
    PropertyValuationRequested, PropertyValuationUpdated, RequestFailed,
};

// ─── Event topic0 hashes (keccak256 of event signature) ──────────────────────

/// keccak256("PropertyValuationRequested(uint256,bytes32)")
pub const VALUATION_REQUESTED_TOPIC: B256 =
    b256!("8789bc758a791a89cad13bf54b5410060cc91925d3de23c81789d559ee21684e");

/// keccak256("PropertyValuationUpdated(uint256,uint256,uint256)")
pub const VALUATION_UPDATED_TOPIC: B256 =
    b256!("729bbd6326151001530a3cc03636dde6a60c918be78be59d5b8e9a7af0240555");

/// keccak256("RequestFailed(bytes32,bytes)")
pub const REQUEST_FAILED_TOPIC: B256 =
    b256!("61982c98cbc49d11759a948f460b92bca26bdf12ceee12c310f117eb2ca9a9cb");

/// Topics used in eth_getLogs / eth_subscribe filters.
pub fn event_topics() -> Vec<B256> {
    vec![
        VALUATION_REQUESTED_TOPIC,
        VALUATION_UPDATED_TOPIC,
        REQUEST_FAILED_TOPIC,
    ]
}

/// Compute keccak256 hash of a byte slice.
pub fn keccak256(data: &[u8]) -> B256 {
    use tiny_keccak::{Hasher, Keccak};
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    B256::from(output)
}

/// Verify that the pre-computed topic hashes match the event signatures,
/// and that the `sol!` declarations decode the same signatures.
/// Call this at startup to catch any signature mismatches.
pub fn verify_topic_hashes() -> Vec<(String, bool)> {
    let checks = [
        (
            "PropertyValuationRequested(uint256,bytes32)",
            PropertyValuationRequested::SIGNATURE,
            VALUATION_REQUESTED_TOPIC,
        ),
        (
            "PropertyValuationUpdated(uint256,uint256,uint256)",
            PropertyValuationUpdated::SIGNATURE,
            VALUATION_UPDATED_TOPIC,
        ),
        (
            "RequestFailed(bytes32,bytes)",
            RequestFailed::SIGNATURE,
            REQUEST_FAILED_TOPIC,
        ),
    ];

    checks
        .into_iter()
        .map(|(sig, declared, expected)| (sig.to_string(), topic_matches(sig, declared, expected)))
        .collect()
}

fn topic_matches(sig: &str, declared: &str, expected: B256) -> bool {
    sig == declared && keccak256(sig.as_bytes()) == expected
}
