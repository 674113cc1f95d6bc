//! Property valuation oracle watcher.
//!
//! Tracks the lifecycle of asynchronous valuation requests made against an
//! on-chain property oracle: reads and subscribes to the oracle's events,
//! reconciles requests against their resolutions on a fixed tick, and gates
//! new requests behind a per-property cooldown and a remote authorization
//! check.

pub mod config;
pub mod oracle;
