//! Valuation oracle request tracking.
//!
//! Follows asynchronous valuation requests from `PropertyValuationRequested`
//! to their resolution:
//! 1. `PropertyValuationUpdated` for the same property: fulfilled
//! 2. `RequestFailed` for the same request id: failed
//! 3. nothing within the resolve timeout: simulated (demo oracle backends)
//!
//! Architecture:
//! - `EventLogReader`: eth_getLogs over a block range, decoded newest-first
//! - `LogPoller`: re-reads new blocks on an interval through the reader
//! - `LiveSubscriber`: WebSocket log subscription with automatic reconnection
//! - Both listeners send `FeedMessage`s over a `tokio::sync::mpsc` channel to
//!   the `OracleService` actor, which owns the `Reconciler` and its `EventLog`
//! - The reconciler ticks on a fixed interval and emits `OracleNotice`s
//! - `RequestGate` combines the local cooldown with the remote permission view

pub mod abi;
pub mod clock;
pub mod error;
pub mod gate;
pub mod log;
pub mod metrics;
pub mod poller;
pub mod reader;
pub mod reconcile;
pub mod service;
pub mod subscriber;
pub mod transport;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{OracleError, TransportError};
pub use gate::RequestGate;
pub use reader::EventLogReader;
pub use reconcile::{Reconciler, ReconcilerSettings};
pub use service::{OracleService, ServiceSettings};
pub use subscriber::{ListenerHandle, LiveSubscriber};
pub use transport::{AlloyTransport, OracleTransport};
pub use types::{GateDecision, OracleEvent, OracleNotice, OracleStatus, PropertyId};
