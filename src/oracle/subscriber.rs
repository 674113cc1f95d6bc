//! Live oracle event subscriber.
//!
//! Subscribes to the oracle's logs over WebSocket RPC and forwards decoded
//! events as `FeedMessage`s. Transport failures are forwarded too, then the
//! session is re-established with URL rotation and backoff.
//!
//! `start` returns a `ListenerHandle`; cancelling it (or dropping it) aborts
//! the task so nothing is forwarded after teardown.

use crate::oracle::abi;
use crate::oracle::clock::Clock;
use crate::oracle::error::{classify_rpc_error, TransportError};
use crate::oracle::reader::decode_log;
use crate::oracle::types::FeedMessage;
use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SOURCE: &str = "live-subscriber";

/// Owns a background listener task. Cancellation is idempotent and also runs on drop.
pub struct ListenerHandle {
    name: &'static str,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn new(name: &'static str, task: JoinHandle<()>) -> Self {
        Self {
            name,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Detach the listener. Safe to call any number of times.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(listener = self.name, "listener cancelled");
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub struct LiveSubscriber {
    urls: Vec<String>,
    address: Address,
    feed_tx: mpsc::UnboundedSender<FeedMessage>,
    clock: Arc<dyn Clock>,
}

impl LiveSubscriber {
    /// `urls`: primary first, then fallbacks.
    pub fn new(
        urls: Vec<String>,
        address: Address,
        feed_tx: mpsc::UnboundedSender<FeedMessage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            urls,
            address,
            feed_tx,
            clock,
        }
    }

    /// Start the subscriber in a background task. Returns immediately.
    pub fn start(self) -> ListenerHandle {
        ListenerHandle::new(
            SOURCE,
            tokio::spawn(async move {
                self.run_forever().await;
            }),
        )
    }

    /// Connect, subscribe, forward events, reconnect on failure.
    /// Rotates through the configured URLs on consecutive failures.
    async fn run_forever(&self) {
        let max_backoff = Duration::from_secs(60);
        if self.urls.is_empty() {
            error!("no oracle WebSocket URLs configured");
            return;
        }
        let mut url_index = 0;
        let mut consecutive_failures: usize = 0;

        loop {
            if self.feed_tx.is_closed() {
                debug!("feed closed, stopping live subscriber");
                return;
            }

            let url = &self.urls[url_index];
            info!(url = %url, provider = url_index + 1, total = self.urls.len(), "connecting to oracle WebSocket");

            match self.run_session(url).await {
                Ok(()) => {
                    info!("oracle WebSocket session ended cleanly");
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    url_index = self.session_failed(url_index, e);
                }
            }

            let backoff = reconnect_backoff(consecutive_failures, self.urls.len(), max_backoff);
            info!(
                backoff_secs = backoff.as_secs(),
                next_url = %self.urls[url_index],
                failures = consecutive_failures,
                "reconnecting to oracle WebSocket"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Report a failed session to the feed and pick the next URL.
    fn session_failed(&self, url_index: usize, e: TransportError) -> usize {
        let url = &self.urls[url_index];
        if is_rate_limited(&e) {
            warn!(url = %url, "provider rate limited, rotating");
        } else {
            error!(url = %url, error = %e, "oracle WebSocket session error");
        }
        let _ = self.feed_tx.send(FeedMessage::Disconnected {
            source: SOURCE,
            reason: e.to_string(),
        });
        let _ = self.feed_tx.send(FeedMessage::TransportError(e));
        (url_index + 1) % self.urls.len()
    }

    async fn run_session(&self, url: &str) -> Result<(), TransportError> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(url))
            .await
            .map_err(|e| classify_rpc_error(&e))?;

        let _ = self.feed_tx.send(FeedMessage::Connected { source: SOURCE });

        let filter = Filter::new()
            .address(self.address)
            .event_signature(abi::event_topics());
        let sub = provider
            .subscribe_logs(&filter)
            .await
            .map_err(|e| classify_rpc_error(&e))?;
        let mut stream = sub.into_stream();

        info!(oracle = %self.address, "subscribed to oracle events");

        while let Some(log) = stream.next().await {
            if !self.forward(&log) && self.feed_tx.is_closed() {
                break;
            }
        }

        Ok(())
    }

    /// Decode one live log and forward it. Returns whether anything was sent.
    fn forward(&self, log: &Log) -> bool {
        if log.removed {
            debug!(block = ?log.block_number, "ignoring log removed by reorg");
            return false;
        }
        let timestamp_ms = log
            .block_timestamp
            .map(|ts| ts * 1000)
            .unwrap_or_else(|| self.clock.now_ms());

        match decode_log(log, timestamp_ms) {
            Some(event) => self.feed_tx.send(FeedMessage::Event(event)).is_ok(),
            None => {
                debug!(topic = ?log.topic0(), "unrecognised oracle log");
                false
            }
        }
    }
}

fn is_rate_limited(err: &TransportError) -> bool {
    match err {
        TransportError::Rpc { code, message } => {
            *code == 429 || *code == -32005 || message.contains("Too Many Requests")
        }
        TransportError::Connection(msg) => msg.contains("429"),
        _ => false,
    }
}

/// Backoff scales with how many providers have failed in a row. Untried
/// providers are tried quickly; a full failed cycle backs off exponentially.
fn reconnect_backoff(consecutive_failures: usize, providers: usize, max: Duration) -> Duration {
    if consecutive_failures == 0 {
        Duration::from_secs(1)
    } else if consecutive_failures < providers {
        Duration::from_secs(2)
    } else {
        let cycle = consecutive_failures / providers.max(1);
        let secs = 2u64.pow(cycle.min(5) as u32).min(max.as_secs());
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::clock::ManualClock;
    use crate::oracle::transport::mock::{junk_log, requested_log, ORACLE};
    use crate::oracle::types::OracleEvent;
    use alloy::primitives::B256;

    fn subscriber(urls: Vec<String>) -> (LiveSubscriber, mpsc::UnboundedReceiver<FeedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = LiveSubscriber::new(urls, ORACLE, tx, Arc::new(ManualClock::new(42_000)));
        (sub, rx)
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let mut handle = ListenerHandle::new("test", tokio::spawn(std::future::pending::<()>()));
        assert!(handle.is_active());
        handle.cancel();
        handle.cancel();
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_forward_decodes_and_skips() {
        let (sub, mut rx) = subscriber(Vec::new());

        assert!(sub.forward(&requested_log(7, B256::repeat_byte(1), 10, 0, None)));
        match rx.try_recv().unwrap() {
            FeedMessage::Event(OracleEvent::Requested(r)) => {
                // No block timestamp on the live log, so receive time is used.
                assert_eq!(r.timestamp_ms, 42_000);
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut removed = requested_log(7, B256::repeat_byte(2), 11, 0, Some(11));
        removed.removed = true;
        assert!(!sub.forward(&removed));
        assert!(!sub.forward(&junk_log(12, 0)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_urls_exits() {
        let (sub, _rx) = subscriber(Vec::new());
        let mut handle = sub.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_active());
        handle.cancel();
    }

    #[tokio::test]
    async fn test_session_error_reports_and_rotates() {
        let (sub, mut rx) = subscriber(vec!["ws://primary".into(), "ws://fallback".into()]);

        let next = sub.session_failed(0, TransportError::Connection("reset".into()));
        assert_eq!(next, 1);
        match rx.try_recv().unwrap() {
            FeedMessage::Disconnected { source, reason } => {
                assert_eq!(source, "live-subscriber");
                assert_eq!(reason, "connection error: reset");
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.try_recv().unwrap() {
            FeedMessage::TransportError(e) => {
                assert_eq!(e, TransportError::Connection("reset".into()))
            }
            other => panic!("unexpected {other:?}"),
        }

        let rate_limited = TransportError::Rpc {
            code: 429,
            message: "Too Many Requests".into(),
        };
        assert!(is_rate_limited(&rate_limited));
        assert_eq!(sub.session_failed(1, rate_limited), 0);
        assert!(matches!(rx.try_recv().unwrap(), FeedMessage::Disconnected { .. }));
        assert!(matches!(rx.try_recv().unwrap(), FeedMessage::TransportError(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_reconnect_backoff() {
        let max = Duration::from_secs(60);
        assert_eq!(reconnect_backoff(0, 3, max), Duration::from_secs(1));
        assert_eq!(reconnect_backoff(2, 3, max), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(3, 3, max), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(6, 3, max), Duration::from_secs(4));
        assert_eq!(reconnect_backoff(100, 1, max), Duration::from_secs(32));
    }
}
