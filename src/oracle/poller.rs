//! Interval log poller.
//!
//! Reads every block past its cursor through the `EventLogReader` and
//! forwards the events oldest-first. Keeps the event log current when no
//! WebSocket endpoint is available and fills gaps while the live subscriber
//! reconnects. Benign transport errors are swallowed here and retried on
//! the next poll; the cursor only moves after a successful read.

use crate::oracle::error::TransportError;
use crate::oracle::reader::EventLogReader;
use crate::oracle::subscriber::ListenerHandle;
use crate::oracle::transport::OracleTransport;
use crate::oracle::types::FeedMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

const SOURCE: &str = "log-poller";

pub struct LogPoller<T: OracleTransport + ?Sized> {
    transport: Arc<T>,
    reader: EventLogReader<T>,
    feed_tx: mpsc::UnboundedSender<FeedMessage>,
    /// Last block already read.
    cursor: u64,
    interval: Duration,
}

impl<T: OracleTransport + ?Sized> LogPoller<T> {
    pub fn new(
        transport: Arc<T>,
        reader: EventLogReader<T>,
        feed_tx: mpsc::UnboundedSender<FeedMessage>,
        cursor: u64,
        interval: Duration,
    ) -> Self {
        Self {
            transport,
            reader,
            feed_tx,
            cursor,
            interval,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Read blocks `(cursor, head]` and forward their events. Returns how many were forwarded.
    pub async fn poll_once(&mut self) -> Result<usize, TransportError> {
        let head = self.transport.block_number().await?;
        if head <= self.cursor {
            return Ok(0);
        }
        let events = self.reader.fetch(self.cursor + 1, head).await?;
        let count = events.len();
        for event in events.into_iter().rev() {
            let _ = self.feed_tx.send(FeedMessage::Event(event));
        }
        debug!(from = self.cursor + 1, to = head, events = count, "polled oracle logs");
        self.cursor = head;
        Ok(count)
    }

    /// Start polling in a background task. Returns immediately.
    pub fn start(mut self) -> ListenerHandle
    where
        T: 'static,
    {
        ListenerHandle::new(
            SOURCE,
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if self.feed_tx.is_closed() {
                        debug!("feed closed, stopping log poller");
                        return;
                    }
                    match self.poll_once().await {
                        Ok(_) => {}
                        Err(e) if e.is_benign() => {
                            debug!(error = %e, cursor = self.cursor, "benign poll error, retrying next cycle");
                        }
                        Err(e) => {
                            warn!(error = %e, cursor = self.cursor, "oracle log poll failed");
                            let _ = self.feed_tx.send(FeedMessage::TransportError(e));
                        }
                    }
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::clock::ManualClock;
    use crate::oracle::transport::mock::{requested_log, updated_log, MockTransport};
    use alloy::primitives::B256;

    fn poller(
        transport: Arc<MockTransport>,
        cursor: u64,
        interval: Duration,
    ) -> (LogPoller<MockTransport>, mpsc::UnboundedReceiver<FeedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = EventLogReader::new(transport.clone(), Arc::new(ManualClock::new(0)), 1_000);
        (LogPoller::new(transport, reader, tx, cursor, interval), rx)
    }

    #[tokio::test]
    async fn test_poll_forwards_oldest_first_and_advances() {
        let transport = Arc::new(MockTransport::new(None));
        transport.with_state(|s| {
            s.head = 20;
            s.logs = vec![
                requested_log(7, B256::repeat_byte(1), 5, 0, Some(5)),
                requested_log(7, B256::repeat_byte(2), 12, 0, Some(12)),
                updated_log(7, 1, 2, 15, 0, Some(15)),
            ];
        });
        let (mut p, mut rx) = poller(transport.clone(), 10, Duration::from_secs(1));

        assert_eq!(p.poll_once().await.unwrap(), 2);
        assert_eq!(p.cursor(), 20);
        let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|m| match m {
                FeedMessage::Event(e) => e.kind(),
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["requested", "updated"]);

        // Nothing new.
        assert_eq!(p.poll_once().await.unwrap(), 0);
        assert_eq!(transport.state.lock().unwrap().log_queries, vec![(11, 20)]);
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_cursor() {
        let transport = Arc::new(MockTransport::new(None));
        transport.with_state(|s| {
            s.head = 8;
            s.log_errors.push_back(TransportError::FilterExpired);
        });
        let (mut p, _rx) = poller(transport, 3, Duration::from_secs(1));

        assert!(p.poll_once().await.unwrap_err().is_benign());
        assert_eq!(p.cursor(), 3);
        p.poll_once().await.unwrap();
        assert_eq!(p.cursor(), 8);
    }

    #[tokio::test]
    async fn test_background_poller_swallows_benign_errors() {
        let transport = Arc::new(MockTransport::new(None));
        transport.with_state(|s| {
            s.head = 4;
            s.log_errors.push_back(TransportError::FilterExpired);
            s.log_errors.push_back(TransportError::Connection("reset".into()));
            s.logs = vec![requested_log(1, B256::repeat_byte(9), 4, 0, Some(4))];
        });
        let (p, mut rx) = poller(transport, 0, Duration::from_millis(5));
        let mut handle = p.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();

        let messages: Vec<FeedMessage> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let errors: Vec<&TransportError> = messages
            .iter()
            .filter_map(|m| match m {
                FeedMessage::TransportError(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![&TransportError::Connection("reset".into())]);
        assert_eq!(
            messages
                .iter()
                .filter(|m| matches!(m, FeedMessage::Event(_)))
                .count(),
            1
        );
    }
}
