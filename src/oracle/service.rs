//! Oracle service: the actor that owns the reconciler.
//!
//! Startup backfills recent history through the `EventLogReader`, then
//! starts the `LogPoller` and (when WebSocket URLs are configured) the
//! `LiveSubscriber`. Both feed one mpsc channel. The actor task drains that
//! channel, answers commands and ticks the reconciler, one thing at a time.

use crate::oracle::clock::Clock;
use crate::oracle::error::{OracleError, TransportError};
use crate::oracle::gate::RequestGate;
use crate::oracle::poller::LogPoller;
use crate::oracle::reader::{decode_log, EventLogReader};
use crate::oracle::reconcile::{Reconciler, ReconcilerSettings};
use crate::oracle::subscriber::{ListenerHandle, LiveSubscriber};
use crate::oracle::transport::OracleTransport;
use crate::oracle::types::{
    FeedMessage, GateDecision, OracleEvent, OracleNotice, OracleStatus, PropertyId,
    RequestReceipt, ValuationRequest,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub tick: Duration,
    pub poll_interval: Duration,
    /// Blocks of history read at startup.
    pub lookback_blocks: u64,
    pub chunk_size: u64,
    /// Live subscription endpoints, primary first. Empty disables the subscriber.
    pub ws_urls: Vec<String>,
    pub reconciler: ReconcilerSettings,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            poll_interval: Duration::from_secs(4),
            lookback_blocks: 5_000,
            chunk_size: 9_999,
            ws_urls: Vec::new(),
            reconciler: ReconcilerSettings::default(),
        }
    }
}

enum Command {
    Status {
        property_id: PropertyId,
        reply: oneshot::Sender<OracleStatus>,
    },
    Events {
        property_id: Option<PropertyId>,
        reply: oneshot::Sender<Vec<OracleEvent>>,
    },
    Record {
        event: OracleEvent,
        reply: oneshot::Sender<bool>,
    },
    ReportError {
        error: TransportError,
    },
}

pub struct OracleService<T: OracleTransport + ?Sized> {
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    gate: RequestGate<T>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    listeners: Vec<ListenerHandle>,
    actor: Option<JoinHandle<()>>,
}

impl<T: OracleTransport + ?Sized> OracleService<T> {
    /// Backfill, start the listeners and the actor. Notices arrive on the returned receiver.
    pub async fn start(
        transport: Arc<T>,
        clock: Arc<dyn Clock>,
        settings: ServiceSettings,
    ) -> Result<(Self, mpsc::UnboundedReceiver<OracleNotice>), TransportError> {
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let mut reconciler = Reconciler::new(settings.reconciler.clone(), clock.clone(), notice_tx);
        let mut reader = EventLogReader::new(transport.clone(), clock.clone(), settings.chunk_size);

        let head = transport.block_number().await?;
        let from = head.saturating_sub(settings.lookback_blocks);
        let cursor = match reader.fetch(from, head).await {
            Ok(events) => {
                let total = events.len();
                let mut added = 0usize;
                for event in events.into_iter().rev() {
                    if reconciler.ingest(event) {
                        added += 1;
                    }
                }
                info!(from = from, to = head, events = total, added = added, "oracle history loaded");
                head
            }
            Err(e) => {
                // The poller starts below the lookback window so the range is read again.
                reconciler.report_error(&e);
                warn!(error = %e, "oracle history backfill failed, poller will retry");
                from.saturating_sub(1)
            }
        };

        let mut listeners = Vec::new();
        listeners.push(
            LogPoller::new(
                transport.clone(),
                reader,
                feed_tx.clone(),
                cursor,
                settings.poll_interval,
            )
            .start(),
        );
        if settings.ws_urls.is_empty() {
            info!("no WebSocket endpoint configured, relying on log polling");
        } else {
            listeners.push(
                LiveSubscriber::new(
                    settings.ws_urls.clone(),
                    transport.oracle_address(),
                    feed_tx,
                    clock.clone(),
                )
                .start(),
            );
        }

        let actor = tokio::spawn(run_actor(reconciler, feed_rx, cmd_rx, settings.tick));

        info!(
            oracle = %transport.oracle_address(),
            listeners = listeners.len(),
            tick_ms = settings.tick.as_millis() as u64,
            "oracle service started"
        );

        Ok((
            Self {
                gate: RequestGate::new(transport.clone()),
                transport,
                clock,
                cmd_tx,
                listeners,
                actor: Some(actor),
            },
            notice_rx,
        ))
    }

    async fn call<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, OracleError> {
        if self.actor.is_none() {
            return Err(OracleError::ServiceStopped);
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| OracleError::ServiceStopped)?;
        rx.await.map_err(|_| OracleError::ServiceStopped)
    }

    fn report(&self, error: TransportError) {
        let _ = self.cmd_tx.send(Command::ReportError { error });
    }

    /// Status as of now, including the remote `lastRequestTime` when the node answers.
    pub async fn status(&self, property_id: PropertyId) -> Result<OracleStatus, OracleError> {
        let mut status = self.local_status(property_id).await?;
        match self.transport.last_request_time(property_id).await {
            Ok(0) => {}
            Ok(ts) => status.last_request_time = Some(ts),
            Err(e) => {
                debug!(property = %property_id, error = %e, "lastRequestTime lookup failed");
                self.report(e);
            }
        }
        Ok(status)
    }

    async fn local_status(&self, property_id: PropertyId) -> Result<OracleStatus, OracleError> {
        self.call(|reply| Command::Status { property_id, reply })
            .await
    }

    /// Log snapshot, newest first, optionally for one property.
    pub async fn events(
        &self,
        property_id: Option<PropertyId>,
    ) -> Result<Vec<OracleEvent>, OracleError> {
        self.call(|reply| Command::Events { property_id, reply })
            .await
    }

    pub async fn can_request(&self, property_id: PropertyId) -> Result<GateDecision, OracleError> {
        let status = self.local_status(property_id).await?;
        Ok(self.gate.check(&status).await)
    }

    /// Gate, send the request transaction, record the emitted request event.
    pub async fn request_update(
        &self,
        request: ValuationRequest,
    ) -> Result<RequestReceipt, OracleError> {
        let decision = self.can_request(request.property_id).await?;
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "not allowed".to_string());
            info!(property = %request.property_id, reason = %reason, "valuation request denied");
            return Err(OracleError::Denied(reason));
        }

        let sent = match self.transport.request_valuation_update(&request).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(property = %request.property_id, error = %e, "valuation request failed");
                self.report(e.clone());
                return Err(e.into());
            }
        };

        // Receipt logs rarely carry a block timestamp; use the block header like the reader does.
        let mut header_secs = None;
        if sent.logs.iter().any(|log| log.block_timestamp.is_none()) {
            if let Some(block) = sent.block_number {
                match self.transport.block_timestamp(block).await {
                    Ok(ts) => header_secs = ts,
                    Err(e) => debug!(block = block, error = %e, "block timestamp lookup failed, using local clock"),
                }
            }
        }
        let now = self.clock.now_ms();
        let requested = sent
            .logs
            .iter()
            .filter_map(|log| {
                let ts = log
                    .block_timestamp
                    .or(header_secs)
                    .map(|t| t * 1000)
                    .unwrap_or(now);
                decode_log(log, ts)
            })
            .find_map(|event| match event {
                OracleEvent::Requested(r) if r.property_id == request.property_id => Some(r),
                _ => None,
            });

        match &requested {
            Some(r) => {
                self.call(|reply| Command::Record {
                    event: OracleEvent::Requested(r.clone()),
                    reply,
                })
                .await?;
                info!(
                    property = %r.property_id,
                    request_id = %r.request_id,
                    tx = %sent.tx_hash,
                    "valuation request confirmed"
                );
            }
            None => warn!(tx = %sent.tx_hash, "request receipt carried no valuation request event"),
        }

        Ok(RequestReceipt {
            tx_hash: sent.tx_hash,
            block_number: sent.block_number,
            requested,
        })
    }

    /// Stop every listener and the actor. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        for listener in &mut self.listeners {
            listener.cancel();
        }
        if let Some(actor) = self.actor.take() {
            actor.abort();
            info!("oracle service stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.actor.as_ref().is_some_and(|a| !a.is_finished())
    }
}

impl<T: OracleTransport + ?Sized> Drop for OracleService<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_actor(
    mut reconciler: Reconciler,
    mut feed_rx: mpsc::UnboundedReceiver<FeedMessage>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(msg) = feed_rx.recv() => handle_feed(&mut reconciler, msg),
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => handle_command(&mut reconciler, cmd),
                None => {
                    debug!("command channel closed, oracle actor exiting");
                    return;
                }
            },
            _ = ticker.tick() => {
                let report = reconciler.tick();
                if !report.simulated.is_empty() || !report.resolved.is_empty() || !report.failed.is_empty() {
                    debug!(
                        pending = report.pending,
                        resolved = report.resolved.len(),
                        failed = report.failed.len(),
                        simulated = report.simulated.len(),
                        "reconcile tick"
                    );
                }
            }
        }
    }
}

fn handle_feed(reconciler: &mut Reconciler, msg: FeedMessage) {
    match msg {
        FeedMessage::Event(event) => {
            reconciler.ingest(event);
        }
        FeedMessage::TransportError(e) => reconciler.report_error(&e),
        FeedMessage::Connected { source } => info!(source = source, "oracle feed connected"),
        FeedMessage::Disconnected { source, reason } => {
            warn!(source = source, reason = %reason, "oracle feed disconnected")
        }
    }
}

fn handle_command(reconciler: &mut Reconciler, cmd: Command) {
    match cmd {
        Command::Status { property_id, reply } => {
            let _ = reply.send(reconciler.status(property_id));
        }
        Command::Events { property_id, reply } => {
            let _ = reply.send(reconciler.events(property_id));
        }
        Command::Record { event, reply } => {
            let _ = reply.send(reconciler.ingest(event));
        }
        Command::ReportError { error } => reconciler.report_error(&error),
    }
}
