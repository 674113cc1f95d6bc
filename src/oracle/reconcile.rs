//! Request reconciliation.
//!
//! Each tick takes a snapshot of the event log and settles every open
//! `PropertyValuationRequested`:
//! - a later `PropertyValuationUpdated` for the property, or `RequestFailed`
//!   for the request id, settles it for real
//! - past the resolve timeout with simulation enabled, a placeholder
//!   resolution is synthesized (once per request id)
//! - otherwise it stays pending
//!
//! Requests older than the stale threshold are hidden from the pending count
//! but keep their state; staleness never settles a request.
//!
//! Per request: NONE -> REQUESTED -> {RESOLVED | FAILED | SIMULATED_RESOLVED},
//! with REQUESTED shown as STALE once it is old enough.

use crate::oracle::clock::Clock;
use crate::oracle::error::TransportError;
use crate::oracle::log::{EventLog, PushOutcome};
use crate::oracle::metrics::{ResolutionKind, ResolutionMetrics, ResolutionRecord};
use crate::oracle::types::{
    OracleEvent, OracleNotice, OracleStatus, PropertyId, RequestId, SimulatedResolution,
    ValuationFailed, ValuationRequested,
};
use alloy::primitives::U256;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Age at which an unanswered request is simulated.
    pub resolve_timeout: Duration,
    /// Age at which a pending request is hidden from the pending count.
    pub stale_after: Duration,
    /// Minimum time between a resolution and the next request for a property.
    pub cooldown: Duration,
    pub simulate_resolutions: bool,
    pub placeholder_valuation: U256,
    pub log_capacity: usize,
    /// Emit a summary notice every N ticks (0 = never).
    pub summary_every_ticks: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(5),
            stale_after: Duration::from_secs(600),
            cooldown: Duration::from_secs(3600),
            simulate_resolutions: true,
            placeholder_valuation: U256::from(500_000u64),
            log_capacity: 10_000,
            summary_every_ticks: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    /// Pending but old enough to be presumed abandoned. Display only.
    Stale,
    Resolved,
    Failed,
    SimulatedResolved,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Resolved | RequestState::Failed | RequestState::SimulatedResolved
        )
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestState::Pending => write!(f, "PENDING"),
            RequestState::Stale => write!(f, "STALE"),
            RequestState::Resolved => write!(f, "RESOLVED"),
            RequestState::Failed => write!(f, "FAILED"),
            RequestState::SimulatedResolved => write!(f, "SIMULATED_RESOLVED"),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pending: usize,
    pub resolved: Vec<RequestId>,
    pub failed: Vec<RequestId>,
    pub simulated: Vec<RequestId>,
}

#[derive(Debug, Clone, Copy)]
struct Settlement {
    state: RequestState,
    at_ms: u64,
}

/// Owns the event log and every piece of reconciliation state.
pub struct Reconciler {
    settings: ReconcilerSettings,
    clock: Arc<dyn Clock>,
    log: EventLog,
    settled: HashMap<RequestId, Settlement>,
    last_resolution: HashMap<PropertyId, u64>,
    metrics: ResolutionMetrics,
    last_error: Option<String>,
    notice_tx: mpsc::UnboundedSender<OracleNotice>,
    tick_count: u64,
}

impl Reconciler {
    pub fn new(
        settings: ReconcilerSettings,
        clock: Arc<dyn Clock>,
        notice_tx: mpsc::UnboundedSender<OracleNotice>,
    ) -> Self {
        let log = EventLog::new(settings.log_capacity);
        Self {
            settings,
            clock,
            log,
            settled: HashMap::new(),
            last_resolution: HashMap::new(),
            metrics: ResolutionMetrics::new(),
            last_error: None,
            notice_tx,
            tick_count: 0,
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Append an event to the log. Returns false for duplicates.
    pub fn ingest(&mut self, event: OracleEvent) -> bool {
        let observed = match &event {
            OracleEvent::Requested(r) => Some((r.property_id, r.request_id)),
            _ => None,
        };
        let desc = event.to_string();
        if !self.append(event) {
            return false;
        }
        debug!(event = %desc, "oracle event recorded");
        if let Some((property_id, request_id)) = observed {
            let _ = self.notice_tx.send(OracleNotice::RequestObserved {
                property_id,
                request_id,
            });
        }
        true
    }

    /// Push into the log, forgetting the settlement of a request that falls out of it.
    fn append(&mut self, event: OracleEvent) -> bool {
        match self.log.push(event) {
            PushOutcome::Duplicate => false,
            PushOutcome::Appended => true,
            PushOutcome::Evicted(OracleEvent::Requested(old)) => {
                if self.settled.remove(&old.request_id).is_some() {
                    debug!(request_id = %old.request_id, "evicted settled request");
                }
                true
            }
            PushOutcome::Evicted(_) => true,
        }
    }

    /// Record a transport error. Benign errors are dropped here.
    pub fn report_error(&mut self, error: &TransportError) {
        if error.is_benign() {
            debug!(error = %error, "benign transport error, retrying next cycle");
            return;
        }
        warn!(error = %error, "oracle transport error");
        self.last_error = Some(error.to_string());
        let _ = self.notice_tx.send(OracleNotice::Error {
            message: error.to_string(),
        });
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn metrics(&self) -> &ResolutionMetrics {
        &self.metrics
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Events newest-first, optionally for one property.
    pub fn events(&self, property_id: Option<PropertyId>) -> Vec<OracleEvent> {
        match property_id {
            Some(pid) => self.log.for_property(pid),
            None => self.log.snapshot(),
        }
    }

    /// One reconciliation pass over a snapshot taken at tick start.
    pub fn tick(&mut self) -> TickReport {
        let now = self.clock.now_ms();
        self.tick_count += 1;

        // Decide every open request against the log as it stands at tick start.
        let decisions: Vec<(ValuationRequested, Option<OracleEvent>)> = {
            let index = ResolutionIndex::build(self.log.newest_first());
            self.log
                .newest_first()
                .filter_map(|e| match e {
                    OracleEvent::Requested(r) if !self.settled.contains_key(&r.request_id) => {
                        Some((r.clone(), index.resolution_for(e).cloned()))
                    }
                    _ => None,
                })
                .collect()
        };

        let mut report = TickReport::default();
        for (request, resolution) in &decisions {
            match resolution {
                Some(OracleEvent::Updated(update)) => {
                    self.settle(request, RequestState::Resolved, update.timestamp_ms);
                    let latency_ms = update.timestamp_ms.saturating_sub(request.timestamp_ms);
                    info!(
                        property = %request.property_id,
                        request_id = %request.request_id,
                        old = %update.old_valuation,
                        new = %update.new_valuation,
                        latency_ms = latency_ms,
                        "valuation request fulfilled"
                    );
                    let _ = self.notice_tx.send(OracleNotice::Resolved {
                        property_id: request.property_id,
                        request_id: request.request_id,
                        old_valuation: update.old_valuation,
                        new_valuation: update.new_valuation,
                        change_pct: change_pct(update.old_valuation, update.new_valuation),
                        latency_ms,
                    });
                    report.resolved.push(request.request_id);
                }
                Some(OracleEvent::Failed(failure)) => {
                    self.settle(request, RequestState::Failed, failure.timestamp_ms);
                    let latency_ms = failure.timestamp_ms.saturating_sub(request.timestamp_ms);
                    warn!(
                        property = %request.property_id,
                        request_id = %request.request_id,
                        error = %failure.error,
                        "valuation request failed on chain"
                    );
                    let _ = self.notice_tx.send(OracleNotice::Failed {
                        property_id: request.property_id,
                        request_id: request.request_id,
                        reason: failure.error.clone(),
                        latency_ms,
                    });
                    report.failed.push(request.request_id);
                }
                // A simulated record is only ever written together with its settlement.
                Some(OracleEvent::Simulated(sim)) => {
                    self.settle(request, RequestState::SimulatedResolved, sim.timestamp_ms);
                }
                Some(OracleEvent::Requested(_)) | None => {
                    let age = now.saturating_sub(request.timestamp_ms);
                    if self.settings.simulate_resolutions
                        && age >= self.settings.resolve_timeout.as_millis() as u64
                    {
                        self.simulate(request, now);
                        report.simulated.push(request.request_id);
                    } else {
                        report.pending += 1;
                    }
                }
            }
        }

        // Older resolutions are still visible in the log; this map only needs the cooldown window.
        let cooldown_ms = self.settings.cooldown.as_millis() as u64;
        self.last_resolution
            .retain(|_, at| now.saturating_sub(*at) < cooldown_ms);

        if self.settings.summary_every_ticks > 0
            && self.tick_count % self.settings.summary_every_ticks == 0
        {
            self.emit_summary(report.pending);
        }

        report
    }

    fn settle(&mut self, request: &ValuationRequested, state: RequestState, at_ms: u64) {
        self.settled.insert(request.request_id, Settlement { state, at_ms });
        let last = self.last_resolution.entry(request.property_id).or_insert(at_ms);
        *last = (*last).max(at_ms);

        let kind = match state {
            RequestState::Resolved => ResolutionKind::Fulfilled,
            RequestState::Failed => ResolutionKind::Failed,
            RequestState::SimulatedResolved => ResolutionKind::Simulated,
            RequestState::Pending | RequestState::Stale => return,
        };
        self.metrics.record(ResolutionRecord {
            property_id: request.property_id,
            request_id: request.request_id,
            kind,
            latency_ms: at_ms.saturating_sub(request.timestamp_ms),
            recorded_at_ms: self.clock.now_ms(),
        });
    }

    fn simulate(&mut self, request: &ValuationRequested, now: u64) {
        let resolution = SimulatedResolution {
            request_id: request.request_id,
            property_id: request.property_id,
            new_valuation: self.settings.placeholder_valuation,
            timestamp_ms: now,
            resolved: true,
        };
        self.append(OracleEvent::Simulated(resolution));
        self.settle(request, RequestState::SimulatedResolved, now);

        warn!(
            property = %request.property_id,
            request_id = %request.request_id,
            placeholder = %self.settings.placeholder_valuation,
            "oracle did not answer in time, recorded simulated resolution"
        );
        let _ = self.notice_tx.send(OracleNotice::SimulatedResolved {
            property_id: request.property_id,
            request_id: request.request_id,
            placeholder_valuation: self.settings.placeholder_valuation,
        });
    }

    fn emit_summary(&self, pending: usize) {
        let tracked_requests = self
            .log
            .newest_first()
            .filter(|e| matches!(e, OracleEvent::Requested(_)))
            .count();
        let _ = self.notice_tx.send(OracleNotice::Summary {
            tracked_requests,
            pending,
            resolved: self.metrics.fulfilled(),
            failed: self.metrics.failed(),
            simulated: self.metrics.simulated(),
            avg_latency_ms: self.metrics.avg_latency_ms(None),
        });
    }

    /// Current state of one request, `None` if it was never seen.
    pub fn request_state(&self, request_id: RequestId) -> Option<RequestState> {
        if let Some(s) = self.settled.get(&request_id) {
            return Some(s.state);
        }
        let (event, request) = self.log.newest_first().find_map(|e| match e {
            OracleEvent::Requested(r) if r.request_id == request_id => Some((e, r)),
            _ => None,
        })?;
        let index = ResolutionIndex::build(self.log.newest_first());
        Some(match index.resolution_for(event) {
            Some(OracleEvent::Updated(_)) => RequestState::Resolved,
            Some(OracleEvent::Failed(_)) => RequestState::Failed,
            Some(OracleEvent::Simulated(_)) => RequestState::SimulatedResolved,
            Some(OracleEvent::Requested(_)) | None => {
                if self.is_stale(request, self.clock.now_ms()) {
                    RequestState::Stale
                } else {
                    RequestState::Pending
                }
            }
        })
    }

    /// When the request with this id settled, if it has.
    pub fn settled_at(&self, request_id: RequestId) -> Option<u64> {
        self.settled.get(&request_id).map(|s| s.at_ms)
    }

    fn is_stale(&self, request: &ValuationRequested, now: u64) -> bool {
        now.saturating_sub(request.timestamp_ms) >= self.settings.stale_after.as_millis() as u64
    }

    /// Oracle status for one property as of now.
    pub fn status(&self, property_id: PropertyId) -> OracleStatus {
        let now = self.clock.now_ms();
        let index = ResolutionIndex::build(self.log.newest_first());

        let mut pending = 0usize;
        let mut stale = 0usize;
        let mut latest_resolution = self.last_resolution.get(&property_id).copied();
        let mut latest: Option<(&OracleEvent, u64, U256)> = None;

        let mut resolved_at = |at: u64| {
            latest_resolution = Some(latest_resolution.map_or(at, |t| t.max(at)));
        };

        for event in self.log.newest_first() {
            match event {
                OracleEvent::Requested(r) if r.property_id == property_id => {
                    for failure in index.failures(r.request_id) {
                        resolved_at(failure.timestamp_ms);
                    }
                    if self.settled.contains_key(&r.request_id) || index.is_settled(event) {
                        continue;
                    }
                    if self.is_stale(r, now) {
                        stale += 1;
                    } else {
                        pending += 1;
                    }
                }
                OracleEvent::Updated(u) if u.property_id == property_id => {
                    resolved_at(u.timestamp_ms);
                    if latest.map_or(true, |(best, _, _)| event.is_later_than(best)) {
                        latest = Some((event, u.timestamp_ms, u.new_valuation));
                    }
                }
                OracleEvent::Simulated(s) if s.property_id == property_id => {
                    resolved_at(s.timestamp_ms);
                    if latest.map_or(true, |(best, _, _)| event.is_later_than(best)) {
                        latest = Some((event, s.timestamp_ms, s.new_valuation));
                    }
                }
                _ => {}
            }
        }

        let cooldown_ms = self.settings.cooldown.as_millis() as u64;
        let cooldown_remaining_ms = latest_resolution
            .map(|t| cooldown_ms.saturating_sub(now.saturating_sub(t)))
            .unwrap_or(0);
        let has_pending_request = pending > 0;

        OracleStatus {
            property_id,
            pending_requests: pending,
            stale_requests: stale,
            has_pending_request,
            latest_valuation: latest.map(|(_, _, v)| v),
            last_update_ms: latest.map(|(_, ts, _)| ts),
            last_resolution_ms: latest_resolution,
            cooldown_remaining_ms,
            can_request_update: !has_pending_request && cooldown_remaining_ms == 0,
            last_request_time: None,
            last_error: self.last_error.clone(),
        }
    }
}

/// Resolution candidates for one pass over the log: updates by property,
/// failures and simulated records by request id.
struct ResolutionIndex<'a> {
    updates: HashMap<PropertyId, Vec<&'a OracleEvent>>,
    latest_update: HashMap<PropertyId, &'a OracleEvent>,
    by_request: HashMap<RequestId, Vec<&'a OracleEvent>>,
}

impl<'a> ResolutionIndex<'a> {
    fn build(events: impl Iterator<Item = &'a OracleEvent>) -> Self {
        let mut index = Self {
            updates: HashMap::new(),
            latest_update: HashMap::new(),
            by_request: HashMap::new(),
        };
        for event in events {
            match event {
                OracleEvent::Updated(u) => {
                    index.updates.entry(u.property_id).or_default().push(event);
                    let latest = index.latest_update.entry(u.property_id).or_insert(event);
                    if event.is_later_than(*latest) {
                        *latest = event;
                    }
                }
                OracleEvent::Failed(f) => index.by_request.entry(f.request_id).or_default().push(event),
                OracleEvent::Simulated(s) => {
                    index.by_request.entry(s.request_id).or_default().push(event)
                }
                OracleEvent::Requested(_) => {}
            }
        }
        index
    }

    fn failures(&self, request_id: RequestId) -> impl Iterator<Item = &'a ValuationFailed> + '_ {
        self.by_request
            .get(&request_id)
            .into_iter()
            .flatten()
            .copied()
            .filter_map(|e| match e {
                OracleEvent::Failed(f) => Some(f),
                _ => None,
            })
    }

    /// Whether anything in the log settles `request`.
    fn is_settled(&self, request: &OracleEvent) -> bool {
        let Some((property_id, request_id)) = request_ids(request) else {
            return false;
        };
        self.latest_update
            .get(&property_id)
            .is_some_and(|u| u.is_later_than(request))
            || self
                .by_request
                .get(&request_id)
                .into_iter()
                .flatten()
                .copied()
                .any(|e| settles(e, request))
    }

    /// The earliest event, later than the request, that settles it.
    fn resolution_for(&self, request: &OracleEvent) -> Option<&'a OracleEvent> {
        let (property_id, request_id) = request_ids(request)?;
        let updates = self.updates.get(&property_id).into_iter().flatten();
        let by_request = self.by_request.get(&request_id).into_iter().flatten();
        updates
            .chain(by_request)
            .copied()
            .filter(|e| settles(e, request))
            .fold(None, |best: Option<&'a OracleEvent>, e| match best {
                Some(b) if !b.is_later_than(e) => Some(b),
                _ => Some(e),
            })
    }
}

fn request_ids(event: &OracleEvent) -> Option<(PropertyId, RequestId)> {
    match event {
        OracleEvent::Requested(r) => Some((r.property_id, r.request_id)),
        _ => None,
    }
}

/// A candidate settles a request when it is later. A simulated record is
/// tied to its request id, never to ordering.
fn settles(candidate: &OracleEvent, request: &OracleEvent) -> bool {
    matches!(candidate, OracleEvent::Simulated(_)) || candidate.is_later_than(request)
}

/// Percent change between two valuations, rounded to 2dp.
fn change_pct(old: U256, new: U256) -> Option<Decimal> {
    let old = Decimal::from_u128(u128::try_from(old).ok()?)?;
    let new = Decimal::from_u128(u128::try_from(new).ok()?)?;
    if old.is_zero() {
        return None;
    }
    let pct = (new - old).checked_div(old)?.checked_mul(Decimal::ONE_HUNDRED)?;
    Some(pct.round_dp(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::clock::ManualClock;
    use crate::oracle::types::{ChainMeta, ValuationFailed, ValuationUpdated};
    use alloy::primitives::B256;

    const T0: u64 = 1_700_000_000_000;

    fn setup(
        settings: ReconcilerSettings,
    ) -> (Reconciler, ManualClock, mpsc::UnboundedReceiver<OracleNotice>) {
        let clock = ManualClock::new(T0);
        let (tx, rx) = mpsc::unbounded_channel();
        (Reconciler::new(settings, Arc::new(clock.clone()), tx), clock, rx)
    }

    fn meta(block: u64, index: u64) -> ChainMeta {
        ChainMeta {
            block_number: block,
            tx_hash: B256::left_padding_from(&(block * 100 + index).to_be_bytes()),
            log_index: index,
        }
    }

    fn request(pid: u64, rid: u8, ts: u64, block: u64) -> OracleEvent {
        OracleEvent::Requested(ValuationRequested {
            property_id: U256::from(pid),
            request_id: B256::repeat_byte(rid),
            timestamp_ms: ts,
            chain: meta(block, 100 + rid as u64),
        })
    }

    fn update(pid: u64, old: u64, new: u64, ts: u64, block: u64) -> OracleEvent {
        OracleEvent::Updated(ValuationUpdated {
            property_id: U256::from(pid),
            old_valuation: U256::from(old),
            new_valuation: U256::from(new),
            timestamp_ms: ts,
            chain: meta(block, 1),
        })
    }

    fn failure(rid: u8, ts: u64, block: u64) -> OracleEvent {
        OracleEvent::Failed(ValuationFailed {
            request_id: B256::repeat_byte(rid),
            error: "source unavailable".to_string(),
            timestamp_ms: ts,
            chain: meta(block, 2),
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OracleNotice>) -> Vec<OracleNotice> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[test]
    fn test_young_request_is_pending() {
        let (mut r, clock, mut rx) = setup(ReconcilerSettings::default());
        r.ingest(request(7, 1, T0, 10));
        clock.advance(Duration::from_millis(4_999));

        let report = r.tick();
        assert_eq!(report.pending, 1);
        assert!(report.simulated.is_empty());
        assert_eq!(r.request_state(B256::repeat_byte(1)), Some(RequestState::Pending));

        let status = r.status(U256::from(7));
        assert_eq!(status.pending_requests, 1);
        assert!(status.has_pending_request);
        assert!(!status.can_request_update);
        assert!(matches!(drain(&mut rx)[0], OracleNotice::RequestObserved { .. }));
    }

    #[test]
    fn test_later_update_resolves_request() {
        let (mut r, clock, mut rx) = setup(ReconcilerSettings::default());
        r.ingest(request(7, 1, T0, 10));
        r.ingest(update(7, 1_000, 1_100, T0 + 2_000, 11));
        clock.advance(Duration::from_secs(3));

        let report = r.tick();
        assert_eq!(report.resolved, vec![B256::repeat_byte(1)]);
        assert_eq!(r.request_state(B256::repeat_byte(1)), Some(RequestState::Resolved));
        assert_eq!(r.settled_at(B256::repeat_byte(1)), Some(T0 + 2_000));
        assert_eq!(r.metrics().fulfilled(), 1);

        let notices = drain(&mut rx);
        let resolved = notices
            .iter()
            .find_map(|n| match n {
                OracleNotice::Resolved { change_pct, latency_ms, .. } => Some((*change_pct, *latency_ms)),
                _ => None,
            })
            .unwrap();
        assert_eq!(resolved, (Some(Decimal::from(10)), 2_000));

        let status = r.status(U256::from(7));
        assert_eq!(status.latest_valuation, Some(U256::from(1_100)));
        assert_eq!(status.last_resolution_ms, Some(T0 + 2_000));
    }

    #[test]
    fn test_update_older_than_request_does_not_resolve() {
        let (mut r, clock, _rx) = setup(ReconcilerSettings {
            simulate_resolutions: false,
            ..Default::default()
        });
        r.ingest(update(7, 900, 1_000, T0 - 60_000, 9));
        r.ingest(request(7, 1, T0, 10));
        clock.advance(Duration::from_secs(30));

        let report = r.tick();
        assert_eq!(report.pending, 1);
        assert!(report.resolved.is_empty());
    }

    fn at(block: u64, log_index: u64) -> ChainMeta {
        ChainMeta {
            block_number: block,
            tx_hash: B256::repeat_byte(block as u8),
            log_index,
        }
    }

    #[test]
    fn test_same_block_update_resolves_by_log_index() {
        let (mut r, clock, _rx) = setup(ReconcilerSettings::default());
        let request = |rid: u8, log_index| {
            OracleEvent::Requested(ValuationRequested {
                property_id: U256::from(7),
                request_id: B256::repeat_byte(rid),
                timestamp_ms: T0,
                chain: at(10, log_index),
            })
        };
        r.ingest(request(1, 0));
        r.ingest(request(2, 2));
        r.ingest(OracleEvent::Updated(ValuationUpdated {
            property_id: U256::from(7),
            old_valuation: U256::from(100),
            new_valuation: U256::from(200),
            timestamp_ms: T0,
            chain: at(10, 1),
        }));
        clock.advance(Duration::from_secs(6));

        let report = r.tick();
        assert_eq!(report.resolved, vec![B256::repeat_byte(1)]);
        // The request logged after the update is not answered by it.
        assert_eq!(report.simulated, vec![B256::repeat_byte(2)]);
    }

    #[test]
    fn test_block_order_beats_skewed_timestamps() {
        let (mut r, clock, _rx) = setup(ReconcilerSettings::default());
        // Request stamped by a local clock running ahead of block time.
        r.ingest(OracleEvent::Requested(ValuationRequested {
            property_id: U256::from(7),
            request_id: B256::repeat_byte(1),
            timestamp_ms: T0 + 900,
            chain: at(20, 0),
        }));
        r.ingest(OracleEvent::Updated(ValuationUpdated {
            property_id: U256::from(7),
            old_valuation: U256::from(100),
            new_valuation: U256::from(200),
            timestamp_ms: T0,
            chain: at(21, 0),
        }));
        clock.advance(Duration::from_secs(6));

        let report = r.tick();
        assert_eq!(report.resolved, vec![B256::repeat_byte(1)]);
        assert!(report.simulated.is_empty());
        assert_eq!(r.status(U256::from(7)).latest_valuation, Some(U256::from(200)));
    }

    #[test]
    fn test_evicted_request_forgets_settlement() {
        let (mut r, clock, _rx) = setup(ReconcilerSettings {
            log_capacity: 2,
            ..Default::default()
        });
        r.ingest(request(7, 1, T0, 10));
        clock.advance(Duration::from_secs(5));
        r.tick();
        assert!(r.settled_at(B256::repeat_byte(1)).is_some());

        // Log now holds [request 1, simulated 1]; request 2 pushes request 1 out.
        r.ingest(request(8, 2, T0 + 5_000, 11));
        assert_eq!(r.settled_at(B256::repeat_byte(1)), None);
        assert_eq!(r.request_state(B256::repeat_byte(1)), None);
        assert_eq!(r.settled.len(), 0);
    }

    #[test]
    fn test_resolution_times_dropped_after_cooldown() {
        let (mut r, clock, _rx) = setup(ReconcilerSettings::default());
        r.ingest(request(7, 1, T0, 10));
        clock.advance(Duration::from_secs(5));
        r.tick();
        assert_eq!(r.last_resolution.len(), 1);

        clock.advance(Duration::from_secs(3600));
        r.tick();
        assert!(r.last_resolution.is_empty());
        let status = r.status(U256::from(7));
        assert!(status.can_request_update);
        assert_eq!(status.last_resolution_ms, Some(T0 + 5_000));
    }

    #[test]
    fn test_failure_settles_matching_request_only() {
        let (mut r, clock, mut rx) = setup(ReconcilerSettings {
            simulate_resolutions: false,
            ..Default::default()
        });
        r.ingest(request(7, 1, T0, 10));
        r.ingest(request(8, 2, T0, 10));
        r.ingest(failure(1, T0 + 1_000, 11));
        clock.advance(Duration::from_secs(2));

        let report = r.tick();
        assert_eq!(report.failed, vec![B256::repeat_byte(1)]);
        assert_eq!(report.pending, 1);
        assert_eq!(r.request_state(B256::repeat_byte(1)), Some(RequestState::Failed));
        assert_eq!(r.request_state(B256::repeat_byte(2)), Some(RequestState::Pending));

        let failed = drain(&mut rx)
            .into_iter()
            .find_map(|n| match n {
                OracleNotice::Failed { property_id, reason, .. } => Some((property_id, reason)),
                _ => None,
            })
            .unwrap();
        assert_eq!(failed, (U256::from(7), "source unavailable".to_string()));
    }

    #[test]
    fn test_simulated_resolution_is_created_once() {
        let (mut r, clock, mut rx) = setup(ReconcilerSettings::default());
        r.ingest(request(7, 1, T0, 10));
        clock.advance(Duration::from_secs(5));

        let report = r.tick();
        assert_eq!(report.simulated, vec![B256::repeat_byte(1)]);

        clock.advance(Duration::from_secs(1));
        let again = r.tick();
        assert!(again.simulated.is_empty());
        assert_eq!(again.pending, 0);

        let simulated: Vec<_> = r
            .events(Some(U256::from(7)))
            .into_iter()
            .filter(|e| matches!(e, OracleEvent::Simulated(_)))
            .collect();
        assert_eq!(simulated.len(), 1);
        assert_eq!(r.metrics().simulated(), 1);

        let count = drain(&mut rx)
            .iter()
            .filter(|n| matches!(n, OracleNotice::SimulatedResolved { .. }))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_simulation_disabled_leaves_request_pending() {
        let (mut r, clock, _rx) = setup(ReconcilerSettings {
            simulate_resolutions: false,
            ..Default::default()
        });
        r.ingest(request(7, 1, T0, 10));
        clock.advance(Duration::from_secs(60));
        let report = r.tick();
        assert_eq!(report.pending, 1);
        assert!(report.simulated.is_empty());
    }

    #[test]
    fn test_stale_request_hidden_but_still_simulated() {
        let (mut r, clock, _rx) = setup(ReconcilerSettings::default());
        let eleven_min = 11 * 60 * 1000;
        r.ingest(request(7, 1, T0 - eleven_min, 10));

        let status = r.status(U256::from(7));
        assert_eq!(status.pending_requests, 0);
        assert_eq!(status.stale_requests, 1);
        assert!(!status.has_pending_request);
        assert_eq!(r.request_state(B256::repeat_byte(1)), Some(RequestState::Stale));

        let report = r.tick();
        assert_eq!(report.simulated, vec![B256::repeat_byte(1)]);
        assert_eq!(
            r.request_state(B256::repeat_byte(1)),
            Some(RequestState::SimulatedResolved)
        );
        // Cooldown runs from the simulated resolution, i.e. now.
        assert_eq!(r.status(U256::from(7)).cooldown_remaining_ms, 3_600_000);
        clock.advance(Duration::from_secs(3600));
        assert!(r.status(U256::from(7)).can_request_update);
    }

    #[test]
    fn test_property_seven_scenario() {
        let (mut r, clock, _rx) = setup(ReconcilerSettings::default());
        r.ingest(request(7, 1, T0, 10));

        // 1s ticks from t=1s to t=5s.
        for _ in 0..5 {
            clock.advance(Duration::from_secs(1));
            r.tick();
        }

        let sim = r
            .events(Some(U256::from(7)))
            .into_iter()
            .find_map(|e| match e {
                OracleEvent::Simulated(s) => Some(s),
                _ => None,
            })
            .expect("simulated resolution at t=5s");
        assert_eq!(sim.property_id.to_string(), "7");
        assert_eq!(sim.new_valuation, r.settings().placeholder_valuation);
        assert_eq!(sim.timestamp_ms, T0 + 5_000);
        assert!(sim.resolved);

        clock.set(T0 + 5_500);
        let status = r.status(U256::from(7));
        assert!(!status.can_request_update);
        assert_eq!(status.cooldown_remaining_ms, 3_599_500);
        assert_eq!(status.latest_valuation, Some(r.settings().placeholder_valuation));

        clock.set(T0 + 3_605_500);
        assert!(r.status(U256::from(7)).can_request_update);
    }

    #[test]
    fn test_unmatched_update_still_starts_cooldown() {
        let (mut r, clock, _rx) = setup(ReconcilerSettings::default());
        r.ingest(update(3, 10, 20, T0, 10));
        clock.advance(Duration::from_secs(60));
        let status = r.status(U256::from(3));
        assert_eq!(status.cooldown_remaining_ms, 3_540_000);
        assert!(!status.can_request_update);
    }

    #[test]
    fn test_benign_errors_never_surface() {
        let (mut r, _clock, mut rx) = setup(ReconcilerSettings::default());
        r.report_error(&TransportError::FilterExpired);
        assert!(r.last_error().is_none());
        assert!(r.status(U256::from(1)).last_error.is_none());
        assert!(drain(&mut rx).is_empty());

        r.report_error(&TransportError::Connection("reset by peer".into()));
        assert_eq!(r.last_error(), Some("connection error: reset by peer"));
        assert!(matches!(drain(&mut rx)[0], OracleNotice::Error { .. }));
    }

    #[test]
    fn test_summary_every_n_ticks() {
        let (mut r, _clock, mut rx) = setup(ReconcilerSettings {
            summary_every_ticks: 2,
            ..Default::default()
        });
        r.tick();
        assert!(drain(&mut rx).is_empty());
        r.tick();
        assert!(matches!(drain(&mut rx)[0], OracleNotice::Summary { .. }));
    }

    #[test]
    fn test_change_pct() {
        assert_eq!(change_pct(U256::from(200), U256::from(150)), Some(Decimal::from(-25)));
        assert_eq!(change_pct(U256::ZERO, U256::from(1)), None);
        assert_eq!(change_pct(U256::MAX, U256::from(1)), None);
    }
}
