//! Bounded, append-only event log.
//!
//! Insertion order is preserved; reads come back newest-first. Chain events
//! are deduplicated on `(tx_hash, log_index)` because the live subscriber and
//! the log poller can both deliver the same log. Simulated resolutions are
//! deduplicated on request id.

use crate::oracle::types::{OracleEvent, PropertyId, RequestId};
use alloy::primitives::B256;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EventKey {
    Chain { tx_hash: B256, log_index: u64 },
    Simulated(RequestId),
}

fn key_of(event: &OracleEvent) -> EventKey {
    match event {
        OracleEvent::Simulated(s) => EventKey::Simulated(s.request_id),
        OracleEvent::Requested(e) => EventKey::Chain {
            tx_hash: e.chain.tx_hash,
            log_index: e.chain.log_index,
        },
        OracleEvent::Updated(e) => EventKey::Chain {
            tx_hash: e.chain.tx_hash,
            log_index: e.chain.log_index,
        },
        OracleEvent::Failed(e) => EventKey::Chain {
            tx_hash: e.chain.tx_hash,
            log_index: e.chain.log_index,
        },
    }
}

/// Outcome of `EventLog::push`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Duplicate,
    Appended,
    /// Appended; the oldest event was dropped to make room.
    Evicted(OracleEvent),
}

impl PushOutcome {
    pub fn appended(&self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<OracleEvent>,
    seen: HashSet<EventKey>,
    capacity: usize,
    evicted: u64,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::new(),
            capacity,
            evicted: 0,
        }
    }

    /// Append an event unless it was already recorded.
    pub fn push(&mut self, event: OracleEvent) -> PushOutcome {
        let key = key_of(&event);
        if !self.seen.insert(key) {
            return PushOutcome::Duplicate;
        }
        let mut outcome = PushOutcome::Appended;
        if self.events.len() >= self.capacity {
            if let Some(oldest) = self.events.pop_front() {
                self.seen.remove(&key_of(&oldest));
                self.evicted += 1;
                outcome = PushOutcome::Evicted(oldest);
            }
        }
        self.events.push_back(event);
        outcome
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn newest_first(&self) -> impl Iterator<Item = &OracleEvent> {
        self.events.iter().rev()
    }

    /// Owned copy of the log, newest-first.
    pub fn snapshot(&self) -> Vec<OracleEvent> {
        self.newest_first().cloned().collect()
    }

    /// Events concerning one property, newest-first. Failures are included
    /// when their request id belongs to one of the property's requests.
    pub fn for_property(&self, property_id: PropertyId) -> Vec<OracleEvent> {
        let request_ids: HashSet<RequestId> = self
            .events
            .iter()
            .filter_map(|e| match e {
                OracleEvent::Requested(r) if r.property_id == property_id => Some(r.request_id),
                _ => None,
            })
            .collect();

        self.newest_first()
            .filter(|e| match e {
                OracleEvent::Failed(f) => request_ids.contains(&f.request_id),
                other => other.property_id() == Some(property_id),
            })
            .cloned()
            .collect()
    }
}
