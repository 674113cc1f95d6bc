//! Oracle round-trip metrics.
//!
//! Tracks how long requests take to resolve and how they end:
//! - fulfilled by the oracle (`PropertyValuationUpdated`)
//! - failed on chain (`RequestFailed`)
//! - simulated locally after the resolve timeout

use crate::oracle::types::{PropertyId, RequestId};
use std::collections::VecDeque;

/// Maximum history entries kept.
const MAX_HISTORY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    Fulfilled,
    Failed,
    Simulated,
}

impl std::fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionKind::Fulfilled => write!(f, "fulfilled"),
            ResolutionKind::Failed => write!(f, "failed"),
            ResolutionKind::Simulated => write!(f, "simulated"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolutionRecord {
    pub property_id: PropertyId,
    pub request_id: RequestId,
    pub kind: ResolutionKind,
    /// Request timestamp to resolution timestamp.
    pub latency_ms: u64,
    pub recorded_at_ms: u64,
}

#[derive(Debug, Default)]
pub struct ResolutionMetrics {
    history: VecDeque<ResolutionRecord>,
    fulfilled: usize,
    failed: usize,
    simulated: usize,
}

impl ResolutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: ResolutionRecord) {
        match record.kind {
            ResolutionKind::Fulfilled => self.fulfilled += 1,
            ResolutionKind::Failed => self.failed += 1,
            ResolutionKind::Simulated => self.simulated += 1,
        }
        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn fulfilled(&self) -> usize {
        self.fulfilled
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn simulated(&self) -> usize {
        self.simulated
    }

    /// Average latency over the retained history, optionally for one outcome.
    pub fn avg_latency_ms(&self, kind: Option<ResolutionKind>) -> f64 {
        let latencies: Vec<u64> = self
            .history
            .iter()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .map(|r| r.latency_ms)
            .collect();
        if latencies.is_empty() {
            return 0.0;
        }
        latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
    }

    /// Most recent records, newest-first.
    pub fn recent(&self, n: usize) -> Vec<&ResolutionRecord> {
        self.history.iter().rev().take(n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{B256, U256};

    fn record(kind: ResolutionKind, latency_ms: u64) -> ResolutionRecord {
        ResolutionRecord {
            property_id: U256::from(1),
            request_id: B256::ZERO,
            kind,
            latency_ms,
            recorded_at_ms: 0,
        }
    }

    #[test]
    fn test_counts_and_averages() {
        let mut m = ResolutionMetrics::new();
        m.record(record(ResolutionKind::Fulfilled, 2_000));
        m.record(record(ResolutionKind::Fulfilled, 4_000));
        m.record(record(ResolutionKind::Simulated, 5_000));

        assert_eq!(m.fulfilled(), 2);
        assert_eq!(m.simulated(), 1);
        assert_eq!(m.failed(), 0);
        assert_eq!(m.avg_latency_ms(Some(ResolutionKind::Fulfilled)), 3_000.0);
        assert_eq!(m.avg_latency_ms(None), 11_000.0 / 3.0);
        assert_eq!(m.avg_latency_ms(Some(ResolutionKind::Failed)), 0.0);
        assert_eq!(m.recent(1)[0].kind, ResolutionKind::Simulated);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut m = ResolutionMetrics::new();
        for i in 0..(MAX_HISTORY + 5) {
            m.record(record(ResolutionKind::Failed, i as u64));
        }
        assert_eq!(m.recent(usize::MAX).len(), MAX_HISTORY);
        assert_eq!(m.failed(), MAX_HISTORY + 5);
    }
}
