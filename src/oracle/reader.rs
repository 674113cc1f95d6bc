//! Historical event reader: eth_getLogs over a block range, decoded against
//! the oracle ABI.

use crate::oracle::abi::{
    PropertyValuationRequested, PropertyValuationUpdated, RequestFailed,
    REQUEST_FAILED_TOPIC, VALUATION_REQUESTED_TOPIC, VALUATION_UPDATED_TOPIC,
};
use crate::oracle::clock::Clock;
use crate::oracle::error::TransportError;
use crate::oracle::transport::OracleTransport;
use crate::oracle::types::{
    ChainMeta, OracleEvent, ValuationFailed, ValuationRequested, ValuationUpdated,
};
use alloy::primitives::Bytes;
use alloy::rpc::types::Log;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Block timestamps cached before the cache is reset.
const MAX_CACHED_BLOCKS: usize = 4096;

pub struct EventLogReader<T: OracleTransport + ?Sized> {
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    chunk_size: u64,
    /// block number → timestamp (seconds)
    block_times: HashMap<u64, u64>,
}

impl<T: OracleTransport + ?Sized> EventLogReader<T> {
    pub fn new(transport: Arc<T>, clock: Arc<dyn Clock>, chunk_size: u64) -> Self {
        Self {
            transport,
            clock,
            chunk_size: chunk_size.max(1),
            block_times: HashMap::new(),
        }
    }

    /// Fetch and decode oracle events in `[from_block, to_block]`, newest-first.
    /// Logs that do not decode are dropped.
    pub async fn fetch(
        &mut self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<OracleEvent>, TransportError> {
        if from_block > to_block {
            return Ok(Vec::new());
        }

        // Chunked to respect provider block range limits.
        let mut raw = Vec::new();
        let mut start = from_block;
        while start <= to_block {
            let end = start.saturating_add(self.chunk_size - 1).min(to_block);
            let logs = self.transport.get_logs(start, end).await?;
            debug!(from = start, to = end, logs = logs.len(), "fetched oracle logs");
            raw.extend(logs);
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }

        let mut events = Vec::with_capacity(raw.len());
        for log in &raw {
            let ts = self.timestamp_ms(log).await;
            match decode_log(log, ts) {
                Some(event) => events.push(event),
                None => debug!(
                    block = ?log.block_number,
                    topic = ?log.topic0(),
                    "skipping undecodable log"
                ),
            }
        }

        events.sort_by_key(|e| {
            let c = e.chain().unwrap_or(ChainMeta {
                block_number: 0,
                tx_hash: Default::default(),
                log_index: 0,
            });
            std::cmp::Reverse((c.block_number, c.log_index))
        });
        Ok(events)
    }

    /// Timestamp for a log: from the log itself, the block header, or the local clock.
    async fn timestamp_ms(&mut self, log: &Log) -> u64 {
        if let Some(ts) = log.block_timestamp {
            return ts * 1000;
        }
        let Some(block) = log.block_number else {
            return self.clock.now_ms();
        };
        if let Some(ts) = self.block_times.get(&block) {
            return ts * 1000;
        }
        match self.transport.block_timestamp(block).await {
            Ok(Some(ts)) => {
                if self.block_times.len() >= MAX_CACHED_BLOCKS {
                    self.block_times.clear();
                }
                self.block_times.insert(block, ts);
                ts * 1000
            }
            Ok(None) => self.clock.now_ms(),
            Err(e) => {
                debug!(block = block, error = %e, "block timestamp lookup failed, using local clock");
                self.clock.now_ms()
            }
        }
    }
}

/// Decode one oracle log. Returns `None` for unknown topics, malformed data,
/// or logs without chain position (pending logs).
pub fn decode_log(log: &Log, timestamp_ms: u64) -> Option<OracleEvent> {
    let topic0 = *log.topic0()?;
    let chain = ChainMeta {
        block_number: log.block_number?,
        tx_hash: log.transaction_hash?,
        log_index: log.log_index?,
    };

    match topic0 {
        t if t == VALUATION_REQUESTED_TOPIC => {
            let ev = log.log_decode::<PropertyValuationRequested>().ok()?.inner.data;
            Some(OracleEvent::Requested(ValuationRequested {
                property_id: ev.propertyId,
                request_id: ev.requestId,
                timestamp_ms,
                chain,
            }))
        }
        t if t == VALUATION_UPDATED_TOPIC => {
            let ev = log.log_decode::<PropertyValuationUpdated>().ok()?.inner.data;
            Some(OracleEvent::Updated(ValuationUpdated {
                property_id: ev.propertyId,
                old_valuation: ev.oldValuation,
                new_valuation: ev.newValuation,
                timestamp_ms,
                chain,
            }))
        }
        t if t == REQUEST_FAILED_TOPIC => {
            let ev = log.log_decode::<RequestFailed>().ok()?.inner.data;
            Some(OracleEvent::Failed(ValuationFailed {
                request_id: ev.requestId,
                error: failure_text(&ev.reason),
                timestamp_ms,
                chain,
            }))
        }
        _ => None,
    }
}

/// Oracle error payloads are usually UTF-8 text; anything else is shown as hex.
fn failure_text(reason: &Bytes) -> String {
    match std::str::from_utf8(reason) {
        Ok(text) => {
            let text = text.trim_matches('\0').trim();
            if text.is_empty() {
                "unknown error".to_string()
            } else {
                text.to_string()
            }
        }
        Err(_) => format!("{reason}"),
    }
}
