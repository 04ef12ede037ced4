//! Per-protocol counters and the end-of-session summary.
//!
//! Grounded on spec.md §3's data model and on the supplemented
//! `SessionSummary` feature described in `SPEC_FULL.md` §C (the original
//! `worker.py`/`service.py` print an equivalent summary on exit).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Transport protocols the interceptor classifies traffic into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Packet/byte counters for one protocol, tracking both total and dropped
/// traffic.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProtocolCounters {
    pub packets: u64,
    pub bytes: u64,
    pub dropped_packets: u64,
    pub dropped_bytes: u64,
}

/// Thread-safe table of per-protocol counters, updated once per packet on
/// the interceptor's hot path under its own mutex (spec.md §4.8 step 6).
#[derive(Default)]
pub struct ProtocolStats {
    counters: Mutex<HashMap<Protocol, ProtocolCounters>>,
}

impl ProtocolStats {
    pub fn new() -> Self {
        ProtocolStats {
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Records one packet of `size` bytes for `protocol`, and its dropped
    /// sub-counters if `dropped` is true.
    pub fn record(&self, protocol: Protocol, size: u64, dropped: bool) {
        let mut counters = self.counters.lock().expect("protocol stats mutex poisoned");
        let entry = counters.entry(protocol).or_default();
        entry.packets += 1;
        entry.bytes += size;
        if dropped {
            entry.dropped_packets += 1;
            entry.dropped_bytes += size;
        }
    }

    /// Snapshot of every protocol's counters observed so far.
    pub fn snapshot(&self) -> HashMap<Protocol, ProtocolCounters> {
        self.counters.lock().expect("protocol stats mutex poisoned").clone()
    }
}

/// Produced at shutdown: a rollup of the whole session, gathered from the
/// interceptor's protocol stats and the analyzer's tracker table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub uptime_secs: f64,
    pub total_bytes: u64,
    pub total_packets: u64,
    pub dropped_bytes: u64,
    pub dropped_packets: u64,
    pub unique_ip_count: usize,
    pub flood_mode: bool,
    pub per_protocol: HashMap<String, ProtocolCounters>,
    pub top_offenders: Vec<(String, u64)>,
}

impl SessionSummary {
    /// Builds a summary from raw inputs gathered at shutdown. `offenders`
    /// maps IP to drop count; only the top `top_n` by drop count are kept.
    pub fn build(
        started_at: chrono::DateTime<chrono::Utc>,
        start: Instant,
        per_protocol: HashMap<Protocol, ProtocolCounters>,
        unique_ip_count: usize,
        flood_mode: bool,
        mut offenders: Vec<(String, u64)>,
        top_n: usize,
    ) -> Self {
        let mut total_bytes = 0;
        let mut total_packets = 0;
        let mut dropped_bytes = 0;
        let mut dropped_packets = 0;
        let mut per_protocol_str = HashMap::new();

        for (proto, counters) in per_protocol {
            total_bytes += counters.bytes;
            total_packets += counters.packets;
            dropped_bytes += counters.dropped_bytes;
            dropped_packets += counters.dropped_packets;
            per_protocol_str.insert(proto.as_str().to_string(), counters);
        }

        offenders.sort_by(|a, b| b.1.cmp(&a.1));
        offenders.truncate(top_n);

        SessionSummary {
            started_at,
            uptime_secs: Instant::now().duration_since(start).as_secs_f64(),
            total_bytes,
            total_packets,
            dropped_bytes,
            dropped_packets,
            unique_ip_count,
            flood_mode,
            per_protocol: per_protocol_str,
            top_offenders: offenders,
        }
    }
}

/// Flood-mode predicate: observed speed exceeds `ratio` of the configured
/// ceiling (spec.md glossary: "Flood mode").
pub fn is_flood_mode(observed_mbps: f64, ceiling_mbps: f64, ratio: f64) -> bool {
    observed_mbps > ceiling_mbps * ratio
}

/// Convenience for callers that only have a start `Instant` handy.
pub fn uptime_secs(start: Instant) -> f64 {
    start.elapsed().as_secs_f64().max(0.0)
}
