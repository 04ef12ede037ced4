//! The unprivileged analyzer: scores inbound traffic, drives enrichment,
//! and issues throttle commands back to the interceptor.
//!
//! Grounded on `original_source/worker.py`'s analyzer loop (tracker table,
//! quick per-packet score, periodic enrichment scan, periodic cleanup) and
//! on the teacher's `commands/state.rs` for the shape of a shared,
//! `Mutex`-guarded table owned by one subsystem (spec.md §4.9, §5).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::core::cache::ProfileCache;
use crate::core::profile::{is_public_ip, IpProfile};
use crate::core::tracker::IpTracker;
use crate::enrichment::EnrichmentWorker;
use crate::ipc::messages::{Command, PacketDescriptor};

/// Quick-score contribution when the recent rate exceeds the high-rate
/// threshold (spec.md §4.9 step 4).
const QUICK_SCORE_HIGH_RATE: u32 = 40;
/// Contribution when the recent rate exceeds half the high-rate threshold.
const QUICK_SCORE_HALF_RATE: u32 = 20;
/// Contribution for a tracker that has ever been throttled.
const QUICK_SCORE_EVER_THROTTLED: u32 = 20;
/// Upper bound of the optional ML anomaly contribution (spec.md §4.9 step 4:
/// "optional ML anomaly score scaled to 0..30").
const QUICK_SCORE_ML_SCALE: u32 = 30;

/// Output of an anomaly-detection model, `0.0` (benign) to `1.0` (anomalous).
/// No model is implemented; this keeps the scoring step's signature stable
/// for one to be wired in later without touching the quick-score logic.
pub type MlAnomalyScore = Option<f64>;

/// Score at or above which the analyzer throttles the source (spec.md §4.9
/// step 5); mirrors [`crate::config::DEFAULT_THREAT_SCORE_THRESHOLD`] but is
/// passed explicitly so tests can exercise the boundary directly.
pub struct AnalyzerConfig {
    pub high_rate_bytes_per_sec: f64,
    pub throttle_threshold: u8,
    pub enrichment_scan_packet_floor: u64,
    pub enrichment_scan_batch: usize,
    pub enrichment_scan_interval: Duration,
    pub cleanup_interval: Duration,
    pub tracker_max_idle: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            high_rate_bytes_per_sec: 50.0 * 1_048_576.0,
            throttle_threshold: crate::config::DEFAULT_THREAT_SCORE_THRESHOLD,
            enrichment_scan_packet_floor: 100,
            enrichment_scan_batch: 10,
            enrichment_scan_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
            tracker_max_idle: Duration::from_secs(3600),
        }
    }
}

/// Owns the tracker table (spec.md §5: "owned exclusively by the analyzer").
pub struct Analyzer {
    trackers: Mutex<HashMap<IpAddr, IpTracker>>,
    cache: Arc<ProfileCache>,
    audit: Arc<AuditLog>,
    enrichment: EnrichmentWorker,
    config: AnalyzerConfig,
}

impl Analyzer {
    /// `cache` is enriched and re-scored elsewhere (the enrichment worker
    /// owns the [`ThreatScorer`](crate::core::scorer::ThreatScorer)); the
    /// analyzer only reads the cached score back into its own quick score.
    pub fn new(
        cache: Arc<ProfileCache>,
        audit: Arc<AuditLog>,
        enrichment: EnrichmentWorker,
        config: AnalyzerConfig,
    ) -> Self {
        Analyzer {
            trackers: Mutex::new(HashMap::new()),
            cache,
            audit,
            enrichment,
            config,
        }
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.lock().expect("tracker table mutex poisoned").len()
    }

    /// IP/drop-count pairs for the tracked sources throttled most often,
    /// highest first, for the end-of-session summary (spec.md §3: "top-N
    /// offenders by drop count").
    pub fn top_offenders(&self, n: usize) -> Vec<(String, u64)> {
        let trackers = self.trackers.lock().expect("tracker table mutex poisoned");
        let mut offenders: Vec<(String, u64)> =
            trackers.iter().map(|(ip, t)| (ip.to_string(), t.throttle_count)).collect();
        offenders.sort_by(|a, b| b.1.cmp(&a.1));
        offenders.truncate(n);
        offenders
    }

    /// Builds the analyzer's half of the end-of-session summary. No
    /// per-protocol breakdown is available here (the tracker table isn't
    /// keyed by protocol); that half comes from the interceptor's own
    /// [`crate::interceptor::Interceptor::session_summary`].
    pub fn session_summary(&self, started_at: chrono::DateTime<chrono::Utc>, start: Instant) -> crate::core::stats::SessionSummary {
        crate::core::stats::SessionSummary::build(
            started_at,
            start,
            HashMap::new(),
            self.tracker_count(),
            false,
            self.top_offenders(10),
            10,
        )
    }

    /// Runs the per-packet-descriptor flow (spec.md §4.9 steps 1-5) with no
    /// ML anomaly contribution. See [`Analyzer::process_descriptor_scored`].
    pub fn process_descriptor(&self, descriptor: &PacketDescriptor) -> Option<IpAddr> {
        self.process_descriptor_scored(descriptor, None)
    }

    /// Runs the per-packet-descriptor flow (spec.md §4.9 steps 1-5).
    /// `ml_anomaly_score`, when present, is an anomaly-model output in
    /// `0.0..=1.0` scaled to a `0..=30` contribution; no model is wired up
    /// today, so every caller but tests passes `None`. Returns `Some(ip)`
    /// when a throttle command should be sent for `ip`.
    pub fn process_descriptor_scored(
        &self,
        descriptor: &PacketDescriptor,
        ml_anomaly_score: MlAnomalyScore,
    ) -> Option<IpAddr> {
        if !descriptor.is_valid() {
            warn!(target: "analyzer", "dropping invalid packet descriptor");
            return None;
        }
        let src_ip: IpAddr = descriptor.src_ip.parse().ok()?;
        if !is_public_ip(src_ip) {
            return None;
        }
        let now = Instant::now();
        let size = descriptor.length as u64;

        let (score, ever_throttled, packet_count) = {
            let mut trackers = self.trackers.lock().expect("tracker table mutex poisoned");
            let tracker = trackers.entry(src_ip).or_insert_with(|| IpTracker::new(now));
            tracker.observe(size, now);
            tracker.add_rate_sample(now, size);

            let mut score: u32 = 0;
            let recent_rate = tracker.recent_rate_bytes_per_sec();
            if recent_rate > self.config.high_rate_bytes_per_sec {
                score += QUICK_SCORE_HIGH_RATE;
            } else if recent_rate > self.config.high_rate_bytes_per_sec / 2.0 {
                score += QUICK_SCORE_HALF_RATE;
            }
            if tracker.ever_throttled {
                score += QUICK_SCORE_EVER_THROTTLED;
            }

            if let Some(profile) = self.cache.get(&descriptor.src_ip) {
                score += profile.threat_score as u32;
            }

            if let Some(ml_score) = ml_anomaly_score {
                score += (ml_score.clamp(0.0, 1.0) * QUICK_SCORE_ML_SCALE as f64) as u32;
            }

            let score = score.min(100) as u8;
            tracker.last_score = score;
            (score, tracker.ever_throttled, tracker.packet_count)
        };
        let _ = packet_count;

        if !self.cache.update(&descriptor.src_ip, |p| {
            p.record_traffic(size, false, 0.0, chrono::Utc::now());
        }) {
            self.cache.put(&descriptor.src_ip, IpProfile::new(&descriptor.src_ip, chrono::Utc::now()));
        }

        if score >= self.config.throttle_threshold {
            if !ever_throttled {
                let mut trackers = self.trackers.lock().expect("tracker table mutex poisoned");
                if let Some(tracker) = trackers.get_mut(&src_ip) {
                    tracker.record_throttle();
                }
            }
            self.audit.log_event(AuditEvent {
                timestamp: chrono::Utc::now(),
                event_type: "high_score".to_string(),
                ip: descriptor.src_ip.clone(),
                speed_mbps: 0.0,
                threat_score: score,
                details: serde_json::json!({ "src_port": descriptor.src_port, "dst_port": descriptor.dst_port }),
            });
            return Some(src_ip);
        }

        None
    }

    /// Scans trackers whose `packet_count` exceeds the configured floor and
    /// enqueues up to `enrichment_scan_batch` of them for background
    /// enrichment, yielding between items (spec.md §4.9 background task a).
    pub async fn run_enrichment_driver(self: Arc<Self>, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            let candidates: Vec<IpAddr> = {
                let trackers = self.trackers.lock().expect("tracker table mutex poisoned");
                trackers
                    .iter()
                    .filter(|(ip, t)| {
                        is_public_ip(**ip) && t.packet_count > self.config.enrichment_scan_packet_floor
                    })
                    .map(|(ip, _)| *ip)
                    .take(self.config.enrichment_scan_batch)
                    .collect()
            };

            for ip in candidates {
                self.enrichment.enqueue(ip);
                tokio::task::yield_now().await;
            }

            tokio::time::sleep(self.config.enrichment_scan_interval).await;
        }
    }

    /// Removes trackers idle for longer than `tracker_max_idle`, every
    /// `cleanup_interval` (spec.md §4.9 background task b).
    pub async fn run_cleanup_task(self: Arc<Self>, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            tokio::time::sleep(self.config.cleanup_interval).await;
            let now = Instant::now();
            let mut trackers = self.trackers.lock().expect("tracker table mutex poisoned");
            let before = trackers.len();
            trackers.retain(|_, t| !t.is_stale(now, self.config.tracker_max_idle));
            let reaped = before - trackers.len();
            if reaped > 0 {
                info!(target: "analyzer", reaped, "cleanup task reaped idle trackers");
            }
        }
    }
}

/// Drives the analyzer's packet-descriptor loop: reads descriptors off
/// `descriptor_rx`, scores them, and sends throttle commands on
/// `command_tx`. Kept separate from [`Analyzer::process_descriptor`] so
/// the scoring logic can be unit-tested without a channel.
pub async fn run_descriptor_loop(
    analyzer: Arc<Analyzer>,
    mut descriptor_rx: mpsc::Receiver<PacketDescriptor>,
    command_tx: mpsc::Sender<Command>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        let descriptor = match tokio::time::timeout(Duration::from_millis(500), descriptor_rx.recv()).await {
            Ok(Some(d)) => d,
            Ok(None) => break,
            Err(_) => continue,
        };

        if let Some(ip) = analyzer.process_descriptor(&descriptor) {
            let cmd = Command::throttle(&ip.to_string(), chrono::Utc::now().timestamp_millis() as f64 / 1000.0);
            if command_tx.send(cmd).await.is_err() {
                warn!(target: "analyzer", "command channel closed, cannot send throttle");
            }
        }
    }
}
