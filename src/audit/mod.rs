//! Durable, asynchronous audit log: events (JSONL), traffic samples (CSV),
//! and a watchlist snapshot (JSON array), with optional HMAC-SHA-256
//! integrity signatures.
//!
//! Grounded on `original_source/loggers/event_logger.py::EventLogger`: a
//! bounded `Queue` feeding a single background writer thread, non-blocking
//! `put_nowait` enqueue that silently drops on overflow, and a
//! `_watchlist_lock`-guarded atomic save via a temp file + rename. The
//! teacher repo's own durable-write surface (`db/history.rs`'s systematic
//! CRUD + thorough tests) grounds the texture of this module even though we
//! write files, not SQLite rows.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use tracing::warn;

use crate::core::profile::IpProfile;
use crate::core::sanitize::sanitize_string;
use crate::error::NetShieldError;

type HmacSha256 = Hmac<Sha256>;

const TRAFFIC_CSV_HEADER: &str =
    "Timestamp,IP,Country,ASN,Network,Speed_MBps,Throttled,ThreatScore,Signature\n";
const EVENT_TYPE_MAX_LEN: usize = 64;
const SIGNATURE_HEX_LEN: usize = 16;

/// A structured event destined for the JSONL events file.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub ip: String,
    pub speed_mbps: f64,
    pub threat_score: u8,
    pub details: Value,
}

/// A per-IP sample destined for the traffic CSV.
#[derive(Debug, Clone)]
pub struct TrafficSample {
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub country: String,
    pub asn: String,
    pub network: String,
    pub speed_mbps: f64,
    pub throttled: bool,
    pub threat_score: u8,
}

enum WriteItem {
    Event(AuditEvent),
    Traffic(TrafficSample),
    Flush(std::sync::mpsc::Sender<()>),
}

/// The async durable log sink. The only place the system performs durable
/// I/O (spec.md §4.6). Cloning is not supported; share via `Arc`.
pub struct AuditLog {
    sender: Mutex<Option<SyncSender<WriteItem>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    watchlist_path: PathBuf,
    watchlist_lock: Mutex<()>,
    secret: Option<String>,
}

impl AuditLog {
    /// Creates the log directory if needed, opens the events and traffic
    /// files for append, and starts the single writer thread. `secret` is
    /// captured once, here, and never re-read from the environment on a
    /// per-write basis (spec.md §9 "Global mutable state").
    pub fn new(
        log_dir: &Path,
        queue_capacity: usize,
        secret: Option<String>,
    ) -> Result<Self, NetShieldError> {
        std::fs::create_dir_all(log_dir)?;
        let events_path = log_dir.join("events.jsonl");
        let traffic_path = log_dir.join("traffic.csv");
        let watchlist_path = log_dir.join("watchlist.json");

        let write_header = !traffic_path.exists();
        let events_file = OpenOptions::new().create(true).append(true).open(&events_path)?;
        let mut traffic_file =
            OpenOptions::new().create(true).append(true).open(&traffic_path)?;
        if write_header {
            traffic_file.write_all(TRAFFIC_CSV_HEADER.as_bytes())?;
            traffic_file.flush()?;
        }

        let (sender, receiver) = sync_channel::<WriteItem>(queue_capacity.max(1));
        let writer_secret = secret.clone();
        let handle = std::thread::Builder::new()
            .name("netshield-audit-writer".into())
            .spawn(move || writer_worker(receiver, events_file, traffic_file, writer_secret))
            .expect("failed to spawn audit writer thread");

        Ok(AuditLog {
            sender: Mutex::new(Some(sender)),
            writer_handle: Mutex::new(Some(handle)),
            watchlist_path,
            watchlist_lock: Mutex::new(()),
            secret,
        })
    }

    /// Non-blocking enqueue; silently drops (with a warning) if the queue
    /// is saturated. Returns whether the item was enqueued.
    pub fn log_event(&self, event: AuditEvent) -> bool {
        let guard = self.sender.lock().expect("audit sender mutex poisoned");
        match guard.as_ref() {
            Some(sender) => match sender.try_send(WriteItem::Event(event)) {
                Ok(()) => true,
                Err(_) => {
                    warn!(target: "audit", "audit event queue full, dropping record");
                    false
                }
            },
            None => false,
        }
    }

    /// Non-blocking enqueue of a traffic sample; same overflow policy as
    /// [`Self::log_event`].
    pub fn log_traffic(&self, sample: TrafficSample) -> bool {
        let guard = self.sender.lock().expect("audit sender mutex poisoned");
        match guard.as_ref() {
            Some(sender) => match sender.try_send(WriteItem::Traffic(sample)) {
                Ok(()) => true,
                Err(_) => {
                    warn!(target: "audit", "audit traffic queue full, dropping record");
                    false
                }
            },
            None => false,
        }
    }

    /// Blocks until every item enqueued before this call has been written.
    pub fn flush(&self) {
        let ack_sender = {
            let guard = self.sender.lock().expect("audit sender mutex poisoned");
            match guard.as_ref() {
                Some(sender) => sender.clone(),
                None => return,
            }
        };
        let (tx, rx) = std::sync::mpsc::channel();
        if ack_sender.send(WriteItem::Flush(tx)).is_ok() {
            let _ = rx.recv_timeout(Duration::from_secs(2));
        }
    }

    /// Closes the write queue and waits (bounded) for the writer thread to
    /// drain and exit. A writer still alive past the bound is abandoned.
    pub fn stop(&self) {
        self.sender.lock().expect("audit sender mutex poisoned").take();

        let handle = self.writer_handle.lock().expect("audit handle mutex poisoned").take();
        if let Some(handle) = handle {
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while !handle.is_finished() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }

    /// Synchronously and atomically rewrites the watchlist file as a JSON
    /// array of profiles scoring at or above `threshold`. Each entry is
    /// signed if integrity mode is active.
    pub fn save_watchlist(&self, profiles: &[IpProfile], threshold: u8) -> Result<(), NetShieldError> {
        let _guard = self.watchlist_lock.lock().expect("watchlist mutex poisoned");

        let entries: Vec<Value> = profiles
            .iter()
            .filter(|p| p.threat_score >= threshold)
            .map(|p| self.sign_if_enabled(serde_json::to_value(p).expect("profile always serializes")))
            .collect();

        let body = serde_json::to_vec_pretty(&Value::Array(entries))?;

        let tmp_path = self.watchlist_path.with_extension("json.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&body)?;
            tmp.flush()?;
        }
        std::fs::rename(&tmp_path, &self.watchlist_path)?;
        Ok(())
    }

    /// Recomputes the HMAC over `record` with `_sig` removed and keys
    /// sorted, and compares it to the stored value. Returns `false`
    /// whenever `secret` is `None` (integrity was never enabled) or the
    /// record carries no `_sig` field.
    pub fn verify_record(record: &Value, secret: Option<&str>) -> bool {
        let secret = match secret {
            Some(s) => s,
            None => return false,
        };
        let obj = match record.as_object() {
            Some(o) => o,
            None => return false,
        };
        let stored_sig = match obj.get("_sig").and_then(Value::as_str) {
            Some(s) => s.to_string(),
            None => return false,
        };
        let mut canonical = obj.clone();
        canonical.remove("_sig");
        let expected = compute_hmac(secret, &canonical_bytes(&canonical));
        expected == stored_sig
    }

    fn sign_if_enabled(&self, value: Value) -> Value {
        match &self.secret {
            None => value,
            Some(secret) => {
                let obj = value.as_object().cloned().unwrap_or_default();
                let sig = compute_hmac(secret, &canonical_bytes(&obj));
                let mut signed = obj;
                signed.insert("_sig".to_string(), Value::String(sig));
                Value::Object(signed)
            }
        }
    }
}

/// Serializes a `Map` canonically: `serde_json::Map` is BTreeMap-backed by
/// default (no `preserve_order` feature), so keys are already sorted.
fn canonical_bytes(map: &Map<String, Value>) -> Vec<u8> {
    serde_json::to_vec(map).expect("canonical map always serializes")
}

/// First 16 hex characters of HMAC-SHA-256 over `data`, keyed by `secret`.
fn compute_hmac(secret: &str, data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(data);
    let digest = mac.finalize().into_bytes();
    hex::encode(digest)[..SIGNATURE_HEX_LEN].to_string()
}

fn writer_worker(
    receiver: Receiver<WriteItem>,
    events_file: File,
    traffic_file: File,
    secret: Option<String>,
) {
    let mut events_writer = BufWriter::new(events_file);
    let mut traffic_writer = BufWriter::new(traffic_file);

    loop {
        match receiver.recv() {
            Ok(WriteItem::Event(event)) => {
                if let Err(e) = write_event(&mut events_writer, &event, secret.as_deref()) {
                    warn!(target: "audit", error = %e, "failed to write audit event");
                }
            }
            Ok(WriteItem::Traffic(sample)) => {
                if let Err(e) = write_traffic(&mut traffic_writer, &sample, secret.as_deref()) {
                    warn!(target: "audit", error = %e, "failed to write traffic sample");
                }
            }
            Ok(WriteItem::Flush(ack)) => {
                let _ = events_writer.flush();
                let _ = traffic_writer.flush();
                let _ = ack.send(());
            }
            Err(_) => break,
        }
    }
    let _ = events_writer.flush();
    let _ = traffic_writer.flush();
}

fn write_event<W: Write>(w: &mut W, event: &AuditEvent, secret: Option<&str>) -> std::io::Result<()> {
    let mut map = Map::new();
    map.insert("timestamp".into(), Value::String(event.timestamp.to_rfc3339()));
    map.insert(
        "event_type".into(),
        Value::String(sanitize_string(&event.event_type, EVENT_TYPE_MAX_LEN)),
    );
    map.insert("ip".into(), Value::String(event.ip.clone()));
    map.insert(
        "speed_mbps".into(),
        serde_json::json!(round2(event.speed_mbps)),
    );
    map.insert("threat_score".into(), Value::from(event.threat_score));
    map.insert("details".into(), event.details.clone());

    if let Some(secret) = secret {
        let sig = compute_hmac(secret, &canonical_bytes(&map));
        map.insert("_sig".into(), Value::String(sig));
    }

    let line = serde_json::to_string(&Value::Object(map))?;
    writeln!(w, "{line}")
}

fn write_traffic<W: Write>(
    w: &mut W,
    sample: &TrafficSample,
    secret: Option<&str>,
) -> std::io::Result<()> {
    let throttled_str = if sample.throttled { "Yes" } else { "No" };
    let mut fields = Map::new();
    fields.insert("Timestamp".into(), Value::String(sample.timestamp.to_rfc3339()));
    fields.insert("IP".into(), Value::String(sample.ip.clone()));
    fields.insert("Country".into(), Value::String(sample.country.clone()));
    fields.insert("ASN".into(), Value::String(sample.asn.clone()));
    fields.insert("Network".into(), Value::String(sample.network.clone()));
    fields.insert("Speed_MBps".into(), serde_json::json!(round2(sample.speed_mbps)));
    fields.insert("Throttled".into(), Value::String(throttled_str.to_string()));
    fields.insert("ThreatScore".into(), Value::from(sample.threat_score));

    let signature = secret
        .map(|secret| compute_hmac(secret, &canonical_bytes(&fields)))
        .unwrap_or_default();

    writeln!(
        w,
        "{},{},{},{},{},{:.2},{},{},{}",
        sample.timestamp.to_rfc3339(),
        csv_escape(&sample.ip),
        csv_escape(&sample.country),
        csv_escape(&sample.asn),
        csv_escape(&sample.network),
        round2(sample.speed_mbps),
        throttled_str,
        sample.threat_score,
        signature
    )
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    fn sample_event() -> AuditEvent {
        AuditEvent {
            timestamp: Utc::now(),
            event_type: "high_score".into(),
            ip: "203.0.113.5".into(),
            speed_mbps: 12.3456,
            threat_score: 90,
            details: serde_json::json!({"reason": "flood"}),
        }
    }

    #[test]
    fn test_log_event_then_flush_writes_to_events_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 100, None).unwrap();
        assert!(log.log_event(sample_event()));
        log.flush();

        let contents = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 1);
        let parsed: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["event_type"], "high_score");
        assert_eq!(parsed["threat_score"], 90);
        log.stop();
    }

    #[test]
    fn test_traffic_csv_has_fixed_header() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 100, None).unwrap();
        log.stop();

        let file = File::open(dir.path().join("traffic.csv")).unwrap();
        let mut lines = std::io::BufReader::new(file).lines();
        let header = lines.next().unwrap().unwrap();
        assert_eq!(
            header,
            "Timestamp,IP,Country,ASN,Network,Speed_MBps,Throttled,ThreatScore,Signature"
        );
    }

    #[test]
    fn test_sanitization_prevents_log_injection() {
        // spec.md §8 scenario 3, applied to the events file via a hostile
        // event_type value rather than a profile field.
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 100, None).unwrap();
        let mut event = sample_event();
        event.event_type = "Bad\r\nInjected: fake".into();
        log.log_event(event);
        log.flush();

        let contents = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 1, "embedded newline must not split the record");
        log.stop();
    }

    #[test]
    fn test_queue_full_drops_silently_without_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 1, None).unwrap();
        // Flood far more events than the queue capacity; none of this may
        // panic or block indefinitely.
        for _ in 0..50 {
            log.log_event(sample_event());
        }
        log.flush();
        log.stop();
    }

    #[test]
    fn test_watchlist_save_is_atomic_and_parseable() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 100, None).unwrap();
        let mut profile = IpProfile::new("203.0.113.5", Utc::now());
        profile.threat_score = 95;
        profile.set_enrichment("AS1", "desc", "Bad\r\nInjected: fake", "1.2.3.0/24", "x");

        log.save_watchlist(&[profile], 80).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("watchlist.json")).unwrap();
        let parsed: Vec<Value> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(!parsed[0]["network_name"].as_str().unwrap().contains('\n'));
        log.stop();
    }

    #[test]
    fn test_watchlist_respects_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 100, None).unwrap();
        let mut low = IpProfile::new("1.1.1.1", Utc::now());
        low.threat_score = 10;
        let mut high = IpProfile::new("2.2.2.2", Utc::now());
        high.threat_score = 90;

        log.save_watchlist(&[low, high], 80).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("watchlist.json")).unwrap();
        let parsed: Vec<Value> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["ip"], "2.2.2.2");
        log.stop();
    }

    #[test]
    fn test_integrity_mode_signs_and_verifies_events() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 100, Some("topsecret".into())).unwrap();
        log.log_event(sample_event());
        log.flush();

        let contents = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        let line = contents.lines().next().unwrap();
        let record: Value = serde_json::from_str(line).unwrap();

        assert!(record.get("_sig").is_some());
        assert!(AuditLog::verify_record(&record, Some("topsecret")));

        let mut tampered = record.clone();
        tampered["threat_score"] = Value::from(1);
        assert!(!AuditLog::verify_record(&tampered, Some("topsecret")));
        log.stop();
    }

    #[test]
    fn test_verify_record_returns_false_when_integrity_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path(), 100, None).unwrap();
        log.log_event(sample_event());
        log.flush();

        let contents = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        let record: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert!(!AuditLog::verify_record(&record, None));
        log.stop();
    }
}
