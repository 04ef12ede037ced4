//! Rate-limited background enrichment worker.
//!
//! Grounded on `original_source/intel/threat_intel.py`'s `_lookup_worker`
//! background thread and its `RateLimiter.acquire(timeout)` polling loop.
//! The actual network lookup (WHOIS/RDAP) is injected as a [`LookupFn`]
//! rather than hard-wired to a specific provider crate — spec.md §1 keeps
//! "the optional external threat-feed downloader" at the core's boundary,
//! and the concrete WHOIS client is exactly that kind of collaborator; see
//! `DESIGN.md` for the resolution. Everything this module owns — the
//! bounded queue, the rate limiter, the failure taxonomy, and the
//! re-scoring on success — is fully implemented and tested.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::core::cache::ProfileCache;
use crate::core::scorer::ThreatScorer;
use crate::core::token_bucket::TokenBucket;
use crate::error::NetShieldError;

/// Outcome of a successful (or reserved-address) lookup.
#[derive(Debug, Clone)]
pub enum LookupOutcome {
    /// The address falls in a reserved range the provider recognizes;
    /// not an error (spec.md §4.5).
    Reserved,
    Success {
        country: String,
        asn: String,
        asn_description: String,
        network_name: String,
        network_cidr: String,
        abuse_contact: String,
    },
}

/// A pluggable enrichment lookup. Implementations may fail with
/// `EnrichmentTransport` (service unreachable) or `EnrichmentData` (parse
/// failure) — both handled by the worker — or with any other
/// `NetShieldError`, which the worker lets propagate and terminate its task.
pub type LookupFuture = Pin<Box<dyn Future<Output = Result<LookupOutcome, NetShieldError>> + Send>>;
pub type LookupFn = Arc<dyn Fn(IpAddr) -> LookupFuture + Send + Sync>;

/// Producer handle: enqueues IP literals for background enrichment.
#[derive(Clone)]
pub struct EnrichmentWorker {
    sender: mpsc::Sender<IpAddr>,
}

impl EnrichmentWorker {
    /// Builds a worker with a bounded FIFO of `capacity` (spec.md §4.5:
    /// "capacity ≥ 1000"). Returns the producer handle and the consumer
    /// half to be driven by [`run_enrichment_loop`].
    pub fn new(capacity: usize) -> (Self, EnrichmentReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (EnrichmentWorker { sender }, EnrichmentReceiver { receiver })
    }

    /// Non-blocking enqueue; a full queue silently drops the item.
    pub fn enqueue(&self, ip: IpAddr) -> bool {
        match self.sender.try_send(ip) {
            Ok(()) => true,
            Err(_) => {
                warn!(target: "enrichment", %ip, "enrichment queue full, dropping");
                false
            }
        }
    }
}

/// Consumer half of the enrichment queue, driven by [`run_enrichment_loop`].
pub struct EnrichmentReceiver {
    receiver: mpsc::Receiver<IpAddr>,
}

/// Drives the background enrichment loop until `stop_flag` is set and the
/// queue is empty, or the queue's sender side is dropped. Acquires a token
/// from `rate_limiter` before each lookup (timing out after
/// `lookup_timeout`), applies the result to the cached profile via `cache`,
/// and re-scores it with `scorer`.
///
/// Any error outside the `EnrichmentTransport`/`EnrichmentData` taxonomy is
/// propagated rather than swallowed, terminating this task.
pub async fn run_enrichment_loop(
    mut rx: EnrichmentReceiver,
    cache: Arc<ProfileCache>,
    scorer: Arc<ThreatScorer>,
    lookup: LookupFn,
    rate_limiter: Arc<TokenBucket>,
    lookup_timeout: Duration,
    stop_flag: Arc<AtomicBool>,
) -> Result<(), NetShieldError> {
    loop {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }

        let ip = match tokio::time::timeout(Duration::from_millis(500), rx.receiver.recv()).await {
            Ok(Some(ip)) => ip,
            Ok(None) => break,
            Err(_) => continue,
        };

        if !acquire_token(&rate_limiter, lookup_timeout).await {
            warn!(target: "enrichment", %ip, "rate limiter timed out, skipping lookup");
            continue;
        }

        let ip_str = ip.to_string();
        match lookup(ip).await {
            Ok(LookupOutcome::Reserved) => {
                cache.update(&ip_str, |p| p.set_country("Reserved"));
            }
            Ok(LookupOutcome::Success {
                country,
                asn,
                asn_description,
                network_name,
                network_cidr,
                abuse_contact,
            }) => {
                cache.update(&ip_str, |p| {
                    p.set_country(&country);
                    p.set_enrichment(&asn, &asn_description, &network_name, &network_cidr, &abuse_contact);
                    scorer.update_profile_score(p);
                });
            }
            Err(NetShieldError::EnrichmentTransport(msg)) => {
                warn!(target: "enrichment", %ip_str, error = %msg, "lookup transport failed");
                cache.update(&ip_str, |p| p.set_country("Lookup Failed"));
            }
            Err(NetShieldError::EnrichmentData(msg)) => {
                warn!(target: "enrichment", %ip_str, error = %msg, "lookup response unparsable, profile left unchanged");
            }
            Err(other) => return Err(other),
        }
    }
    Ok(())
}

/// Polls `bucket` for one token every 50ms (mirroring the polling interval
/// in `original_source/intel/threat_intel.py::RateLimiter.acquire`) until
/// admitted or `timeout` elapses.
async fn acquire_token(bucket: &TokenBucket, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (allowed, _) = bucket.consume(1);
        if allowed {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scorer::ScoringConfig;
    use std::sync::atomic::AtomicUsize;

    fn always_success(ip: IpAddr) -> LookupFuture {
        Box::pin(async move {
            let _ = ip;
            Ok(LookupOutcome::Success {
                country: "US".into(),
                asn: "AS1".into(),
                asn_description: "Example Net".into(),
                network_name: "Example".into(),
                network_cidr: "0.0.0.0/0".into(),
                abuse_contact: "abuse@example.com".into(),
            })
        })
    }

    fn always_transport_error(_ip: IpAddr) -> LookupFuture {
        Box::pin(async { Err(NetShieldError::EnrichmentTransport("unreachable".into())) })
    }

    fn always_unexpected(_ip: IpAddr) -> LookupFuture {
        Box::pin(async { Err(NetShieldError::Unexpected("boom".into())) })
    }

    #[tokio::test]
    async fn test_enqueue_beyond_capacity_drops_silently() {
        let (worker, _rx) = EnrichmentWorker::new(1);
        assert!(worker.enqueue("1.1.1.1".parse().unwrap()));
        assert!(!worker.enqueue("2.2.2.2".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_successful_lookup_populates_and_rescores_profile() {
        let (worker, rx) = EnrichmentWorker::new(10);
        let cache = Arc::new(ProfileCache::new(10, 3600));
        cache.put("1.1.1.1", crate::core::profile::IpProfile::new("1.1.1.1", chrono::Utc::now()));
        let scorer = Arc::new(ThreatScorer::new(ScoringConfig::default()));
        let bucket = Arc::new(TokenBucket::new(100.0, 100.0).unwrap());
        let stop = Arc::new(AtomicBool::new(false));

        worker.enqueue("1.1.1.1".parse().unwrap());
        let stop_clone = stop.clone();
        let cache_clone = cache.clone();
        let handle = tokio::spawn(run_enrichment_loop(
            rx,
            cache_clone,
            scorer,
            Arc::new(always_success) as LookupFn,
            bucket,
            Duration::from_millis(200),
            stop_clone,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.store(true, Ordering::Relaxed);
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());

        let profile = cache.get("1.1.1.1").unwrap();
        assert_eq!(profile.country, "US");
        assert_eq!(profile.asn_description, "Example Net");
    }

    #[tokio::test]
    async fn test_transport_error_sets_lookup_failed_without_propagating() {
        let (worker, rx) = EnrichmentWorker::new(10);
        let cache = Arc::new(ProfileCache::new(10, 3600));
        cache.put("1.1.1.1", crate::core::profile::IpProfile::new("1.1.1.1", chrono::Utc::now()));
        let scorer = Arc::new(ThreatScorer::new(ScoringConfig::default()));
        let bucket = Arc::new(TokenBucket::new(100.0, 100.0).unwrap());
        let stop = Arc::new(AtomicBool::new(false));

        worker.enqueue("1.1.1.1".parse().unwrap());
        let cache_clone = cache.clone();
        let stop_clone = stop.clone();
        let handle = tokio::spawn(run_enrichment_loop(
            rx,
            cache_clone,
            scorer,
            Arc::new(always_transport_error) as LookupFn,
            bucket,
            Duration::from_millis(200),
            stop_clone,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.store(true, Ordering::Relaxed);
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(result.is_ok());

        assert_eq!(cache.get("1.1.1.1").unwrap().country, "Lookup Failed");
    }

    #[tokio::test]
    async fn test_unexpected_error_propagates_and_terminates_loop() {
        let (worker, rx) = EnrichmentWorker::new(10);
        let cache = Arc::new(ProfileCache::new(10, 3600));
        let scorer = Arc::new(ThreatScorer::new(ScoringConfig::default()));
        let bucket = Arc::new(TokenBucket::new(100.0, 100.0).unwrap());
        let stop = Arc::new(AtomicBool::new(false));

        worker.enqueue("1.1.1.1".parse().unwrap());
        let handle = tokio::spawn(run_enrichment_loop(
            rx,
            cache,
            scorer,
            Arc::new(always_unexpected) as LookupFn,
            bucket,
            Duration::from_millis(200),
            stop,
        ));

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rate_limiter_timeout_skips_without_calling_lookup() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let counting_lookup: LookupFn = Arc::new(move |ip: IpAddr| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            always_success(ip)
        });

        let (worker, rx) = EnrichmentWorker::new(10);
        let cache = Arc::new(ProfileCache::new(10, 3600));
        let scorer = Arc::new(ThreatScorer::new(ScoringConfig::default()));
        // Bucket starts empty (capacity consumed immediately) with a tiny
        // rate so the retry loop exhausts its short timeout.
        let bucket = Arc::new(TokenBucket::new(0.001, 1.0).unwrap());
        bucket.consume(1); // drain the single token
        let stop = Arc::new(AtomicBool::new(false));

        worker.enqueue("1.1.1.1".parse().unwrap());
        let stop_clone = stop.clone();
        let handle = tokio::spawn(run_enrichment_loop(
            rx,
            cache,
            scorer,
            counting_lookup,
            bucket,
            Duration::from_millis(100),
            stop_clone,
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        stop.store(true, Ordering::Relaxed);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }
}
