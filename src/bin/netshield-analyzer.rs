//! The unprivileged process: connects to the interceptor's IPC fabric,
//! scores inbound traffic, drives enrichment and the audit log, and issues
//! throttle commands back (spec.md §2, §4.9).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use netshield::analyzer::{run_descriptor_loop, Analyzer, AnalyzerConfig};
use netshield::audit::AuditLog;
use netshield::config::Config;
use netshield::core::cache::ProfileCache;
use netshield::core::scorer::{ScoringConfig, ThreatScorer};
use netshield::core::token_bucket::TokenBucket;
use netshield::enrichment::EnrichmentWorker;
use netshield::ipc::frame::FrameResult;
use netshield::ipc::messages::{Command, PacketDescriptor};
use netshield::ipc::{read_frame, write_frame, IpcClient};
use netshield::lookup::rdap_lookup;

/// How long the analyzer waits for the interceptor to start listening
/// before declaring the peer unavailable (spec.md §7 `PeerUnavailable`).
const CONNECT_MAX_WAIT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    netshield::init_logging("netshield=info");

    let cfg = Config::from_env();
    if let Err(e) = cfg.validate() {
        eprintln!("netshield-analyzer: invalid configuration: {e}");
        std::process::exit(1);
    }

    let cache = Arc::new(ProfileCache::new(cfg.cache_capacity, cfg.cache_ttl_secs));
    let audit = match AuditLog::new(&cfg.log_dir, cfg.audit_queue_capacity, cfg.log_secret.clone()) {
        Ok(a) => Arc::new(a),
        Err(e) => {
            eprintln!("netshield-analyzer: could not start audit log: {e}");
            std::process::exit(1);
        }
    };

    let scorer = Arc::new(ThreatScorer::new(ScoringConfig {
        high_risk_countries: cfg.high_risk_countries.clone(),
        suspicious_asn_keywords: cfg.suspicious_asn_keywords.clone(),
    }));

    let (enrichment, enrichment_rx) = EnrichmentWorker::new(cfg.enrichment_queue_capacity);
    let enrichment_rate_limiter =
        match TokenBucket::new(cfg.enrichment_rate, cfg.enrichment_rate.max(1.0)) {
            Ok(b) => Arc::new(b),
            Err(e) => {
                eprintln!("netshield-analyzer: invalid enrichment rate: {e}");
                std::process::exit(1);
            }
        };

    let started_at = chrono::Utc::now();
    let start = std::time::Instant::now();
    let running = Arc::new(AtomicBool::new(true));

    let analyzer_config = AnalyzerConfig {
        throttle_threshold: cfg.threat_score_threshold,
        ..AnalyzerConfig::default()
    };
    let analyzer = Arc::new(Analyzer::new(cache.clone(), audit.clone(), enrichment, analyzer_config));

    let packet_stream =
        match IpcClient::connect_with_retry("127.0.0.1", cfg.packet_channel_port, CONNECT_MAX_WAIT).await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("netshield-analyzer: {e}");
                std::process::exit(1);
            }
        };
    let command_stream =
        match IpcClient::connect_with_retry("127.0.0.1", cfg.command_channel_port, CONNECT_MAX_WAIT).await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("netshield-analyzer: {e}");
                std::process::exit(1);
            }
        };

    let (descriptor_tx, descriptor_rx) = mpsc::channel::<PacketDescriptor>(1024);
    let (command_tx, command_rx) = mpsc::channel::<Command>(1024);

    let reader_handle = tokio::spawn(run_packet_reader(packet_stream, descriptor_tx, running.clone()));
    let writer_handle = tokio::spawn(run_command_writer(command_stream, command_rx, running.clone()));
    let descriptor_loop_handle = tokio::spawn(run_descriptor_loop(
        analyzer.clone(),
        descriptor_rx,
        command_tx,
        running.clone(),
    ));
    let enrichment_loop_handle = tokio::spawn(netshield::enrichment::run_enrichment_loop(
        enrichment_rx,
        cache.clone(),
        scorer,
        rdap_lookup(reqwest::Client::new()),
        enrichment_rate_limiter,
        Duration::from_secs(cfg.enrichment_timeout_secs),
        running.clone(),
    ));
    let enrichment_driver_handle = tokio::spawn(analyzer.clone().run_enrichment_driver(running.clone()));
    let cleanup_handle = tokio::spawn(analyzer.clone().run_cleanup_task(running.clone()));

    tokio::signal::ctrl_c().await.ok();
    info!(target: "analyzer", "received shutdown signal");
    running.store(false, Ordering::Relaxed);

    let _ = tokio::time::timeout(Duration::from_secs(2), reader_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), writer_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), descriptor_loop_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), enrichment_loop_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), enrichment_driver_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), cleanup_handle).await;

    let watchlist: Vec<_> = cache.values();
    if let Err(e) = audit.save_watchlist(&watchlist, cfg.watchlist_threshold) {
        error!(target: "analyzer", error = %e, "failed to save watchlist on shutdown");
    }

    let summary = analyzer.session_summary(started_at, start);
    info!(target: "analyzer", ?summary, "session summary");

    audit.flush();
    audit.stop();
}

/// Reads packet-descriptor frames off the interceptor's packet channel and
/// forwards decoded, non-oversized frames into `tx`. Malformed bodies are
/// dropped with a warning, matching spec.md §7's `InvalidFrame` handling.
async fn run_packet_reader(
    mut stream: tokio::net::TcpStream,
    tx: mpsc::Sender<PacketDescriptor>,
    running: Arc<AtomicBool>,
) {
    loop {
        match read_frame(&mut stream).await {
            Ok(FrameResult::Data(body)) => match serde_json::from_slice::<PacketDescriptor>(&body) {
                Ok(descriptor) => {
                    if tx.send(descriptor).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(target: "analyzer", error = %e, "malformed packet descriptor frame"),
            },
            Ok(FrameResult::Discarded { declared_len }) => {
                warn!(target: "analyzer", declared_len, "oversized packet descriptor frame discarded");
            }
            Ok(FrameResult::Closed) => {
                info!(target: "analyzer", "packet channel closed by interceptor");
                break;
            }
            Err(e) => {
                error!(target: "analyzer", error = %e, "packet channel read failed");
                break;
            }
        }
        if !running.load(Ordering::Relaxed) {
            break;
        }
    }
}

/// Drains `rx` and writes each command as a frame on the interceptor's
/// command channel until shutdown or the peer disconnects.
async fn run_command_writer(
    mut stream: tokio::net::TcpStream,
    mut rx: mpsc::Receiver<Command>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        let cmd = match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Some(cmd)) => cmd,
            Ok(None) => break,
            Err(_) => continue,
        };
        let body = match serde_json::to_vec(&cmd) {
            Ok(b) => b,
            Err(e) => {
                warn!(target: "analyzer", error = %e, "failed to encode command");
                continue;
            }
        };
        if let Err(e) = write_frame(&mut stream, &body).await {
            error!(target: "analyzer", error = %e, "command channel write failed");
            break;
        }
    }
}
