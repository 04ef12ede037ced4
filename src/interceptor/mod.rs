//! The privileged interceptor: owns the kernel packet-diversion handle,
//! enforces the rate limit, and makes the drop/forward decision on the hot
//! path (spec.md §4.8).
//!
//! Grounded on the teacher's `CaptureEngine` (a dedicated capture thread
//! guarded by an `Arc<AtomicBool>` shutdown flag) and
//! `core::rate_limiter::RateLimiterManager` (separate mutexes for distinct
//! pieces of hot-path state, never held across I/O).

pub mod packet;
#[cfg(target_os = "windows")]
pub mod windivert_backend;

use std::collections::HashSet;
use std::net::{IpAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, warn};

use crate::core::stats::{Protocol, ProtocolCounters, ProtocolStats};
use crate::core::token_bucket::TokenBucket;
use crate::ipc::messages::{Command, CommandTag, PacketDescriptor, WireProtocol};
use crate::error::NetShieldError;

use packet::ParsedPacket;

/// Consecutive transient kernel receive errors after which the hot loop
/// terminates (spec.md §4.8 step 1, §7 `KernelRecvTransient`).
const MAX_CONSECUTIVE_KERNEL_ERRORS: u32 = 10;

/// Abstraction over the platform packet-diversion handle. The real
/// implementation (`windivert_backend`) wraps a blocking WinDivert handle;
/// tests substitute an in-memory fake so the hot loop's decision logic is
/// exercised without a kernel driver.
pub trait PacketSource: Send {
    /// Blocks until one packet arrives, writing it into `buf` and
    /// returning its length. A transient error is recoverable; the caller
    /// counts consecutive occurrences.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NetShieldError>;

    /// Reinjects a previously received, not-dropped packet.
    fn send(&mut self, data: &[u8]) -> Result<(), NetShieldError>;
}

/// Where admitted packet descriptors go. The hot path only ever calls
/// `try_send`; a full or unavailable sink just means the descriptor is
/// dropped, never that the loop blocks.
pub trait PacketSink: Send {
    fn try_send(&mut self, descriptor: &PacketDescriptor) -> bool;
}

/// Sends packet descriptors over a blocking TCP stream with a short write
/// timeout, so a stalled peer degrades to "drop the descriptor" instead of
/// stalling the receive loop.
pub struct TcpPacketSink {
    stream: TcpStream,
}

impl TcpPacketSink {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_write_timeout(Some(Duration::from_millis(20)))?;
        Ok(TcpPacketSink { stream })
    }
}

impl PacketSink for TcpPacketSink {
    fn try_send(&mut self, descriptor: &PacketDescriptor) -> bool {
        use std::io::Write;
        let body = match serde_json::to_vec(descriptor) {
            Ok(b) => b,
            Err(_) => return false,
        };
        if body.len() > crate::config::MAX_FRAME_BYTES as usize {
            return false;
        }
        let len = (body.len() as u32).to_be_bytes();
        self.stream.write_all(&len).and_then(|_| self.stream.write_all(&body)).is_ok()
    }
}

/// Interceptor filter mode (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptMode {
    VrChat,
    Universal,
    Custom,
}

impl InterceptMode {
    /// Maps a validated `Config::mode` string to its mode. Panics on an
    /// unrecognized value — `Config::validate` is expected to have already
    /// rejected anything else.
    pub fn from_config_str(mode: &str) -> Self {
        match mode {
            "vrchat" => InterceptMode::VrChat,
            "universal" => InterceptMode::Universal,
            "custom" => InterceptMode::Custom,
            other => panic!("unrecognized intercept mode {other:?}, Config::validate should have rejected it"),
        }
    }

    /// The WinDivert filter expression for this mode.
    pub fn filter_expression(&self) -> &'static str {
        match self {
            InterceptMode::VrChat => {
                "inbound and (udp.SrcPort == 5055 or udp.SrcPort == 5056 or udp.SrcPort == 5058 \
                 or (udp.SrcPort >= 27000 and udp.SrcPort <= 27100) \
                 or tcp.SrcPort == 80 or tcp.SrcPort == 443)"
            }
            InterceptMode::Universal => "inbound and (tcp or udp)",
            InterceptMode::Custom => "inbound and udp",
        }
    }
}

/// Owns all interceptor hot-path state: the global token bucket, the
/// sliding-window throughput meter, the permanently-throttled IP set, and
/// per-protocol counters. Only the throttled set and the counter table are
/// guarded by their own mutexes; the bucket provides its own
/// synchronization (spec.md §4.8).
pub struct Interceptor {
    pub bucket: TokenBucket,
    pub window: crate::core::sliding_window::SlidingWindowMeter,
    throttled: Mutex<HashSet<IpAddr>>,
    pub stats: ProtocolStats,
    consecutive_kernel_errors: AtomicU32,
}

/// Outcome of processing one packet through the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketOutcome {
    pub dropped: bool,
    pub ip_blocked: bool,
    pub bucket_ok: bool,
}

impl Interceptor {
    pub fn new(bucket: TokenBucket, window_secs: f64) -> Self {
        Interceptor {
            bucket,
            window: crate::core::sliding_window::SlidingWindowMeter::new(window_secs),
            throttled: Mutex::new(HashSet::new()),
            stats: ProtocolStats::new(),
            consecutive_kernel_errors: AtomicU32::new(0),
        }
    }

    pub fn throttle(&self, ip: IpAddr) {
        self.throttled.lock().expect("throttled set mutex poisoned").insert(ip);
    }

    pub fn unthrottle(&self, ip: IpAddr) {
        self.throttled.lock().expect("throttled set mutex poisoned").remove(&ip);
    }

    pub fn is_throttled(&self, ip: IpAddr) -> bool {
        self.throttled.lock().expect("throttled set mutex poisoned").contains(&ip)
    }

    pub fn throttled_count(&self) -> usize {
        self.throttled.lock().expect("throttled set mutex poisoned").len()
    }

    /// Applies one validated command. `running` is cleared on `shutdown`.
    /// `get_stats` is recognized but answered by a mechanism outside the
    /// core (spec.md §4.8).
    pub fn apply_command(&self, cmd: &Command, running: &AtomicBool) {
        match cmd.tag {
            CommandTag::ThrottleIp => {
                if let Some(ip) = cmd.target_ip.as_deref().and_then(|s| s.parse().ok()) {
                    self.throttle(ip);
                }
            }
            CommandTag::UnthrottleIp => {
                if let Some(ip) = cmd.target_ip.as_deref().and_then(|s| s.parse().ok()) {
                    self.unthrottle(ip);
                }
            }
            CommandTag::Shutdown => {
                running.store(false, Ordering::Relaxed);
            }
            CommandTag::GetStats => {}
        }
    }

    /// Runs the per-packet flow (spec.md §4.8 steps 2-6) and returns the
    /// outcome; does not itself send a descriptor or reinject — the caller
    /// (the hot loop) does that based on `dropped`.
    pub fn process_packet(&self, parsed: &ParsedPacket) -> PacketOutcome {
        let ip_blocked = self.is_throttled(parsed.src_ip);
        let (bucket_ok, _wait) = self.bucket.consume(parsed.total_len as u64);
        let dropped = ip_blocked || !bucket_ok;

        self.stats.record(parsed.protocol, parsed.total_len as u64, dropped);
        if !dropped {
            self.window.add_sample(parsed.total_len as u64);
        }

        PacketOutcome {
            dropped,
            ip_blocked,
            bucket_ok,
        }
    }

    pub fn protocol_snapshot(&self) -> std::collections::HashMap<Protocol, ProtocolCounters> {
        self.stats.snapshot()
    }

    /// Builds the interceptor's half of the end-of-session summary
    /// (SPEC_FULL.md §C). `unique_ip_count` here is the size of the
    /// throttled set, not every distinct source address seen: the
    /// interceptor's hot path never keeps a full IP table, only the
    /// permanently-throttled one.
    pub fn session_summary(
        &self,
        started_at: chrono::DateTime<chrono::Utc>,
        start: std::time::Instant,
        bandwidth_ceiling_mbps: f64,
    ) -> crate::core::stats::SessionSummary {
        let flood = crate::core::stats::is_flood_mode(self.window.speed_mbps(), bandwidth_ceiling_mbps, 0.8);
        crate::core::stats::SessionSummary::build(
            started_at,
            start,
            self.protocol_snapshot(),
            self.throttled_count(),
            flood,
            Vec::new(),
            10,
        )
    }
}

/// Drives the hot receive loop until `running` clears or ten consecutive
/// kernel receive errors occur. Intended to run on a dedicated
/// `std::thread`, never inside a Tokio reactor (spec.md §4.8, §5).
pub fn run_hot_loop<S: PacketSource, K: PacketSink>(
    mut source: S,
    mut sink: K,
    interceptor: Arc<Interceptor>,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; 65536];
    let mut consecutive_errors = 0u32;

    while running.load(Ordering::Relaxed) {
        let len = match source.recv(&mut buf) {
            Ok(len) => {
                consecutive_errors = 0;
                len
            }
            Err(NetShieldError::KernelRecvTransient(msg)) => {
                consecutive_errors += 1;
                warn!(target: "interceptor", error = %msg, consecutive_errors, "transient kernel receive error");
                if consecutive_errors >= MAX_CONSECUTIVE_KERNEL_ERRORS {
                    error!(target: "interceptor", "too many consecutive kernel receive errors, stopping hot loop");
                    break;
                }
                continue;
            }
            Err(other) => {
                error!(target: "interceptor", error = %other, "fatal kernel receive error");
                break;
            }
        };

        let parsed = match packet::parse_ip_packet(&buf[..len]) {
            Some(p) => p,
            None => continue,
        };

        let outcome = interceptor.process_packet(&parsed);

        if outcome.dropped {
            continue;
        }

        if let Err(e) = source.send(&buf[..len]) {
            warn!(target: "interceptor", error = %e, "failed to reinject packet");
            continue;
        }

        let descriptor = PacketDescriptor {
            src_ip: parsed.src_ip.to_string(),
            dst_ip: parsed.dst_ip.to_string(),
            src_port: parsed.src_port,
            dst_port: parsed.dst_port,
            protocol: match parsed.protocol {
                Protocol::Tcp => WireProtocol::Tcp,
                Protocol::Udp => WireProtocol::Udp,
            },
            length: parsed.total_len,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        sink.try_send(&descriptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    fn ipv4_udp_packet(src: [u8; 4], dst: [u8; 4], len: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 28];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&len.to_be_bytes());
        buf[9] = 17;
        buf[12..16].copy_from_slice(&src);
        buf[16..20].copy_from_slice(&dst);
        buf[20..22].copy_from_slice(&27015u16.to_be_bytes());
        buf[22..24].copy_from_slice(&5055u16.to_be_bytes());
        buf
    }

    struct FakeSource {
        packets: VecDeque<Result<Vec<u8>, NetShieldError>>,
        sent: Vec<Vec<u8>>,
    }

    impl PacketSource for FakeSource {
        fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NetShieldError> {
            match self.packets.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(NetShieldError::Unexpected("no more packets".into())),
            }
        }

        fn send(&mut self, data: &[u8]) -> Result<(), NetShieldError> {
            self.sent.push(data.to_vec());
            Ok(())
        }
    }

    struct RecordingSink {
        sent: Arc<StdMutex<Vec<PacketDescriptor>>>,
    }

    impl PacketSink for RecordingSink {
        fn try_send(&mut self, descriptor: &PacketDescriptor) -> bool {
            self.sent.lock().unwrap().push(descriptor.clone());
            true
        }
    }

    #[test]
    fn test_intercept_mode_from_config_str() {
        assert_eq!(InterceptMode::from_config_str("vrchat"), InterceptMode::VrChat);
        assert_eq!(InterceptMode::from_config_str("universal"), InterceptMode::Universal);
        assert_eq!(InterceptMode::from_config_str("custom"), InterceptMode::Custom);
    }

    #[test]
    fn test_throttled_ip_is_always_dropped_regardless_of_bucket() {
        let interceptor = Interceptor::new(TokenBucket::new(1e12, 1e12).unwrap(), 1.0);
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        interceptor.throttle(ip);

        let parsed = ParsedPacket {
            protocol: Protocol::Udp,
            src_ip: ip,
            dst_ip: "10.0.0.1".parse().unwrap(),
            src_port: 1,
            dst_port: 2,
            total_len: 100,
        };
        let outcome = interceptor.process_packet(&parsed);
        assert!(outcome.dropped);
        assert!(outcome.ip_blocked);
        assert!(outcome.bucket_ok);
    }

    #[test]
    fn test_throttle_propagation_matches_spec_scenario() {
        // spec.md §8 scenario 6.
        let interceptor = Interceptor::new(TokenBucket::new(1e12, 1e12).unwrap(), 1.0);
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        interceptor.throttle(ip);

        let parsed = ParsedPacket {
            protocol: Protocol::Tcp,
            src_ip: ip,
            dst_ip: "10.0.0.1".parse().unwrap(),
            src_port: 1,
            dst_port: 2,
            total_len: 40,
        };
        let outcome = interceptor.process_packet(&parsed);
        assert!(outcome.dropped);
        let snap = interceptor.protocol_snapshot();
        assert_eq!(snap[&Protocol::Tcp].dropped_packets, 1);
    }

    #[test]
    fn test_bucket_exhaustion_drops_non_throttled_ip() {
        let interceptor = Interceptor::new(TokenBucket::new(1.0, 1.0).unwrap(), 1.0);
        let parsed = ParsedPacket {
            protocol: Protocol::Udp,
            src_ip: "203.0.113.5".parse().unwrap(),
            dst_ip: "10.0.0.1".parse().unwrap(),
            src_port: 1,
            dst_port: 2,
            total_len: 1000,
        };
        let outcome = interceptor.process_packet(&parsed);
        assert!(outcome.dropped);
        assert!(!outcome.ip_blocked);
        assert!(!outcome.bucket_ok);
    }

    #[test]
    fn test_apply_throttle_and_unthrottle_commands() {
        let interceptor = Interceptor::new(TokenBucket::new(100.0, 100.0).unwrap(), 1.0);
        let running = AtomicBool::new(true);
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        interceptor.apply_command(&Command::throttle(&ip.to_string(), 1.0), &running);
        assert!(interceptor.is_throttled(ip));

        interceptor.apply_command(&Command::unthrottle(&ip.to_string(), 2.0), &running);
        assert!(!interceptor.is_throttled(ip));
    }

    #[test]
    fn test_shutdown_command_clears_running_flag() {
        let interceptor = Interceptor::new(TokenBucket::new(100.0, 100.0).unwrap(), 1.0);
        let running = AtomicBool::new(true);
        interceptor.apply_command(&Command::shutdown(1.0), &running);
        assert!(!running.load(Ordering::Relaxed));
    }

    #[test]
    fn test_hot_loop_stops_after_ten_consecutive_transient_errors() {
        let mut packets = VecDeque::new();
        for _ in 0..15 {
            packets.push_back(Err(NetShieldError::KernelRecvTransient("timeout".into())));
        }
        let source = FakeSource { packets, sent: Vec::new() };
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sink = RecordingSink { sent: sent.clone() };
        let interceptor = Arc::new(Interceptor::new(TokenBucket::new(1e9, 1e9).unwrap(), 1.0));
        let running = Arc::new(AtomicBool::new(true));

        run_hot_loop(source, sink, interceptor, running.clone());
        // the loop must have terminated itself, not merely via the flag
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_hot_loop_forwards_public_ip_descriptor_on_admit() {
        let mut packets = VecDeque::new();
        packets.push_back(Ok(ipv4_udp_packet([203, 0, 113, 5], [10, 0, 0, 1], 28)));
        packets.push_back(Err(NetShieldError::Unexpected("stop".into())));
        let source = FakeSource { packets, sent: Vec::new() };
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sink = RecordingSink { sent: sent.clone() };
        let interceptor = Arc::new(Interceptor::new(TokenBucket::new(1e9, 1e9).unwrap(), 1.0));
        let running = Arc::new(AtomicBool::new(true));

        run_hot_loop(source, sink, interceptor, running);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].src_ip, "203.0.113.5");
    }

    #[test]
    fn test_hot_loop_forwards_private_ip_descriptor_unconditionally() {
        // spec.md §4.8 step 8 has no IP-publicness test: any admitted packet
        // is described and try-sent. The private/loopback/reserved filter is
        // the analyzer's job (spec.md §8 boundary behavior), not the hot
        // path's — see `Analyzer::process_descriptor_scored`.
        let mut packets = VecDeque::new();
        packets.push_back(Ok(ipv4_udp_packet([192, 168, 1, 5], [10, 0, 0, 1], 28)));
        packets.push_back(Err(NetShieldError::Unexpected("stop".into())));
        let source = FakeSource { packets, sent: Vec::new() };
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sink = RecordingSink { sent: sent.clone() };
        let interceptor = Arc::new(Interceptor::new(TokenBucket::new(1e9, 1e9).unwrap(), 1.0));
        let running = Arc::new(AtomicBool::new(true));

        run_hot_loop(source, sink, interceptor, running);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].src_ip, "192.168.1.5");
    }
}
