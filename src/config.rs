//! Runtime configuration for the interceptor and analyzer processes.
//!
//! Values are collected in one place, validated once at startup, and passed
//! down by reference rather than re-read from the environment deep inside a
//! hot path. Tunables that must never go out of bound (rates, capacities,
//! thresholds) are checked by [`Config::validate`]; anything out of range
//! fails fast with [`NetShieldError::ConfigInvalid`] instead of producing a
//! token bucket or cache that silently misbehaves.

use std::collections::HashSet;

use crate::error::NetShieldError;

/// Default threat score at or above which an IP is included in the
/// watchlist snapshot, distinct from the auto-throttle threshold.
pub const DEFAULT_WATCHLIST_THRESHOLD: u8 = 80;

/// Splits a comma-separated environment value into a set, trimming
/// whitespace and dropping empty entries. Empty/unset input yields an
/// empty set, not an error — both lookup-table rules degrade to "never
/// fires" rather than failing configuration validation.
fn env_set(key: &str) -> HashSet<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Default number of IP profiles the analyzer keeps warm before evicting the
/// least-recently-used entry.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Default time an idle IP profile is kept before `get()` treats it as gone.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3_600;

/// Default width of the bandwidth meter's sliding window (seconds).
pub const DEFAULT_BANDWIDTH_WINDOW_SECS: f64 = 1.0;

/// Default enrichment lookup rate (lookups per second).
pub const DEFAULT_ENRICHMENT_RATE: f64 = 5.0;

/// Default enrichment lookup timeout.
pub const DEFAULT_ENRICHMENT_TIMEOUT_SECS: u64 = 2;

/// Default capacity of the enrichment work queue before new IPs are dropped.
pub const DEFAULT_ENRICHMENT_QUEUE_CAPACITY: usize = 1_000;

/// Default capacity of the audit log's in-memory write queue.
pub const DEFAULT_AUDIT_QUEUE_CAPACITY: usize = 10_000;

/// Threat score at or above which an IP is throttled automatically.
pub const DEFAULT_THREAT_SCORE_THRESHOLD: u8 = 70;

/// Speed, in MB/s, above which the scorer's "high speed" rule fires.
pub const DEFAULT_HIGH_SPEED_THRESHOLD_MBPS: f64 = 50.0;

/// Speed, in MB/s, above which the scorer's "extreme speed" rule fires.
pub const DEFAULT_EXTREME_SPEED_THRESHOLD_MBPS: f64 = 100.0;

/// Observed-speed fraction of the configured ceiling above which flood mode
/// is flagged in the session summary.
pub const FLOOD_MODE_RATIO: f64 = 0.8;

/// Maximum size of a single IPC frame body, in bytes.
pub const MAX_FRAME_BYTES: u32 = 65_536;

/// Maximum length of a sanitized string field before truncation.
pub const MAX_SANITIZED_FIELD_LEN: usize = 256;

/// Environment variable holding the HMAC secret that enables audit log
/// integrity signing. Read exactly once, at [`Config::from_env`] time.
pub const LOG_SECRET_ENV_VAR: &str = "NETSHIELD_LOG_SECRET";

/// Fully resolved, validated runtime configuration shared by both processes.
#[derive(Debug, Clone)]
pub struct Config {
    /// Inbound bandwidth ceiling, in megabits per second.
    pub bandwidth_ceiling_mbps: f64,
    /// Token bucket burst allowance, in megabytes.
    pub burst_capacity_mb: f64,
    /// Maximum number of cached IP profiles.
    pub cache_capacity: usize,
    /// TTL for an idle cached IP profile.
    pub cache_ttl_secs: u64,
    /// Width of the bandwidth sliding window, in seconds.
    pub bandwidth_window_secs: f64,
    /// Enrichment lookup rate, in lookups per second.
    pub enrichment_rate: f64,
    /// Enrichment lookup timeout, in seconds.
    pub enrichment_timeout_secs: u64,
    /// Capacity of the bounded enrichment work queue.
    pub enrichment_queue_capacity: usize,
    /// Capacity of the audit log's write queue.
    pub audit_queue_capacity: usize,
    /// Threat score at or above which an IP is auto-throttled.
    pub threat_score_threshold: u8,
    /// Directory audit log files are written under.
    pub log_dir: std::path::PathBuf,
    /// TCP port the interceptor listens on for the packet-descriptor channel.
    pub packet_channel_port: u16,
    /// TCP port the interceptor listens on for the command channel.
    pub command_channel_port: u16,
    /// HMAC secret enabling audit log integrity signing, if set.
    pub log_secret: Option<String>,
    /// Interceptor filter mode: one of `"vrchat"`, `"universal"`, `"custom"`.
    pub mode: String,
    /// Threat score at or above which an IP is included in the watchlist
    /// snapshot (distinct from `threat_score_threshold`, which gates
    /// auto-throttling).
    pub watchlist_threshold: u8,
    /// ISO country codes the scorer's rule 1 treats as high-risk.
    pub high_risk_countries: HashSet<String>,
    /// Lower-cased `asn_description` substrings the scorer's rule 5 treats
    /// as suspicious.
    pub suspicious_asn_keywords: HashSet<String>,
}

impl Config {
    /// Builds a `Config` from environment variables, falling back to
    /// conservative defaults for anything unset. Full CLI/config-file
    /// parsing is out of scope; this wiring is deliberately thin.
    pub fn from_env() -> Self {
        fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        Config {
            bandwidth_ceiling_mbps: env_parse("NETSHIELD_BANDWIDTH_MBPS", 100.0),
            burst_capacity_mb: env_parse("NETSHIELD_BURST_MB", 10.0),
            cache_capacity: env_parse("NETSHIELD_CACHE_CAPACITY", DEFAULT_CACHE_CAPACITY),
            cache_ttl_secs: env_parse("NETSHIELD_CACHE_TTL_SECS", DEFAULT_CACHE_TTL_SECS),
            bandwidth_window_secs: env_parse(
                "NETSHIELD_BANDWIDTH_WINDOW_SECS",
                DEFAULT_BANDWIDTH_WINDOW_SECS,
            ),
            enrichment_rate: env_parse("NETSHIELD_ENRICHMENT_RATE", DEFAULT_ENRICHMENT_RATE),
            enrichment_timeout_secs: env_parse(
                "NETSHIELD_ENRICHMENT_TIMEOUT_SECS",
                DEFAULT_ENRICHMENT_TIMEOUT_SECS,
            ),
            enrichment_queue_capacity: env_parse(
                "NETSHIELD_ENRICHMENT_QUEUE_CAPACITY",
                DEFAULT_ENRICHMENT_QUEUE_CAPACITY,
            ),
            audit_queue_capacity: env_parse(
                "NETSHIELD_AUDIT_QUEUE_CAPACITY",
                DEFAULT_AUDIT_QUEUE_CAPACITY,
            ),
            threat_score_threshold: env_parse(
                "NETSHIELD_THREAT_THRESHOLD",
                DEFAULT_THREAT_SCORE_THRESHOLD,
            ),
            log_dir: env_parse("NETSHIELD_LOG_DIR", "./netshield-logs".to_string()).into(),
            packet_channel_port: env_parse("NETSHIELD_PACKET_PORT", 47_801u16),
            command_channel_port: env_parse("NETSHIELD_COMMAND_PORT", 47_802u16),
            log_secret: std::env::var(LOG_SECRET_ENV_VAR).ok(),
            mode: env_parse("NETSHIELD_MODE", "universal".to_string()),
            watchlist_threshold: env_parse(
                "NETSHIELD_WATCHLIST_THRESHOLD",
                DEFAULT_WATCHLIST_THRESHOLD,
            ),
            high_risk_countries: env_set("NETSHIELD_HIGH_RISK_COUNTRIES"),
            suspicious_asn_keywords: env_set("NETSHIELD_SUSPICIOUS_ASN_KEYWORDS"),
        }
    }

    /// Validates every bound named in spec.md §6, returning the first
    /// violation encountered. Fields are checked in declaration order so the
    /// error is deterministic across runs.
    pub fn validate(&self) -> Result<(), NetShieldError> {
        if !(1.0..=1000.0).contains(&self.bandwidth_ceiling_mbps) {
            return Err(NetShieldError::ConfigInvalid(format!(
                "bandwidth_ceiling_mbps must be in 1..=1000, got {}",
                self.bandwidth_ceiling_mbps
            )));
        }
        if !(1.0..=100.0).contains(&self.burst_capacity_mb) {
            return Err(NetShieldError::ConfigInvalid(format!(
                "burst_capacity_mb must be in 1..=100, got {}",
                self.burst_capacity_mb
            )));
        }
        if self.burst_capacity_mb > self.bandwidth_ceiling_mbps {
            return Err(NetShieldError::ConfigInvalid(
                "burst_capacity_mb must not exceed bandwidth_ceiling_mbps".into(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(NetShieldError::ConfigInvalid(
                "cache_capacity must be non-zero".into(),
            ));
        }
        if self.cache_ttl_secs == 0 {
            return Err(NetShieldError::ConfigInvalid(
                "cache_ttl_secs must be non-zero".into(),
            ));
        }
        if self.bandwidth_window_secs <= 0.0 {
            return Err(NetShieldError::ConfigInvalid(
                "bandwidth_window_secs must be positive".into(),
            ));
        }
        if self.enrichment_rate <= 0.0 {
            return Err(NetShieldError::ConfigInvalid(
                "enrichment_rate must be positive".into(),
            ));
        }
        if self.enrichment_timeout_secs == 0 {
            return Err(NetShieldError::ConfigInvalid(
                "enrichment_timeout_secs must be non-zero".into(),
            ));
        }
        if self.enrichment_queue_capacity == 0 {
            return Err(NetShieldError::ConfigInvalid(
                "enrichment_queue_capacity must be non-zero".into(),
            ));
        }
        if self.audit_queue_capacity == 0 {
            return Err(NetShieldError::ConfigInvalid(
                "audit_queue_capacity must be non-zero".into(),
            ));
        }
        if self.threat_score_threshold == 0 || self.threat_score_threshold > 100 {
            return Err(NetShieldError::ConfigInvalid(format!(
                "threat_score_threshold must be in 1..=100, got {}",
                self.threat_score_threshold
            )));
        }
        if self.packet_channel_port == self.command_channel_port {
            return Err(NetShieldError::ConfigInvalid(
                "packet_channel_port and command_channel_port must differ".into(),
            ));
        }
        if !matches!(self.mode.as_str(), "vrchat" | "universal" | "custom") {
            return Err(NetShieldError::ConfigInvalid(format!(
                "mode must be one of vrchat, universal, custom, got {}",
                self.mode
            )));
        }
        if self.watchlist_threshold > 100 {
            return Err(NetShieldError::ConfigInvalid(format!(
                "watchlist_threshold must be in 0..=100, got {}",
                self.watchlist_threshold
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bandwidth_ceiling_mbps: 100.0,
            burst_capacity_mb: 10.0,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            bandwidth_window_secs: DEFAULT_BANDWIDTH_WINDOW_SECS,
            enrichment_rate: DEFAULT_ENRICHMENT_RATE,
            enrichment_timeout_secs: DEFAULT_ENRICHMENT_TIMEOUT_SECS,
            enrichment_queue_capacity: DEFAULT_ENRICHMENT_QUEUE_CAPACITY,
            audit_queue_capacity: DEFAULT_AUDIT_QUEUE_CAPACITY,
            threat_score_threshold: DEFAULT_THREAT_SCORE_THRESHOLD,
            log_dir: "./netshield-logs".into(),
            packet_channel_port: 47_801,
            command_channel_port: 47_802,
            log_secret: None,
            mode: "universal".to_string(),
            watchlist_threshold: DEFAULT_WATCHLIST_THRESHOLD,
            high_risk_countries: HashSet::new(),
            suspicious_asn_keywords: HashSet::new(),
        }
    }
}
