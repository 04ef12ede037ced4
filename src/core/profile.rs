//! IP profile record, owned by the cache and shared by the enrichment
//! worker and scorer.
//!
//! Grounded on `original_source/intel/threat_intel.py`'s profile shape and
//! `_is_private_ip` short-circuit. Every setter routes strings through
//! [`sanitize_string`] and the IP field through [`sanitize_ip`] so the
//! invariant in spec.md §3 holds no matter which subsystem last wrote it.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sanitize::{sanitize_ip, sanitize_string};

const MAX_COUNTRY_LEN: usize = 10;
const MAX_ASN_LEN: usize = 20;
const MAX_ASN_DESC_LEN: usize = 128;
const MAX_NETWORK_NAME_LEN: usize = 128;
const MAX_NETWORK_CIDR_LEN: usize = 50;
const MAX_ABUSE_CONTACT_LEN: usize = 128;

/// Long-lived per-IP record maintained by the cache and enriched
/// asynchronously by the background lookup worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpProfile {
    pub ip: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub country: String,
    pub asn: String,
    pub asn_description: String,
    pub network_name: String,
    pub network_cidr: String,
    pub abuse_contact: String,
    pub total_bytes: u64,
    pub total_packets: u64,
    pub throttled_packets: u64,
    pub max_speed_mbps: f64,
    pub threat_score: u8,
    pub reasons: Vec<String>,

    /// Monotonic eviction clock, expressed as seconds since the cache's
    /// epoch instant. Not serialized; every load starts with a fresh
    /// access time set by the cache.
    #[serde(skip)]
    pub last_access_secs: f64,
}

impl IpProfile {
    /// Creates a freshly observed profile for `ip`, sanitizing the literal.
    pub fn new(ip: &str, now: DateTime<Utc>) -> Self {
        IpProfile {
            ip: sanitize_ip(ip),
            first_seen: now,
            last_seen: now,
            country: String::new(),
            asn: String::new(),
            asn_description: String::new(),
            network_name: String::new(),
            network_cidr: String::new(),
            abuse_contact: String::new(),
            total_bytes: 0,
            total_packets: 0,
            throttled_packets: 0,
            max_speed_mbps: 0.0,
            threat_score: 0,
            reasons: Vec::new(),
            last_access_secs: 0.0,
        }
    }

    /// Sets the country code, sanitized and bounded.
    pub fn set_country(&mut self, country: &str) {
        self.country = sanitize_string(country, MAX_COUNTRY_LEN);
    }

    /// Sets ASN, description, network, and abuse contact fields together,
    /// as a successful enrichment lookup does in one update.
    pub fn set_enrichment(
        &mut self,
        asn: &str,
        asn_description: &str,
        network_name: &str,
        network_cidr: &str,
        abuse_contact: &str,
    ) {
        self.asn = sanitize_string(asn, MAX_ASN_LEN);
        self.asn_description = sanitize_string(asn_description, MAX_ASN_DESC_LEN);
        self.network_name = sanitize_string(network_name, MAX_NETWORK_NAME_LEN);
        self.network_cidr = sanitize_string(network_cidr, MAX_NETWORK_CIDR_LEN);
        self.abuse_contact = sanitize_string(abuse_contact, MAX_ABUSE_CONTACT_LEN);
    }

    /// Folds in one observation: bytes transferred, whether it was
    /// throttled, and the instantaneous speed sample.
    pub fn record_traffic(&mut self, bytes: u64, throttled: bool, speed_mbps: f64, now: DateTime<Utc>) {
        self.total_bytes += bytes;
        self.total_packets += 1;
        if throttled {
            self.throttled_packets += 1;
        }
        if speed_mbps > self.max_speed_mbps {
            self.max_speed_mbps = speed_mbps;
        }
        self.last_seen = now;
    }
}

/// Returns true only for addresses the analyzer should profile and enrich:
/// excludes private, loopback, link-local, multicast, unspecified, and
/// other reserved ranges (`original_source/intel/threat_intel.py::_is_private_ip`,
/// inverted).
pub fn is_public_ip(ip: IpAddr) -> bool {
    if ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_reserved())
        }
        IpAddr::V6(v6) => {
            // is_unique_local / is_unicast_link_local are stable check
            // equivalents to RFC 4193 / RFC 4291 reserved ranges.
            let segments = v6.segments();
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            let is_unicast_link_local = (segments[0] & 0xffc0) == 0xfe80;
            !(is_unique_local || is_unicast_link_local)
        }
    }
}
