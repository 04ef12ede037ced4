//! Wire message shapes and their validators.
//!
//! JSON field names equal the attribute names in spec.md §3. Unknown tags
//! and unknown fields are rejected at decode time (spec.md §9 "Dynamic
//! typing" design note): these are concrete record types, not duck-typed
//! dictionaries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::sanitize::sanitize_ip;

/// Transport protocol tag carried on a packet descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    Tcp,
    Udp,
}

/// On-wire packet-metadata record, interceptor → analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PacketDescriptor {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: WireProtocol,
    pub length: u16,
    pub timestamp: f64,
}

impl PacketDescriptor {
    /// True if every field satisfies its declared grammar (spec.md §3).
    /// Ports and length are bounded by their `u16` type already; only the
    /// IP literals need runtime validation.
    pub fn is_valid(&self) -> bool {
        sanitize_ip(&self.src_ip) == self.src_ip && sanitize_ip(&self.dst_ip) == self.dst_ip
    }
}

/// The fixed set of command tags that may cross the command channel.
/// Any other string fails to deserialize — unknown tags are rejected at
/// the boundary, not downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTag {
    ThrottleIp,
    UnthrottleIp,
    GetStats,
    Shutdown,
}

/// On-wire command record, analyzer → interceptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Command {
    pub tag: CommandTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ip: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub timestamp: f64,
}

impl Command {
    pub fn throttle(ip: &str, timestamp: f64) -> Self {
        Command {
            tag: CommandTag::ThrottleIp,
            target_ip: Some(ip.to_string()),
            parameters: HashMap::new(),
            timestamp,
        }
    }

    pub fn unthrottle(ip: &str, timestamp: f64) -> Self {
        Command {
            tag: CommandTag::UnthrottleIp,
            target_ip: Some(ip.to_string()),
            parameters: HashMap::new(),
            timestamp,
        }
    }

    pub fn shutdown(timestamp: f64) -> Self {
        Command {
            tag: CommandTag::Shutdown,
            target_ip: None,
            parameters: HashMap::new(),
            timestamp,
        }
    }

    /// True if the command's tag is known (guaranteed by deserialization)
    /// and, when a target IP is present, that it matches the IP-literal
    /// grammar. `throttle_ip`/`unthrottle_ip` additionally require a
    /// target IP to be present at all.
    pub fn is_valid(&self) -> bool {
        if let Some(ip) = &self.target_ip {
            if sanitize_ip(ip) != *ip {
                return false;
            }
        }
        match self.tag {
            CommandTag::ThrottleIp | CommandTag::UnthrottleIp => self.target_ip.is_some(),
            CommandTag::GetStats | CommandTag::Shutdown => true,
        }
    }
}
