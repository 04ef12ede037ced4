//! Unified error type shared by every NetShield component.
//!
//! `NetShieldError` is the single error type returned across the interceptor,
//! analyzer, and supporting subsystems. It serializes as
//! `{ "kind": "...", "message": "..." }` so it can be logged or reported
//! structurally, one variant per entry in the error taxonomy (spec.md §7).

use serde::ser::SerializeStruct;

/// Error kinds shared by the interceptor, analyzer, and supporting
/// subsystems (cache, audit log, enrichment worker, IPC codec).
#[derive(Debug, thiserror::Error)]
pub enum NetShieldError {
    /// A configuration value lies outside its declared bound.
    #[error("{0}")]
    ConfigInvalid(String),

    /// The kernel packet-diversion handle could not be opened.
    #[error("{0}")]
    PrivilegeDenied(String),

    /// IPC connect/read failed or the peer disappeared.
    #[error("{0}")]
    PeerUnavailable(String),

    /// An oversized or malformed IPC frame was discarded.
    #[error("{0}")]
    InvalidFrame(String),

    /// A remote enrichment lookup service was unreachable.
    #[error("{0}")]
    EnrichmentTransport(String),

    /// A remote enrichment response could not be parsed.
    #[error("{0}")]
    EnrichmentData(String),

    /// A bounded queue (audit or enrichment) was full; the item was dropped.
    #[error("{0}")]
    QueueFull(String),

    /// Local (de)serialization of our own records failed — audit log
    /// entries, not IPC frames. See `InvalidFrame` for the wire case.
    #[error("{0}")]
    Serialization(String),

    /// A transient error receiving a packet from the kernel handle.
    #[error("{0}")]
    KernelRecvTransient(String),

    /// An invalid argument was passed to a component (e.g. a zero rate).
    #[error("{0}")]
    InvalidArgument(String),

    /// I/O failure (audit log files, IPC sockets).
    #[error("{0}")]
    Io(String),

    /// Anything outside the named taxonomy. Never swallowed by workers.
    #[error("{0}")]
    Unexpected(String),
}

impl NetShieldError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            NetShieldError::ConfigInvalid(_) => "ConfigInvalid",
            NetShieldError::PrivilegeDenied(_) => "PrivilegeDenied",
            NetShieldError::PeerUnavailable(_) => "PeerUnavailable",
            NetShieldError::InvalidFrame(_) => "InvalidFrame",
            NetShieldError::EnrichmentTransport(_) => "EnrichmentTransport",
            NetShieldError::EnrichmentData(_) => "EnrichmentData",
            NetShieldError::QueueFull(_) => "QueueFull",
            NetShieldError::Serialization(_) => "Serialization",
            NetShieldError::KernelRecvTransient(_) => "KernelRecvTransient",
            NetShieldError::InvalidArgument(_) => "InvalidArgument",
            NetShieldError::Io(_) => "Io",
            NetShieldError::Unexpected(_) => "Unexpected",
        }
    }
}

/// Custom Serialize: produces `{ "kind": "Variant", "message": "..." }`.
impl serde::Serialize for NetShieldError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("NetShieldError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<anyhow::Error> for NetShieldError {
    fn from(err: anyhow::Error) -> Self {
        NetShieldError::Unexpected(err.to_string())
    }
}

impl From<std::io::Error> for NetShieldError {
    fn from(err: std::io::Error) -> Self {
        NetShieldError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NetShieldError {
    fn from(err: serde_json::Error) -> Self {
        NetShieldError::Serialization(err.to_string())
    }
}
