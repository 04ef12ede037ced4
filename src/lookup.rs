//! RDAP-backed enrichment lookup — the concrete collaborator plugged into
//! [`crate::enrichment::EnrichmentWorker`] via the [`crate::enrichment::LookupFn`]
//! seam.
//!
//! Grounded on `original_source/intel/threat_intel.py::_do_whois_lookup`,
//! which calls `ipwhois.IPWhois(ip).lookup_rdap(depth=1)` and reads
//! `asn_country_code`, `asn`, `asn_description`, `network.name`,
//! `network.cidr`, and the first `entities` string containing "abuse".
//! RDAP is the modern, structured-JSON successor to classic WHOIS text
//! parsing, so a plain HTTP client suffices here; `reqwest` is the HTTP
//! client already used for a feed downloader elsewhere in this retrieval
//! pack (`prospectorengine-prospector-btc`).

use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::enrichment::{LookupFuture, LookupOutcome};
use crate::error::NetShieldError;

/// `rdap.org` redirects every query to the correct regional registry, so
/// one base URL covers all five RIRs without a bootstrap table.
const RDAP_BASE_URL: &str = "https://rdap.org/ip";

#[derive(Debug, Deserialize)]
struct RdapResponse {
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cidr0_cidrs: Vec<RdapCidr>,
    #[serde(default)]
    entities: Vec<RdapEntity>,
    #[serde(default)]
    arin_originas0_originautnums: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct RdapCidr {
    #[serde(default)]
    v4prefix: Option<String>,
    #[serde(default)]
    v6prefix: Option<String>,
    #[serde(default)]
    length: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct RdapEntity {
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default, rename = "vcardArray")]
    vcard_array: Option<serde_json::Value>,
    #[serde(default)]
    handle: Option<String>,
}

impl RdapCidr {
    fn as_cidr(&self) -> Option<String> {
        let prefix = self.v4prefix.as_ref().or(self.v6prefix.as_ref())?;
        match self.length {
            Some(len) => Some(format!("{prefix}/{len}")),
            None => Some(prefix.clone()),
        }
    }
}

fn extract_abuse_contact(entities: &[RdapEntity]) -> Option<String> {
    entities
        .iter()
        .find(|e| e.roles.iter().any(|r| r.eq_ignore_ascii_case("abuse")))
        .and_then(|e| e.handle.clone().or_else(|| vcard_email(&e.vcard_array)))
}

fn vcard_email(vcard: &Option<serde_json::Value>) -> Option<String> {
    // vCard arrays are `["vcard", [[field, params, type, value], ...]]`;
    // look for an "email" field's value.
    let entries = vcard.as_ref()?.as_array()?.get(1)?.as_array()?;
    for entry in entries {
        let entry = entry.as_array()?;
        if entry.first()?.as_str()? == "email" {
            return entry.get(3)?.as_str().map(String::from);
        }
    }
    None
}

/// Builds a [`LookupFn`]-compatible closure around a shared `reqwest::Client`.
/// Kept as a free function rather than a unit struct so it composes with
/// `Arc::new(rdap_lookup(client))` at the call site (spec.md §4.5's queue
/// is fed by an opaque `Fn(IpAddr) -> LookupFuture`).
pub fn rdap_lookup(client: reqwest::Client) -> crate::enrichment::LookupFn {
    std::sync::Arc::new(move |ip: IpAddr| -> LookupFuture {
        let client = client.clone();
        Box::pin(async move { do_lookup(&client, ip).await })
    })
}

async fn do_lookup(client: &reqwest::Client, ip: IpAddr) -> Result<LookupOutcome, NetShieldError> {
    let url = format!("{RDAP_BASE_URL}/{ip}");
    let response = client
        .get(&url)
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .map_err(|e| NetShieldError::EnrichmentTransport(e.to_string()))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        // rdap.org answers reserved/private ranges this way.
        return Ok(LookupOutcome::Reserved);
    }
    if !response.status().is_success() {
        return Err(NetShieldError::EnrichmentTransport(format!(
            "RDAP server returned {}",
            response.status()
        )));
    }

    let body: RdapResponse = response
        .json()
        .await
        .map_err(|e| NetShieldError::EnrichmentData(e.to_string()))?;

    let asn = body
        .arin_originas0_originautnums
        .first()
        .map(|n| n.to_string())
        .unwrap_or_else(|| "Unknown".to_string());

    Ok(LookupOutcome::Success {
        country: body.country.unwrap_or_else(|| "Unknown".to_string()),
        asn,
        asn_description: body.name.clone().unwrap_or_else(|| "Unknown".to_string()),
        network_name: body.name.unwrap_or_else(|| "Unknown".to_string()),
        network_cidr: body
            .cidr0_cidrs
            .first()
            .and_then(RdapCidr::as_cidr)
            .unwrap_or_else(|| "Unknown".to_string()),
        abuse_contact: extract_abuse_contact(&body.entities)
            .unwrap_or_else(|| "Unknown".to_string()),
    })
}
