//! Rule-based threat scorer.
//!
//! Pure function from [`IpProfile`] to `(score, reasons)`. Grounded on
//! `original_source/intel/scoring.py::ThreatScorer`, whose five
//! independently-contributing rules and default thresholds this mirrors
//! exactly (spec.md §4.4).

use std::collections::HashSet;

use super::profile::IpProfile;

const SCORE_HIGH_RISK_COUNTRY: u32 = 30;
const SCORE_EXTREME_SPEED: u32 = 40;
const SCORE_HIGH_SPEED: u32 = 20;
const SCORE_HIGH_THROTTLE: u32 = 20;
const SCORE_SUSPICIOUS_ASN: u32 = 15;

const EXTREME_SPEED_THRESHOLD_MBPS: f64 = 100.0;
const HIGH_SPEED_THRESHOLD_MBPS: f64 = 50.0;
const HIGH_THROTTLE_RATIO: f64 = 0.5;
const MIN_PACKETS_FOR_THROTTLE_RULE: u64 = 10;

/// Configuration for the scorer's two lookup-table rules. Everything else
/// (thresholds, contributions) is a fixed constant per spec.md §4.4.
#[derive(Debug, Clone, Default)]
pub struct ScoringConfig {
    /// ISO country codes considered high-risk.
    pub high_risk_countries: HashSet<String>,
    /// Lower-cased substrings of `asn_description` considered suspicious.
    pub suspicious_asn_keywords: HashSet<String>,
}

/// Stateless, deterministic rule-based scorer.
pub struct ThreatScorer {
    config: ScoringConfig,
}

impl ThreatScorer {
    pub fn new(config: ScoringConfig) -> Self {
        ThreatScorer { config }
    }

    /// Computes `(score in 0..=100, reasons)` for `profile`. Each of the
    /// five rules contributes independently; the raw sum is clipped to 100.
    pub fn calculate(&self, profile: &IpProfile) -> (u8, Vec<String>) {
        let mut score: u32 = 0;
        let mut reasons = Vec::new();

        if self.config.high_risk_countries.contains(&profile.country) {
            score += SCORE_HIGH_RISK_COUNTRY;
            reasons.push(format!(
                "high-risk country: {}",
                profile.country
            ));
        }

        if profile.max_speed_mbps > EXTREME_SPEED_THRESHOLD_MBPS {
            score += SCORE_EXTREME_SPEED;
            reasons.push(format!(
                "extreme speed: {:.2} MB/s",
                profile.max_speed_mbps
            ));
        } else if profile.max_speed_mbps > HIGH_SPEED_THRESHOLD_MBPS {
            score += SCORE_HIGH_SPEED;
            reasons.push(format!("high speed: {:.2} MB/s", profile.max_speed_mbps));
        }

        if profile.total_packets > MIN_PACKETS_FOR_THROTTLE_RULE {
            let ratio = profile.throttled_packets as f64 / profile.total_packets as f64;
            if ratio > HIGH_THROTTLE_RATIO {
                score += SCORE_HIGH_THROTTLE;
                reasons.push(format!("high drop ratio: {:.2}", ratio));
            }
        }

        let asn_desc_lower = profile.asn_description.to_lowercase();
        if self
            .config
            .suspicious_asn_keywords
            .iter()
            .any(|kw| asn_desc_lower.contains(kw.as_str()))
        {
            score += SCORE_SUSPICIOUS_ASN;
            reasons.push(format!(
                "suspicious ASN: {}",
                profile.asn_description
            ));
        }

        (score.min(100) as u8, reasons)
    }

    /// Computes the score and reasons, and records both on `profile`.
    pub fn update_profile_score(&self, profile: &mut IpProfile) {
        let (score, reasons) = self.calculate(profile);
        profile.threat_score = score;
        profile.reasons = reasons;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn base_profile() -> IpProfile {
        IpProfile::new("1.2.3.4", Utc::now())
    }

    fn scorer_with(countries: &[&str], keywords: &[&str]) -> ThreatScorer {
        ThreatScorer::new(ScoringConfig {
            high_risk_countries: countries.iter().map(|s| s.to_string()).collect(),
            suspicious_asn_keywords: keywords.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn test_clean_profile_scores_zero() {
        let scorer = scorer_with(&["KP"], &["bulletproof"]);
        let profile = base_profile();
        let (score, reasons) = scorer.calculate(&profile);
        assert_eq!(score, 0);
        assert!(reasons.is_empty());
    }

    #[test]
    fn test_scorer_combination_matches_spec_scenario() {
        // spec.md §8 scenario 4.
        let scorer = scorer_with(&["KP"], &["bulletproof hosting"]);
        let mut profile = base_profile();
        profile.set_country("KP");
        profile.max_speed_mbps = 150.0;
        profile.total_packets = 100;
        profile.throttled_packets = 60;
        profile.set_enrichment("AS1", "Bulletproof Hosting", "net", "1.2.3.0/24", "abuse@x");

        let (score, reasons) = scorer.calculate(&profile);
        assert_eq!(score, 100);
        assert_eq!(reasons.len(), 4);
    }

    #[test]
    fn test_extreme_and_high_speed_are_mutually_exclusive() {
        let scorer = scorer_with(&[], &[]);
        let mut profile = base_profile();
        profile.max_speed_mbps = 150.0;
        let (score, reasons) = scorer.calculate(&profile);
        assert_eq!(score, 40);
        assert_eq!(reasons.len(), 1);

        profile.max_speed_mbps = 60.0;
        let (score, reasons) = scorer.calculate(&profile);
        assert_eq!(score, 20);
        assert_eq!(reasons.len(), 1);
    }

    #[test]
    fn test_high_drop_ratio_requires_minimum_packets() {
        let scorer = scorer_with(&[], &[]);
        let mut profile = base_profile();
        profile.total_packets = 5;
        profile.throttled_packets = 5;
        let (score, _) = scorer.calculate(&profile);
        assert_eq!(score, 0, "ratio rule must not fire below the packet floor");

        profile.total_packets = 11;
        profile.throttled_packets = 6;
        let (score, _) = scorer.calculate(&profile);
        assert_eq!(score, 20);
    }

    #[test]
    fn test_suspicious_asn_keyword_counted_once_on_multiple_matches() {
        let scorer = scorer_with(&[], &["bulletproof", "offshore"]);
        let mut profile = base_profile();
        profile.set_enrichment("AS1", "Offshore Bulletproof Hosting Ltd", "n", "c", "a");
        let (score, reasons) = scorer.calculate(&profile);
        assert_eq!(score, 15);
        assert_eq!(reasons.len(), 1);
    }

    #[test]
    fn test_score_never_exceeds_100() {
        let scorer = scorer_with(&["KP"], &["bad"]);
        let mut profile = base_profile();
        profile.set_country("KP");
        profile.max_speed_mbps = 500.0;
        profile.total_packets = 1000;
        profile.throttled_packets = 999;
        profile.set_enrichment("AS1", "Bad Corp", "n", "c", "a");
        let (score, _) = scorer.calculate(&profile);
        assert!(score <= 100);
    }

    #[test]
    fn test_update_profile_score_writes_back_to_profile() {
        let scorer = scorer_with(&["KP"], &[]);
        let mut profile = base_profile();
        profile.set_country("KP");
        scorer.update_profile_score(&mut profile);
        assert_eq!(profile.threat_score, 30);
        assert_eq!(profile.reasons.len(), 1);
    }
}
