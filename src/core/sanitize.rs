//! String and IP-literal sanitization.
//!
//! Every string that reaches a persisted or logged record goes through
//! [`sanitize_string`] first; every IP literal goes through [`sanitize_ip`].
//! Grounded on spec.md §3's sanitization rule and tested against the log
//! injection scenario in spec.md §8 ("Bad\r\nInjected: fake" must survive
//! with no embedded newlines).

const ELLIPSIS: &str = "...";

/// Removes control bytes (0x00-0x1F, 0x7F-0x9F), truncates to `max_len`
/// (appending an ellipsis marker when truncated), then trims whitespace.
///
/// Truncation happens before the final trim so a truncated field never ends
/// up longer than `max_len + ELLIPSIS.len()` but also never retains
/// leading/trailing whitespace introduced by the cut.
pub fn sanitize_string(input: &str, max_len: usize) -> String {
    let cleaned: String = input
        .chars()
        .filter(|&c| {
            let b = c as u32;
            !((0x00..=0x1F).contains(&b) || (0x7F..=0x9F).contains(&b))
        })
        .collect();

    let truncated = if cleaned.chars().count() > max_len {
        let mut s: String = cleaned.chars().take(max_len).collect();
        s.push_str(ELLIPSIS);
        s
    } else {
        cleaned
    };

    truncated.trim().to_string()
}

/// Maximum length of a sanitized IP literal (longest valid IPv6 textual
/// form with a zone id comfortably fits in 45 chars without one).
pub const MAX_IP_LITERAL_LEN: usize = 45;

/// Validates `input` against the restricted IP-literal grammar
/// `[0-9a-fA-F.:]+` and a 45-character length bound. Returns the literal
/// unchanged if it matches, otherwise the literal `"invalid"`.
pub fn sanitize_ip(input: &str) -> String {
    let matches_grammar = !input.is_empty()
        && input.len() <= MAX_IP_LITERAL_LEN
        && input
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '.' || c == ':');

    if matches_grammar {
        input.to_string()
    } else {
        "invalid".to_string()
    }
}
