//! Payload grammar.
//!
//! A request is space-separated tokens, optionally closed by a trailing
//! `!FZT=<n>` tracker token. Arguments after a recognized command are
//! typically a single CSV string of `Key=Value` pairs. Command streams are
//! case-sensitive; hyphens and underscores are interchangeable for lookup.

use std::collections::HashMap;

/// Prefix of the diagnostic tracker token.
pub const TRACKER_PREFIX: &str = "!FZT=";

/// A tokenized request with its tracker peeled off.
#[derive(Debug, PartialEq, Eq)]
pub struct Request<'a> {
    pub tokens: Vec<&'a str>,
    pub tracker: Option<u64>,
}

/// Split a raw payload into tokens, stripping the trailing tracker token
/// when present.
pub fn parse_request(raw: &str) -> Request<'_> {
    let mut tokens: Vec<&str> = raw.split_whitespace().collect();
    let mut tracker = None;
    if let Some(last) = tokens.last() {
        if let Some(n) = last.strip_prefix(TRACKER_PREFIX) {
            tracker = n.parse().ok();
            tokens.pop();
        }
    }
    Request { tokens, tracker }
}

/// Append the tracker token to an outbound payload.
pub fn with_tracker(payload: &str, n: u64) -> String {
    format!("{} {}{}", payload, TRACKER_PREFIX, n)
}

/// Parse one `Key=Value,Key=Value,...` CSV string. Malformed elements are
/// skipped, matching the forgiving original parser.
pub fn csv_to_map(csv: &str) -> HashMap<String, String> {
    let mut kv = HashMap::new();
    for elem in csv.trim().split(',') {
        let mut parts = elem.splitn(2, '=');
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        kv.insert(key.to_string(), value.trim().to_string());
    }
    kv
}

/// Lookup normalization: hyphens inside tokens count as underscores, so
/// `Peer-Attribute` and `Peer_Attribute` select the same handler.
pub(crate) fn normalize(token: &str) -> String {
    token.replace('-', "_")
}
