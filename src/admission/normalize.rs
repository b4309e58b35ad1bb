//! # Handshake Field Normalization
//!
//! Clients in the wild name the same handshake fields differently (`meetingUrl`
//! vs `meeting_url`, `nativeMeetingId` vs `meeting_id`, ...). This module maps
//! those alternate names onto the canonical keys. It never fails and never drops
//! keys: anything it does not recognize is passed through untouched.
//!
//! ## Alias table (priority order):
//! - `meeting_url` ← `meetingUrl`
//! - `meeting_id`  ← `meetingId`, `nativeMeetingId`
//! - `uid`         ← `connectionId`, `botName`
//!
//! Matching is exact and case-sensitive.

use serde_json::{Map, Value};

/// Raw first-frame payload: an unordered JSON object.
pub type RawHandshakePayload = Map<String, Value>;

/// Canonical keys every admitted session must carry.
pub const CANONICAL_KEYS: [&str; 5] = ["uid", "platform", "meeting_url", "token", "meeting_id"];

/// `(canonical key, aliases in priority order)`.
pub const ALIASES: [(&str, &[&str]); 3] = [
    ("meeting_url", &["meetingUrl"]),
    ("meeting_id", &["meetingId", "nativeMeetingId"]),
    ("uid", &["connectionId", "botName"]),
];

/// Returns true when `key` is a canonical key or one of the accepted aliases.
pub fn is_identity_key(key: &str) -> bool {
    CANONICAL_KEYS.contains(&key) || is_alias_key(key)
}

/// Returns true when `key` is only an alias source (e.g. `meetingUrl`).
pub fn is_alias_key(key: &str) -> bool {
    ALIASES
        .iter()
        .any(|(_, aliases)| aliases.contains(&key))
}

/// A value "carries" a field when it is neither null nor a blank string.
pub(crate) fn carries_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn has_field(payload: &RawHandshakePayload, key: &str) -> bool {
    payload.get(key).map(carries_value).unwrap_or(false)
}

/// Map a raw payload onto canonical keys.
///
/// Each alias rule is applied on its own: a canonical key that is already
/// present wins unchanged, otherwise it is filled from the first alias that
/// carries a value. Alias source keys stay in the output, so normalizing an
/// already-normalized payload gives back the same payload.
pub fn normalize(raw: RawHandshakePayload) -> RawHandshakePayload {
    let mut normalized = raw;

    for (canonical, aliases) in ALIASES.iter() {
        if has_field(&normalized, canonical) {
            continue;
        }

        let source = aliases.iter().find(|alias| has_field(&normalized, alias));
        if let Some(alias) = source {
            if let Some(value) = normalized.get(*alias).cloned() {
                tracing::debug!(canonical = *canonical, alias = *alias, "Applied handshake alias");
                normalized.insert((*canonical).to_string(), value);
            }
        }
    }

    normalized
}

/// Sorted key list, used in diagnostics so raw and normalized payloads
/// can be compared side by side in the logs.
pub fn key_list(payload: &RawHandshakePayload) -> Vec<String> {
    let mut keys: Vec<String> = payload.keys().cloned().collect();
    keys.sort();
    keys
}
