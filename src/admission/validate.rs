//! # Handshake Validation
//!
//! Turns a normalized handshake payload into a [`SessionDescriptor`], or a
//! [`HandshakeRejection`] listing every required field that is missing.
//!
//! ## Processing order:
//! 1. **Defaulting**: synthesize `uid` (`anon-<8 hex>`) and `token` (`NO_TOKEN`)
//! 2. **Coercion**: numbers/booleans become strings, `null` counts as absent
//! 3. **Enforcement**: `platform`, `meeting_url`, `meeting_id` must be non-empty
//!
//! Only `uid` and `token` are ever defaulted, and both defaults are logged.

use crate::admission::error::HandshakeRejection;
use crate::admission::normalize::{is_identity_key, RawHandshakePayload};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

/// Placeholder token injected when the client sends none.
pub const PLACEHOLDER_TOKEN: &str = "NO_TOKEN";

/// Prefix of server-synthesized session ids.
pub const SYNTHETIC_UID_PREFIX: &str = "anon-";

/// Required fields that are never defaulted, in the order they are reported.
pub const REQUIRED_FIELDS: [&str; 3] = ["platform", "meeting_url", "meeting_id"];

/// Canonical, validated description of a session.
///
/// Immutable once built: nothing outside this module can change its fields.
/// A connection holds exactly one for its whole lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescriptor {
    uid: String,
    platform: String,
    meeting_url: String,
    token: String,
    meeting_id: String,
    optional: Map<String, Value>,
}

impl SessionDescriptor {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn meeting_url(&self) -> &str {
        &self.meeting_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    /// Every non-identity key the client sent, with its original JSON type.
    pub fn optional(&self) -> &Map<String, Value> {
        &self.optional
    }

    pub fn language(&self) -> Option<&str> {
        self.optional.get("language").and_then(Value::as_str)
    }

    pub fn task(&self) -> Option<&str> {
        self.optional.get("task").and_then(Value::as_str)
    }

    pub fn initial_prompt(&self) -> Option<&str> {
        self.optional.get("initial_prompt").and_then(Value::as_str)
    }

    /// Voice activity detection is on unless the client explicitly opts out.
    pub fn use_vad(&self) -> bool {
        self.optional
            .get("use_vad")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// True when the session runs on the development-mode token fallback.
    pub fn has_placeholder_token(&self) -> bool {
        self.token == PLACEHOLDER_TOKEN
    }

    /// Rebuild the descriptor under a different uid. Used by the session
    /// registry when the requested uid is already taken.
    pub(crate) fn with_uid(self, uid: String) -> Self {
        Self { uid, ..self }
    }
}

/// Draw a fresh `anon-xxxxxxxx` id.
///
/// Eight hex characters from a v4 UUID: collisions are unlikely but possible,
/// the session registry re-draws on conflict.
pub fn synthesize_uid() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}{}", SYNTHETIC_UID_PREFIX, &hex[..8])
}

/// Coerce a JSON value into the string form of a required field.
///
/// `None` means the field is absent: null, or a string that is blank
/// after trimming.
pub fn coerce_to_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    };

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn field(payload: &RawHandshakePayload, key: &str) -> Option<String> {
    payload.get(key).and_then(coerce_to_string)
}

/// Validate a normalized payload.
///
/// ## Returns:
/// - **Ok(SessionDescriptor)**: all required fields present after defaulting
/// - **Err(HandshakeRejection)**: lists every missing required field
pub fn validate(normalized: &RawHandshakePayload) -> Result<SessionDescriptor, HandshakeRejection> {
    let uid = match field(normalized, "uid") {
        Some(uid) => uid,
        None => {
            let uid = synthesize_uid();
            info!(uid = %uid, uid_synthesized = true, "Handshake carried no uid, synthesized one");
            uid
        }
    };

    let token = match field(normalized, "token") {
        Some(token) => token,
        None => {
            warn!(
                uid = %uid,
                token_placeholder = true,
                "Handshake carried no token, using development fallback {}",
                PLACEHOLDER_TOKEN
            );
            PLACEHOLDER_TOKEN.to_string()
        }
    };

    let platform = field(normalized, "platform");
    let meeting_url = field(normalized, "meeting_url");
    let meeting_id = field(normalized, "meeting_id");

    let missing: Vec<&'static str> = REQUIRED_FIELDS
        .iter()
        .zip([&platform, &meeting_url, &meeting_id])
        .filter(|(_, value)| value.is_none())
        .map(|(name, _)| *name)
        .collect();

    match (platform, meeting_url, meeting_id) {
        (Some(platform), Some(meeting_url), Some(meeting_id)) => {
            let optional = normalized
                .iter()
                .filter(|(key, _)| !is_identity_key(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();

            Ok(SessionDescriptor {
                uid,
                platform,
                meeting_url,
                token,
                meeting_id,
                optional,
            })
        }
        _ => Err(HandshakeRejection { missing }),
    }
}

/// Test-only constructor for code that needs a descriptor without going
/// through a payload.
#[cfg(test)]
pub(crate) fn descriptor_for_tests(uid: &str) -> SessionDescriptor {
    SessionDescriptor {
        uid: uid.to_string(),
        platform: "zoom".to_string(),
        meeting_url: "https://meet.example/abc".to_string(),
        token: "t".to_string(),
        meeting_id: "abc".to_string(),
        optional: Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::normalize::normalize;
    use serde_json::json;

    fn object(value: Value) -> RawHandshakePayload {
        match value {
            Value::Object(map) => map,
            _ => panic!("test payload must be an object"),
        }
    }

    fn is_synthetic(uid: &str) -> bool {
        uid.len() == 13
            && uid.starts_with(SYNTHETIC_UID_PREFIX)
            && uid[5..]
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }

    #[test]
    fn test_synthetic_uid_shape_and_uniqueness() {
        let first = synthesize_uid();
        let second = synthesize_uid();
        assert!(is_synthetic(&first), "unexpected uid shape: {}", first);
        assert!(is_synthetic(&second), "unexpected uid shape: {}", second);
        assert_ne!(first, second);
    }

    #[test]
    fn test_missing_uid_is_synthesized() {
        let descriptor = validate(&object(json!({
            "platform": "teams",
            "meeting_url": "https://x",
            "meeting_id": "m",
            "token": "t"
        })))
        .unwrap();
        assert!(is_synthetic(descriptor.uid()));
    }

    #[test]
    fn test_token_defaults_to_placeholder() {
        let descriptor = validate(&object(json!({
            "uid": "s1",
            "platform": "teams",
            "meeting_url": "https://x",
            "meeting_id": "m"
        })))
        .unwrap();
        assert_eq!(descriptor.token(), "NO_TOKEN");
        assert!(descriptor.has_placeholder_token());
    }

    #[test]
    fn test_rejection_lists_every_missing_field() {
        let rejection = validate(&object(json!({
            "uid": "s1",
            "meeting_url": "https://x"
        })))
        .unwrap_err();
        assert_eq!(rejection.missing, vec!["platform", "meeting_id"]);
        assert_eq!(rejection.reason(), "missing_required_fields");
    }

    #[test]
    fn test_numeric_meeting_id_is_coerced() {
        let descriptor = validate(&object(json!({
            "uid": "s1",
            "platform": "zoom",
            "meeting_url": "https://x",
            "meeting_id": 42
        })))
        .unwrap();
        assert_eq!(descriptor.meeting_id(), "42");
    }

    #[test]
    fn test_blank_and_null_required_fields_are_missing() {
        let rejection = validate(&object(json!({
            "platform": "   ",
            "meeting_url": null,
            "meeting_id": "m"
        })))
        .unwrap_err();
        assert_eq!(rejection.missing, vec!["platform", "meeting_url"]);
    }

    #[test]
    fn test_coercion_rules() {
        assert_eq!(coerce_to_string(&json!(7)), Some("7".to_string()));
        assert_eq!(coerce_to_string(&json!(true)), Some("true".to_string()));
        assert_eq!(coerce_to_string(&json!("  x ")), Some("x".to_string()));
        assert_eq!(coerce_to_string(&json!([1, 2])), Some("[1,2]".to_string()));
        assert_eq!(coerce_to_string(&json!(null)), None);
        assert_eq!(coerce_to_string(&json!("")), None);
    }

    #[test]
    fn test_optional_keys_keep_their_types() {
        let descriptor = validate(&normalize(object(json!({
            "uid": "s1",
            "platform": "zoom",
            "meetingUrl": "https://x",
            "meeting_id": "m",
            "language": "de",
            "task": "translate",
            "initial_prompt": "Standup",
            "use_vad": false,
            "vad_parameters": {"threshold": 0.4}
        }))))
        .unwrap();

        assert_eq!(descriptor.language(), Some("de"));
        assert_eq!(descriptor.task(), Some("translate"));
        assert_eq!(descriptor.initial_prompt(), Some("Standup"));
        assert!(!descriptor.use_vad());
        assert_eq!(descriptor.optional()["vad_parameters"], json!({"threshold": 0.4}));
        assert!(!descriptor.optional().contains_key("meetingUrl"));
        assert!(!descriptor.optional().contains_key("uid"));
    }

    #[test]
    fn test_use_vad_defaults_to_true() {
        assert!(descriptor_for_tests("s1").use_vad());
    }

    #[test]
    fn test_end_to_end_aliased_payload() {
        let raw = object(json!({
            "meetingUrl": "https://x",
            "nativeMeetingId": 7,
            "platform": "zoom"
        }));

        let descriptor = validate(&normalize(raw)).unwrap();
        assert!(is_synthetic(descriptor.uid()));
        assert_eq!(descriptor.platform(), "zoom");
        assert_eq!(descriptor.meeting_url(), "https://x");
        assert_eq!(descriptor.token(), "NO_TOKEN");
        assert_eq!(descriptor.meeting_id(), "7");
    }

    #[test]
    fn test_end_to_end_missing_everything_but_identity() {
        let raw = object(json!({ "uid": "s1", "token": "t" }));
        let rejection = validate(&normalize(raw)).unwrap_err();
        assert_eq!(rejection.missing, vec!["platform", "meeting_url", "meeting_id"]);
    }

    #[test]
    fn test_with_uid_keeps_other_fields() {
        let original = descriptor_for_tests("s1");
        let renamed = original.clone().with_uid("anon-0000beef".to_string());
        assert_eq!(renamed.uid(), "anon-0000beef");
        assert_eq!(renamed.meeting_id(), original.meeting_id());
        assert_eq!(renamed.token(), original.token());
    }
}
