//! Frame classification for active sessions.
//!
//! Binary frames are float32 PCM audio and go to the pipeline unmodified.
//! Text frames are JSON control messages discriminated by their `type` field.

use crate::admission::normalize::is_identity_key;
use actix_web::web::Bytes;
use serde_json::{Map, Value};

/// Binary sentinel a client sends to signal that no more audio follows.
pub const END_OF_AUDIO: &[u8] = b"END_OF_AUDIO";

/// `session_control` events that end the session.
const TERMINATING_EVENTS: [&str; 4] = ["LEAVING_MEETING", "END_SESSION", "end_session", "terminate"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    SpeakerActivity,
    SessionControl,
    AudioChunkMetadata,
}

impl ControlKind {
    pub fn parse(discriminator: &str) -> Option<Self> {
        match discriminator {
            "speaker_activity" => Some(ControlKind::SpeakerActivity),
            "session_control" => Some(ControlKind::SessionControl),
            "audio_chunk_metadata" => Some(ControlKind::AudioChunkMetadata),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::SpeakerActivity => "speaker_activity",
            ControlKind::SessionControl => "session_control",
            ControlKind::AudioChunkMetadata => "audio_chunk_metadata",
        }
    }
}

/// A recognized JSON control message. `body` is the full object, `type` included.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub kind: ControlKind,
    pub body: Map<String, Value>,
}

impl ControlMessage {
    /// `event` field, looked up at the top level first and then under `payload`.
    pub fn event(&self) -> Option<&str> {
        self.body
            .get("event")
            .and_then(Value::as_str)
            .or_else(|| {
                self.body
                    .get("payload")
                    .and_then(|payload| payload.get("event"))
                    .and_then(Value::as_str)
            })
    }

    pub fn is_termination(&self) -> bool {
        self.kind == ControlKind::SessionControl
            && self
                .event()
                .map(|event| TERMINATING_EVENTS.contains(&event))
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoutedFrame {
    /// Raw PCM bytes for the transcription pipeline.
    Audio(Bytes),
    /// Client signalled the end of its audio stream.
    EndOfAudio,
    Control(ControlMessage),
    /// Identity-bearing JSON arriving after admission. Never merged.
    LateHandshake,
    /// Anything else. Logged and dropped.
    Unrecognized(String),
}

/// Recognized control message in a JSON object, if any.
pub fn control_message(object: &Map<String, Value>) -> Option<ControlMessage> {
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .and_then(ControlKind::parse)?;

    Some(ControlMessage {
        kind,
        body: object.clone(),
    })
}

pub fn classify_binary(data: Bytes) -> RoutedFrame {
    if &data[..] == END_OF_AUDIO {
        RoutedFrame::EndOfAudio
    } else {
        RoutedFrame::Audio(data)
    }
}

pub fn classify_text(text: &str) -> RoutedFrame {
    let object = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => object,
        Ok(_) => return RoutedFrame::Unrecognized("JSON frame is not an object".to_string()),
        Err(err) => return RoutedFrame::Unrecognized(format!("invalid JSON: {}", err)),
    };

    if let Some(message) = control_message(&object) {
        return RoutedFrame::Control(message);
    }

    if let Some(kind) = object.get("type").and_then(Value::as_str) {
        return RoutedFrame::Unrecognized(format!("unknown control type '{}'", kind));
    }

    if object.keys().any(|key| is_identity_key(key)) {
        RoutedFrame::LateHandshake
    } else {
        RoutedFrame::Unrecognized("JSON object without a type discriminator".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_is_audio() {
        let frame = classify_binary(Bytes::from_static(&[0, 0, 128, 63]));
        assert_eq!(frame, RoutedFrame::Audio(Bytes::from_static(&[0, 0, 128, 63])));
    }

    #[test]
    fn test_end_of_audio_sentinel() {
        assert_eq!(
            classify_binary(Bytes::from_static(b"END_OF_AUDIO")),
            RoutedFrame::EndOfAudio
        );
    }

    #[test]
    fn test_control_kinds() {
        for (raw, kind) in [
            (r#"{"type":"speaker_activity","speaker":"A"}"#, ControlKind::SpeakerActivity),
            (r#"{"type":"session_control","event":"PAUSE"}"#, ControlKind::SessionControl),
            (r#"{"type":"audio_chunk_metadata","sequence":3}"#, ControlKind::AudioChunkMetadata),
        ] {
            match classify_text(raw) {
                RoutedFrame::Control(message) => assert_eq!(message.kind, kind),
                other => panic!("expected control message for {}, got {:?}", raw, other),
            }
        }
    }

    #[test]
    fn test_termination_events() {
        let top_level = classify_text(r#"{"type":"session_control","event":"END_SESSION"}"#);
        let nested = classify_text(r#"{"type":"session_control","payload":{"event":"LEAVING_MEETING"}}"#);
        let other = classify_text(r#"{"type":"session_control","event":"MUTED"}"#);

        for (frame, expected) in [(top_level, true), (nested, true), (other, false)] {
            match frame {
                RoutedFrame::Control(message) => assert_eq!(message.is_termination(), expected),
                other => panic!("expected control message, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_handshake_shaped_message_is_late_handshake() {
        assert_eq!(
            classify_text(r#"{"uid":"other","platform":"zoom"}"#),
            RoutedFrame::LateHandshake
        );
        assert_eq!(
            classify_text(r#"{"meetingUrl":"https://x"}"#),
            RoutedFrame::LateHandshake
        );
    }

    #[test]
    fn test_unrecognized_frames_are_not_fatal_variants() {
        assert!(matches!(
            classify_text(r#"{"type":"telemetry"}"#),
            RoutedFrame::Unrecognized(_)
        ));
        assert!(matches!(classify_text("not json"), RoutedFrame::Unrecognized(_)));
        assert!(matches!(classify_text("[1,2,3]"), RoutedFrame::Unrecognized(_)));
        assert!(matches!(classify_text(r#"{"hello":1}"#), RoutedFrame::Unrecognized(_)));
    }
}
