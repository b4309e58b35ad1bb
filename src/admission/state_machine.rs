//! # Session Admission State Machine
//!
//! Tracks one connection from transport establishment to teardown and decides
//! which frames are legal in which phase.
//!
//! ## Phases:
//! 1. **Connecting**: nothing has happened yet
//! 2. **AwaitingHandshake**: transport is open, waiting for the first frame
//! 3. **Active**: handshake validated, frames are routed to the pipeline
//! 4. **Closing**: terminal, either requested or caused by an error
//! 5. **Closed**: resources released
//!
//! There is no way back from `Active` to `AwaitingHandshake`: a session's
//! identity is fixed when it is admitted. Once `Closing` is entered every
//! further frame is ignored.
//!
//! This type does no I/O. The WebSocket actor feeds it events and acts on the
//! returned [`Step`].

use crate::admission::error::{AdmissionError, CloseCause};
use crate::admission::normalize::{key_list, normalize};
use crate::admission::registry::{SessionLease, SessionRegistry};
use crate::admission::router::{classify_binary, classify_text, control_message, RoutedFrame};
use crate::admission::validate::{validate, SessionDescriptor};
use actix_web::web::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    AwaitingHandshake,
    Active,
    Closing,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Connecting => "connecting",
            Phase::AwaitingHandshake => "awaiting_handshake",
            Phase::Active => "active",
            Phase::Closing => "closing",
            Phase::Closed => "closed",
        }
    }

    fn is_pre_handshake(&self) -> bool {
        matches!(self, Phase::Connecting | Phase::AwaitingHandshake)
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closing | Phase::Closed)
    }
}

/// What the connection should do after an event.
#[derive(Debug, Clone)]
pub enum Step {
    /// Handshake accepted; the session is now active.
    Admitted(SessionDescriptor),
    /// Hand this frame to the pipeline or control handlers.
    Dispatch(RoutedFrame),
    /// A recoverable protocol violation. Log it, keep going.
    Recovered(AdmissionError),
    /// Nothing to do.
    Ignored,
    /// Close the connection for this reason.
    Close(CloseCause),
}

/// Per-connection admission state. Owned by exactly one connection.
#[derive(Debug)]
pub struct ConnectionState {
    phase: Phase,
    descriptor: Option<SessionDescriptor>,
    created_at: DateTime<Utc>,
    close_cause: Option<CloseCause>,
    lease: Option<SessionLease>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Connecting,
            descriptor: None,
            created_at: Utc::now(),
            close_cause: None,
            lease: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn descriptor(&self) -> Option<&SessionDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn close_cause(&self) -> Option<&CloseCause> {
        self.close_cause.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.phase == Phase::Active
    }

    /// Transport is up: `Connecting → AwaitingHandshake`.
    pub fn on_open(&mut self) {
        if self.phase == Phase::Connecting {
            self.phase = Phase::AwaitingHandshake;
        }
    }

    /// A text frame arrived.
    pub fn on_text(&mut self, text: &str, registry: &Arc<SessionRegistry>) -> Step {
        match self.phase {
            Phase::Connecting | Phase::AwaitingHandshake => self.admit(text, registry),
            Phase::Active => self.route(classify_text(text)),
            Phase::Closing | Phase::Closed => Step::Ignored,
        }
    }

    /// A binary frame arrived.
    pub fn on_binary(&mut self, data: Bytes) -> Step {
        match self.phase {
            Phase::Connecting | Phase::AwaitingHandshake => {
                self.reject(AdmissionError::PrematureStreaming { frame: "binary" }, None)
            }
            Phase::Active => self.route(classify_binary(data)),
            Phase::Closing | Phase::Closed => Step::Ignored,
        }
    }

    /// The handshake timer fired. Only meaningful before admission.
    pub fn on_handshake_timeout(&mut self, waited_ms: u64) -> Step {
        if self.phase.is_pre_handshake() {
            self.reject(AdmissionError::HandshakeTimeout { waited_ms }, None)
        } else {
            Step::Ignored
        }
    }

    /// The transport closed underneath us.
    pub fn on_transport_closed(&mut self) -> Step {
        if self.phase.is_terminal() {
            return Step::Ignored;
        }
        self.begin_closing(CloseCause::TransportClosed)
    }

    /// The pipeline reported an unrecoverable error.
    pub fn on_pipeline_failure(&mut self, detail: String) -> Step {
        if self.phase != Phase::Active {
            return Step::Ignored;
        }
        self.begin_closing(CloseCause::PipelineFailure(detail))
    }

    pub fn on_heartbeat_timeout(&mut self) -> Step {
        if self.phase.is_terminal() {
            return Step::Ignored;
        }
        self.begin_closing(CloseCause::HeartbeatTimeout)
    }

    /// `Closing → Closed`. Releases the registry lease.
    pub fn finish(&mut self) {
        if self.phase != Phase::Closing {
            // Transport vanished without a closing event, record it anyway.
            self.close_cause.get_or_insert(CloseCause::TransportClosed);
        }
        self.phase = Phase::Closed;
        self.lease.take();
    }

    fn admit(&mut self, text: &str, registry: &Arc<SessionRegistry>) -> Step {
        let raw = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(object)) => object,
            Ok(other) => {
                let detail = format!("expected a JSON object, got {}", json_kind(&other));
                return self.reject(AdmissionError::MalformedPayload { detail }, None);
            }
            Err(err) => {
                let detail = err.to_string();
                return self.reject(AdmissionError::MalformedPayload { detail }, None);
            }
        };

        let raw_keys = key_list(&raw);

        if control_message(&raw).is_some() {
            return self.reject(
                AdmissionError::PrematureStreaming { frame: "control" },
                Some((raw_keys, Vec::new())),
            );
        }

        let normalized = normalize(raw);
        let normalized_keys = key_list(&normalized);

        let descriptor = match validate(&normalized) {
            Ok(descriptor) => descriptor,
            Err(rejection) => {
                return self.reject(rejection.into(), Some((raw_keys, normalized_keys)));
            }
        };

        let lease = match registry.claim(descriptor) {
            Ok(lease) => lease,
            Err(err) => return self.reject(err, Some((raw_keys, normalized_keys))),
        };

        let descriptor = lease.descriptor().clone();
        info!(
            uid = %descriptor.uid(),
            platform = %descriptor.platform(),
            meeting_id = %descriptor.meeting_id(),
            placeholder_token = descriptor.has_placeholder_token(),
            active_sessions = registry.active_count(),
            raw_keys = ?raw_keys,
            "Handshake accepted, session active"
        );

        self.phase = Phase::Active;
        self.descriptor = Some(descriptor.clone());
        self.lease = Some(lease);
        Step::Admitted(descriptor)
    }

    fn route(&mut self, frame: RoutedFrame) -> Step {
        let uid = self.descriptor.as_ref().map(|d| d.uid().to_string()).unwrap_or_default();

        match frame {
            RoutedFrame::EndOfAudio => {
                info!(uid = %uid, "Client signalled end of audio");
                self.begin_closing(CloseCause::ClientEnded)
            }
            RoutedFrame::Control(message) if message.is_termination() => {
                info!(uid = %uid, event = ?message.event(), "Client ended the session");
                self.begin_closing(CloseCause::ClientEnded)
            }
            RoutedFrame::LateHandshake => {
                warn!(uid = %uid, "Ignoring handshake received on an active session");
                Step::Recovered(AdmissionError::LateHandshake)
            }
            RoutedFrame::Unrecognized(why) => {
                debug!(uid = %uid, reason = %why, "Dropping unrecognized frame");
                Step::Ignored
            }
            frame => Step::Dispatch(frame),
        }
    }

    fn reject(&mut self, err: AdmissionError, keys: Option<(Vec<String>, Vec<String>)>) -> Step {
        let (raw_keys, normalized_keys) = keys.unwrap_or_default();
        warn!(
            reason = err.reason_code(),
            missing = ?err.missing_fields(),
            raw_keys = ?raw_keys,
            normalized_keys = ?normalized_keys,
            phase = self.phase.as_str(),
            "Handshake rejected: {}",
            err
        );
        self.begin_closing(CloseCause::Rejected(err))
    }

    fn begin_closing(&mut self, cause: CloseCause) -> Step {
        self.phase = Phase::Closing;
        self.close_cause = Some(cause.clone());
        Step::Close(cause)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
