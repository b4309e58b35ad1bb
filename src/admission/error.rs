//! # Admission Errors
//!
//! Error taxonomy for the handshake phase of a connection. Every variant maps to
//! a machine-readable reason code (sent to the client and written to logs) and,
//! for fatal variants, to the WebSocket close code used to terminate the
//! connection.
//!
//! ## Fatal vs. recoverable:
//! - **Fatal**: the connection moves to `Closing` and the client must reconnect
//! - **Recoverable**: logged and counted, the connection stays where it is

use actix_web_actors::ws::CloseCode;
use thiserror::Error;

/// Rejection produced by the handshake validator.
///
/// `missing` always lists every required field that was absent, in canonical
/// order, so one round trip tells the client everything it got wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRejection {
    pub missing: Vec<&'static str>,
}

impl HandshakeRejection {
    pub const REASON: &'static str = "missing_required_fields";

    pub fn reason(&self) -> &'static str {
        Self::REASON
    }
}

impl std::fmt::Display for HandshakeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "missing required fields: {}", self.missing.join(", "))
    }
}

/// Everything that can go wrong while a connection is being admitted.
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    /// First frame was not a JSON object.
    #[error("handshake is not a valid JSON object: {detail}")]
    MalformedPayload { detail: String },

    /// One or more of `platform`, `meeting_url`, `meeting_id` were absent.
    #[error("{0}")]
    MissingRequiredFields(HandshakeRejection),

    /// Audio or control data arrived before a valid handshake.
    #[error("{frame} frame received before handshake")]
    PrematureStreaming { frame: &'static str },

    /// No valid handshake arrived inside the timeout window.
    #[error("no handshake received within {waited_ms}ms")]
    HandshakeTimeout { waited_ms: u64 },

    /// The session registry is at its concurrent session limit.
    #[error("server is at its limit of {limit} concurrent sessions")]
    CapacityExceeded { limit: usize },

    /// A second handshake arrived while the session was already active.
    #[error("handshake received on an already active session")]
    LateHandshake,

    /// Discovery publication failed.
    #[error("discovery registration failed: {detail}")]
    RegistrarFailure { detail: String },
}

impl AdmissionError {
    /// Stable identifier for this error, used as the close reason text and
    /// as the `code` field of the error message sent to the client.
    pub fn reason_code(&self) -> &'static str {
        match self {
            AdmissionError::MalformedPayload { .. } => "malformed_payload",
            AdmissionError::MissingRequiredFields(rejection) => rejection.reason(),
            AdmissionError::PrematureStreaming { .. } => "premature_streaming",
            AdmissionError::HandshakeTimeout { .. } => "handshake_timeout",
            AdmissionError::CapacityExceeded { .. } => "capacity_exceeded",
            AdmissionError::LateHandshake => "late_handshake",
            AdmissionError::RegistrarFailure { .. } => "registrar_failure",
        }
    }

    /// Whether this error terminates the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AdmissionError::LateHandshake | AdmissionError::RegistrarFailure { .. }
        )
    }

    /// WebSocket close code for fatal errors.
    pub fn close_code(&self) -> CloseCode {
        match self {
            AdmissionError::MalformedPayload { .. } => CloseCode::Invalid,
            AdmissionError::MissingRequiredFields(_) => CloseCode::Policy,
            AdmissionError::PrematureStreaming { .. } => CloseCode::Protocol,
            AdmissionError::HandshakeTimeout { .. } => CloseCode::Policy,
            AdmissionError::CapacityExceeded { .. } => CloseCode::Again,
            AdmissionError::LateHandshake | AdmissionError::RegistrarFailure { .. } => {
                CloseCode::Normal
            }
        }
    }

    /// Missing field list, if this is a validation rejection.
    pub fn missing_fields(&self) -> Option<&[&'static str]> {
        match self {
            AdmissionError::MissingRequiredFields(rejection) => Some(&rejection.missing),
            _ => None,
        }
    }
}

impl From<HandshakeRejection> for AdmissionError {
    fn from(rejection: HandshakeRejection) -> Self {
        AdmissionError::MissingRequiredFields(rejection)
    }
}

/// Why a connection entered the `Closing` phase.
#[derive(Debug, Clone)]
pub enum CloseCause {
    /// Admission failed with a fatal error.
    Rejected(AdmissionError),
    /// The client asked to end the session.
    ClientEnded,
    /// The transport went away underneath us.
    TransportClosed,
    /// The transcription pipeline hit an unrecoverable error.
    PipelineFailure(String),
    /// The client stopped answering heartbeats.
    HeartbeatTimeout,
}

impl CloseCause {
    pub fn reason_code(&self) -> &'static str {
        match self {
            CloseCause::Rejected(err) => err.reason_code(),
            CloseCause::ClientEnded => "client_ended",
            CloseCause::TransportClosed => "transport_closed",
            CloseCause::PipelineFailure(_) => "pipeline_failure",
            CloseCause::HeartbeatTimeout => "heartbeat_timeout",
        }
    }

    pub fn close_code(&self) -> CloseCode {
        match self {
            CloseCause::Rejected(err) => err.close_code(),
            CloseCause::ClientEnded | CloseCause::TransportClosed => CloseCode::Normal,
            CloseCause::PipelineFailure(_) => CloseCode::Error,
            CloseCause::HeartbeatTimeout => CloseCode::Away,
        }
    }

    /// True for closures the client did not ask for.
    pub fn is_error(&self) -> bool {
        !matches!(self, CloseCause::ClientEnded | CloseCause::TransportClosed)
    }
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseCause::Rejected(err) => write!(f, "{}", err),
            CloseCause::ClientEnded => write!(f, "client ended the session"),
            CloseCause::TransportClosed => write!(f, "transport closed"),
            CloseCause::PipelineFailure(detail) => write!(f, "pipeline failure: {}", detail),
            CloseCause::HeartbeatTimeout => write!(f, "client heartbeat timed out"),
        }
    }
}
