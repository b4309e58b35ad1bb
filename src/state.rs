//! # Application State Management
//!
//! Shared state that every HTTP handler and every WebSocket actor can reach.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership (many handlers and connections hold a reference)
//! - **RwLock**: Multiple readers OR one writer
//! - **parking_lot**: Its locks cannot be poisoned, so `.read()` / `.write()`
//!   return the guard directly; no `.unwrap()` needed
//!
//! ### Trait objects for collaborators
//! The pipeline and the discovery registrar sit behind `Arc<dyn Trait>` so
//! tests can swap in in-memory versions without touching the actor code.

use crate::admission::{AdmissionError, SessionDescriptor, SessionRegistry};
use crate::config::AppConfig;
use crate::discovery::Discovery;
use crate::pipeline::TranscriptionPipeline;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The main application state shared across handlers and connections.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (the admission section can change at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Admission counters, updated by every connection
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Active session uids and the concurrent session limit
    pub registry: Arc<SessionRegistry>,

    /// Where admitted audio goes
    pub pipeline: Arc<dyn TranscriptionPipeline>,

    /// Present only when discovery publication is enabled
    pub discovery: Option<Discovery>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all connections.
///
/// ## Why these metrics matter:
/// - **rejections**: Which clients are sending broken handshakes, by reason code
/// - **synthesized_uids / placeholder_tokens**: How many clients rely on the
///   lenient defaults (these should trend to zero in production)
/// - **active_sessions**: Current load against `max_concurrent_sessions`
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// HTTP requests processed since server start
    pub request_count: u64,

    /// HTTP requests that ended in an error status
    pub error_count: u64,

    /// WebSocket connections opened
    pub connections_opened: u64,

    /// Handshakes that produced an active session
    pub handshakes_accepted: u64,

    /// Fatal admission rejections, keyed by reason code
    pub rejections: HashMap<String, u64>,

    /// Sessions whose uid was generated by the server
    pub synthesized_uids: u64,

    /// Sessions admitted with the NO_TOKEN fallback
    pub placeholder_tokens: u64,

    /// Handshake frames received on already active sessions
    pub late_handshakes: u64,

    /// Failed discovery register/deregister calls
    pub registrar_failures: u64,

    /// Audio frames accepted by the pipeline
    pub audio_frames: u64,

    /// Bytes of audio accepted by the pipeline
    pub audio_bytes: u64,

    /// Control messages forwarded to the pipeline
    pub control_messages: u64,

    /// Frames the pipeline refused as malformed
    pub dropped_frames: u64,

    /// Currently active sessions
    pub active_sessions: u32,
}

impl AppMetrics {
    pub fn total_rejections(&self) -> u64 {
        self.rejections.values().sum()
    }

    /// Fatal errors are rejections, keyed by reason code; recoverable ones
    /// have their own counters.
    pub fn record_admission_error(&mut self, err: &AdmissionError) {
        if err.is_fatal() {
            *self
                .rejections
                .entry(err.reason_code().to_string())
                .or_insert(0) += 1;
            return;
        }

        match err {
            AdmissionError::LateHandshake => self.late_handshakes += 1,
            AdmissionError::RegistrarFailure { .. } => self.registrar_failures += 1,
            _ => {}
        }
    }
}

impl AppState {
    /// Create a new AppState.
    ///
    /// The registry limit is taken from `config.admission.max_concurrent_sessions`.
    pub fn new(
        config: AppConfig,
        pipeline: Arc<dyn TranscriptionPipeline>,
        discovery: Option<Discovery>,
        metrics: Arc<RwLock<AppMetrics>>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.admission.max_concurrent_sessions));
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics,
            registry,
            pipeline,
            discovery,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Update the configuration with validation.
    ///
    /// The registry limit follows `max_concurrent_sessions`; every other
    /// admission setting is read by connections when they open.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                self.registry
                    .set_max_sessions(new_config.admission.max_concurrent_sessions);
                *self.config.write() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Count one HTTP request (called by the logging middleware).
    pub fn record_request(&self, is_error: bool) {
        let mut metrics = self.metrics.write();
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }
    }

    pub fn record_connection_opened(&self) {
        self.metrics.write().connections_opened += 1;
    }

    /// Count a successful admission, including which lenient defaults it used.
    pub fn record_admission(&self, descriptor: &SessionDescriptor, uid_synthesized: bool) {
        let mut metrics = self.metrics.write();
        metrics.handshakes_accepted += 1;
        metrics.active_sessions += 1;
        if uid_synthesized {
            metrics.synthesized_uids += 1;
        }
        if descriptor.has_placeholder_token() {
            metrics.placeholder_tokens += 1;
        }
    }

    /// Count an admission error. Fatal errors go into `rejections`.
    pub fn record_admission_error(&self, err: &AdmissionError) {
        self.metrics.write().record_admission_error(err);
    }

    pub fn record_audio_frame(&self, len: usize) {
        let mut metrics = self.metrics.write();
        metrics.audio_frames += 1;
        metrics.audio_bytes += len as u64;
    }

    pub fn record_dropped_frame(&self) {
        self.metrics.write().dropped_frames += 1;
    }

    pub fn record_control_message(&self) {
        self.metrics.write().control_messages += 1;
    }

    /// Called when an admitted session ends.
    ///
    /// Includes a check to prevent underflow if a session is somehow ended twice.
    pub fn record_session_ended(&self) {
        let mut metrics = self.metrics.write();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Get a snapshot of current metrics (used by the health and metrics endpoints).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
