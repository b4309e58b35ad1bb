//! # Service Discovery Publication
//!
//! When a session becomes active the gateway can publish "uid X is served at
//! address Y" to a key/value store so routers elsewhere can find it. The
//! registrar backend is an external collaborator; this module owns only the
//! client side.
//!
//! ## Guarantees:
//! - **Fire-and-forget**: admission never waits for, or fails because of, a
//!   registrar call
//! - **Serialized**: at most one registrar call is in flight per process
//! - **Observable**: failures are logged and counted in the metrics

use crate::admission::AdmissionError;
use crate::config::DiscoveryConfig;
use crate::state::AppMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("registrar request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("registrar answered {status} for {key}")]
    Status { status: u16, key: String },

    #[error("invalid registrar url: {0}")]
    InvalidUrl(String),

    #[error("uid {0:?} cannot be used as a registrar key")]
    InvalidKey(String),
}

/// What gets published for an active session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub uid: String,
    pub address: String,
    pub platform: String,
    pub meeting_id: String,
    pub registered_at: DateTime<Utc>,
}

/// Backend that stores discovery records.
#[async_trait]
pub trait DiscoveryRegistrar: Send + Sync {
    async fn register(&self, record: &DiscoveryRecord) -> Result<(), RegistrarError>;

    async fn deregister(&self, uid: &str) -> Result<(), RegistrarError>;
}

/// Registrar for a Consul-style HTTP key/value API:
/// `PUT {base}/v1/kv/{prefix}/{uid}` to publish, `DELETE` to withdraw.
///
/// The uid is always a single percent-encoded path segment, so a client-chosen
/// uid cannot reach other keys or add query parameters.
pub struct KvRegistrar {
    client: reqwest::Client,
    base_url: Url,
    key_prefix: Vec<String>,
}

impl KvRegistrar {
    pub fn new(config: &DiscoveryConfig) -> Result<Self, RegistrarError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        let base_url = Url::parse(config.kv_url.trim())
            .map_err(|e| RegistrarError::InvalidUrl(format!("{}: {}", config.kv_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(RegistrarError::InvalidUrl(config.kv_url.clone()));
        }

        let key_prefix = config
            .key_prefix
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| checked_segment(segment).map(str::to_string))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            client,
            base_url,
            key_prefix,
        })
    }

    pub fn key_url(&self, uid: &str) -> Result<Url, RegistrarError> {
        let uid = checked_segment(uid)?;
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| RegistrarError::InvalidUrl(self.base_url.to_string()))?;
            segments
                .pop_if_empty()
                .extend(["v1", "kv"])
                .extend(&self.key_prefix)
                .push(uid);
        }
        Ok(url)
    }
}

/// `.` and `..` would be dropped or resolved by URL path handling.
fn checked_segment(segment: &str) -> Result<&str, RegistrarError> {
    match segment {
        "" | "." | ".." => Err(RegistrarError::InvalidKey(segment.to_string())),
        _ => Ok(segment),
    }
}

#[async_trait]
impl DiscoveryRegistrar for KvRegistrar {
    async fn register(&self, record: &DiscoveryRecord) -> Result<(), RegistrarError> {
        let url = self.key_url(&record.uid)?;
        let response = self.client.put(url.clone()).json(record).send().await?;
        if !response.status().is_success() {
            return Err(RegistrarError::Status {
                status: response.status().as_u16(),
                key: url.to_string(),
            });
        }
        Ok(())
    }

    async fn deregister(&self, uid: &str) -> Result<(), RegistrarError> {
        let url = self.key_url(uid)?;
        let response = self.client.delete(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(RegistrarError::Status {
                status: response.status().as_u16(),
                key: url.to_string(),
            });
        }
        Ok(())
    }
}

/// Process-wide handle used by connections to publish and withdraw records.
#[derive(Clone)]
pub struct Discovery {
    registrar: Arc<dyn DiscoveryRegistrar>,
    address: String,
    lock: Arc<Mutex<()>>,
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Discovery {
    pub fn new(
        registrar: Arc<dyn DiscoveryRegistrar>,
        address: String,
        metrics: Arc<RwLock<AppMetrics>>,
    ) -> Self {
        Self {
            registrar,
            address,
            lock: Arc::new(Mutex::new(())),
            metrics,
        }
    }

    /// Address published for every session on this instance.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn record_for(&self, uid: &str, platform: &str, meeting_id: &str) -> DiscoveryRecord {
        DiscoveryRecord {
            uid: uid.to_string(),
            address: self.address.clone(),
            platform: platform.to_string(),
            meeting_id: meeting_id.to_string(),
            registered_at: Utc::now(),
        }
    }

    /// Publish in the background. Connections keep the handle and pass it to
    /// [`Discovery::withdraw`].
    pub fn publish(&self, record: DiscoveryRecord) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let _serialized = this.lock.lock().await;
            match this.registrar.register(&record).await {
                Ok(()) => debug!(uid = %record.uid, address = %record.address, "Published to discovery"),
                Err(err) => this.record_failure("register", &record.uid, &err),
            }
        })
    }

    /// Withdraw in the background. When `after` is the session's publish
    /// task, the deregistration is only sent once that task has finished.
    pub fn withdraw(&self, uid: String, after: Option<JoinHandle<()>>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if let Some(publish) = after {
                if let Err(err) = publish.await {
                    debug!(uid = %uid, error = %err, "Publish task did not complete");
                }
            }
            let _serialized = this.lock.lock().await;
            match this.registrar.deregister(&uid).await {
                Ok(()) => debug!(uid = %uid, "Withdrawn from discovery"),
                Err(err) => this.record_failure("deregister", &uid, &err),
            }
        })
    }

    fn record_failure(&self, operation: &str, uid: &str, err: &RegistrarError) {
        warn!(
            uid = %uid,
            operation = operation,
            reason = "registrar_failure",
            "Discovery {} failed: {}",
            operation,
            err
        );
        self.metrics
            .write()
            .record_admission_error(&AdmissionError::RegistrarFailure {
                detail: err.to_string(),
            });
    }
}

/// Resolve the address to publish: the configured advertise address, or the
/// bind address as a fallback.
pub fn resolve_address(config: &DiscoveryConfig, host: &str, port: u16) -> String {
    let advertised = config.advertise_address.trim();
    if advertised.is_empty() {
        format!("{}:{}", host, port)
    } else {
        advertised.to_string()
    }
}
