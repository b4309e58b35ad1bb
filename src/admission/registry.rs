//! # Active Session Registry
//!
//! Process-wide record of which session uids are currently active. It exists
//! for two reasons: to keep `uid` unique among live sessions (best effort), and
//! to enforce the concurrent session limit.
//!
//! ## Ownership:
//! - One `Arc<SessionRegistry>` lives in `AppState` for the whole process
//! - Each admitted connection holds a [`SessionLease`]
//! - Dropping the lease removes the uid, so cleanup can't be forgotten
//!
//! ## Collision policy:
//! When a uid is already active the newcomer does NOT overwrite the existing
//! entry. It is given a freshly synthesized `anon-xxxxxxxx` id instead, drawn
//! until it is unused. The set is bounded by the session limit and the id
//! space is 2^32, so the loop ends.

use crate::admission::error::AdmissionError;
use crate::admission::validate::{synthesize_uid, SessionDescriptor};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the registry knows about one active session.
#[derive(Debug, Clone)]
pub struct RegisteredSession {
    pub platform: String,
    pub meeting_id: String,
    pub admitted_at: DateTime<Utc>,
}

/// Summary used by the health and metrics endpoints.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub sessions_by_platform: HashMap<String, usize>,
    pub distinct_meetings: usize,
    pub oldest_admitted_at: Option<DateTime<Utc>>,
}

/// Mutex-guarded map of active uids.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, RegisteredSession>>,
    max_sessions: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions: AtomicUsize::new(max_sessions),
        }
    }

    /// Register a validated descriptor.
    ///
    /// ## Returns:
    /// - **Ok(lease)**: the session is registered; `lease.descriptor()` is the
    ///   descriptor to use from now on (its uid may differ from the input)
    /// - **Err(CapacityExceeded)**: the concurrent session limit is reached
    pub fn claim(
        self: &Arc<Self>,
        descriptor: SessionDescriptor,
    ) -> Result<SessionLease, AdmissionError> {
        let mut sessions = self.sessions.lock();
        let limit = self.max_sessions();

        if sessions.len() >= limit {
            return Err(AdmissionError::CapacityExceeded { limit });
        }

        let descriptor = if sessions.contains_key(descriptor.uid()) {
            let requested = descriptor.uid().to_string();
            let replacement = unused_uid_with(&sessions, synthesize_uid);
            warn!(
                requested_uid = %requested,
                uid = %replacement,
                "Requested uid is already active, assigned a synthetic uid"
            );
            descriptor.with_uid(replacement)
        } else {
            descriptor
        };

        sessions.insert(
            descriptor.uid().to_string(),
            RegisteredSession {
                platform: descriptor.platform().to_string(),
                meeting_id: descriptor.meeting_id().to_string(),
                admitted_at: Utc::now(),
            },
        );
        debug!(uid = %descriptor.uid(), active = sessions.len(), "Session registered");

        Ok(SessionLease {
            registry: Arc::clone(self),
            descriptor,
        })
    }

    fn release(&self, uid: &str) -> bool {
        let removed = self.sessions.lock().remove(uid).is_some();
        if removed {
            debug!(uid = %uid, "Session released");
        }
        removed
    }

    #[cfg(test)]
    pub fn contains(&self, uid: &str) -> bool {
        self.sessions.lock().contains_key(uid)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::Relaxed)
    }

    /// Change the session limit. Sessions above a lowered limit are kept;
    /// only new admissions see the new value.
    pub fn set_max_sessions(&self, max_sessions: usize) {
        self.max_sessions.store(max_sessions, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let sessions = self.sessions.lock();
        let mut sessions_by_platform = HashMap::new();
        let mut meetings = HashSet::new();
        for session in sessions.values() {
            *sessions_by_platform
                .entry(session.platform.clone())
                .or_insert(0) += 1;
            meetings.insert((session.platform.as_str(), session.meeting_id.as_str()));
        }

        RegistrySnapshot {
            active_sessions: sessions.len(),
            max_sessions: self.max_sessions(),
            sessions_by_platform,
            distinct_meetings: meetings.len(),
            oldest_admitted_at: sessions.values().map(|s| s.admitted_at).min(),
        }
    }
}

/// Draw candidates until one is not an active uid.
fn unused_uid_with(
    sessions: &HashMap<String, RegisteredSession>,
    mut draw: impl FnMut() -> String,
) -> String {
    loop {
        let candidate = draw();
        if !sessions.contains_key(&candidate) {
            return candidate;
        }
        debug!(uid = %candidate, "Synthetic uid already active, drawing again");
    }
}

/// Proof that a session is registered. Releases its uid on drop.
pub struct SessionLease {
    registry: Arc<SessionRegistry>,
    descriptor: SessionDescriptor,
}

impl SessionLease {
    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.release(self.descriptor.uid());
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("uid", &self.descriptor.uid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::validate::descriptor_for_tests;

    #[test]
    fn test_claim_and_release_on_drop() {
        let registry = Arc::new(SessionRegistry::new(4));
        let lease = registry.claim(descriptor_for_tests("s1")).unwrap();
        assert_eq!(lease.descriptor().uid(), "s1");
        assert!(registry.contains("s1"));
        assert_eq!(registry.active_count(), 1);

        drop(lease);
        assert!(!registry.contains("s1"));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_colliding_uid_gets_synthetic_replacement() {
        let registry = Arc::new(SessionRegistry::new(4));
        let first = registry.claim(descriptor_for_tests("s1")).unwrap();
        let second = registry.claim(descriptor_for_tests("s1")).unwrap();

        assert_eq!(first.descriptor().uid(), "s1");
        assert_ne!(second.descriptor().uid(), "s1");
        assert!(second.descriptor().uid().starts_with("anon-"));
        assert_eq!(registry.active_count(), 2);

        // Releasing the newcomer must not evict the original holder.
        drop(second);
        assert!(registry.contains("s1"));
    }

    #[test]
    fn test_capacity_limit() {
        let registry = Arc::new(SessionRegistry::new(1));
        let _held = registry.claim(descriptor_for_tests("s1")).unwrap();
        let err = registry.claim(descriptor_for_tests("s2")).unwrap_err();
        assert_eq!(err.reason_code(), "capacity_exceeded");

        registry.set_max_sessions(2);
        assert!(registry.claim(descriptor_for_tests("s2")).is_ok());
    }

    #[test]
    fn test_snapshot_counts_platforms() {
        let registry = Arc::new(SessionRegistry::new(8));
        let _a = registry.claim(descriptor_for_tests("a")).unwrap();
        let _b = registry.claim(descriptor_for_tests("b")).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.active_sessions, 2);
        assert_eq!(snapshot.max_sessions, 8);
        assert_eq!(snapshot.sessions_by_platform.get("zoom"), Some(&2));
        assert_eq!(snapshot.distinct_meetings, 1);
        assert!(snapshot.oldest_admitted_at.is_some());

        drop((_a, _b));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.distinct_meetings, 0);
        assert_eq!(snapshot.oldest_admitted_at, None);
    }

    #[test]
    fn test_synthetic_uid_skips_every_taken_candidate() {
        let mut sessions = HashMap::new();
        for n in 0..12 {
            sessions.insert(
                format!("anon-{:08x}", n),
                RegisteredSession {
                    platform: "zoom".to_string(),
                    meeting_id: "m1".to_string(),
                    admitted_at: Utc::now(),
                },
            );
        }

        // Twelve draws collide before a free id comes up.
        let mut next = 0u32;
        let uid = unused_uid_with(&sessions, || {
            let candidate = format!("anon-{:08x}", next);
            next += 1;
            candidate
        });

        assert_eq!(uid, "anon-0000000c");
        assert_eq!(next, 13);
    }
}
