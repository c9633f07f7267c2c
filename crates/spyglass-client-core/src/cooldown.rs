use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::store::CredentialStore;

/// Outcome of consulting the cooldown gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    Ready,
    Blocked { remaining: Duration },
}

impl CooldownDecision {
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Advisory client-side throttle on triggering an expensive job class.
///
/// The authoritative limit lives server-side; this gate only avoids wasted
/// round-trips. Any store failure, missing marker, or clock skew resolves
/// to `Ready` so a legitimate first use is never blocked.
pub struct CooldownGate {
    store: Arc<dyn CredentialStore>,
    marker_key: String,
    window: Duration,
}

impl CooldownGate {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, job_class: &str, window: Duration) -> Self {
        Self {
            store,
            marker_key: format!("cooldown:{}", job_class.trim()),
            window,
        }
    }

    #[must_use]
    pub fn check(&self) -> CooldownDecision {
        self.check_at(Utc::now())
    }

    #[must_use]
    pub fn check_at(&self, now: DateTime<Utc>) -> CooldownDecision {
        let last = match self.store.read_marker(&self.marker_key) {
            Ok(last) => last,
            Err(error) => {
                warn!(marker = %self.marker_key, %error, "cooldown marker read failed; allowing");
                return CooldownDecision::Ready;
            }
        };
        let Some(last) = last else {
            return CooldownDecision::Ready;
        };

        let elapsed = now.signed_duration_since(last);
        let Ok(elapsed) = elapsed.to_std() else {
            // Negative elapsed means the clock moved backwards; advisory
            // gates do not block on skew.
            return CooldownDecision::Ready;
        };
        if elapsed < self.window {
            CooldownDecision::Blocked {
                remaining: self.window - elapsed,
            }
        } else {
            CooldownDecision::Ready
        }
    }

    /// Check the gate and, when ready, stamp the marker optimistically
    /// before the trigger request goes out.
    pub fn acquire(&self) -> CooldownDecision {
        self.acquire_at(Utc::now())
    }

    pub fn acquire_at(&self, now: DateTime<Utc>) -> CooldownDecision {
        let decision = self.check_at(now);
        if decision.is_ready()
            && let Err(error) = self.store.write_marker(&self.marker_key, now)
        {
            warn!(marker = %self.marker_key, %error, "cooldown marker write failed; allowing");
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryCredentialStore, StoreError};
    use chrono::TimeDelta;

    fn gate_with_store(store: Arc<dyn CredentialStore>) -> CooldownGate {
        CooldownGate::new(store, "deep_analysis", Duration::from_secs(60))
    }

    #[test]
    fn first_use_is_always_ready() {
        let gate = gate_with_store(Arc::new(MemoryCredentialStore::new()));
        assert_eq!(gate.check_at(Utc::now()), CooldownDecision::Ready);
    }

    #[test]
    fn second_trigger_inside_window_is_blocked() {
        let gate = gate_with_store(Arc::new(MemoryCredentialStore::new()));
        let start = Utc::now();
        assert!(gate.acquire_at(start).is_ready());

        let retry = start + TimeDelta::seconds(10);
        let decision = gate.acquire_at(retry);
        assert_eq!(
            decision,
            CooldownDecision::Blocked {
                remaining: Duration::from_secs(50)
            }
        );
    }

    #[test]
    fn trigger_past_window_is_allowed_again() {
        let gate = gate_with_store(Arc::new(MemoryCredentialStore::new()));
        let start = Utc::now();
        assert!(gate.acquire_at(start).is_ready());

        let later = start + TimeDelta::seconds(61);
        assert!(gate.acquire_at(later).is_ready());
    }

    #[test]
    fn clock_skew_never_blocks() {
        let store = Arc::new(MemoryCredentialStore::new());
        let gate = gate_with_store(store.clone());
        let start = Utc::now();
        assert!(gate.acquire_at(start).is_ready());

        // The persisted marker is now in this observer's future.
        let skewed = start - TimeDelta::seconds(30);
        assert_eq!(gate.check_at(skewed), CooldownDecision::Ready);
    }

    struct FailingStore;

    impl CredentialStore for FailingStore {
        fn load_session(&self) -> Result<Option<crate::auth::SessionState>, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn persist_session(&self, _state: &crate::auth::SessionState) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
        fn clear_session(&self) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
        fn read_marker(&self, _key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn write_marker(&self, _key: &str, _at: DateTime<Utc>) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
        fn clear_marker(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    #[test]
    fn store_failure_resolves_to_ready() {
        let gate = gate_with_store(Arc::new(FailingStore));
        assert!(gate.acquire_at(Utc::now()).is_ready());
    }
}
