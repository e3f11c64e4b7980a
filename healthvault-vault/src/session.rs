//! Process-scoped holder of the unlocked master key.
//!
//! One `SessionKeyCache` is created at startup and cloned into every
//! component that needs the master key. Only the unlock/lock flow writes to
//! it. Readers get an `Arc` snapshot, so a concurrent `clear()` never pulls
//! the key out from under an in-flight operation; the snapshot is dropped
//! (and zeroized) when the last reader finishes.

use healthvault_crypto::MasterKey;
use healthvault_types::UserId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Session lifetime settings.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// The key is dropped once this long passes without a `get()`.
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

struct Session {
    user_id: UserId,
    key: Arc<MasterKey>,
    started: Instant,
    /// Milliseconds after `started` of the most recent access.
    last_access_ms: AtomicU64,
}

impl Session {
    fn idle_for(&self, now: Instant) -> Duration {
        let last = self.started + Duration::from_millis(self.last_access_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }

    fn touch(&self, now: Instant) {
        let ms = now.saturating_duration_since(self.started).as_millis() as u64;
        self.last_access_ms.fetch_max(ms, Ordering::Relaxed);
    }
}

/// Unlocked master key for the current session.
#[derive(Clone)]
pub struct SessionKeyCache {
    inner: Arc<RwLock<Option<Arc<Session>>>>,
    config: SessionConfig,
}

impl SessionKeyCache {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            config,
        }
    }

    /// Installs the master key for `user_id`, replacing any previous session.
    pub fn initialize(&self, user_id: UserId, key: MasterKey) {
        let session = Arc::new(Session {
            user_id: user_id.clone(),
            key: Arc::new(key),
            started: Instant::now(),
            last_access_ms: AtomicU64::new(0),
        });
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(session);
        info!(user = %user_id, "session unlocked");
    }

    /// Returns the master key, or `None` if locked or idle-expired.
    ///
    /// `None` means the caller must prompt for re-authentication.
    pub fn get(&self) -> Option<Arc<MasterKey>> {
        let session = self.snapshot()?;
        self.live_key(&session)
    }

    /// Like [`get`](Self::get), but only if the session belongs to `user_id`.
    pub fn get_for(&self, user_id: &UserId) -> Option<Arc<MasterKey>> {
        let session = self.snapshot()?;
        if &session.user_id != user_id {
            return None;
        }
        self.live_key(&session)
    }

    /// User id of the active session, if any.
    pub fn user_id(&self) -> Option<UserId> {
        self.snapshot().map(|s| s.user_id.clone())
    }

    pub fn is_unlocked(&self) -> bool {
        self.get().is_some()
    }

    /// Drops the key. Calling it on a locked cache is a no-op.
    pub fn clear(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = guard.take() {
            info!(user = %session.user_id, "session locked");
        }
    }

    fn snapshot(&self) -> Option<Arc<Session>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Idle check and touch on one snapshot. The key returned always
    /// belongs to `session`, even if another session was installed since.
    fn live_key(&self, session: &Arc<Session>) -> Option<Arc<MasterKey>> {
        let now = Instant::now();
        if session.idle_for(now) >= self.config.idle_timeout {
            self.expire(session);
            return None;
        }
        session.touch(now);
        Some(Arc::clone(&session.key))
    }

    fn expire(&self, stale: &Arc<Session>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        // A newer session may have been installed since the snapshot.
        if guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, stale)) {
            *guard = None;
            debug!(user = %stale.user_id, "session expired after idle timeout");
        }
    }
}

impl Default for SessionKeyCache {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
