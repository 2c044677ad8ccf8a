//! Converts a stream of small progress updates into a sparser stream of
//! Hardcover writes by staging small deltas in a per-book session and
//! flushing immediately on completion or a large jump.

use crate::cache::models::SessionData;
use crate::cache::BookCache;
use crate::clock::Clock;
use crate::error::{Result, ShelfBridgeError};
use crate::progress::AbsProgressInput;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    SyncImmediately,
    DelayUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    DelayedUpdatesDisabled,
    BookCompletion,
    SignificantProgressChange,
    MaxDelayExceeded,
    ActiveSessionDetected,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub action: DecisionAction,
    pub reason: DecisionReason,
    pub session_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionManagerConfig {
    pub enabled: bool,
    pub session_timeout_secs: u64,
    pub max_delay_secs: u64,
    pub immediate_completion: bool,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            session_timeout_secs: 900,
            max_delay_secs: 3600,
            immediate_completion: true,
        }
    }
}

impl SessionManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(60..=7200).contains(&self.session_timeout_secs) {
            return Err(ShelfBridgeError::Config(
                "session_timeout must be in 60..=7200".into(),
            ));
        }
        if !(300..=86400).contains(&self.max_delay_secs) {
            return Err(ShelfBridgeError::Config(
                "max_delay must be in 300..=86400".into(),
            ));
        }
        if self.session_timeout_secs >= self.max_delay_secs {
            return Err(ShelfBridgeError::Config(
                "session_timeout must be less than max_delay".into(),
            ));
        }
        Ok(())
    }
}

const MILESTONES: [f64; 5] = [10.0, 25.0, 50.0, 75.0, 90.0];
const SIGNIFICANT_DELTA: f64 = 5.0;

fn crosses_milestone(prev: f64, curr: f64) -> bool {
    let (lo, hi) = if prev <= curr { (prev, curr) } else { (curr, prev) };
    MILESTONES.iter().any(|&m| lo < m && m <= hi)
}

pub struct SessionManager {
    config: SessionManagerConfig,
    clock: Arc<dyn Clock>,
    expired_callback_errors: AtomicU64,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            expired_callback_errors: AtomicU64::new(0),
        })
    }

    pub fn expired_callback_error_count(&self) -> u64 {
        self.expired_callback_errors.load(Ordering::Relaxed)
    }

    /// Decides whether `current` progress should be pushed now or
    /// staged in a session. Branch order matches the spec exactly.
    pub fn should_delay_update(
        &self,
        last_pushed_progress: Option<f64>,
        current: f64,
        abs: &AbsProgressInput,
        is_completed: bool,
        last_hardcover_sync: Option<DateTime<Utc>>,
    ) -> Decision {
        let _ = abs;

        if !self.config.enabled {
            return Decision {
                action: DecisionAction::SyncImmediately,
                reason: DecisionReason::DelayedUpdatesDisabled,
                session_timeout_secs: None,
            };
        }

        if is_completed && self.config.immediate_completion {
            return Decision {
                action: DecisionAction::SyncImmediately,
                reason: DecisionReason::BookCompletion,
                session_timeout_secs: None,
            };
        }

        let Some(prev) = last_pushed_progress else {
            return Decision {
                action: DecisionAction::SyncImmediately,
                reason: DecisionReason::SignificantProgressChange,
                session_timeout_secs: None,
            };
        };

        if let Some(last_sync) = last_hardcover_sync {
            let elapsed = (self.clock.now() - last_sync).num_seconds().max(0) as u64;
            if elapsed > self.config.max_delay_secs {
                return Decision {
                    action: DecisionAction::SyncImmediately,
                    reason: DecisionReason::MaxDelayExceeded,
                    session_timeout_secs: None,
                };
            }
        }

        let delta = (current - prev).abs();
        if delta > SIGNIFICANT_DELTA || crosses_milestone(prev, current) {
            return Decision {
                action: DecisionAction::SyncImmediately,
                reason: DecisionReason::SignificantProgressChange,
                session_timeout_secs: None,
            };
        }

        Decision {
            action: DecisionAction::DelayUpdate,
            reason: DecisionReason::ActiveSessionDetected,
            session_timeout_secs: Some(self.config.session_timeout_secs),
        }
    }

    pub async fn update_session(
        &self,
        cache: &BookCache,
        user_id: &str,
        identifier: &str,
        title: &str,
        identifier_type: crate::cache::models::IdentifierType,
        pending_progress: f64,
        user_book_id: Option<i64>,
    ) -> Result<()> {
        cache
            .update_session_progress(user_id, identifier, title, identifier_type, pending_progress, user_book_id)
            .await
    }

    pub async fn complete_session(
        &self,
        cache: &BookCache,
        user_id: &str,
        identifier: &str,
        title: &str,
    ) -> Result<()> {
        cache.mark_session_complete(user_id, identifier, title).await
    }

    /// Loads sessions older than `session_timeout`, invokes `cb` for
    /// each to perform the actual Hardcover write, and on success marks
    /// the session complete. A callback failure is counted and logged;
    /// it does not abort the batch.
    pub async fn process_expired_sessions<F, Fut>(&self, cache: &BookCache, user_id: &str, cb: F)
    where
        F: Fn(SessionData) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        if !self.config.enabled {
            return;
        }
        let expired = cache
            .get_expired_sessions(user_id, self.config.session_timeout_secs as i64)
            .await;
        for session in expired {
            let identifier = session.identifier.clone();
            let title = session.title_normalized.clone();
            match cb(session).await {
                Ok(()) => {
                    if let Err(e) = cache.mark_session_complete(user_id, &identifier, &title).await {
                        warn!(error = %e, user_id, identifier, "failed to mark recovered session complete");
                        self.expired_callback_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    warn!(error = %e, user_id, identifier, "expired session callback failed");
                    self.expired_callback_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn abs_input() -> AbsProgressInput {
        AbsProgressInput::default()
    }

    #[test]
    fn b2_session_timeout_bounds() {
        let mut cfg = SessionManagerConfig {
            enabled: true,
            session_timeout_secs: 59,
            max_delay_secs: 3600,
            immediate_completion: true,
        };
        assert!(cfg.validate().is_err());
        cfg.session_timeout_secs = 60;
        cfg.validate().unwrap();
        cfg.session_timeout_secs = cfg.max_delay_secs;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn disabled_always_syncs_immediately() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let mgr = SessionManager::new(SessionManagerConfig::default(), clock).unwrap();
        let d = mgr.should_delay_update(Some(50.0), 51.0, &abs_input(), false, None);
        assert_eq!(d.action, DecisionAction::SyncImmediately);
        assert_eq!(d.reason, DecisionReason::DelayedUpdatesDisabled);
    }

    #[test]
    fn s5_milestone_crossing_forces_immediate_sync() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let cfg = SessionManagerConfig {
            enabled: true,
            ..SessionManagerConfig::default()
        };
        let mgr = SessionManager::new(cfg, clock).unwrap();
        let d = mgr.should_delay_update(Some(49.0), 51.0, &abs_input(), false, Some(Utc::now()));
        assert_eq!(d.action, DecisionAction::SyncImmediately);
        assert_eq!(d.reason, DecisionReason::SignificantProgressChange);
    }

    #[test]
    fn s5_small_delta_without_milestone_delays() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let cfg = SessionManagerConfig {
            enabled: true,
            ..SessionManagerConfig::default()
        };
        let mgr = SessionManager::new(cfg, clock.clone());
        let mgr = mgr.unwrap();
        let d = mgr.should_delay_update(Some(51.0), 52.0, &abs_input(), false, Some(clock.now()));
        assert_eq!(d.action, DecisionAction::DelayUpdate);
        assert_eq!(d.reason, DecisionReason::ActiveSessionDetected);
    }

    #[test]
    fn completion_bypasses_delay_when_immediate_completion_enabled() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let cfg = SessionManagerConfig {
            enabled: true,
            ..SessionManagerConfig::default()
        };
        let mgr = SessionManager::new(cfg, clock).unwrap();
        let d = mgr.should_delay_update(Some(90.0), 91.0, &abs_input(), true, None);
        assert_eq!(d.action, DecisionAction::SyncImmediately);
        assert_eq!(d.reason, DecisionReason::BookCompletion);
    }

    #[test]
    fn no_previous_progress_is_bootstrap_immediate() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let cfg = SessionManagerConfig {
            enabled: true,
            ..SessionManagerConfig::default()
        };
        let mgr = SessionManager::new(cfg, clock).unwrap();
        let d = mgr.should_delay_update(None, 10.0, &abs_input(), false, None);
        assert_eq!(d.reason, DecisionReason::SignificantProgressChange);
    }

    #[test]
    fn max_delay_exceeded_forces_sync() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let cfg = SessionManagerConfig {
            enabled: true,
            session_timeout_secs: 60,
            max_delay_secs: 300,
            immediate_completion: true,
        };
        let mgr = SessionManager::new(cfg, clock.clone()).unwrap();
        let old_sync = clock.now() - chrono::Duration::seconds(400);
        let d = mgr.should_delay_update(Some(51.0), 52.0, &abs_input(), false, Some(old_sync));
        assert_eq!(d.reason, DecisionReason::MaxDelayExceeded);
    }

    #[tokio::test]
    async fn s6_expired_session_carries_its_user_book_id_through_recovery() {
        use crate::cache::models::IdentifierType;

        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let cache = BookCache::connect_with_clock(dir.path().join("cache.db"), clock.clone())
            .await
            .unwrap();
        cache
            .store_edition_mapping("u1", "X", "Book", IdentifierType::Isbn, 1, None)
            .await
            .unwrap();
        cache
            .update_session_progress("u1", "X", "Book", IdentifierType::Isbn, 35.0, Some(77))
            .await
            .unwrap();

        let mgr = SessionManager::new(
            SessionManagerConfig {
                enabled: true,
                session_timeout_secs: 60,
                max_delay_secs: 3600,
                immediate_completion: true,
            },
            clock.clone(),
        )
        .unwrap();
        clock.advance(chrono::Duration::seconds(61));

        let seen_id = Arc::new(std::sync::Mutex::new(None));
        let seen_id_clone = seen_id.clone();
        mgr.process_expired_sessions(&cache, "u1", |session| {
            let seen_id_clone = seen_id_clone.clone();
            async move {
                *seen_id_clone.lock().unwrap() = session.user_book_id;
                Ok(())
            }
        })
        .await;

        assert_eq!(*seen_id.lock().unwrap(), Some(77));
        assert!(!cache.has_active_session("u1", "X", "Book").await);
    }

    #[tokio::test]
    async fn s6_expired_session_without_user_book_id_is_not_silently_marked_complete() {
        use crate::cache::models::IdentifierType;

        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let cache = BookCache::connect_with_clock(dir.path().join("cache.db"), clock.clone())
            .await
            .unwrap();
        cache
            .store_edition_mapping("u1", "X", "Book", IdentifierType::Isbn, 1, None)
            .await
            .unwrap();
        cache
            .update_session_progress("u1", "X", "Book", IdentifierType::Isbn, 35.0, None)
            .await
            .unwrap();

        let mgr = SessionManager::new(
            SessionManagerConfig {
                enabled: true,
                session_timeout_secs: 60,
                max_delay_secs: 3600,
                immediate_completion: true,
            },
            clock.clone(),
        )
        .unwrap();
        clock.advance(chrono::Duration::seconds(61));

        mgr.process_expired_sessions(&cache, "u1", |session| async move {
            if session.user_book_id.is_none() {
                anyhow::bail!("no user_book_id");
            }
            Ok(())
        })
        .await;

        assert_eq!(mgr.expired_callback_error_count(), 1);
        assert!(cache.has_active_session("u1", "X", "Book").await);
    }
}
