use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::ratelimit::config::RateLimitConfig;
use crate::ratelimit::snapshot::RateLimitSnapshot;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// The op-class a call belongs to, admission for which is checked alongside
/// the global and per-session tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Download,
    Upload,
    Other,
}

/// Decision the controller reaches after observing a flood-wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodWaitDecision {
    /// `seconds <= threshold`: absorb inline and retry on the same session.
    Absorb { seconds: u64 },
    /// `seconds > threshold`: suspend the session until the deadline.
    Suspend { seconds: u64 },
}

/// A single tier's limiter plus enough state to rebuild it at a new quota
/// when adaptive tuning fires (governor limiters are immutable once built).
struct Tier {
    base_per_minute: u32,
    current_per_minute: u32,
    limiter: DirectLimiter,
}

impl Tier {
    fn new(per_minute: u32) -> Self {
        Self {
            base_per_minute: per_minute,
            current_per_minute: per_minute,
            limiter: build_limiter(per_minute),
        }
    }

    fn rescale(&mut self, factor: f64, min_per_minute: u32, max_per_minute: u32) {
        let scaled = ((self.current_per_minute as f64) * factor).round() as u32;
        let clamped = scaled.clamp(min_per_minute, max_per_minute);
        if clamped != self.current_per_minute {
            self.current_per_minute = clamped;
            self.limiter = build_limiter(clamped);
        }
    }
}

fn build_limiter(per_minute: u32) -> DirectLimiter {
    let nz = NonZeroU32::new(per_minute.max(1)).unwrap_or(nonzero!(1u32));
    RateLimiter::direct(Quota::per_minute(nz))
}

/// Per-session tracking: call counter, back-off deadline, recent flood-wait
/// timestamps, and a dedicated per-session limiter.
struct SessionState {
    limiter: DirectLimiter,
    back_off_until: Option<DateTime<Utc>>,
    flood_wait_times: VecDeque<DateTime<Utc>>,
    call_count: AtomicU64,
}

impl SessionState {
    fn new(per_minute: u32) -> Self {
        Self {
            limiter: build_limiter(per_minute),
            back_off_until: None,
            flood_wait_times: VecDeque::new(),
            call_count: AtomicU64::new(0),
        }
    }
}

/// Three layered limiters (global, op-class, per-session), flood-wait
/// policy, and adaptive tuning.
pub struct RateLimitController {
    config: RateLimitConfig,
    global: StdMutex<Tier>,
    download: StdMutex<Tier>,
    upload: StdMutex<Tier>,
    sessions: DashMap<String, StdMutex<SessionState>>,
    total_calls: AtomicU64,
    total_flood_waits: AtomicU64,
}

impl RateLimitController {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            global: StdMutex::new(Tier::new(config.global_per_minute)),
            download: StdMutex::new(Tier::new(config.download_per_minute)),
            upload: StdMutex::new(Tier::new(config.upload_per_minute)),
            sessions: DashMap::new(),
            total_calls: AtomicU64::new(0),
            total_flood_waits: AtomicU64::new(0),
            config,
        }
    }

    fn session_entry(&self, session: &str) -> dashmap::mapref::one::Ref<'_, String, StdMutex<SessionState>> {
        if !self.sessions.contains_key(session) {
            self.sessions.insert(
                session.to_string(),
                StdMutex::new(SessionState::new(self.config.per_session_per_minute)),
            );
        }
        self.sessions.get(session).expect("just inserted")
    }

    /// Seconds remaining before `session` may be dispatched again, or `None`
    /// if it is not currently suspended.
    pub fn suspended_for(&self, session: &str) -> Option<u64> {
        let entry = self.session_entry(session);
        let state = entry.lock().expect("session state lock poisoned");
        state.back_off_until.and_then(|deadline| {
            let now = Utc::now();
            if now < deadline {
                Some((deadline - now).num_seconds().max(0) as u64)
            } else {
                None
            }
        })
    }

    /// Acquire admission from all three tiers for `session`/`op`, waiting
    /// (cooperatively, respecting `cancel`) until every tier grants a
    /// permit. Returns `RateLimited` immediately if the session is
    /// currently suspended; `Cancelled` if `cancel` fires first.
    pub async fn admit(
        &self,
        session: &str,
        op: OpClass,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        if let Some(seconds) = self.suspended_for(session) {
            return Err(RelayError::RateLimited { seconds });
        }

        self.wait_for_tier_global(cancel).await?;
        match op {
            OpClass::Download => self.wait_for_tier_class(&self.download, cancel).await?,
            OpClass::Upload => self.wait_for_tier_class(&self.upload, cancel).await?,
            OpClass::Other => {}
        }
        self.wait_for_session(session, cancel).await?;

        self.session_entry(session)
            .lock()
            .expect("session state lock poisoned")
            .call_count
            .fetch_add(1, Ordering::Relaxed);
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn wait_for_tier_global(&self, cancel: &CancellationToken) -> Result<(), RelayError> {
        loop {
            let ready = { self.global.lock().expect("global tier lock poisoned").limiter.check().is_ok() };
            if ready {
                return Ok(());
            }
            self.sleep_or_cancel(cancel).await?;
        }
    }

    async fn wait_for_tier_class(
        &self,
        tier: &StdMutex<Tier>,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        loop {
            let ready = { tier.lock().expect("tier lock poisoned").limiter.check().is_ok() };
            if ready {
                return Ok(());
            }
            self.sleep_or_cancel(cancel).await?;
        }
    }

    async fn wait_for_session(
        &self,
        session: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        loop {
            let ready = {
                self.session_entry(session)
                    .lock()
                    .expect("session state lock poisoned")
                    .limiter
                    .check()
                    .is_ok()
            };
            if ready {
                return Ok(());
            }
            self.sleep_or_cancel(cancel).await?;
        }
    }

    async fn sleep_or_cancel(&self, cancel: &CancellationToken) -> Result<(), RelayError> {
        // Small fixed polling interval; governor doesn't expose an async
        // `until_ready` in the non-`std-future` configuration, so admission
        // waits are modeled as a cancellable poll loop.
        const POLL_INTERVAL: Duration = Duration::from_millis(50);
        tokio::select! {
            _ = sleep(POLL_INTERVAL) => Ok(()),
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
        }
    }

    /// Record a flood-wait from the service and decide absorb vs. suspend.
    pub fn observe_flood_wait(&self, session: &str, seconds: u64) -> FloodWaitDecision {
        self.total_flood_waits.fetch_add(1, Ordering::Relaxed);

        let entry = self.session_entry(session);
        let mut state = entry.lock().expect("session state lock poisoned");
        let now = Utc::now();
        state.flood_wait_times.push_back(now);
        let window_start = now - chrono::Duration::seconds(self.config.flood_wait_window_secs as i64);
        while state
            .flood_wait_times
            .front()
            .is_some_and(|t| *t < window_start)
        {
            state.flood_wait_times.pop_front();
        }
        let recent = state.flood_wait_times.len() as u32;
        drop(state);

        if recent >= self.config.flood_wait_trigger_count {
            self.tune_down();
        }

        if seconds <= self.config.flood_wait_absorb_threshold_secs {
            FloodWaitDecision::Absorb { seconds }
        } else {
            let deadline = now + chrono::Duration::seconds(seconds as i64);
            self.session_entry(session)
                .lock()
                .expect("session state lock poisoned")
                .back_off_until = Some(deadline);
            warn!(session = %session, seconds, "session suspended for long flood-wait");
            FloodWaitDecision::Suspend { seconds }
        }
    }

    /// Record a successful call outside the admission path — used by the
    /// sustained-success recovery rule.
    pub fn observe_success(&self) {
        let successes = self.total_calls.load(Ordering::Relaxed);
        let floods = self.total_flood_waits.load(Ordering::Relaxed);
        if successes == 0 {
            return;
        }
        let rate = 1.0 - (floods as f64 / successes.max(1) as f64);
        if rate > self.config.success_recovery_threshold {
            self.tune_up();
        }
    }

    fn tune_down(&self) {
        let factor = self.config.tune_down_factor;
        let mut d = self.download.lock().expect("tier lock poisoned");
        let max_d = d.base_per_minute;
        d.rescale(factor, 1, max_d);
        let mut u = self.upload.lock().expect("tier lock poisoned");
        let max_u = u.base_per_minute;
        u.rescale(factor, 1, max_u);
        debug!("rate limit tiers tuned down");
    }

    fn tune_up(&self) {
        let factor = self.config.tune_up_factor;
        let mut d = self.download.lock().expect("tier lock poisoned");
        let max_d = d.base_per_minute;
        d.rescale(factor, 1, max_d);
        let mut u = self.upload.lock().expect("tier lock poisoned");
        let max_u = u.base_per_minute;
        u.rescale(factor, 1, max_u);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let mut per_session_calls = HashMap::new();
        let mut backoff_remaining_secs = HashMap::new();
        for entry in self.sessions.iter() {
            let state = entry.value().lock().expect("session state lock poisoned");
            per_session_calls.insert(entry.key().clone(), state.call_count.load(Ordering::Relaxed));
            if let Some(secs) = self.suspended_for(entry.key()) {
                backoff_remaining_secs.insert(entry.key().clone(), secs);
            }
        }
        let successes = self.total_calls.load(Ordering::Relaxed);
        let floods = self.total_flood_waits.load(Ordering::Relaxed);
        let success_rate = if successes == 0 {
            1.0
        } else {
            1.0 - (floods as f64 / successes as f64)
        };
        RateLimitSnapshot {
            per_session_calls,
            backoff_remaining_secs,
            success_rate,
            download_quota_per_minute: self.download.lock().expect("tier lock poisoned").current_per_minute,
            upload_quota_per_minute: self.upload.lock().expect("tier lock poisoned").current_per_minute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RateLimitController {
        RateLimitController::new(RateLimitConfig::default())
    }

    #[tokio::test]
    async fn admit_succeeds_for_fresh_session() {
        let c = controller();
        let cancel = CancellationToken::new();
        let result = c.admit("s1", OpClass::Download, &cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn admit_fails_when_session_suspended() {
        let c = controller();
        c.observe_flood_wait("s1", 120);
        let cancel = CancellationToken::new();
        let result = c.admit("s1", OpClass::Upload, &cancel).await;
        assert!(matches!(result, Err(RelayError::RateLimited { .. })));
    }

    #[test]
    fn short_flood_wait_is_absorbed() {
        let c = controller();
        let decision = c.observe_flood_wait("s1", 5);
        assert_eq!(decision, FloodWaitDecision::Absorb { seconds: 5 });
        assert!(c.suspended_for("s1").is_none());
    }

    #[test]
    fn long_flood_wait_suspends_session() {
        let c = controller();
        let decision = c.observe_flood_wait("s1", 120);
        assert_eq!(decision, FloodWaitDecision::Suspend { seconds: 120 });
        assert!(c.suspended_for("s1").is_some());
    }

    #[test]
    fn three_recent_flood_waits_tune_down() {
        let c = controller();
        for _ in 0..3 {
            c.observe_flood_wait("s1", 2);
        }
        let snap = c.snapshot();
        assert!(snap.download_quota_per_minute < RateLimitConfig::default().download_per_minute);
    }

    #[tokio::test]
    async fn admit_is_cancellable() {
        // Exhaust the per-session quota of 1/min, then cancel instead of
        // waiting out the window.
        let mut cfg = RateLimitConfig::default();
        cfg.per_session_per_minute = 1;
        let c = RateLimitController::new(cfg);
        let cancel = CancellationToken::new();
        c.admit("s1", OpClass::Other, &cancel).await.unwrap();

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            cancel2.cancel();
        });
        let result = c.admit("s1", OpClass::Other, &cancel).await;
        assert!(matches!(result, Err(RelayError::Cancelled)));
    }

    #[test]
    fn snapshot_reports_per_session_calls() {
        let c = controller();
        let cancel = CancellationToken::new();
        tokio_test::block_on(c.admit("s1", OpClass::Download, &cancel)).unwrap();
        let snap = c.snapshot();
        assert_eq!(snap.per_session_calls.get("s1"), Some(&1));
    }
}
