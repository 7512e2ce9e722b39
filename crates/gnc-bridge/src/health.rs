//! [`HealthMonitor`] – fixed-interval reconnect supervisor.
//!
//! Every `interval` the monitor looks at
//! [`BridgeSession::is_connected`]; when the session is down and no dial is
//! already in flight it issues exactly one [`BridgeSession::connect`].
//! There is no backoff and no retry cap.  A reconnect attempt that fails
//! synchronously is logged and the loop carries on; asynchronous failures
//! surface on the session's own event channel.
//!
//! Warnings are rate limited so a broker that stays down for hours does not
//! flood the log; the attempts themselves are not.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::session::BridgeSession;

/// Default health-check period.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_millis(3000);

/// Reconnect warnings allowed per minute; the rest go to `debug`.
const WARNINGS_PER_MINUTE: NonZeroU32 = NonZeroU32::MIN.saturating_add(3);

/// Outcome of one health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    /// The session was connected; nothing to do.
    Healthy,
    /// The session was down and a reconnect was started.
    Reconnecting,
    /// An earlier attempt is still dialling; nothing was started.
    Pending,
    /// The session was down and the reconnect attempt failed immediately.
    ReconnectFailed(String),
}

/// Owns the periodic health-check task for one mounted session.
///
/// Stopping is idempotent; dropping the monitor stops it.
pub struct HealthMonitor {
    task: Option<JoinHandle<()>>,
    attempts: Arc<AtomicU64>,
    interval: Duration,
}

impl HealthMonitor {
    /// Start checking `session` every `interval`.  The first check runs one
    /// full interval after spawning.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(session: BridgeSession, interval: Duration) -> Self {
        let attempts = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&attempts);
        let start = tokio::time::Instant::now() + interval;
        let task = tokio::spawn(async move {
            let limiter = RateLimiter::direct(Quota::per_minute(WARNINGS_PER_MINUTE));
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if matches!(
                    check_once(&session, &limiter),
                    HealthCheck::Reconnecting | HealthCheck::ReconnectFailed(_)
                ) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        Self {
            task: Some(task),
            attempts,
            interval,
        }
    }

    /// Number of reconnect attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The check period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the check loop is still scheduled.
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Cancel the check loop.  Returns `true` only for the call that actually
    /// stopped it.
    pub fn stop(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                debug!("health monitor stopped");
                true
            }
            None => false,
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run one health check against `session`.
pub fn check_once(session: &BridgeSession, limiter: &DefaultDirectRateLimiter) -> HealthCheck {
    if session.is_connected() {
        return HealthCheck::Healthy;
    }
    match session.start_connect() {
        Ok(false) => {
            debug!(endpoint = %session.endpoint(), "reconnect still in progress");
            HealthCheck::Pending
        }
        Ok(true) => {
            if limiter.check().is_ok() {
                warn!(endpoint = %session.endpoint(), "bridge disconnected; reconnecting");
            } else {
                debug!(endpoint = %session.endpoint(), "bridge disconnected; reconnecting");
            }
            HealthCheck::Reconnecting
        }
        Err(e) => {
            if limiter.check().is_ok() {
                warn!(endpoint = %session.endpoint(), error = %e, "reconnect attempt failed");
            } else {
                debug!(endpoint = %session.endpoint(), error = %e, "reconnect attempt failed");
            }
            HealthCheck::ReconnectFailed(e.to_string())
        }
    }
}
