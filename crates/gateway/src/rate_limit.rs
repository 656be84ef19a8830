//! Per-client fixed-window rate limiting.
//!
//! Each client address gets one window of `window` length. The first
//! request opens the window; each later request inside it increments the
//! count and is rejected once the count passes the effective limit. The
//! window is replaced lazily by the first request after it expires.
//!
//! The effective limit comes from the caller's grant:
//!
//! | Policy | Limit |
//! |--------|-------|
//! | [`RateLimitPolicy::Unlimited`] | none, and no window is tracked |
//! | [`RateLimitPolicy::ServiceDefault`] | [`RateLimitConfig::default_limit`] |
//! | [`RateLimitPolicy::Explicit`] | the token's own limit |
//!
//! Time comes from [`tokio::time::Instant`], so tests can drive windows
//! with a paused clock.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
    error::{GatewayError, GatewayResult},
    permission::RateLimitPolicy,
};

/// Service-wide rate limit settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    default_limit: u64,
    window: Duration,
}

impl RateLimitConfig {
    /// Creates a configuration. Zero values are raised to their minimum
    /// (one request, one millisecond); [`GatewayConfig`](crate::GatewayConfig)
    /// rejects them before they get here.
    #[must_use]
    pub fn new(default_limit: u64, window: Duration) -> Self {
        Self { default_limit: default_limit.max(1), window: window.max(Duration::from_millis(1)) }
    }

    /// Requests per window for tokens without their own limit.
    #[must_use]
    pub fn default_limit(&self) -> u64 {
        self.default_limit
    }

    /// Window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Copy)]
struct ClientWindow {
    count: u64,
    reset_at: Instant,
}

/// Snapshot of rate limiter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitMetricsSnapshot {
    /// Requests admitted.
    pub allowed: u64,
    /// Requests rejected.
    pub rejected: u64,
    /// Client windows currently held, expired ones included.
    pub tracked_clients: usize,
}

/// Fixed-window limiter keyed by client address.
pub struct RateLimiter {
    config: RateLimitConfig,
    clients: Mutex<HashMap<IpAddr, ClientWindow>>,
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Creates a limiter with no tracked clients.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// The limiter's configuration.
    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Counts one request from `client` against its window.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RateLimited`] with the time left in the
    /// window when the client is over its limit.
    pub fn admit(&self, client: IpAddr, policy: RateLimitPolicy) -> GatewayResult<()> {
        let limit = match policy {
            RateLimitPolicy::Unlimited => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            },
            RateLimitPolicy::ServiceDefault => self.config.default_limit,
            RateLimitPolicy::Explicit(limit) => limit,
        };

        let now = Instant::now();
        let outcome = {
            let mut clients = self.clients.lock();
            let window = clients
                .entry(client)
                .and_modify(|w| {
                    if now >= w.reset_at {
                        *w = ClientWindow { count: 0, reset_at: now + self.config.window };
                    }
                })
                .or_insert(ClientWindow { count: 0, reset_at: now + self.config.window });
            window.count += 1;

            if window.count > limit { Err(window.reset_at - now) } else { Ok(()) }
        };

        match outcome {
            Ok(()) => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Err(retry_after) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%client, limit, "rate limit exceeded");
                Err(GatewayError::RateLimited { retry_after })
            },
        }
    }

    /// Returns the current counters.
    #[must_use]
    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            tracked_clients: self.clients.lock().len(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    const OTHER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    fn limiter(limit: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::new(limit, Duration::from_secs(60)))
    }

    #[tokio::test(start_paused = true)]
    async fn default_limit_applies_within_window() {
        let limiter = limiter(3);
        for _ in 0..3 {
            limiter.admit(CLIENT, RateLimitPolicy::ServiceDefault).unwrap();
        }

        let err = limiter.admit(CLIENT, RateLimitPolicy::ServiceDefault).unwrap_err();
        let GatewayError::RateLimited { retry_after } = err else {
            panic!("expected RateLimited, got {err:?}");
        };
        assert_eq!(retry_after, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_expiry() {
        let limiter = limiter(1);
        limiter.admit(CLIENT, RateLimitPolicy::ServiceDefault).unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        let GatewayError::RateLimited { retry_after } =
            limiter.admit(CLIENT, RateLimitPolicy::ServiceDefault).unwrap_err()
        else {
            panic!("expected RateLimited");
        };
        assert_eq!(retry_after, Duration::from_secs(40));

        tokio::time::advance(Duration::from_secs(40)).await;
        limiter.admit(CLIENT, RateLimitPolicy::ServiceDefault).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_limit_overrides_default() {
        let limiter = limiter(1);
        for _ in 0..5 {
            limiter.admit(CLIENT, RateLimitPolicy::Explicit(5)).unwrap();
        }
        assert!(limiter.admit(CLIENT, RateLimitPolicy::Explicit(5)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_tracks_a_window() {
        let limiter = limiter(1);
        for _ in 0..100 {
            limiter.admit(CLIENT, RateLimitPolicy::Unlimited).unwrap();
        }

        let snapshot = limiter.metrics_snapshot();
        assert_eq!(snapshot.allowed, 100);
        assert_eq!(snapshot.tracked_clients, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clients_have_independent_windows() {
        let limiter = limiter(1);
        limiter.admit(CLIENT, RateLimitPolicy::ServiceDefault).unwrap();
        limiter.admit(OTHER, RateLimitPolicy::ServiceDefault).unwrap();
        assert!(limiter.admit(CLIENT, RateLimitPolicy::ServiceDefault).is_err());

        assert_eq!(
            limiter.metrics_snapshot(),
            RateLimitMetricsSnapshot { allowed: 2, rejected: 1, tracked_clients: 2 }
        );
    }

    #[test]
    fn zero_config_values_are_clamped() {
        let config = RateLimitConfig::new(0, Duration::ZERO);
        assert_eq!(config.default_limit(), 1);
        assert!(config.window() > Duration::ZERO);
    }
}
