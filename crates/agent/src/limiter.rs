//! Per-user sliding-window admission control in front of the orchestration
//! loop. The check and the count update happen under one write lock, so two
//! concurrent requests can never both be admitted on a stale count.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use taskpilot_core::config::LimitsConfig;
use taskpilot_core::domain::task::UserId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted { remaining: u32 },
    Rejected { retry_after_seconds: u32 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

#[derive(Debug, Default)]
struct Window {
    admitted: Vec<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        self.admitted.retain(|instant| now.duration_since(*instant) < window);
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    windows: RwLock<HashMap<String, Window>>,
    window: Duration,
    limit: u32,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { windows: RwLock::new(HashMap::new()), window, limit: limit.max(1) }
    }

    pub fn from_config(config: &LimitsConfig) -> Self {
        Self::new(config.requests_per_minute, Duration::from_secs(config.window_secs))
    }

    pub async fn admit(&self, user: &UserId) -> Admission {
        self.admit_at(user, Instant::now()).await
    }

    /// Admission check against an explicit clock. Exposed for tests.
    pub async fn admit_at(&self, user: &UserId, now: Instant) -> Admission {
        let mut windows = self.windows.write().await;
        // Drop users whose every admission has aged out, so the map only
        // tracks callers with live windows.
        windows.retain(|_, window| {
            window.prune(now, self.window);
            !window.admitted.is_empty()
        });
        let window = windows.entry(user.0.clone()).or_default();

        if window.admitted.len() >= self.limit as usize {
            // The next slot opens when the oldest in-window request ages out.
            let oldest = window.admitted[0];
            let elapsed = now.duration_since(oldest);
            let wait = self.window.saturating_sub(elapsed);
            let retry_after_seconds = (wait.as_secs_f64().ceil() as u32).max(1);
            return Admission::Rejected { retry_after_seconds };
        }

        window.admitted.push(now);
        let remaining = self.limit - window.admitted.len() as u32;
        Admission::Admitted { remaining }
    }

    /// Number of users with a live window. Exposed for tests.
    pub async fn tracked_users(&self) -> usize {
        self.windows.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use taskpilot_core::domain::task::UserId;

    use super::{Admission, RateLimiter};

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    #[tokio::test]
    async fn sixty_first_request_in_window_is_rejected() {
        let limiter = RateLimiter::new(60, Duration::from_secs(60));
        let now = Instant::now();
        let caller = user("u-1");

        for _ in 0..60 {
            assert!(limiter.admit_at(&caller, now).await.is_admitted());
        }

        match limiter.admit_at(&caller, now).await {
            Admission::Rejected { retry_after_seconds } => assert!(retry_after_seconds >= 1),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_users_are_unaffected_by_a_full_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let now = Instant::now();

        assert!(limiter.admit_at(&user("u-1"), now).await.is_admitted());
        assert!(limiter.admit_at(&user("u-1"), now).await.is_admitted());
        assert!(!limiter.admit_at(&user("u-1"), now).await.is_admitted());

        assert!(limiter.admit_at(&user("u-2"), now).await.is_admitted());
    }

    #[tokio::test]
    async fn window_slides_as_time_advances() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();
        let caller = user("u-1");

        assert!(limiter.admit_at(&caller, start).await.is_admitted());
        assert!(limiter.admit_at(&caller, start + Duration::from_secs(30)).await.is_admitted());
        assert!(!limiter.admit_at(&caller, start + Duration::from_secs(31)).await.is_admitted());

        // The first request has aged out by now.
        assert!(limiter.admit_at(&caller, start + Duration::from_secs(61)).await.is_admitted());
    }

    #[tokio::test]
    async fn users_with_expired_windows_are_evicted() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.admit_at(&user("u-1"), start).await.is_admitted());
        assert!(limiter.admit_at(&user("u-2"), start + Duration::from_secs(10)).await.is_admitted());
        assert_eq!(limiter.tracked_users().await, 2);

        // By now every admission of u-1 has aged out; only the freshly
        // admitted u-2 should remain tracked.
        assert!(limiter.admit_at(&user("u-2"), start + Duration::from_secs(75)).await.is_admitted());
        assert_eq!(limiter.tracked_users().await, 1);
    }

    #[tokio::test]
    async fn retry_after_counts_down_toward_the_oldest_slot() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let start = Instant::now();
        let caller = user("u-1");

        assert!(limiter.admit_at(&caller, start).await.is_admitted());
        match limiter.admit_at(&caller, start + Duration::from_secs(40)).await {
            Admission::Rejected { retry_after_seconds } => assert_eq!(retry_after_seconds, 20),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
