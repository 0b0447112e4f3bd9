//! Sliding-window operation budget shared by every tool call.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::{Error, Result};

#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            calls: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record one call, or fail without recording if the window is full.
    pub fn try_acquire(&self) -> Result<usize> {
        self.try_acquire_at(Instant::now())
    }

    /// Check and record happen under one lock, so concurrent callers can
    /// never both see the last free slot.
    pub fn try_acquire_at(&self, now: Instant) -> Result<usize> {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        evict(&mut calls, now, self.window);
        if calls.len() >= self.limit {
            let retry_after = calls
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or_default();
            return Err(Error::RateLimitExceeded {
                limit: self.limit,
                remaining: 0,
                window: self.window,
                retry_after,
            });
        }
        calls.push_back(now);
        Ok(self.limit - calls.len())
    }

    /// Calls still allowed in the current window.
    pub fn remaining(&self) -> usize {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        evict(&mut calls, Instant::now(), self.window);
        self.limit.saturating_sub(calls.len())
    }
}

fn evict(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = calls.front() {
        if now.saturating_duration_since(oldest) >= window {
            calls.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_n_plus_one_fails() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();
        assert_eq!(limiter.try_acquire_at(now).unwrap(), 2);
        assert_eq!(limiter.try_acquire_at(now).unwrap(), 1);
        assert_eq!(limiter.try_acquire_at(now).unwrap(), 0);

        let err = limiter.try_acquire_at(now).unwrap_err();
        match err {
            Error::RateLimitExceeded {
                limit,
                remaining,
                retry_after,
                ..
            } => {
                assert_eq!(limit, 3);
                assert_eq!(remaining, 0);
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_window_elapses() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();
        limiter.try_acquire_at(start).unwrap();
        limiter.try_acquire_at(start + Duration::from_secs(10)).unwrap();
        assert!(limiter.try_acquire_at(start + Duration::from_secs(30)).is_err());

        // First call leaves the window.
        assert!(limiter.try_acquire_at(start + Duration::from_secs(60)).is_ok());
        assert!(limiter.try_acquire_at(start + Duration::from_secs(61)).is_err());
        assert!(limiter.try_acquire_at(start + Duration::from_secs(70)).is_ok());
    }

    #[test]
    fn test_rejected_call_not_recorded() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let start = Instant::now();
        limiter.try_acquire_at(start).unwrap();
        for i in 1..5 {
            assert!(limiter.try_acquire_at(start + Duration::from_secs(i)).is_err());
        }
        assert!(limiter.try_acquire_at(start + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn test_concurrent_callers_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new(50, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..20).filter(|_| limiter.try_acquire().is_ok()).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
        assert_eq!(limiter.remaining(), 0);
    }
}
