// src/retry.rs

use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Result, StoreError};

/// Bounded exponential backoff for quota failures.
///
/// `max_attempts` counts every call of the operation, so `3` means one try
/// plus at most two retries. Zero still runs the operation once. Any error
/// other than [`StoreError::Quota`] is returned on first sight.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    /// Upper bound for a single sleep. `None` leaves the schedule uncapped.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_attempts: 3,
            max_delay: None,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier,
            max_attempts: cfg.max_attempts,
            max_delay: cfg.max_delay_ms.map(Duration::from_millis),
        }
    }
}

impl RetryPolicy {
    /// Policy that never sleeps; handy where the caller owns pacing.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (0-based): `base * multiplier^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Run `op`, blocking the current thread between attempts.
    pub fn execute<T, F>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        self.execute_with_sleep(op, std::thread::sleep)
    }

    /// Same as [`execute`](Self::execute) with an injectable sleep.
    pub fn execute_with_sleep<T, F, S>(&self, mut op: F, mut sleep: S) -> Result<T>
    where
        F: FnMut() -> Result<T>,
        S: FnMut(Duration),
    {
        let attempts = self.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(v) => return Ok(v),
                Err(StoreError::Quota(msg)) if attempt < attempts => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %msg,
                        "quota exceeded; backing off"
                    );
                    sleep(delay);
                }
                Err(e) => return Err(give_up(attempt, e)),
            }
        }
    }

    /// Async variant: identical schedule, sleeping on the tokio timer.
    pub async fn execute_async<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(StoreError::Quota(msg)) if attempt < attempts => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %msg,
                        "quota exceeded; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(give_up(attempt, e)),
            }
        }
    }
}

fn give_up(attempt: u32, e: StoreError) -> StoreError {
    if e.is_quota() {
        warn!(attempt, "quota exceeded; retries exhausted");
    }
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_attempts,
            max_delay: None,
        }
    }

    /// Fails with a quota error `k` times, then returns the call count.
    fn flaky(k: u32, calls: &Cell<u32>) -> impl FnMut() -> Result<u32> + '_ {
        move || {
            calls.set(calls.get() + 1);
            if calls.get() <= k {
                Err(StoreError::Quota("429".into()))
            } else {
                Ok(calls.get())
            }
        }
    }

    #[test]
    fn succeeds_after_k_quota_failures_with_doubling_delays() {
        let calls = Cell::new(0);
        let mut slept = Vec::new();
        let out = policy(4)
            .execute_with_sleep(flaky(3, &calls), |d| slept.push(d))
            .unwrap();

        assert_eq!(out, 4);
        assert_eq!(
            slept,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let mut slept = Vec::new();
        let err = policy(3)
            .execute_with_sleep(flaky(3, &calls), |d| slept.push(d))
            .unwrap_err();

        assert!(err.is_quota());
        assert_eq!(calls.get(), 3);
        assert_eq!(slept.len(), 2);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let calls = Cell::new(0);
        let mut slept = Vec::new();
        let err = policy(0)
            .execute_with_sleep(flaky(5, &calls), |d| slept.push(d))
            .unwrap_err();

        assert!(err.is_quota());
        assert_eq!(calls.get(), 1);
        assert!(slept.is_empty());
    }

    #[test]
    fn non_quota_errors_are_not_retried() {
        let calls = Cell::new(0);
        let err = policy(5)
            .execute_with_sleep(
                || {
                    calls.set(calls.get() + 1);
                    Err::<(), _>(StoreError::Io("reset".into()))
                },
                |_| panic!("must not sleep"),
            )
            .unwrap_err();

        assert_eq!(err, StoreError::Io("reset".into()));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn delay_is_capped_only_when_configured() {
        let mut p = policy(10);
        assert_eq!(p.delay_for(6), Duration::from_millis(6_400));

        p.max_delay = Some(Duration::from_secs(1));
        assert_eq!(p.delay_for(6), Duration::from_secs(1));
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn async_variant_follows_same_schedule() {
        let calls = Cell::new(0);
        let start = tokio::time::Instant::now();
        let out = policy(3)
            .execute_async(|| {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n <= 2 {
                        Err(StoreError::Quota("429".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 3);
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn async_variant_gives_up_with_quota_error() {
        let calls = Cell::new(0);
        let err = policy(2)
            .execute_async(|| {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(StoreError::Quota("429".into())) }
            })
            .await
            .unwrap_err();

        assert!(err.is_quota());
        assert_eq!(calls.get(), 2);
    }
}
