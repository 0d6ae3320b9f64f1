// Copyright (c) James Kassemi, SC, US. All rights reserved.
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Jittered exponential backoff for transient network failures.
///
/// The rate-limit policy (fixed 30 s sleeps on HTTP 429) is handled by the
/// connector itself; this policy covers everything else that is worth a
/// blind retry: timeouts, resets, 5xx responses.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: usize,
        base_delay: Duration,
        max_delay: Duration,
        jitter_pct: f64,
    ) -> Self {
        let base = base_delay.max(Duration::from_millis(1));
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: base,
            max_delay: max_delay.max(base),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// Default for exchange HTTP calls: 5 attempts, 250 ms doubling to 5 s.
    pub fn default_http() -> Self {
        Self::new(
            5,
            Duration::from_millis(250),
            Duration::from_secs(5),
            0.25,
        )
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = 2_u32.saturating_pow(attempt as u32);
        let mut delay = self
            .base_delay
            .saturating_mul(exp)
            .min(self.max_delay)
            .as_millis() as u64;
        if self.jitter_pct > 0.0 {
            let spread = (delay as f64 * self.jitter_pct) as i64;
            let delta = rand::thread_rng().gen_range(-spread..=spread);
            delay = delay.saturating_add_signed(delta);
        }
        Duration::from_millis(delay)
    }

    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(val) => return Ok(val),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    sleep(self.delay_for(attempt - 1)).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_http()
    }
}
