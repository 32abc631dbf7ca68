use std::time::Duration;

use rand::Rng;

use crate::app_config::settings::FeedSettings;

/// 行情重连退避：min(max_delay, base * 2^n) 加随机抖动，次数有上限
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            jitter_factor: 0.1,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &FeedSettings) -> Self {
        Self::new(
            settings.reconnect_base,
            settings.reconnect_max,
            settings.reconnect_max_attempts,
        )
    }

    /// 抖动比例，负数按 0 处理
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.max(0.0);
        self
    }

    /// 下一次等待时长；次数用尽返回 None
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let exp = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        let capped = exp.min(self.max_delay);

        let range = capped.as_secs_f64() * self.jitter_factor;
        let jitter = if range > 0.0 {
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };
        self.attempt = self.attempt.saturating_add(1);
        Some(Duration::from_secs_f64(
            (capped.as_secs_f64() + jitter).max(0.0),
        ))
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// 连接成功后清零
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_until_cap_then_exhaust() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(500), Duration::from_secs(2), 4)
                .with_jitter(0.0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_secs(10), Duration::from_secs(60), 1)
                .with_jitter(0.2);
        let secs = backoff.next_delay().unwrap().as_secs_f64();
        assert!((8.0..=12.0).contains(&secs), "delay was {}", secs);
    }
}
