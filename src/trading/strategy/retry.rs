//! 券商调用重试策略
//!
//! 指数退避 + 抖动，次数有上限；只有 Transient/Timeout 会重试。

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

use crate::app_config::settings::RetrySettings;
use crate::error::BrokerError;

/// 两次尝试之间的等待序列，长度为 max_attempts - 1
pub fn backoff_delays(settings: &RetrySettings) -> impl Iterator<Item = Duration> {
    // ExponentialBackoff 第 n 次等待 = factor * 2^n 毫秒
    let factor = (settings.base_delay.as_millis() as u64 / 2).max(1);
    ExponentialBackoff::from_millis(2)
        .factor(factor)
        .max_delay(settings.max_delay)
        .map(jitter)
        .take(settings.max_attempts.saturating_sub(1))
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, BrokerError>,
    /// 实际发起调用的次数
    pub attempts: usize,
}

/// 执行带超时与重试的券商调用
pub async fn retry_broker_call<T, F, Fut>(
    settings: &RetrySettings,
    call_timeout: Duration,
    mut call: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let attempts = AtomicUsize::new(0);
    let result = RetryIf::spawn(
        backoff_delays(settings),
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = call();
            async move {
                match tokio::time::timeout(call_timeout, fut).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => {
                        if e.is_retryable() {
                            warn!("券商调用失败，准备重试 attempt={}: {}", attempt, e);
                        }
                        Err(e)
                    }
                    Err(_) => {
                        warn!("券商调用超时 attempt={} timeout={:?}", attempt, call_timeout);
                        Err(BrokerError::Timeout(call_timeout))
                    }
                }
            }
        },
        |e: &BrokerError| e.is_retryable(),
    )
    .await;

    RetryOutcome {
        result,
        attempts: attempts.load(Ordering::SeqCst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn settings(max_attempts: usize) -> RetrySettings {
        RetrySettings {
            max_attempts,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(2000),
        }
    }

    #[test]
    fn test_delay_count_and_cap() {
        let delays: Vec<Duration> = backoff_delays(&settings(5)).collect();
        assert_eq!(delays.len(), 4);
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(2000)));
        assert_eq!(backoff_delays(&settings(1)).count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let outcome = retry_broker_call(&settings(3), Duration::from_secs(5), || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BrokerError::Transient("503".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(outcome.result, Ok(2));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let outcome: RetryOutcome<()> =
            retry_broker_call(&settings(3), Duration::from_secs(5), || async {
                Err(BrokerError::Rejected("qty".into()))
            })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(BrokerError::Rejected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_retryable() {
        let outcome: RetryOutcome<()> =
            retry_broker_call(&settings(2), Duration::from_secs(5), || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert_eq!(outcome.attempts, 2);
        assert_eq!(
            outcome.result,
            Err(BrokerError::Timeout(Duration::from_secs(5)))
        );
    }
}
