use std::future::Future;
use std::time::Duration;

use fastrace::future::FutureExt;
use fastrace::Span;
use log::warn;
use spindle_telemetry::common::SpanAttribute;

#[derive(Debug, Clone)]
pub enum RetryStrategy {
    Fixed {
        max_count: usize,
        delay: Duration,
    },
}

impl RetryStrategy {
    /// Runs the operation until it succeeds or the retry budget is exhausted.
    /// The operation runs at most `max_count + 1` times, and the last error is returned.
    pub async fn run<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let mut delay = self.delay();
        let mut attempt = 0;
        loop {
            let span = Span::enter_with_local_parent("RetryStrategy::run")
                .with_property(|| (SpanAttribute::RETRY_ATTEMPT, attempt.to_string()));
            let result = f().in_span(Span::enter_with_parent("attempt", &span)).await;
            match result {
                x @ Ok(_) => return x,
                Err(e) => {
                    span.add_property(|| (SpanAttribute::EXCEPTION_MESSAGE, e.to_string()));
                    warn!("retryable operation failed (attempt {attempt}): {e}");
                    if let Some(delay) = delay.next() {
                        tokio::time::sleep(delay).await;
                    } else {
                        return Err(e);
                    }
                }
            }
            attempt += 1;
        }
    }

    fn delay(&self) -> impl Iterator<Item = Duration> + Send {
        match self {
            Self::Fixed { max_count, delay } => std::iter::repeat_n(*delay, *max_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    async fn fail_times(
        strategy: &RetryStrategy,
        failures: usize,
        counter: Arc<AtomicUsize>,
    ) -> Result<usize, String> {
        strategy
            .run(|| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        Err(format!("failure {n}"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_retry_succeeds_within_budget() {
        let strategy = RetryStrategy::Fixed {
            max_count: 3,
            delay: Duration::from_millis(100),
        };
        let counter = Arc::new(AtomicUsize::new(0));
        let result = fail_times(&strategy, 2, counter.clone()).await;
        assert_eq!(result, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_retry_returns_last_error() {
        let strategy = RetryStrategy::Fixed {
            max_count: 2,
            delay: Duration::from_millis(100),
        };
        let counter = Arc::new(AtomicUsize::new(0));
        let result = fail_times(&strategy, 10, counter.clone()).await;
        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let strategy = RetryStrategy::Fixed {
            max_count: 0,
            delay: Duration::ZERO,
        };
        let counter = Arc::new(AtomicUsize::new(0));
        let result = fail_times(&strategy, 1, counter.clone()).await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
