use std::{future::Future, time::Duration};

use beacon_core::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, backoff_with_jitter};
use tracing::warn;

use crate::error::{SyncError, TransportError};

/// Retry rule shared by push and pull: transient transport failures get a
/// bounded number of jittered exponential retries, everything else fails
/// straight away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
            max_retries: 1,
        }
    }
}

impl RetryPolicy {
    /// Runs `operation`, checking connectivity before the first attempt and
    /// again before every retry.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        is_online: impl Fn() -> bool,
        mut operation: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut retries = 0;
        loop {
            if !is_online() {
                return Err(SyncError::Offline);
            }
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && retries < self.max_retries => {
                    let delay = backoff_with_jitter(retries, self.base, self.cap);
                    warn!(
                        operation = label,
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_once_after_backoff() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), SyncError> = RetryPolicy::default()
            .run("push", || true, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::Timeout) }
            })
            .await;

        assert!(matches!(
            result,
            Err(SyncError::Transport(TransportError::Timeout))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(900), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(1100), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn application_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), SyncError> = RetryPolicy::default()
            .run("pull", || true, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(TransportError::Status {
                        status: 404,
                        body: "{\"error\":\"not found\"}".to_owned(),
                    })
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(SyncError::Transport(TransportError::Status { status: 404, .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_stops_the_retry() {
        let online = Arc::new(AtomicBool::new(true));
        let calls = AtomicU32::new(0);
        let flag = online.clone();
        let result: Result<(), SyncError> = RetryPolicy::default()
            .run("pull", || online.load(Ordering::SeqCst), || {
                calls.fetch_add(1, Ordering::SeqCst);
                flag.store(false, Ordering::SeqCst);
                async { Err(TransportError::Network("reset".to_owned())) }
            })
            .await;

        assert!(matches!(result, Err(SyncError::Offline)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_a_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::default()
            .run("push", || true, || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(TransportError::ConnectionRefused("refused".to_owned()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 1);
    }
}
