//! Bounded polling: retry a probe until it converges or a deadline elapses.
//!
//! This is the primitive under every "wait for resource to reach state X"
//! operation. A probe that is already satisfied returns immediately without
//! sleeping, so sampling is idempotent and cheap to call when the condition
//! may already hold.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::transport::StatusProbe;

/// Terminal result of a sample loop.
///
/// `converged == false` is not an error; it is a normal negative result.
/// Callers decide whether it is fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sampled<T> {
    /// Last value observed from the probe.
    pub value: T,
    /// Whether the probe reported success before the deadline.
    pub converged: bool,
    /// Number of probe invocations.
    pub attempts: u32,
    /// Wall-clock time spent sampling.
    pub elapsed: Duration,
}

/// Repeatedly invoke `probe` until it reports success or `timeout` elapses.
///
/// Between unsuccessful attempts the loop sleeps `interval`, clamped to the
/// remaining budget so the final attempt lands on the deadline: a probe that
/// never converges is reported no earlier than `timeout` and no later than
/// `timeout + interval`. When `interval >= timeout` the loop degrades to an
/// initial attempt plus one at the deadline.
///
/// A probe error aborts the loop early and is surfaced distinctly from a
/// timeout.
pub async fn sample<T, F, Fut>(
    mut probe: F,
    timeout: Duration,
    interval: Duration,
) -> Result<Sampled<T>, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(T, bool), EngineError>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let (value, ok) = probe().await?;
        if ok {
            return Ok(Sampled {
                value,
                converged: true,
                attempts,
                elapsed: start.elapsed(),
            });
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Ok(Sampled {
                value,
                converged: false,
                attempts,
                elapsed,
            });
        }
        sleep(interval.min(timeout - elapsed)).await;
    }
}

/// Terminal result of a state wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateWait {
    /// Whether the resource reached the target state in time.
    pub reached: bool,
    /// Last status string observed.
    pub last_status: String,
    /// Number of status queries issued.
    pub attempts: u32,
    /// Wall-clock time spent waiting.
    pub elapsed: Duration,
}

/// Wait for a named resource's observable status to equal `target`
/// (case-sensitive string equality).
///
/// A query error aborts the wait: an unreachable status endpoint must not be
/// silently treated as "not yet converged".
pub async fn wait_for_state<P>(
    probe: &P,
    resource_id: &str,
    target: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<StateWait, EngineError>
where
    P: StatusProbe + ?Sized,
{
    let sampled = sample(
        // Shared refs are Copy, so each attempt's future owns its own copies
        // and the closure stays callable.
        move || async move {
            let status = probe.status(resource_id).await?;
            let ok = status == target;
            Ok((status, ok))
        },
        timeout,
        interval,
    )
    .await?;

    if sampled.converged {
        debug!(
            resource = resource_id,
            status = %sampled.value,
            attempts = sampled.attempts,
            "resource reached target state"
        );
    } else {
        warn!(
            resource = resource_id,
            target,
            last_status = %sampled.value,
            elapsed_ms = sampled.elapsed.as_millis() as u64,
            "resource did not reach target state before deadline"
        );
    }

    Ok(StateWait {
        reached: sampled.converged,
        last_status: sampled.value,
        attempts: sampled.attempts,
        elapsed: sampled.elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_already_satisfied_probe_returns_without_sleeping() {
        let start = Instant::now();
        let sampled = sample(
            || async { Ok((42u32, true)) },
            Duration::from_secs(60),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert!(sampled.converged);
        assert_eq!(sampled.value, 42);
        assert_eq!(sampled.attempts, 1);
        // Under the paused clock any sleep would advance time.
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_honored_within_one_interval() {
        let timeout = Duration::from_secs(30);
        let interval = Duration::from_secs(4);
        let start = Instant::now();

        let sampled = sample(|| async { Ok(((), false)) }, timeout, interval)
            .await
            .unwrap();

        assert!(!sampled.converged);
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout, "returned before deadline: {elapsed:?}");
        assert!(
            elapsed <= timeout + interval,
            "overshot deadline by more than one interval: {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_after_several_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_probe = Arc::clone(&calls);

        let sampled = sample(
            move || {
                let calls = Arc::clone(&calls_probe);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok((n, n >= 3))
                }
            },
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert!(sampled.converged);
        assert_eq!(sampled.attempts, 3);
        assert_eq!(sampled.value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_larger_than_timeout_degrades_to_final_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_probe = Arc::clone(&calls);
        let timeout = Duration::from_secs(5);

        let start = Instant::now();
        let sampled = sample(
            move || {
                let calls = Arc::clone(&calls_probe);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(((), false))
                }
            },
            timeout,
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        // One attempt up front, one at the deadline; the sleep is clamped to
        // the remaining budget instead of a full interval.
        assert!(!sampled.converged);
        assert_eq!(sampled.attempts, 2);
        assert_eq!(start.elapsed(), timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_aborts_distinct_from_timeout() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_probe = Arc::clone(&calls);

        let err = sample::<(), _, _>(
            move || {
                let calls = Arc::clone(&calls_probe);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<((), bool), _>(EngineError::Probe {
                        resource: "disk-1".to_string(),
                        message: "connection reset".to_string(),
                    })
                }
            },
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::Probe { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_state_reaches_target() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_probe = Arc::clone(&calls);
        let probe = move |_id: String| {
            let calls = Arc::clone(&calls_probe);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(if n >= 2 { "active" } else { "locked" }.to_string())
            }
        };

        let wait = wait_for_state(
            &probe,
            "disk-1",
            "active",
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert!(wait.reached);
        assert_eq!(wait.last_status, "active");
        assert_eq!(wait.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_state_timeout_reports_last_status() {
        let probe = |_id: String| async move { Ok("locked".to_string()) };

        let wait = wait_for_state(
            &probe,
            "disk-1",
            "active",
            Duration::from_secs(10),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert!(!wait.reached);
        assert_eq!(wait.last_status, "locked");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_state_fails_fast_on_query_error() {
        let probe = |id: String| async move {
            Err::<String, _>(EngineError::Probe {
                resource: id,
                message: "endpoint unreachable".to_string(),
            })
        };

        let err = wait_for_state(
            &probe,
            "disk-1",
            "active",
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert!(err.is_transport());
    }
}
