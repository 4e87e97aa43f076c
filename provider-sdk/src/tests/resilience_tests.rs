//! Tests for resilience patterns
//!
//! These tests verify that the retry and circuit breaker patterns compose
//! correctly inside the `Resilience` facade.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::error::{ErrorKind, Result, ServiceError};
    use crate::resilience::{
        AttemptReport, CircuitBreakerConfig, CircuitBreakerStatus, Resilience, RetryPolicy,
    };

    #[derive(Debug, Clone, PartialEq)]
    struct Seen {
        attempt: u32,
        kind: Option<ErrorKind>,
        trial: bool,
        latency: Duration,
    }

    fn resilience(threshold: u32, cooldown_secs: u64) -> Resilience {
        Resilience::new(
            "test",
            RetryPolicy::default(),
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(cooldown_secs),
                max_cooldown: Duration::from_secs(600),
            },
        )
    }

    fn recorder(seen: &Mutex<Vec<Seen>>) -> impl Fn(AttemptReport<'_>) + '_ {
        move |report| {
            seen.lock().unwrap().push(Seen {
                attempt: report.attempt,
                kind: report.error.map(ServiceError::kind),
                trial: report.trial,
                latency: report.latency,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let r = resilience(5, 30);
        let calls = AtomicU32::new(0);
        let seen = Mutex::new(Vec::new());

        let result = r
            .execute(
                Duration::from_secs(1),
                |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ServiceError::network("reset"))
                        } else {
                            Ok("done")
                        }
                    }
                },
                recorder(&seen),
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].kind, Some(ErrorKind::TransientNetwork));
        assert_eq!(seen[2].kind, None);
        assert_eq!(r.circuit_breaker().snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let r = resilience(5, 30);
        let calls = AtomicU32::new(0);
        let seen = Mutex::new(Vec::new());

        let result: Result<()> = r
            .execute(
                Duration::from_secs(1),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ServiceError::authentication("bad key")) }
                },
                recorder(&seen),
            )
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Rejected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.circuit_breaker_status(), CircuitBreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let r = resilience(5, 30);
        let seen = Mutex::new(Vec::new());

        let result: Result<()> = r
            .execute(
                Duration::from_millis(50),
                |_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                recorder(&seen),
            )
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|s| s.latency >= Duration::from_millis(50)));
        assert_eq!(r.circuit_breaker().snapshot().consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_mid_retry_stops_attempts() {
        let r = resilience(2, 30);
        let calls = AtomicU32::new(0);
        let seen = Mutex::new(Vec::new());

        let result: Result<()> = r
            .execute(
                Duration::from_secs(1),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ServiceError::service("503")) }
                },
                recorder(&seen),
            )
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::ProviderUnavailable);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].kind, Some(ErrorKind::ProviderUnavailable));
        assert_eq!(seen[2].latency, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_fails_fast_without_calling() {
        let r = resilience(1, 30);
        let _ = r
            .execute(
                Duration::from_secs(1),
                |_| async { Err::<(), _>(ServiceError::network("down")) },
                |_| {},
            )
            .await;
        assert_eq!(r.circuit_breaker_status(), CircuitBreakerStatus::Open);

        let calls = AtomicU32::new(0);
        let result: Result<()> = r
            .execute(
                Duration::from_secs(1),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                |_| {},
            )
            .await;

        assert!(matches!(result, Err(ServiceError::CircuitBroken(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_attempt_is_not_retried() {
        let r = resilience(1, 30);
        let _ = r
            .execute(
                Duration::from_secs(1),
                |_| async { Err::<(), _>(ServiceError::network("down")) },
                |_| {},
            )
            .await;

        tokio::time::advance(Duration::from_secs(30)).await;

        let calls = AtomicU32::new(0);
        let seen = Mutex::new(Vec::new());
        let result: Result<()> = r
            .execute(
                Duration::from_secs(1),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ServiceError::rate_limit("still busy")) }
                },
                recorder(&seen),
            )
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(seen.into_inner().unwrap()[0].trial);

        let snapshot = r.circuit_breaker().snapshot();
        assert_eq!(snapshot.status, CircuitBreakerStatus::Open);
        assert_eq!(snapshot.next_cooldown_ms, 60_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_trial_closes_breaker() {
        let r = resilience(1, 30);
        let _ = r
            .execute(
                Duration::from_secs(1),
                |_| async { Err::<(), _>(ServiceError::network("down")) },
                |_| {},
            )
            .await;

        tokio::time::advance(Duration::from_secs(31)).await;
        let result = r
            .execute(Duration::from_secs(1), |_| async { Ok(7) }, |_| {})
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(r.circuit_breaker_status(), CircuitBreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_reopens_breaker() {
        let r = resilience(1, 30);
        let _ = r
            .execute(
                Duration::from_secs(1),
                |_| async { Err::<(), _>(ServiceError::network("down")) },
                |_| {},
            )
            .await;
        tokio::time::advance(Duration::from_secs(30)).await;

        // The caller gives up while the trial is in flight
        let trial = r.execute(
            Duration::from_secs(10),
            |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            |_| {},
        );
        let _ = tokio::time::timeout(Duration::from_millis(100), trial).await;

        assert_eq!(r.circuit_breaker_status(), CircuitBreakerStatus::Open);
    }
}
