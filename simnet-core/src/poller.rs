//! Bounded retry loops.
//!
//! Two flavors: [`poll_until`] repeats a probe until it observes a value
//! (existence polling) and fails with [`Error::ReadinessTimeout`]; [`retry`]
//! repeats an operation while its error is transient and gives back the last
//! error when attempts run out.

use backoff::Error as BackoffError;
use log::*;
use std::future::Future;

use crate::config::RetryPolicy;
use crate::error::{Error, Result};

fn describe_max(policy: &RetryPolicy) -> String {
    match policy.max_attempts {
        Some(max) => max.to_string(),
        None => "∞".to_string(),
    }
}

/// Repeat `probe` until it yields `Some`.  Probe errors count as failed
/// attempts.  The closure gets the attempt number, starting at 1.
pub async fn poll_until<T, F, Fut>(policy: &RetryPolicy, what: &str, mut probe: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let mut attempt = 0u32;
    backoff::future::retry(policy.backoff(), || {
        attempt += 1;
        let n = attempt;
        let fut = probe(n);
        async move {
            let reason = match fut.await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => "not ready".to_string(),
                Err(e) => e.to_string(),
            };
            info!("waiting for {} ({}/{}): {}", what, n, describe_max(policy), reason);
            if policy.exhausted(n) {
                return Err(BackoffError::permanent(Error::ReadinessTimeout {
                    what: what.to_string(),
                    attempts: n,
                }));
            }
            Err(BackoffError::transient(Error::ReadinessTimeout {
                what: what.to_string(),
                attempts: n,
            }))
        }
    })
    .await
}

/// Repeat `op` while it fails with a transient error
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    backoff::future::retry(policy.backoff(), || {
        attempt += 1;
        let n = attempt;
        let fut = op(n);
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(e) if !e.is_transient() => Err(BackoffError::permanent(e)),
                Err(e) if policy.exhausted(n) => {
                    error!("{}: giving up after {} attempts: {}", what, n, e);
                    Err(BackoffError::permanent(e))
                }
                Err(e) => {
                    warn!("{} ({}/{}): {}, trying again", what, n, describe_max(policy), e);
                    Err(BackoffError::transient(e))
                }
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_log::test;

    fn empty(n: u32) -> Error {
        Error::EmptyResponse { target: "alice".into(), command: format!("probe {}", n) }
    }

    #[test(tokio::test)]
    async fn poll_until_succeeds_eventually() {
        let value = poll_until(&RetryPolicy::immediate(5), "alice", |n| async move {
            Ok(if n == 3 { Some(n * 10) } else { None })
        })
        .await
        .unwrap();
        assert_eq!(value, 30);
    }

    #[test(tokio::test)]
    async fn poll_until_times_out() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = poll_until(&RetryPolicy::immediate(4), "alice", |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(empty(n)) }
        })
        .await;
        match result {
            Err(Error::ReadinessTimeout { what, attempts }) => {
                assert_eq!(what, "alice");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test(tokio::test)]
    async fn retry_returns_last_transient_error() {
        let result: Result<()> =
            retry(&RetryPolicy::immediate(3), "getinfo", |n| async move { Err(empty(n)) }).await;
        match result {
            Err(Error::EmptyResponse { command, .. }) => assert_eq!(command, "probe 3"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test(tokio::test)]
    async fn retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&RetryPolicy::immediate(10), "openchannel", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Validation("negative amount".into())) }
        })
        .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn unbounded_retry_keeps_going() {
        let policy = RetryPolicy { max_attempts: None, ..RetryPolicy::immediate(1) };
        let value = retry(&policy, "listpeers", |n| async move {
            if n < 50 {
                Err(empty(n))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 50);
    }
}
