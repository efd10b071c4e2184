//! Bounded retry with a fixed pause, plus the shared circuit-status fetch
//! used by the health monitor, the stream reconciler and the session

use crate::control::{CircuitStatus, ControlChannel, ControlError};
use crate::notify::{Notification, NotificationSink};
use anonroute_common::{retry, RouterError};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Attempt budget and pause between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Circuit status queries
    pub const fn status() -> Self {
        Self::new(retry::STATUS_ATTEMPTS, Duration::from_millis(retry::STATUS_DELAY_MS))
    }

    /// Country population
    pub const fn geo() -> Self {
        Self::new(retry::GEO_ATTEMPTS, Duration::from_millis(retry::GEO_DELAY_MS))
    }

    /// Relay info lookups, back to back
    pub const fn relay_info() -> Self {
        Self::new(retry::RELAY_INFO_ATTEMPTS, Duration::ZERO)
    }

    /// Run `op` until it succeeds, `should_retry` refuses an error, or the
    /// attempt budget runs out
    pub async fn run<T, E, F, Fut, P>(
        &self,
        label: &str,
        mut should_retry: P,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "Recovered after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !should_retry(&e) => return Err(RetryError::Aborted(e)),
                Err(e) if attempt >= max_attempts => {
                    warn!(label, attempt, max_attempts, "Giving up: {}", e);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    debug!(label, attempt, max_attempts, "Attempt failed, retrying: {}", e);
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last: E },

    /// A non-retryable error ended the loop early
    Aborted(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Aborted(e) => e,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Message pushed when the control connection cannot be re-established
pub const CONNECTION_LOST_MESSAGE: &str = "Control connection lost. Please restart the proxy.";

/// Fetch circuit status, absorbing transient control-channel failures
///
/// Malformed replies are retried per `policy` and degrade to an empty list.
/// A lost connection gets one re-authentication and one more query; if the
/// re-authentication fails a `proxy-error` is pushed. Other errors propagate.
pub async fn fetch_circuit_status(
    control: &dyn ControlChannel,
    notifier: &dyn NotificationSink,
    policy: RetryPolicy,
) -> Result<Vec<CircuitStatus>, RouterError> {
    let first = policy
        .run("circuit-status", ControlError::is_malformed, |_| {
            control.circuit_status()
        })
        .await;

    let err = match first {
        Ok(circuits) => return Ok(circuits),
        Err(RetryError::Exhausted { attempts, last }) => {
            warn!(attempts, "Circuit status unreadable, treating as empty: {}", last);
            return Ok(Vec::new());
        }
        Err(RetryError::Aborted(err)) => err,
    };

    if !err.is_connection_lost() {
        return Err(err.into());
    }

    info!("Control connection lost, re-authenticating: {}", err);
    if let Err(auth_err) = control.authenticate().await {
        error!("Re-authentication failed: {}", auth_err);
        notifier.notify(Notification::proxy_error(CONNECTION_LOST_MESSAGE));
        return Err(RouterError::ReauthenticationFailure(auth_err.to_string()));
    }

    match control.circuit_status().await {
        Ok(circuits) => Ok(circuits),
        Err(e) if e.is_malformed() => {
            warn!("Circuit status unreadable after reconnect, treating as empty: {}", e);
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::fake::{built_circuit, FakeControl};
    use crate::notify::recorder::RecordingNotifier;
    use anonroute_common::ControlErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, RetryError<String>> = RetryPolicy::status()
            .run("test", |_| true, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {}", attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_non_retryable() {
        let result: Result<(), RetryError<&str>> = RetryPolicy::geo()
            .run("test", |e| *e != "fatal", |_| async { Err("fatal") })
            .await;
        assert_eq!(result.unwrap_err(), RetryError::Aborted("fatal"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_with_last_error() {
        let start = tokio::time::Instant::now();
        let result: Result<(), RetryError<&str>> = RetryPolicy::geo()
            .run("test", |_| true, |_| async { Err("nope") })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.into_inner(), "nope");
        // Two pauses between three attempts
        assert_eq!(start.elapsed(), Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_twice_then_success_is_silent() {
        let control = FakeControl::standard();
        control.add_circuit(built_circuit(7, &[10, 20, 1]));
        control.fail_status_with([
            ControlError::malformed("got ''"),
            ControlError::malformed("got ''"),
        ]);
        let notifier = RecordingNotifier::default();

        let circuits = fetch_circuit_status(&control, &notifier, RetryPolicy::status())
            .await
            .unwrap();

        assert_eq!(circuits.len(), 1);
        assert_eq!(control.status_calls(), 3);
        assert!(notifier.all().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_exhaustion_degrades_to_empty() {
        let control = FakeControl::standard();
        control.add_circuit(built_circuit(7, &[10, 20, 1]));
        control.fail_status_with((0..3).map(|_| ControlError::malformed("got ''")));
        let notifier = RecordingNotifier::default();

        let circuits = fetch_circuit_status(&control, &notifier, RetryPolicy::status())
            .await
            .unwrap();

        assert!(circuits.is_empty());
        assert!(notifier.all().is_empty());
    }

    #[tokio::test]
    async fn connection_lost_reauthenticates_once() {
        let control = FakeControl::standard();
        control.add_circuit(built_circuit(7, &[10, 20, 1]));
        control.fail_status_with([ControlError::connection_lost("Connection refused")]);
        let notifier = RecordingNotifier::default();

        let circuits = fetch_circuit_status(&control, &notifier, RetryPolicy::status())
            .await
            .unwrap();

        assert_eq!(circuits.len(), 1);
        assert_eq!(control.auth_calls(), 1);
        assert_eq!(control.status_calls(), 2);
    }

    #[tokio::test]
    async fn failed_reauthentication_notifies() {
        let control = FakeControl::standard();
        control.fail_auth();
        control.fail_status_with([ControlError::connection_lost("Connection refused")]);
        let notifier = RecordingNotifier::default();

        let err = fetch_circuit_status(&control, &notifier, RetryPolicy::status())
            .await
            .unwrap_err();

        assert!(matches!(err, RouterError::ReauthenticationFailure(_)));
        assert_eq!(notifier.channels(), vec!["proxy-error"]);
    }

    #[tokio::test]
    async fn other_errors_propagate() {
        let control = FakeControl::standard();
        control.fail_status_with([ControlError::rejected("510 Unrecognized command")]);
        let notifier = RecordingNotifier::default();

        let err = fetch_circuit_status(&control, &notifier, RetryPolicy::status())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RouterError::ControlChannel {
                kind: ControlErrorKind::Rejected,
                ..
            }
        ));
        assert_eq!(control.auth_calls(), 0);
    }
}
