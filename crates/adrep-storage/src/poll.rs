//! Poll-until-ready loop shared by every long-running remote report.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Growing sleep between attempts: `initial_delay * multiplier^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
            max_attempts: 60,
        }
    }
}

impl PollPolicy {
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            max_attempts,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt_index.min(64) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus<T> {
    Pending,
    Ready(T),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PollError {
    #[error("{what} not ready after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },
    #[error("{what} failed: {reason}")]
    Failed { what: String, reason: String },
}

/// Call `check` until it reports ready or failed, sleeping per `policy` in between.
///
/// Running out of attempts is an error, never a silent success.
pub async fn poll_until<T, E, F, Fut>(policy: &PollPolicy, what: &str, mut check: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, E>>,
    E: From<PollError>,
{
    let attempts = policy.max_attempts.max(1);
    info!(what, max_attempts = attempts, "polling for completion");

    for attempt in 0..attempts {
        match check(attempt + 1).await? {
            PollStatus::Ready(value) => {
                info!(what, attempt = attempt + 1, "ready");
                return Ok(value);
            }
            PollStatus::Failed(reason) => {
                return Err(PollError::Failed {
                    what: what.to_string(),
                    reason,
                }
                .into());
            }
            PollStatus::Pending => {
                info!(what, attempt = attempt + 1, max_attempts = attempts, "still processing");
                if attempt + 1 < attempts {
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                }
            }
        }
    }

    warn!(what, attempts, "gave up waiting");
    Err(PollError::Timeout {
        what: what.to_string(),
        attempts,
    }
    .into())
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn quick(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 1.5,
            max_delay: Duration::from_millis(2),
            max_attempts,
        }
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = PollPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(7500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(11250));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(60));
    }

    #[test]
    fn fixed_policy_never_grows() {
        let policy = PollPolicy::fixed(Duration::from_secs(10), 60);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn returns_value_once_ready() {
        let calls = Cell::new(0u32);
        let result: Result<&str, PollError> = poll_until(&quick(5), "report run", |attempt| {
            calls.set(calls.get() + 1);
            async move {
                Ok(if attempt < 3 {
                    PollStatus::Pending
                } else {
                    PollStatus::Ready("results/7")
                })
            }
        })
        .await;
        assert_eq!(result, Ok("results/7"));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn exhausting_attempts_is_a_timeout() {
        let calls = Cell::new(0u32);
        let result: Result<(), PollError> = poll_until(&quick(4), "report run", |_| {
            calls.set(calls.get() + 1);
            async { Ok(PollStatus::Pending) }
        })
        .await;
        assert_eq!(
            result,
            Err(PollError::Timeout {
                what: "report run".into(),
                attempts: 4
            })
        );
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn remote_failure_stops_polling() {
        let result: Result<(), PollError> = poll_until(&quick(10), "request report", |_| async {
            Ok(PollStatus::Failed("status Failed".into()))
        })
        .await;
        assert!(matches!(result, Err(PollError::Failed { .. })));
    }
}
