//! Retry with a fixed schedule of jittered delays.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Delays slept after each failed attempt; one attempt per delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// 1, 2, 4, 8, 16 seconds. Used to repair a dropped connection.
    Quick,
    /// 0.5, 1, 2, 4, 8, 16, 30 seconds. Used for the first connect.
    Standard,
}

const QUICK_MS: &[u64] = &[1_000, 2_000, 4_000, 8_000, 16_000];
const STANDARD_MS: &[u64] = &[500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000];

/// Each delay is scaled by a random factor in `1 ± JITTER`.
const JITTER: f64 = 0.2;

impl Strategy {
    pub fn delays(self) -> impl Iterator<Item = Duration> {
        let ms = match self {
            Strategy::Quick => QUICK_MS,
            Strategy::Standard => STANDARD_MS,
        };
        ms.iter().map(|ms| Duration::from_millis(*ms))
    }

    pub fn attempts(self) -> usize {
        self.delays().count()
    }
}

pub fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
    delay.mul_f64(factor)
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("retry cancelled")]
    Cancelled,

    #[error("failed after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: E },
}

/// Runs `op` until it succeeds, the strategy runs out, or `cancel` fires.
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    strategy: Strategy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = strategy.attempts();
    let mut last = None;

    for (index, delay) in strategy.delays().enumerate() {
        let attempt = index + 1;
        let result = tokio::select! {
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op(attempt) => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) => {
                let delay = jittered(delay);
                tracing::warn!(
                    attempt,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed"
                );
                last = Some(e);
                tokio::select! {
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    match last {
        Some(last) => Err(RetryError::Exhausted { attempts, last }),
        None => Err(RetryError::Cancelled),
    }
}
