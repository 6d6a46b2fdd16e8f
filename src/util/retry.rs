use std::future::Future;
use std::time::Duration;

use anyhow::bail;
use tokio::time::sleep;
use tracing::debug;

/// Delays between consecutive attempts: starting at an initial delay, doubling after every
///  failed attempt
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    next_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration) -> Self {
        ExponentialBackoff {
            next_delay: initial_delay,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let result = self.next_delay;
        self.next_delay = self.next_delay.saturating_mul(2);
        result
    }
}

/// Calls `op` up to `max_attempts` times until it succeeds, waiting with exponential backoff
///  between attempts. Returns the last error if all attempts fail.
pub async fn retry<T, F, Fut>(max_attempts: usize, initial_delay: Duration, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if max_attempts == 0 {
        bail!("retry requires at least one attempt");
    }

    let mut backoff = ExponentialBackoff::new(initial_delay);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = backoff.next_delay();
                debug!("attempt {} of {} failed, retrying in {:?}: {}", attempt, max_attempts, delay, e);
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
