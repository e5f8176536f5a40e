use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;

/// Wraps any fallible async operation in exponential-backoff retries,
/// bounded by `max_tries` and wall-clock `max_time`; whichever bound
/// trips first surfaces the last error. All transport variants share
/// one invoker so transient failures never bubble past the connection.
#[derive(Clone, Debug)]
pub struct RetryInvoker {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Total attempts, the first one included. `None` = unbounded.
    pub max_tries: Option<u32>,
    /// Wall-clock budget across attempts. `None` = unbounded.
    pub max_time: Option<Duration>,
}

impl Default for RetryInvoker {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
            max_tries: Some(5),
            max_time: Some(Duration::from_secs(120)),
        }
    }
}

impl RetryInvoker {
    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            max_elapsed_time: self.max_time,
            ..ExponentialBackoff::default()
        }
    }

    /// Run `op` until it succeeds or a bound trips. Cancelling the
    /// surrounding task stops the loop at its next await point.
    pub async fn invoke<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut policy = self.policy();
        policy.reset();
        let mut tries: u32 = 0;
        loop {
            tries += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if self.max_tries.is_some_and(|max| tries >= max) {
                        return Err(err);
                    }
                    match policy.next_backoff() {
                        Some(delay) => {
                            tracing::debug!(%err, tries, ?delay, "transient failure, backing off");
                            tokio::time::sleep(delay).await;
                        }
                        // Wall-clock budget spent.
                        None => return Err(err),
                    }
                }
            }
        }
    }
}
