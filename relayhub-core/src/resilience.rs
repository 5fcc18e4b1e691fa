//! Timeout and retry policy shared by everything that talks to the broker

pub mod timeout {
    //! Timeout defaults for external calls

    use std::time::Duration;

    /// Default timeout for Redis operations (ping, publish, SET, DEL, SUBSCRIBE)
    pub const REDIS_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default per-write deadline on a client stream
    pub const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default read inactivity deadline on a client stream
    pub const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(60);
}

pub mod retry {
    //! Linear retry policy
    //!
    //! Failed attempt `n` (1-based) waits `n * unit` before the next one, so
    //! with the default one-second unit the waits are 1s, 2s, 3s, ...

    use std::future::Future;
    use std::time::Duration;

    /// Backoff to wait after the given failed attempt (1-based)
    #[must_use]
    pub fn linear_backoff(attempt: u32, unit: Duration) -> Duration {
        unit.saturating_mul(attempt)
    }

    /// Run `op` up to `max_attempts` times, sleeping a linearly growing backoff
    /// between attempts. Returns the last error once the budget is exhausted.
    /// A budget of zero still makes one attempt.
    pub async fn with_linear_backoff<T, E, F, Fut>(
        max_attempts: u32,
        unit: Duration,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => return Err(e),
                Err(_) => {
                    tokio::time::sleep(linear_backoff(attempt, unit)).await;
                    attempt += 1;
                }
            }
        }
    }
}
