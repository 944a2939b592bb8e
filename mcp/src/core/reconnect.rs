//! Reconnection of dropped backends with exponential backoff.

use std::{future::Future, time::Duration};

use tracing::{debug, info, warn};

use crate::error::{McpError, McpResult};

/// Retry budget for re-opening a backend connection.
///
/// Attempt `n` that fails waits `min(base_delay * 2^(n-1), max_delay)` before
/// attempt `n + 1`. Errors that a retry cannot fix end the loop at once.
#[derive(Debug, Clone)]
pub struct ReconnectionManager {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectionManager {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let Some(exponent) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        self.base_delay
            .saturating_mul(1u32 << exponent.min(31))
            .min(self.max_delay)
    }

    /// Call `connect` until it succeeds or the budget runs out. Returns the
    /// last error on failure.
    pub async fn reconnect<F, Fut, T>(&self, server_name: &str, mut connect: F) -> McpResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = McpResult<T>>,
    {
        if self.max_retries == 0 {
            return Err(McpError::ConnectionFailed(format!(
                "reconnecting to '{}' is disabled (max_retries = 0)",
                server_name
            )));
        }

        let mut attempt = 1;
        loop {
            let err = match connect().await {
                Ok(value) => {
                    info!(server = %server_name, attempt, "Reconnected to MCP server");
                    return Ok(value);
                }
                Err(e) => e,
            };

            if err.is_permanent() || attempt >= self.max_retries {
                warn!(
                    server = %server_name,
                    attempt,
                    permanent = err.is_permanent(),
                    "Giving up reconnecting: {}",
                    err
                );
                return Err(err);
            }

            let delay = self.calculate_backoff(attempt);
            debug!(
                "Reconnect attempt {} for '{}' failed: {}. Retrying in {:?}",
                attempt, server_name, err, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
