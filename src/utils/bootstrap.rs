//! Bootstrap utilities for relay binaries.

use std::future::Future;
use std::time::Duration;

use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing from the RELAY_LOG environment variable.
///
/// Defaults to "info" level if RELAY_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Backoff schedule for [`connect_with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn next_delay(&self, delay: Duration) -> Duration {
        std::cmp::min(delay * 2, self.max_delay)
    }
}

/// Connect to the log store with exponential backoff.
///
/// Only the initial connection is retried. Once a relay is running, a lost
/// change stream is terminal for its adapters.
pub async fn connect_with_retry<T, E, F, Fut>(
    endpoint: &str,
    policy: RetryPolicy,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(connected) => {
                tracing::info!(endpoint = %endpoint, attempt, "Connected to log store");
                return Ok(connected);
            }
            Err(e) if attempt < policy.max_attempts => {
                warn!(
                    endpoint = %endpoint,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    delay = ?delay,
                    "Log store connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = policy.next_delay(delay);
            }
            Err(e) => {
                tracing::error!(
                    endpoint = %endpoint,
                    attempts = policy.max_attempts,
                    error = %e,
                    "Giving up on log store connection"
                );
                return Err(e);
            }
        }
    }
}
