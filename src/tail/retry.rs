use std::future::Future;
use std::time::Duration;

use crate::config::types::RetryConfig;
use crate::remote::{ChannelError, CommandChannel, CommandOutput};

/// Bounded exponential backoff around remote commands.
///
/// Only transport failures and timeouts are retried. A command that ran and
/// exited non-zero produced a real answer (e.g. "no such file") and is
/// returned as-is.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
        }
    }

    /// A policy that makes exactly one attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    pub async fn run<F, Fut, T>(&self, what: &str, mut operation: F) -> Result<T, ChannelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChannelError>>,
    {
        let mut attempts = 0;
        let mut backoff = self.initial_backoff;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.max_attempts {
                        if self.max_attempts > 1 {
                            tracing::warn!(
                                operation = what,
                                attempts = attempts,
                                error = %e,
                                "Remote command failed, giving up"
                            );
                        }
                        return Err(e);
                    }

                    tracing::debug!(
                        operation = what,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Remote command failed, retrying"
                    );

                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.max_backoff);
                }
            }
        }
    }

    /// Execute one command on the channel under this policy
    pub async fn execute(
        &self,
        channel: &dyn CommandChannel,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, ChannelError> {
        self.run(command, || channel.execute(command, timeout)).await
    }
}
