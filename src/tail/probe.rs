use std::sync::Arc;
use std::time::Duration;

use super::retry::RetryPolicy;
use crate::remote::{commands, CommandChannel, CommandOutput};

/// What a remote file looked like at probe time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Missing, unreadable, or the host could not be reached
    NotFound { reason: String },
    Empty,
    Present { size: u64, first_line: String },
}

/// Queries existence, byte size and first line of a remote file.
///
/// Never fails: any problem is folded into [`ProbeResult::NotFound`] so a file
/// that vanished between polls is simply skipped.
#[derive(Clone)]
pub struct RemoteFileProbe {
    channel: Arc<dyn CommandChannel>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl RemoteFileProbe {
    pub fn new(channel: Arc<dyn CommandChannel>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            channel,
            retry,
            timeout,
        }
    }

    pub async fn probe(&self, path: &str) -> ProbeResult {
        let size_output = match self.run(&commands::size_query(path)).await {
            Ok(output) => output,
            Err(reason) => return ProbeResult::NotFound { reason },
        };

        let size = match commands::parse_size(&size_output.stdout) {
            Some(size) => size,
            None => {
                return ProbeResult::NotFound {
                    reason: format!(
                        "unexpected size output: {:?}",
                        String::from_utf8_lossy(&size_output.stdout)
                    ),
                }
            }
        };

        if size == 0 {
            return ProbeResult::Empty;
        }

        let head_output = match self.run(&commands::first_line_query(path)).await {
            Ok(output) => output,
            Err(reason) => return ProbeResult::NotFound { reason },
        };

        ProbeResult::Present {
            size,
            first_line: strip_line_ending(&head_output.stdout),
        }
    }

    async fn run(&self, command: &str) -> Result<CommandOutput, String> {
        let output = self
            .retry
            .execute(self.channel.as_ref(), command, self.timeout)
            .await
            .map_err(|e| e.to_string())?;

        if output.success() {
            Ok(output)
        } else {
            Err(format!(
                "exit status {}: {}",
                output.status,
                output.stderr_lossy()
            ))
        }
    }
}

fn strip_line_ending(bytes: &[u8]) -> String {
    let line = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
