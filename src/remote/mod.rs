//! Remote command execution.
//!
//! The tailer only ever needs "run this shell command on the log host and give
//! me its exit status and output". Everything about how the host is reached
//! lives behind [`CommandChannel`].

pub mod commands;
pub mod local;
pub mod ssh;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::types::{RemoteConfig, Transport};

pub use local::LocalShellChannel;
pub use ssh::SshChannel;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to spawn remote command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Result of one command invocation
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit status; `-1` when the process was terminated by a signal
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Synchronous request/response execution of a shell command against a fixed host
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ChannelError>;

    /// Human readable name of the host, for logs
    fn host(&self) -> &str;
}

/// Build the channel selected by the config
pub fn channel_from_config(config: &RemoteConfig) -> Arc<dyn CommandChannel> {
    match config.transport {
        Transport::Ssh => Arc::new(SshChannel::new(config)),
        Transport::Local => Arc::new(LocalShellChannel::new()),
    }
}

/// Run a prepared process, enforcing the timeout and collecting its output
pub(crate) async fn run_process(
    mut cmd: tokio::process::Command,
    timeout: Duration,
) -> Result<CommandOutput, ChannelError> {
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        }),
        Ok(Err(e)) => Err(ChannelError::Transport(e.to_string())),
        // Dropping the future drops the child, which kills it
        Err(_) => Err(ChannelError::Timeout(timeout)),
    }
}
