use async_trait::async_trait;
use std::time::Duration;

use super::{run_process, ChannelError, CommandChannel, CommandOutput};
use crate::config::types::RemoteConfig;

/// ssh exits with 255 when the connection itself failed
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Executes commands on a fixed host through the system `ssh` binary.
///
/// Authentication is left to ssh (keys, agent, `~/.ssh/config`); `BatchMode`
/// keeps it from ever prompting.
#[derive(Debug, Clone)]
pub struct SshChannel {
    host: String,
    port: u16,
    user: String,
    options: Vec<String>,
}

impl SshChannel {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            options: config.ssh_options.clone(),
        }
    }

    fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }

    fn build_args(&self, command: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(self.destination());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl CommandChannel for SshChannel {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ChannelError> {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(self.build_args(command));

        let output = run_process(cmd, timeout).await?;
        if output.status == SSH_CONNECTION_FAILURE {
            return Err(ChannelError::Transport(format!(
                "ssh to {} failed: {}",
                self.destination(),
                output.stderr_lossy()
            )));
        }
        Ok(output)
    }

    fn host(&self) -> &str {
        &self.host
    }
}
