use async_trait::async_trait;
use std::time::Duration;

use super::{run_process, ChannelError, CommandChannel, CommandOutput};

/// Runs commands through `sh -c` on this machine
#[derive(Debug, Default, Clone)]
pub struct LocalShellChannel;

impl LocalShellChannel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandChannel for LocalShellChannel {
    async fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, ChannelError> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        run_process(cmd, timeout).await
    }

    fn host(&self) -> &str {
        "localhost"
    }
}
