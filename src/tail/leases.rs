//! Client hostnames from the log host's DHCP leases.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::retry::RetryPolicy;
use crate::remote::{commands, CommandChannel};
use crate::storage::{ClientName, StorageError};

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("client name lookup is not configured")]
    NotConfigured,

    #[error("failed to read leases file '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("failed to store client names: {0}")]
    Storage(#[from] StorageError),
}

/// Parse dnsmasq lease lines, `expiry mac ip hostname [client_id]`.
///
/// Leases without a hostname (`*`) and short lines are skipped. When an
/// address appears twice the later lease wins.
pub fn parse_leases(text: &str) -> Vec<ClientName> {
    let mut names = BTreeMap::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[3] == "*" {
            continue;
        }
        names.insert(fields[2].to_string(), fields[3].to_string());
    }

    names
        .into_iter()
        .map(|(ip, hostname)| ClientName { ip, hostname })
        .collect()
}

/// Reads the lease file over the command channel
pub struct LeaseReader {
    channel: Arc<dyn CommandChannel>,
    retry: RetryPolicy,
    timeout: Duration,
    path: String,
}

impl LeaseReader {
    pub fn new(
        channel: Arc<dyn CommandChannel>,
        retry: RetryPolicy,
        timeout: Duration,
        path: &str,
    ) -> Self {
        Self {
            channel,
            retry,
            timeout,
            path: path.to_string(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn read(&self) -> Result<Vec<ClientName>, LeaseError> {
        let output = self
            .retry
            .execute(
                self.channel.as_ref(),
                &commands::read_file(&self.path),
                self.timeout,
            )
            .await
            .map_err(|e| self.read_error(e.to_string()))?;

        if !output.success() {
            return Err(self.read_error(format!(
                "exit status {}: {}",
                output.status,
                output.stderr_lossy()
            )));
        }

        Ok(parse_leases(&String::from_utf8_lossy(&output.stdout)))
    }

    fn read_error(&self, reason: String) -> LeaseError {
        LeaseError::Read {
            path: self.path.clone(),
            reason,
        }
    }
}
