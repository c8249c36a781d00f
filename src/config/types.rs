use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub remote: RemoteConfig,
    #[serde(default)]
    pub fetch: FetchSettings,
    pub sources: BTreeMap<String, SourceConfig>,
    /// IP to hostname lookup from the host's DHCP leases
    #[serde(default)]
    pub clients: Option<ClientsConfig>,
    /// Named aggregate presets served at `/api/summaries/{name}`
    #[serde(default)]
    pub summaries: BTreeMap<String, SummaryConfig>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Extra `-o` options handed to ssh, e.g. `ConnectTimeout=10`
    #[serde(default)]
    pub ssh_options: Vec<String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Ssh,
    /// Run commands through `sh -c` on this machine
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSettings {
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: u64,
    /// Longest line kept in memory; longer lines are discarded as malformed
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dedup: DedupMode,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            chunk_bytes: default_chunk_bytes(),
            max_line_bytes: default_max_line_bytes(),
            retry: RetryConfig::default(),
            dedup: DedupMode::default(),
        }
    }
}

fn default_chunk_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_max_line_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

/// Key used to collapse duplicate entries after merging all files of a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    /// Entries sharing a timestamp are duplicates; the first in sort order wins
    #[default]
    Timestamp,
    /// Timestamp plus a hash of the entry content
    TimestampAndContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub description: Option<String>,
    /// Current file first, then rotated files
    pub remote_files: Vec<String>,
    pub timestamp_field: String,
    pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientsConfig {
    /// dnsmasq lease file: `expiry mac ip hostname [client_id]` per line
    #[serde(default = "default_leases_file")]
    pub leases_file: String,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            leases_file: default_leases_file(),
        }
    }
}

fn default_leases_file() -> String {
    "/var/lib/misc/dnsmasq.leases".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    #[serde(default)]
    pub description: Option<String>,
    pub destination: String,
    /// Field references, e.g. `IP`, `client_name(IP)`, `base_domain(QH)`
    pub group_by: Vec<String>,
    #[serde(default)]
    pub sum_field: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
