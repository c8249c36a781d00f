pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# QUERYTAIL CONFIGURATION
# =============================================================================
# Pulls line-delimited JSON logs from a remote host over ssh, incrementally,
# and stores them in a local DuckDB database.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/querytail/config.yml
#   3. /etc/querytail/config.yml
#
# Any value may reference an environment variable as $env{NAME}.

# =============================================================================
# REMOTE HOST
# =============================================================================
remote:
  # 'ssh' runs commands on host via the ssh binary (keys/agent handle auth)
  # 'local' runs them through sh -c on this machine
  transport: ssh
  host: $env{ROUTER_SSH_HOST}
  port: 22
  user: root
  # Applied to every remote command (size probe, first line, chunk read)
  command_timeout: 30s
  ssh_options:
    - ConnectTimeout=10

# =============================================================================
# FETCH BEHAVIOUR
# =============================================================================
fetch:
  # Upper bound on bytes pulled per remote read
  chunk_bytes: 4194304
  # Lines longer than this are discarded as malformed instead of buffered
  max_line_bytes: 1048576
  retry:
    # Attempts per remote command on transport failure (1 = no retry)
    max_attempts: 3
    initial_backoff: 500ms
    max_backoff: 10s
  # 'timestamp': entries sharing a timestamp collapse to one
  # 'timestamp_and_content': only identical entries collapse
  dedup: timestamp

# =============================================================================
# SOURCES
# =============================================================================
# Each source lists its remote files, current file first, then rotated ones.
# File names (basenames) must be unique within a source.
sources:
  querylog:
    description: DNS Query Log
    remote_files:
      - /opt/AdGuardHome/data/querylog.json
      - /opt/AdGuardHome/data/querylog.json.1
    # JSON field holding a lexically sortable timestamp
    timestamp_field: T
    # Stream name the entries are stored under
    destination: querylog

# =============================================================================
# CLIENT NAMES
# =============================================================================
# Hostnames from the host's DHCP leases, refreshed after every 'fetch' and via
# POST /api/clients/refresh. Queries can use them as client_name(<ip field>).
clients:
  leases_file: /var/lib/misc/dnsmasq.leases

# =============================================================================
# SUMMARIES
# =============================================================================
# Named aggregates served at POST /api/summaries/<name>. Fields are JSON paths
# or derived values: base_domain(<field>) groups sub.example.co.uk under
# example.co.uk, client_name(<field>) looks up the DHCP hostname.
summaries:
  query-log-summary:
    description: Queries per client and domain
    destination: querylog
    group_by: [IP, client_name(IP), QH, QT, CP, Result.IsFiltered]
  domain-summary:
    description: Queries per domain
    destination: querylog
    group_by: [QH, QT, CP, Result.IsFiltered]
  base-domain-summary:
    description: Queries per base domain
    destination: querylog
    group_by: [base_domain(QH), QT, CP, Result.IsFiltered]

# =============================================================================
# STORAGE
# =============================================================================
storage:
  path: ~/.local/share/querytail/querytail.duckdb

# =============================================================================
# WEB API
# =============================================================================
web:
  listen: 0.0.0.0:8080
"#
    .to_string()
}
