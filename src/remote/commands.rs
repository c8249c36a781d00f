//! Shell command builders for the remote queries the tailer issues.
//!
//! Commands stick to `wc`, `head` and `tail` so they run on busybox routers.

/// Quote a string for POSIX `sh` using single quotes
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Prints the byte size of the file; fails when the file is missing
pub fn size_query(path: &str) -> String {
    format!("wc -c < {}", shell_quote(path))
}

/// Prints the first line of the file, newline included when present
pub fn first_line_query(path: &str) -> String {
    format!("head -n 1 {}", shell_quote(path))
}

/// Prints `length` bytes starting at zero-based byte `start`
pub fn range_read(path: &str, start: u64, length: u64) -> String {
    format!(
        "tail -c +{} {} | head -c {}",
        start + 1,
        shell_quote(path),
        length
    )
}

/// Prints the whole file; only used for small files such as DHCP leases
pub fn read_file(path: &str) -> String {
    format!("cat {}", shell_quote(path))
}

/// Parse the output of [`size_query`]
pub fn parse_size(stdout: &[u8]) -> Option<u64> {
    std::str::from_utf8(stdout).ok()?.trim().parse().ok()
}
