//! Scripted in-memory stand-in for a remote host.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crate::remote::{ChannelError, CommandChannel, CommandOutput};

/// Answers the size, first-line, range and cat commands against an in-memory file map
#[derive(Default)]
pub struct MemoryChannel {
    files: Mutex<HashMap<String, Vec<u8>>>,
    unreachable: Mutex<HashSet<String>>,
    /// Range reads allowed before every further range read fails
    range_budget: Mutex<Option<usize>>,
    /// Transport failures to inject before commands start succeeding
    transient_failures: Mutex<usize>,
    commands: Mutex<Vec<String>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
    }

    pub fn append(&self, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .extend_from_slice(content);
    }

    pub fn set_unreachable(&self, path: &str) {
        self.unreachable.lock().unwrap().insert(path.to_string());
    }

    pub fn fail_range_reads_after(&self, successful: usize) {
        *self.range_budget.lock().unwrap() = Some(successful);
    }

    pub fn fail_next(&self, count: usize) {
        *self.transient_failures.lock().unwrap() = count;
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn range_reads(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with("tail -c"))
            .collect()
    }

    fn answer(&self, command: &str) -> Result<CommandOutput, ChannelError> {
        let size_re = Regex::new(r"^wc -c < '(.*)'$").unwrap();
        let head_re = Regex::new(r"^head -n 1 '(.*)'$").unwrap();
        let cat_re = Regex::new(r"^cat '(.*)'$").unwrap();
        let range_re = Regex::new(r"^tail -c \+(\d+) '(.*)' \| head -c (\d+)$").unwrap();

        let path = [&size_re, &head_re, &cat_re]
            .iter()
            .find_map(|re| re.captures(command).map(|c| c[1].to_string()))
            .or_else(|| range_re.captures(command).map(|c| c[2].to_string()))
            .ok_or_else(|| ChannelError::Transport(format!("unexpected command: {}", command)))?;

        if self.unreachable.lock().unwrap().contains(&path) {
            return Err(ChannelError::Timeout(Duration::from_secs(1)));
        }

        let files = self.files.lock().unwrap();
        let content = files.get(&path);

        if size_re.is_match(command) {
            return Ok(match content {
                Some(bytes) => ok(format!("{}\n", bytes.len()).into_bytes()),
                None => missing(),
            });
        }

        if cat_re.is_match(command) {
            return Ok(match content {
                Some(bytes) => ok(bytes.clone()),
                None => missing(),
            });
        }

        if head_re.is_match(command) {
            return Ok(match content {
                Some(bytes) => {
                    let end = bytes
                        .iter()
                        .position(|&b| b == b'\n')
                        .map(|i| i + 1)
                        .unwrap_or(bytes.len());
                    ok(bytes[..end].to_vec())
                }
                None => missing(),
            });
        }

        let caps = range_re.captures(command).unwrap();
        {
            let mut budget = self.range_budget.lock().unwrap();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    return Err(ChannelError::Transport("connection reset".to_string()));
                }
                *remaining -= 1;
            }
        }
        let start: usize = caps[1].parse::<usize>().unwrap() - 1;
        let length: usize = caps[3].parse().unwrap();
        Ok(match content {
            Some(bytes) if start < bytes.len() => {
                let end = (start + length).min(bytes.len());
                ok(bytes[start..end].to_vec())
            }
            _ => ok(Vec::new()),
        })
    }
}

fn ok(stdout: Vec<u8>) -> CommandOutput {
    CommandOutput {
        status: 0,
        stdout,
        stderr: Vec::new(),
    }
}

fn missing() -> CommandOutput {
    CommandOutput {
        status: 1,
        stdout: Vec::new(),
        stderr: b"No such file or directory".to_vec(),
    }
}

#[async_trait]
impl CommandChannel for MemoryChannel {
    async fn execute(&self, command: &str, _timeout: Duration) -> Result<CommandOutput, ChannelError> {
        self.commands.lock().unwrap().push(command.to_string());
        {
            let mut transient = self.transient_failures.lock().unwrap();
            if *transient > 0 {
                *transient -= 1;
                return Err(ChannelError::Transport("temporary failure".to_string()));
            }
        }
        self.answer(command)
    }

    fn host(&self) -> &str {
        "memory"
    }
}
