use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

use super::file_key;
use super::leases::{LeaseError, LeaseReader};
use super::lines::{Line, LineReconstructor};
use super::parser::{EntryParser, LineOutcome, RawEntry};
use super::probe::{ProbeResult, RemoteFileProbe};
use super::reader::ChunkedRangeReader;
use super::retry::RetryPolicy;
use super::state::{FileState, SourceState, StateError, StateStore};
use crate::config::types::{DedupMode, SourceConfig};
use crate::config::Config;
use crate::remote::CommandChannel;
use crate::storage::{Storage, StorageError};

const MALFORMED_PREVIEW_CHARS: usize = 120;

/// Everything the orchestrator needs, resolved from [`Config`]
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub sources: BTreeMap<String, SourceConfig>,
    pub command_timeout: Duration,
    pub chunk_bytes: u64,
    pub max_line_bytes: usize,
    pub retry: RetryPolicy,
    pub dedup: DedupMode,
    /// Remote DHCP lease file for client names, when configured
    pub leases_file: Option<String>,
}

impl FetchConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sources: config.sources.clone(),
            command_timeout: config.remote.command_timeout,
            chunk_bytes: config.fetch.chunk_bytes,
            max_line_bytes: usize::try_from(config.fetch.max_line_bytes).unwrap_or(usize::MAX),
            retry: RetryPolicy::new(&config.fetch.retry),
            dedup: config.fetch.dedup,
            leases_file: config.clients.as_ref().map(|c| c.leases_file.clone()),
        }
    }
}

/// How much of a file to read this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPlan {
    /// Same file as last cycle and it grew: read `[start, end)`
    Resume { start: u64, end: u64 },
    /// New, rotated or shrunk file: read `[0, end)`
    FullRead { end: u64 },
    /// Same file, no growth
    Skip,
}

impl ReadPlan {
    pub fn decide(stored: Option<&FileState>, size: u64, first_line: &str) -> Self {
        match stored {
            Some(s) if s.fingerprint == first_line && s.offset == size => ReadPlan::Skip,
            Some(s) if s.fingerprint == first_line && s.offset > 0 && s.offset < size => {
                ReadPlan::Resume {
                    start: s.offset,
                    end: size,
                }
            }
            _ => ReadPlan::FullRead { end: size },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    NotFound,
    Empty,
    Unchanged,
    Resumed,
    FullRead,
}

/// Per-file outcome of one cycle
#[derive(Debug, Clone, Serialize)]
pub struct FileDiagnostic {
    pub path: String,
    pub status: FileStatus,
    /// Offset the read started at, when a read happened
    pub start_offset: Option<u64>,
    /// Offset stored for the next cycle, when the file was observed
    pub new_offset: Option<u64>,
    pub bytes_read: u64,
    pub entries: usize,
    pub error: Option<String>,
}

impl FileDiagnostic {
    fn new(path: &str, status: FileStatus) -> Self {
        Self {
            path: path.to_string(),
            status,
            start_offset: None,
            new_offset: None,
            bytes_read: 0,
            entries: 0,
            error: None,
        }
    }
}

/// Lines and entries dropped during a cycle, by reason
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscardCounts {
    pub blank: u64,
    pub below_watermark: u64,
    pub resumed_mid_line: u64,
    pub writer_in_progress: u64,
    pub malformed: u64,
    pub duplicates: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub source_id: String,
    pub success: bool,
    pub message: String,
    pub entries_fetched: u64,
    pub files: Vec<FileDiagnostic>,
    pub discarded: DiscardCounts,
    pub watermark: Option<String>,
    pub duration_ms: u64,
}

impl FetchSummary {
    /// Summary for a cycle that ended before producing any result
    pub fn failed(source_id: &str, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.to_string(),
            success: false,
            message: message.into(),
            entries_fetched: 0,
            files: Vec::new(),
            discarded: DiscardCounts::default(),
            watermark: None,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unknown source '{0}'")]
    UnknownSource(String),

    #[error("fetch state error: {0}")]
    State(#[from] StateError),

    /// Entries were parsed but could not be stored; no state was persisted
    #[error("failed to append entries for source '{}': {source}", .summary.source_id)]
    Append {
        summary: Box<FetchSummary>,
        source: StorageError,
    },
}

impl FetchError {
    /// Caller-facing summary of a failed cycle
    pub fn into_summary(self, source_id: &str) -> FetchSummary {
        match self {
            FetchError::Append { summary, .. } => *summary,
            other => FetchSummary::failed(source_id, other.to_string()),
        }
    }
}

struct FileResult {
    diagnostic: FileDiagnostic,
    /// `None` leaves the stored state untouched
    new_state: Option<FileState>,
    entries: Vec<RawEntry>,
}

/// Drives fetch cycles: probe each file, read what is new, merge, store, and
/// remember how far every file was consumed.
pub struct TailOrchestrator {
    config: FetchConfig,
    channel: Arc<dyn CommandChannel>,
    storage: Arc<dyn Storage>,
    probe: RemoteFileProbe,
    leases: Option<LeaseReader>,
    states: StateStore,
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl TailOrchestrator {
    pub fn new(
        config: FetchConfig,
        channel: Arc<dyn CommandChannel>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let probe = RemoteFileProbe::new(
            channel.clone(),
            config.retry.clone(),
            config.command_timeout,
        );
        let leases = config.leases_file.as_deref().map(|path| {
            LeaseReader::new(
                channel.clone(),
                config.retry.clone(),
                config.command_timeout,
                path,
            )
        });
        let locks = config
            .sources
            .keys()
            .map(|id| (id.clone(), Arc::new(Mutex::new(()))))
            .collect();

        Self {
            states: StateStore::new(storage.clone()),
            config,
            channel,
            storage,
            probe,
            leases,
            locks,
        }
    }

    pub fn sources(&self) -> &BTreeMap<String, SourceConfig> {
        &self.config.sources
    }

    pub fn host(&self) -> &str {
        self.channel.host()
    }

    /// Stored state of a source, as the next cycle will see it
    pub async fn source_state(&self, source_id: &str) -> Result<SourceState, FetchError> {
        if !self.config.sources.contains_key(source_id) {
            return Err(FetchError::UnknownSource(source_id.to_string()));
        }
        Ok(self.states.load(source_id).await?)
    }

    pub fn client_names_configured(&self) -> bool {
        self.leases.is_some()
    }

    /// Re-read the DHCP leases and store their hostnames; returns how many
    /// mappings were stored
    pub async fn refresh_client_names(&self) -> Result<usize, LeaseError> {
        let reader = self.leases.as_ref().ok_or(LeaseError::NotConfigured)?;
        let names = reader.read().await?;
        let stored = self.storage.upsert_client_names(&names).await?;

        tracing::info!(
            host = %self.channel.host(),
            path = %reader.path(),
            clients = stored,
            "Refreshed client names"
        );
        Ok(stored)
    }

    /// Run fetch cycles for every source, in name order, one after another
    pub async fn run_fetch_all(&self) -> Vec<(String, Result<FetchSummary, FetchError>)> {
        let mut results = Vec::new();
        for source_id in self.config.sources.keys() {
            let result = self.run_fetch(source_id).await;
            results.push((source_id.clone(), result));
        }
        results
    }

    /// Run one fetch cycle for a source.
    ///
    /// Cycles of the same source never overlap. State is persisted only after
    /// the new entries were appended to storage.
    pub async fn run_fetch(&self, source_id: &str) -> Result<FetchSummary, FetchError> {
        let (source, lock) = match (
            self.config.sources.get(source_id),
            self.locks.get(source_id),
        ) {
            (Some(source), Some(lock)) => (source, lock.clone()),
            _ => return Err(FetchError::UnknownSource(source_id.to_string())),
        };
        let _guard = lock.lock().await;
        let started = Instant::now();

        tracing::info!(
            source_id = %source_id,
            host = %self.channel.host(),
            files = source.remote_files.len(),
            "Starting fetch"
        );

        let mut state = self.states.load(source_id).await?;
        let watermark = state.last_entry_timestamp.clone();
        let mut discarded = DiscardCounts::default();
        let mut files = Vec::with_capacity(source.remote_files.len());
        let mut accepted = Vec::new();

        for path in &source.remote_files {
            let key = file_key(path);
            let result = self
                .process_file(
                    source_id,
                    source,
                    path,
                    state.file(key),
                    watermark.as_deref(),
                    &mut discarded,
                )
                .await;

            if let Some(new_state) = result.new_state {
                state.files.insert(key.to_string(), new_state);
            }
            accepted.extend(result.entries);
            files.push(result.diagnostic);
        }

        let entries = merge_entries(accepted, self.config.dedup, &mut discarded.duplicates);
        if let Some(newest) = entries.last() {
            state.advance_watermark(&newest.timestamp);
        }

        let mut summary = FetchSummary {
            source_id: source_id.to_string(),
            success: true,
            message: String::new(),
            entries_fetched: entries.len() as u64,
            files,
            discarded,
            watermark: state.last_entry_timestamp.clone(),
            duration_ms: 0,
        };

        if let Err(e) = self.storage.append_events(&source.destination, &entries).await {
            tracing::error!(
                source_id = %source_id,
                destination = %source.destination,
                entries = entries.len(),
                error = %e,
                "Failed to append entries, fetch state not saved"
            );
            summary.success = false;
            summary.entries_fetched = 0;
            summary.watermark = watermark;
            summary.message = format!("Storage append failed: {}", e);
            summary.duration_ms = started.elapsed().as_millis() as u64;
            return Err(FetchError::Append {
                summary: Box::new(summary),
                source: e,
            });
        }

        // Fetch history only moves when something new arrived
        if !entries.is_empty() {
            state.total_entries_fetched += entries.len() as u64;
            state.last_fetch_time = Some(Utc::now());
        }
        self.states.save(source_id, &state).await?;

        summary.message = describe(&summary);
        summary.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            source_id = %source_id,
            entries = summary.entries_fetched,
            malformed = summary.discarded.malformed,
            duplicates = summary.discarded.duplicates,
            duration_ms = summary.duration_ms,
            "Fetch complete"
        );

        Ok(summary)
    }

    async fn process_file(
        &self,
        source_id: &str,
        source: &SourceConfig,
        path: &str,
        stored: Option<&FileState>,
        watermark: Option<&str>,
        discarded: &mut DiscardCounts,
    ) -> FileResult {
        let (size, first_line) = match self.probe.probe(path).await {
            ProbeResult::NotFound { reason } => {
                tracing::info!(source_id = %source_id, path = %path, reason = %reason, "Skipping unavailable file");
                let mut diagnostic = FileDiagnostic::new(path, FileStatus::NotFound);
                diagnostic.error = Some(reason);
                return FileResult {
                    diagnostic,
                    new_state: None,
                    entries: Vec::new(),
                };
            }
            ProbeResult::Empty => {
                tracing::debug!(source_id = %source_id, path = %path, "File is empty");
                let mut diagnostic = FileDiagnostic::new(path, FileStatus::Empty);
                diagnostic.new_offset = Some(0);
                return FileResult {
                    diagnostic,
                    new_state: Some(FileState::default()),
                    entries: Vec::new(),
                };
            }
            ProbeResult::Present { size, first_line } => (size, first_line),
        };

        let (start, end, status) = match ReadPlan::decide(stored, size, &first_line) {
            ReadPlan::Skip => {
                let mut diagnostic = FileDiagnostic::new(path, FileStatus::Unchanged);
                diagnostic.new_offset = Some(size);
                return FileResult {
                    diagnostic,
                    new_state: None,
                    entries: Vec::new(),
                };
            }
            ReadPlan::Resume { start, end } => (start, end, FileStatus::Resumed),
            ReadPlan::FullRead { end } => {
                if let Some(previous) = stored.filter(|s| s.offset > 0) {
                    tracing::info!(
                        source_id = %source_id,
                        path = %path,
                        previous_offset = previous.offset,
                        size,
                        "File rotated or truncated, reading from start"
                    );
                }
                (0, end, FileStatus::FullRead)
            }
        };

        tracing::debug!(source_id = %source_id, path = %path, start, end, "Reading file");

        let parser = EntryParser::new(
            &source.timestamp_field,
            watermark.map(str::to_string),
            start > 0,
        );
        let mut reader = ChunkedRangeReader::new(
            self.channel.clone(),
            self.config.retry.clone(),
            self.config.command_timeout,
            path,
            start,
            end,
            self.config.chunk_bytes,
        );
        let mut lines = LineReconstructor::new(self.config.max_line_bytes);
        let mut entries = Vec::new();
        let mut consumed = 0u64;

        while let Some(chunk) = reader.next_chunk().await {
            for line in lines.push(&chunk.bytes) {
                consumed += classify(source_id, path, &parser, &line, &mut entries, discarded);
            }
        }

        // A fragment left by a failed read is not the end of the file
        if reader.failure().is_none() {
            if let Some(line) = lines.finish() {
                consumed += classify(source_id, path, &parser, &line, &mut entries, discarded);
            }
        }

        let new_offset = start + consumed;
        let mut diagnostic = FileDiagnostic::new(path, status);
        diagnostic.start_offset = Some(start);
        diagnostic.new_offset = Some(new_offset);
        diagnostic.bytes_read = reader.bytes_read();
        diagnostic.entries = entries.len();

        if let Some(failure) = reader.failure() {
            tracing::warn!(
                source_id = %source_id,
                path = %path,
                bytes_read = reader.bytes_read(),
                new_offset,
                error = %failure,
                "Read stopped early, keeping complete lines"
            );
            diagnostic.error = Some(failure.to_string());
        }

        FileResult {
            diagnostic,
            new_state: Some(FileState {
                fingerprint: first_line,
                offset: new_offset,
            }),
            entries,
        }
    }
}

/// Classify one line, collect it if accepted, and return the bytes it consumes
fn classify(
    source_id: &str,
    path: &str,
    parser: &EntryParser,
    line: &Line,
    entries: &mut Vec<RawEntry>,
    discarded: &mut DiscardCounts,
) -> u64 {
    let outcome = parser.parse(line);
    let consumed = if outcome.consumes_bytes() { line.len } else { 0 };

    match outcome {
        LineOutcome::Accepted(entry) => entries.push(entry),
        LineOutcome::Blank => discarded.blank += 1,
        LineOutcome::BelowWatermark => discarded.below_watermark += 1,
        LineOutcome::ResumedMidLine => {
            tracing::debug!(source_id = %source_id, path = %path, "Discarded partial first line of resumed read");
            discarded.resumed_mid_line += 1;
        }
        LineOutcome::WriterInProgress => {
            tracing::debug!(
                source_id = %source_id,
                path = %path,
                pending_bytes = line.len,
                "Unterminated last line, will retry next cycle"
            );
            discarded.writer_in_progress += 1;
        }
        LineOutcome::Malformed(reason) => {
            tracing::warn!(
                source_id = %source_id,
                path = %path,
                line = line.number,
                reason = %reason,
                preview = %line.preview(MALFORMED_PREVIEW_CHARS),
                "Discarding malformed entry"
            );
            discarded.malformed += 1;
        }
    }

    consumed
}

/// Sort by timestamp and drop duplicates, keeping the first in sort order
fn merge_entries(mut entries: Vec<RawEntry>, mode: DedupMode, duplicates: &mut u64) -> Vec<RawEntry> {
    entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    let before = entries.len();

    match mode {
        DedupMode::Timestamp => entries.dedup_by(|b, a| a.timestamp == b.timestamp),
        DedupMode::TimestampAndContent => {
            let mut seen = HashSet::new();
            entries.retain(|e| seen.insert((e.timestamp.clone(), e.content_hash())));
        }
    }

    *duplicates += (before - entries.len()) as u64;
    entries
}

fn describe(summary: &FetchSummary) -> String {
    let read = summary
        .files
        .iter()
        .filter(|f| matches!(f.status, FileStatus::Resumed | FileStatus::FullRead))
        .count();
    let failed = summary.files.iter().filter(|f| f.error.is_some()).count();

    let mut message = format!(
        "Fetched {} new entries ({} of {} files read)",
        summary.entries_fetched,
        read,
        summary.files.len()
    );
    if failed > 0 {
        message.push_str(&format!(", {} file(s) unavailable or incomplete", failed));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::RetryConfig;
    use crate::storage::duckdb::DuckDbStorage;
    use crate::storage::{AggregatePage, AggregateQuery, ClientName, StreamStats};
    use crate::tail::testutil::MemoryChannel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const CURRENT: &str = "/opt/adguard/querylog.json";
    const ROTATED: &str = "/opt/adguard/querylog.json.1";

    fn entry_line(ts: &str, qh: &str) -> String {
        format!("{{\"T\":\"{}\",\"QH\":\"{}\"}}\n", ts, qh)
    }

    fn lines(items: &[(&str, &str)]) -> String {
        items.iter().map(|(ts, qh)| entry_line(ts, qh)).collect()
    }

    fn fetch_config(files: &[&str], chunk_bytes: u64) -> FetchConfig {
        let mut sources = BTreeMap::new();
        sources.insert(
            "querylog".to_string(),
            SourceConfig {
                description: None,
                remote_files: files.iter().map(|f| f.to_string()).collect(),
                timestamp_field: "T".to_string(),
                destination: "querylog".to_string(),
            },
        );
        FetchConfig {
            sources,
            command_timeout: Duration::from_secs(5),
            chunk_bytes,
            max_line_bytes: 4096,
            retry: RetryPolicy::none(),
            dedup: DedupMode::Timestamp,
            leases_file: None,
        }
    }

    /// Storage that can be told to reject appends
    struct FlakyStorage {
        inner: DuckDbStorage,
        fail_appends: AtomicBool,
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        async fn init_schema(&self) -> Result<(), StorageError> {
            self.inner.init_schema().await
        }

        async fn append_events(&self, destination: &str, entries: &[RawEntry]) -> Result<usize, StorageError> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(StorageError::Database("disk full".to_string()));
            }
            self.inner.append_events(destination, entries).await
        }

        async fn get_metadata(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get_metadata(key).await
        }

        async fn set_metadata(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.inner.set_metadata(key, value).await
        }

        async fn aggregate(&self, query: &AggregateQuery) -> Result<AggregatePage, StorageError> {
            self.inner.aggregate(query).await
        }

        async fn upsert_client_names(&self, names: &[ClientName]) -> Result<usize, StorageError> {
            self.inner.upsert_client_names(names).await
        }

        async fn client_names(&self) -> Result<Vec<ClientName>, StorageError> {
            self.inner.client_names().await
        }

        async fn stats(&self) -> Result<Vec<StreamStats>, StorageError> {
            self.inner.stats().await
        }
    }

    struct Harness {
        channel: Arc<MemoryChannel>,
        storage: Arc<FlakyStorage>,
        orchestrator: TailOrchestrator,
    }

    impl Harness {
        async fn new(config: FetchConfig) -> Self {
            let channel = Arc::new(MemoryChannel::new());
            let storage = Arc::new(FlakyStorage {
                inner: DuckDbStorage::in_memory().unwrap(),
                fail_appends: AtomicBool::new(false),
            });
            storage.init_schema().await.unwrap();
            let orchestrator = TailOrchestrator::new(config, channel.clone(), storage.clone());
            Self {
                channel,
                storage,
                orchestrator,
            }
        }

        async fn fetch(&self) -> FetchSummary {
            self.orchestrator.run_fetch("querylog").await.unwrap()
        }

        async fn state(&self) -> SourceState {
            self.orchestrator.source_state("querylog").await.unwrap()
        }

        async fn set_state(&self, state: &SourceState) {
            StateStore::new(self.storage.clone())
                .save("querylog", state)
                .await
                .unwrap();
        }

        /// Stored timestamps in ascending order
        async fn stored(&self) -> Vec<String> {
            let mut query = AggregateQuery::new("querylog");
            query.group_by = vec!["T".to_string()];
            query.sort_by = Some("T".to_string());
            query.sort_asc = true;
            let page = self.storage.aggregate(&query).await.unwrap();
            page.rows
                .into_iter()
                .flat_map(|row| std::iter::repeat(row.keys["T"].clone().unwrap()).take(row.count as usize))
                .collect()
        }
    }

    #[test]
    fn test_read_plan_decisions() {
        let state = FileState {
            fingerprint: "first".to_string(),
            offset: 100,
        };
        assert_eq!(ReadPlan::decide(None, 50, "first"), ReadPlan::FullRead { end: 50 });
        assert_eq!(
            ReadPlan::decide(Some(&state), 150, "first"),
            ReadPlan::Resume { start: 100, end: 150 }
        );
        assert_eq!(ReadPlan::decide(Some(&state), 100, "first"), ReadPlan::Skip);
        assert_eq!(ReadPlan::decide(Some(&state), 150, "other"), ReadPlan::FullRead { end: 150 });
        // Shrunk below the stored offset
        assert_eq!(ReadPlan::decide(Some(&state), 60, "first"), ReadPlan::FullRead { end: 60 });

        let reset = FileState::default();
        assert_eq!(ReadPlan::decide(Some(&reset), 10, ""), ReadPlan::FullRead { end: 10 });
    }

    #[tokio::test]
    async fn test_second_fetch_is_idempotent() {
        let h = Harness::new(fetch_config(&[CURRENT], 1024)).await;
        let content = lines(&[
            ("2025-12-03T10:00:00", "a.com"),
            ("2025-12-03T10:00:01", "b.com"),
            ("2025-12-03T10:00:02", "c.com"),
        ]);
        h.channel.write(CURRENT, content.as_bytes());

        let first = h.fetch().await;
        assert!(first.success);
        assert_eq!(first.entries_fetched, 3);
        assert_eq!(first.files[0].status, FileStatus::FullRead);
        let state_after_first = h.state().await;
        assert_eq!(state_after_first.files["querylog.json"].offset, content.len() as u64);
        assert_eq!(state_after_first.total_entries_fetched, 3);

        let reads = h.channel.range_reads().len();
        let second = h.fetch().await;
        assert_eq!(second.entries_fetched, 0);
        assert_eq!(second.files[0].status, FileStatus::Unchanged);
        assert_eq!(h.channel.range_reads().len(), reads);

        let state_after_second = h.state().await;
        assert_eq!(state_after_second.files, state_after_first.files);
        assert_eq!(state_after_second.last_entry_timestamp, state_after_first.last_entry_timestamp);
        assert_eq!(h.stored().await.len(), 3);
    }

    #[tokio::test]
    async fn test_resumes_after_append() {
        let h = Harness::new(fetch_config(&[CURRENT], 1024)).await;
        let initial = lines(&[("2025-12-03T10:00:00", "a.com"), ("2025-12-03T10:00:01", "b.com")]);
        h.channel.write(CURRENT, initial.as_bytes());
        h.fetch().await;

        h.channel
            .append(CURRENT, lines(&[("2025-12-03T10:00:02", "c.com")]).as_bytes());
        let summary = h.fetch().await;

        assert_eq!(summary.entries_fetched, 1);
        assert_eq!(summary.files[0].status, FileStatus::Resumed);
        assert_eq!(summary.files[0].start_offset, Some(initial.len() as u64));
        assert!(h
            .channel
            .range_reads()
            .last()
            .unwrap()
            .starts_with(&format!("tail -c +{} ", initial.len() + 1)));
        assert_eq!(summary.discarded, DiscardCounts::default());
        assert_eq!(h.state().await.total_entries_fetched, 3);
    }

    #[tokio::test]
    async fn test_unterminated_tail_is_reread() {
        let h = Harness::new(fetch_config(&[CURRENT], 1024)).await;
        let complete = lines(&[("2025-12-03T10:00:00", "a.com"), ("2025-12-03T10:00:01", "b.com")]);
        let partial = r#"{"T":"2025-12-03T10:00:02","QH":"ex"#;
        h.channel
            .write(CURRENT, format!("{}{}", complete, partial).as_bytes());

        let summary = h.fetch().await;
        assert_eq!(summary.entries_fetched, 2);
        assert_eq!(summary.discarded.writer_in_progress, 1);
        assert_eq!(summary.discarded.malformed, 0);
        // Offset stops at the start of the unfinished line
        assert_eq!(h.state().await.files["querylog.json"].offset, complete.len() as u64);

        h.channel.append(CURRENT, b"ample.com\"}\n");
        let summary = h.fetch().await;
        assert_eq!(summary.entries_fetched, 1);
        assert_eq!(summary.discarded.resumed_mid_line, 0);
        assert_eq!(
            h.stored().await,
            vec!["2025-12-03T10:00:00", "2025-12-03T10:00:01", "2025-12-03T10:00:02"]
        );
    }

    #[tokio::test]
    async fn test_line_split_across_chunks() {
        let first = entry_line("2025-12-03T10:00:00", "a.com");
        let content = lines(&[
            ("2025-12-03T10:00:00", "a.com"),
            ("2025-12-03T10:00:01", "b.com"),
            ("2025-12-03T10:00:02", "c.com"),
        ]);
        // The first chunk ends 10 bytes into line 2
        let h = Harness::new(fetch_config(&[CURRENT], first.len() as u64 + 10)).await;
        h.channel.write(CURRENT, content.as_bytes());

        let summary = h.fetch().await;
        assert_eq!(summary.entries_fetched, 3);
        assert_eq!(summary.discarded, DiscardCounts::default());
        assert!(h.channel.range_reads().len() > 1);
        assert_eq!(h.state().await.files["querylog.json"].offset, content.len() as u64);
    }

    #[tokio::test]
    async fn test_resume_inside_a_line_is_expected_partial() {
        let h = Harness::new(fetch_config(&[CURRENT], 1024)).await;
        let l1 = entry_line("2025-12-03T10:00:00", "a.com");
        let l2 = entry_line("2025-12-03T10:00:01", "b.com");
        let l3 = entry_line("2025-12-03T10:00:02", "c.com");
        let content = format!("{}{}{}", l1, l2, l3);
        h.channel.write(CURRENT, content.as_bytes());

        let mut state = SourceState::default();
        state.files.insert(
            "querylog.json".to_string(),
            FileState {
                fingerprint: l1.trim_end().to_string(),
                offset: (l1.len() + 5) as u64,
            },
        );
        h.set_state(&state).await;

        let summary = h.fetch().await;
        assert_eq!(summary.files[0].status, FileStatus::Resumed);
        assert_eq!(summary.discarded.resumed_mid_line, 1);
        assert_eq!(summary.discarded.malformed, 0);
        assert_eq!(summary.entries_fetched, 1);
        assert_eq!(h.stored().await, vec!["2025-12-03T10:00:02"]);
        assert_eq!(h.state().await.files["querylog.json"].offset, content.len() as u64);
    }

    #[tokio::test]
    async fn test_interior_malformed_line_is_consumed() {
        let h = Harness::new(fetch_config(&[CURRENT], 1024)).await;
        let content = format!(
            "{}{}\n{}",
            entry_line("2025-12-03T10:00:00", "a.com"),
            "{not json",
            entry_line("2025-12-03T10:00:01", "b.com")
        );
        h.channel.write(CURRENT, content.as_bytes());

        let summary = h.fetch().await;
        assert_eq!(summary.entries_fetched, 2);
        assert_eq!(summary.discarded.malformed, 1);
        assert_eq!(h.state().await.files["querylog.json"].offset, content.len() as u64);
    }

    #[tokio::test]
    async fn test_oversized_line_is_discarded_without_buffering_it() {
        let mut config = fetch_config(&[CURRENT], 16);
        config.max_line_bytes = 64;
        let h = Harness::new(config).await;

        let junk = "x".repeat(300);
        let content = format!(
            "{}{}\n{}",
            entry_line("2025-12-03T10:00:00", "a.com"),
            junk,
            entry_line("2025-12-03T10:00:01", "b.com")
        );
        h.channel.write(CURRENT, content.as_bytes());

        let summary = h.fetch().await;
        assert_eq!(summary.entries_fetched, 2);
        assert_eq!(summary.discarded.malformed, 1);
        assert_eq!(h.state().await.files["querylog.json"].offset, content.len() as u64);

        // A long unterminated tail is still left for the writer to finish
        h.channel.append(CURRENT, junk.as_bytes());
        let summary = h.fetch().await;
        assert_eq!(summary.entries_fetched, 0);
        assert_eq!(summary.discarded.writer_in_progress, 1);
        assert_eq!(h.state().await.files["querylog.json"].offset, content.len() as u64);
    }

    #[tokio::test]
    async fn test_fetch_history_moves_only_with_new_entries() {
        let h = Harness::new(fetch_config(&[CURRENT], 1024)).await;
        h.channel.write(CURRENT, b"");
        h.fetch().await;
        let state = h.state().await;
        assert!(state.last_fetch_time.is_none());
        assert!(state.files.contains_key("querylog.json"));

        h.channel
            .write(CURRENT, lines(&[("2025-12-03T10:00:00", "a.com")]).as_bytes());
        h.fetch().await;
        let after_new = h.state().await;
        assert!(after_new.last_fetch_time.is_some());

        h.fetch().await;
        let after_idle = h.state().await;
        assert_eq!(after_idle.last_fetch_time, after_new.last_fetch_time);
        assert_eq!(after_idle.total_entries_fetched, 1);
    }

    #[tokio::test]
    async fn test_refresh_client_names() {
        const LEASES: &str = "/var/lib/misc/dnsmasq.leases";

        let unconfigured = Harness::new(fetch_config(&[CURRENT], 1024)).await;
        assert!(!unconfigured.orchestrator.client_names_configured());
        assert!(matches!(
            unconfigured.orchestrator.refresh_client_names().await,
            Err(LeaseError::NotConfigured)
        ));

        let mut config = fetch_config(&[CURRENT], 1024);
        config.leases_file = Some(LEASES.to_string());
        let h = Harness::new(config).await;
        assert!(matches!(
            h.orchestrator.refresh_client_names().await,
            Err(LeaseError::Read { .. })
        ));

        h.channel.write(
            LEASES,
            b"1733270400 aa:bb:cc:dd:ee:01 10.0.0.2 laptop *\n1733270400 aa:bb:cc:dd:ee:02 10.0.0.3 * *\n",
        );
        assert_eq!(h.orchestrator.refresh_client_names().await.unwrap(), 1);
        assert_eq!(
            h.storage.client_names().await.unwrap(),
            vec![ClientName {
                ip: "10.0.0.2".to_string(),
                hostname: "laptop".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_rotation_rereads_and_filters_by_watermark() {
        let h = Harness::new(fetch_config(&[CURRENT, ROTATED], 1024)).await;
        h.channel.write(
            CURRENT,
            lines(&[("2025-12-03T10:00:00", "a.com"), ("2025-12-03T10:00:01", "b.com")]).as_bytes(),
        );
        assert_eq!(h.fetch().await.entries_fetched, 2);

        // The writer added one more entry, then the file was rotated away
        h.channel.write(
            ROTATED,
            lines(&[
                ("2025-12-03T10:00:00", "a.com"),
                ("2025-12-03T10:00:01", "b.com"),
                ("2025-12-03T10:00:02", "c.com"),
            ])
            .as_bytes(),
        );
        h.channel
            .write(CURRENT, lines(&[("2025-12-03T10:00:03", "d.com")]).as_bytes());

        let summary = h.fetch().await;
        assert_eq!(summary.files[0].status, FileStatus::FullRead);
        assert_eq!(summary.files[1].status, FileStatus::FullRead);
        assert_eq!(summary.discarded.below_watermark, 2);
        assert_eq!(summary.entries_fetched, 2);
        assert_eq!(
            h.stored().await,
            vec![
                "2025-12-03T10:00:00",
                "2025-12-03T10:00:01",
                "2025-12-03T10:00:02",
                "2025-12-03T10:00:03"
            ]
        );
        assert_eq!(
            h.state().await.last_entry_timestamp.as_deref(),
            Some("2025-12-03T10:00:03")
        );
    }

    #[tokio::test]
    async fn test_shrunk_file_with_same_first_line_is_reread() {
        let h = Harness::new(fetch_config(&[CURRENT], 1024)).await;
        let l1 = entry_line("2025-12-03T10:00:00", "a.com");
        h.channel.write(
            CURRENT,
            format!("{}{}", l1, entry_line("2025-12-03T10:00:01", "b.com")).as_bytes(),
        );
        h.fetch().await;

        h.channel.write(CURRENT, l1.as_bytes());
        let summary = h.fetch().await;
        assert_eq!(summary.files[0].status, FileStatus::FullRead);
        assert_eq!(summary.discarded.below_watermark, 1);
        assert_eq!(h.state().await.files["querylog.json"].offset, l1.len() as u64);
    }

    #[tokio::test]
    async fn test_missing_rotated_file_does_not_block_current() {
        let h = Harness::new(fetch_config(&[CURRENT, ROTATED], 1024)).await;
        h.channel
            .write(CURRENT, lines(&[("2025-12-03T10:00:00", "a.com")]).as_bytes());

        let summary = h.fetch().await;
        assert!(summary.success);
        assert_eq!(summary.entries_fetched, 1);
        assert_eq!(summary.files[1].status, FileStatus::NotFound);
        assert!(summary.files[1].error.is_some());
        assert!(!h.state().await.files.contains_key("querylog.json.1"));
    }

    #[tokio::test]
    async fn test_unreachable_file_keeps_its_state() {
        let h = Harness::new(fetch_config(&[CURRENT, ROTATED], 1024)).await;
        h.channel
            .write(ROTATED, lines(&[("2025-12-03T09:00:00", "old.com")]).as_bytes());
        h.channel
            .write(CURRENT, lines(&[("2025-12-03T10:00:00", "a.com")]).as_bytes());
        h.fetch().await;
        let before = h.state().await.files["querylog.json.1"].clone();

        h.channel.set_unreachable(ROTATED);
        h.channel
            .append(CURRENT, lines(&[("2025-12-03T10:00:01", "b.com")]).as_bytes());
        let summary = h.fetch().await;

        assert!(summary.success);
        assert_eq!(summary.entries_fetched, 1);
        assert_eq!(summary.files[1].status, FileStatus::NotFound);
        assert_eq!(h.state().await.files["querylog.json.1"], before);
    }

    #[tokio::test]
    async fn test_empty_file_resets_state() {
        let h = Harness::new(fetch_config(&[CURRENT], 1024)).await;
        h.channel
            .write(CURRENT, lines(&[("2025-12-03T10:00:00", "a.com")]).as_bytes());
        h.fetch().await;

        h.channel.write(CURRENT, b"");
        let summary = h.fetch().await;
        assert_eq!(summary.files[0].status, FileStatus::Empty);
        assert_eq!(h.state().await.files["querylog.json"], FileState::default());

        h.channel
            .write(CURRENT, lines(&[("2025-12-03T11:00:00", "b.com")]).as_bytes());
        let summary = h.fetch().await;
        assert_eq!(summary.files[0].status, FileStatus::FullRead);
        assert_eq!(summary.entries_fetched, 1);
    }

    #[tokio::test]
    async fn test_duplicate_timestamps_across_files() {
        let h = Harness::new(fetch_config(&[CURRENT, ROTATED], 1024)).await;
        h.channel.write(
            CURRENT,
            lines(&[("2025-12-03T10:00:01", "a.com"), ("2025-12-03T10:00:02", "b.com")]).as_bytes(),
        );
        h.channel.write(
            ROTATED,
            lines(&[("2025-12-03T10:00:00", "z.com"), ("2025-12-03T10:00:01", "other.com")]).as_bytes(),
        );

        let summary = h.fetch().await;
        assert_eq!(summary.entries_fetched, 3);
        assert_eq!(summary.discarded.duplicates, 1);
        assert_eq!(
            h.stored().await,
            vec!["2025-12-03T10:00:00", "2025-12-03T10:00:01", "2025-12-03T10:00:02"]
        );
    }

    #[tokio::test]
    async fn test_content_dedup_keeps_distinct_entries() {
        let mut config = fetch_config(&[CURRENT, ROTATED], 1024);
        config.dedup = DedupMode::TimestampAndContent;
        let h = Harness::new(config).await;
        let shared = entry_line("2025-12-03T10:00:01", "a.com");
        h.channel.write(
            CURRENT,
            format!("{}{}", shared, entry_line("2025-12-03T10:00:01", "b.com")).as_bytes(),
        );
        h.channel.write(ROTATED, shared.as_bytes());

        let summary = h.fetch().await;
        assert_eq!(summary.entries_fetched, 2);
        assert_eq!(summary.discarded.duplicates, 1);
    }

    #[tokio::test]
    async fn test_append_failure_persists_nothing() {
        let h = Harness::new(fetch_config(&[CURRENT], 1024)).await;
        h.channel.write(
            CURRENT,
            lines(&[("2025-12-03T10:00:00", "a.com"), ("2025-12-03T10:00:01", "b.com")]).as_bytes(),
        );
        h.storage.fail_appends.store(true, Ordering::SeqCst);

        match h.orchestrator.run_fetch("querylog").await {
            Err(FetchError::Append { summary, .. }) => {
                assert!(!summary.success);
                assert_eq!(summary.entries_fetched, 0);
                assert!(summary.message.contains("disk full"));
            }
            other => panic!("expected append failure, got {:?}", other),
        }
        assert_eq!(h.state().await, SourceState::default());

        h.storage.fail_appends.store(false, Ordering::SeqCst);
        let summary = h.fetch().await;
        assert_eq!(summary.entries_fetched, 2);
        assert_eq!(h.stored().await.len(), 2);
    }

    #[tokio::test]
    async fn test_read_failure_keeps_complete_lines() {
        let l1 = entry_line("2025-12-03T10:00:00", "a.com");
        let content = lines(&[
            ("2025-12-03T10:00:00", "a.com"),
            ("2025-12-03T10:00:01", "b.com"),
            ("2025-12-03T10:00:02", "c.com"),
        ]);
        let h = Harness::new(fetch_config(&[CURRENT], l1.len() as u64 + 5)).await;
        h.channel.write(CURRENT, content.as_bytes());
        h.channel.fail_range_reads_after(1);

        let summary = h.fetch().await;
        assert!(summary.success);
        assert_eq!(summary.entries_fetched, 1);
        assert!(summary.files[0].error.is_some());
        assert_eq!(summary.discarded.writer_in_progress, 0);
        assert_eq!(h.state().await.files["querylog.json"].offset, l1.len() as u64);

        h.channel.fail_range_reads_after(100);
        let summary = h.fetch().await;
        assert_eq!(summary.entries_fetched, 2);
        assert_eq!(summary.files[0].status, FileStatus::Resumed);
        assert_eq!(h.stored().await.len(), 3);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mut config = fetch_config(&[CURRENT], 1024);
        config.retry = RetryPolicy::new(&RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        });
        let h = Harness::new(config).await;
        h.channel
            .write(CURRENT, lines(&[("2025-12-03T10:00:00", "a.com")]).as_bytes());
        h.channel.fail_next(2);

        let summary = h.fetch().await;
        assert_eq!(summary.files[0].status, FileStatus::FullRead);
        assert_eq!(summary.entries_fetched, 1);
    }

    #[tokio::test]
    async fn test_concurrent_cycles_are_serialized() {
        let h = Harness::new(fetch_config(&[CURRENT], 1024)).await;
        h.channel.write(
            CURRENT,
            lines(&[
                ("2025-12-03T10:00:00", "a.com"),
                ("2025-12-03T10:00:01", "b.com"),
                ("2025-12-03T10:00:02", "c.com"),
            ])
            .as_bytes(),
        );

        let (a, b) = tokio::join!(
            h.orchestrator.run_fetch("querylog"),
            h.orchestrator.run_fetch("querylog")
        );
        assert_eq!(a.unwrap().entries_fetched + b.unwrap().entries_fetched, 3);
        assert_eq!(h.stored().await.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_source() {
        let h = Harness::new(fetch_config(&[CURRENT], 1024)).await;
        assert!(matches!(
            h.orchestrator.run_fetch("nope").await,
            Err(FetchError::UnknownSource(_))
        ));
    }

    #[tokio::test]
    async fn test_run_fetch_all_visits_every_source() {
        let mut config = fetch_config(&[CURRENT], 1024);
        config.sources.insert(
            "dhcp".to_string(),
            SourceConfig {
                description: Some("DHCP leases".to_string()),
                remote_files: vec!["/var/log/dhcp.json".to_string()],
                timestamp_field: "ts".to_string(),
                destination: "dhcp".to_string(),
            },
        );
        let h = Harness::new(config).await;
        h.channel
            .write(CURRENT, lines(&[("2025-12-03T10:00:00", "a.com")]).as_bytes());
        h.channel
            .write("/var/log/dhcp.json", b"{\"ts\":\"2025-12-03T09:00:00\",\"mac\":\"aa:bb\"}\n");

        let results = h.orchestrator.run_fetch_all().await;
        let ids: Vec<_> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["dhcp", "querylog"]);
        for (_, result) in &results {
            assert_eq!(result.as_ref().unwrap().entries_fetched, 1);
        }
    }
}
