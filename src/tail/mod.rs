//! Incremental tailing of remote append-only JSON line logs.
//!
//! A fetch cycle probes every file of a source, reads only the bytes that are
//! new since the previous cycle, rebuilds complete lines from bounded chunks,
//! decodes them, and persists how far each file was consumed.

pub mod leases;
pub mod lines;
pub mod orchestrator;
pub mod parser;
pub mod probe;
pub mod reader;
pub mod retry;
pub mod state;

#[cfg(test)]
pub(crate) mod testutil;

pub use orchestrator::{
    DiscardCounts, FetchConfig, FetchError, FetchSummary, FileDiagnostic, FileStatus, ReadPlan,
    TailOrchestrator,
};
pub use leases::{LeaseError, LeaseReader};
pub use parser::RawEntry;
pub use state::{FileState, SourceState, StateError, StateStore};

/// Key under which a remote file's state is stored: its basename
pub fn file_key(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
