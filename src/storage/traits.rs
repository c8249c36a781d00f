use async_trait::async_trait;

use super::query::{AggregatePage, AggregateQuery, ClientName, StreamStats};
use crate::tail::RawEntry;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn init_schema(&self) -> Result<(), StorageError>;

    /// Durably append entries to a destination stream; all or nothing
    async fn append_events(&self, destination: &str, entries: &[RawEntry]) -> Result<usize, StorageError>;

    async fn get_metadata(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_metadata(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Grouped COUNT/SUM/MIN/MAX over a destination with filters, sort and pagination
    async fn aggregate(&self, query: &AggregateQuery) -> Result<AggregatePage, StorageError>;

    /// Insert or refresh IP to hostname mappings; all or nothing
    async fn upsert_client_names(&self, names: &[ClientName]) -> Result<usize, StorageError>;

    async fn client_names(&self) -> Result<Vec<ClientName>, StorageError>;

    async fn stats(&self) -> Result<Vec<StreamStats>, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}
