pub mod duckdb;
pub mod query;
pub mod traits;

pub use query::{
    AggregatePage, AggregateQuery, AggregateRow, ClientName, FieldFilter, FieldRef, FilterOp,
    StreamStats,
};
pub use traits::{Storage, StorageError};
