//! Row-store access for ledger records.
//!
//! The sync layer treats the remote store as an external collaborator: it only needs
//! owner-scoped queries and single-row writes. [`RowStore`] captures that surface;
//! [`InMemoryRowStore`] backs tests and local wiring, [`RestRowStore`] talks to a
//! PostgREST-style HTTP endpoint.

mod memory;
mod record;
mod rest;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{InMemoryRowStore, StoreCall};
pub use record::{
    EntityKind, NewRecord, OwnerFilter, QueryOrder, Record, RecordDraft, RecordPatch,
};
pub use rest::RestRowStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid store url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unknown table {0}")]
    UnknownTable(String),
    #[error("row {id} not found in {table}")]
    NotFound { table: String, id: String },
    #[error("store error: {0}")]
    Store(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait RowStore: Send + Sync {
    /// Returns every row in `table` matching `filter`, sorted by `order`.
    async fn query(
        &self,
        table: &str,
        filter: &OwnerFilter,
        order: &QueryOrder,
    ) -> StoreResult<Vec<Record>>;

    async fn insert(&self, table: &str, record: NewRecord) -> StoreResult<Record>;

    async fn update(&self, table: &str, id: &str, patch: RecordPatch) -> StoreResult<Record>;

    /// Deleting an id that does not exist is not an error.
    async fn delete(&self, table: &str, id: &str) -> StoreResult<()>;
}
