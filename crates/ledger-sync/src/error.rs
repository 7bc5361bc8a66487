use std::fmt;
use std::time::Duration;

use change_feed::FeedError;
use ledger_store::StoreError;
use thiserror::Error;

/// Remote write kinds issued by the mutation coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

impl WriteOp {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteOp::Create => "create",
            WriteOp::Update => "update",
            WriteOp::Delete => "delete",
        }
    }
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection probe inconclusive: {0}")]
    ProbeInconclusive(String),
    #[error("channel subscribe failed: {0}")]
    ChannelSubscribe(#[from] FeedError),
    #[error("channel not acknowledged within {0:?}")]
    ChannelTimeout(Duration),
    #[error("fetch failed: {0}")]
    Fetch(#[source] StoreError),
    #[error("{op} failed: {source}")]
    Write {
        op: WriteOp,
        #[source]
        source: StoreError,
    },
    #[error("undecodable change payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid sync config: {0}")]
    Config(String),
    #[error("session closed")]
    SessionClosed,
}

impl SyncError {
    /// Fetch and write failures reach the user; channel trouble only degrades the session.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            SyncError::Fetch(_) | SyncError::Write { .. } | SyncError::SessionClosed
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
