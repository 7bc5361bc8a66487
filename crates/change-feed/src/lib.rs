//! Push-subscription primitive used by the ledger sync layer.
//!
//! A [`ChangeFeed`] hands out per-topic subscriptions that report lifecycle status
//! (subscribed, channel error, timed out, closed) and raw change payloads on one signal
//! stream. Payloads stay as bytes here; decoding belongs to whoever owns the schema.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

mod local;
mod sse;

pub use local::{AckMode, LocalChangeFeed};
pub use sse::SseChangeFeed;

/// Buffered signals per subscription before the feed starts dropping payloads.
pub const SIGNAL_BUFFER: usize = 64;

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl SubscribeStatus {
    pub fn is_failure(self) -> bool {
        !matches!(self, SubscribeStatus::Subscribed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    Status(SubscribeStatus),
    Message(FeedMessage),
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed channel closed")]
    Closed,
    #[error("push channel unavailable: {0}")]
    Unavailable(String),
    #[error("feed transport error: {0}")]
    Transport(String),
}

pub type FeedResult<T> = Result<T, FeedError>;

/// Server-side row filter attached to a subscription (`column=eq.value`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub column: String,
    pub value: String,
}

impl TopicFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// A live subscription. Dropping it does not unsubscribe; call
/// [`ChangeFeed::unsubscribe`] with `id`.
#[derive(Debug)]
pub struct FeedSubscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub signals: mpsc::Receiver<FeedSignal>,
}

pub trait ChangeFeed: Send + Sync {
    /// Whether the push primitive exists at all in this runtime.
    fn is_available(&self) -> bool {
        true
    }

    fn subscribe(&self, topic: &str, filter: &TopicFilter) -> FeedResult<FeedSubscription>;

    /// Releases a subscription. Unknown or already released ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId) -> FeedResult<()>;
}
