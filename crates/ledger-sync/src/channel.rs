use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use change_feed::{
    ChangeFeed, FeedResult, FeedSignal, SubscribeStatus, SubscriptionId, TopicFilter,
};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::SyncError;
use crate::event::ChangeEvent;
use crate::state::FallbackReason;

/// Ownership of one feed subscription. Released at most once, and on drop.
pub struct ChannelLease {
    feed: Arc<dyn ChangeFeed>,
    id: SubscriptionId,
    topic: String,
    released: AtomicBool,
}

impl ChannelLease {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_live(&self) -> bool {
        !self.released.load(Ordering::SeqCst)
    }

    /// Unsubscribes; returns false if this lease was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(err) = self.feed.unsubscribe(self.id) {
            warn!(
                target = "ledger_sync",
                subscription = self.id,
                topic = %self.topic,
                error = %err,
                "unsubscribe failed"
            );
        }
        true
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Acknowledged,
    Change(ChangeEvent),
    Undecodable(String),
    Failed(FallbackReason),
}

/// A feed subscription whose payloads are decoded into [`ChangeEvent`]s as they arrive.
pub struct SubscriptionChannel {
    lease: Arc<ChannelLease>,
    signals: mpsc::Receiver<FeedSignal>,
}

impl SubscriptionChannel {
    pub fn open(feed: Arc<dyn ChangeFeed>, topic: &str, filter: &TopicFilter) -> FeedResult<Self> {
        let subscription = feed.subscribe(topic, filter)?;
        let lease = Arc::new(ChannelLease {
            feed,
            id: subscription.id,
            topic: subscription.topic,
            released: AtomicBool::new(false),
        });
        Ok(Self {
            lease,
            signals: subscription.signals,
        })
    }

    pub fn lease(&self) -> Arc<ChannelLease> {
        Arc::clone(&self.lease)
    }

    /// Next lifecycle or change signal. A dropped sender reads as the channel closing.
    pub async fn next(&mut self) -> ChannelSignal {
        match self.signals.recv().await {
            None => ChannelSignal::Failed(FallbackReason::ChannelClosed),
            Some(FeedSignal::Status(status)) => match status {
                SubscribeStatus::Subscribed => ChannelSignal::Acknowledged,
                SubscribeStatus::ChannelError => ChannelSignal::Failed(FallbackReason::ChannelError),
                SubscribeStatus::TimedOut => ChannelSignal::Failed(FallbackReason::ChannelTimeout),
                SubscribeStatus::Closed => ChannelSignal::Failed(FallbackReason::ChannelClosed),
            },
            Some(FeedSignal::Message(message)) => match ChangeEvent::decode(&message.payload) {
                Ok(event) => ChannelSignal::Change(event),
                Err(err) => ChannelSignal::Undecodable(SyncError::Decode(err).to_string()),
            },
        }
    }
}
