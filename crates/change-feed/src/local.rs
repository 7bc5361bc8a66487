use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    ChangeFeed, FeedError, FeedMessage, FeedResult, FeedSignal, FeedSubscription, SubscribeStatus,
    SubscriptionId, TopicFilter, SIGNAL_BUFFER,
};

/// How [`LocalChangeFeed`] acknowledges new subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// `Subscribed` is queued as soon as `subscribe` returns.
    Immediate,
    /// Nothing is sent until the owner calls [`LocalChangeFeed::send_status`].
    Manual,
}

#[derive(Debug)]
struct Entry {
    topic: String,
    filter: TopicFilter,
    tx: mpsc::Sender<FeedSignal>,
}

/// Simple in-memory feed for tests and non-network contexts.
#[derive(Debug)]
pub struct LocalChangeFeed {
    available: bool,
    ack_mode: AckMode,
    refuse: AtomicBool,
    next_id: AtomicU64,
    opened: AtomicUsize,
    subscriptions: RwLock<HashMap<SubscriptionId, Entry>>,
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::with_mode(AckMode::Immediate)
    }
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manual() -> Self {
        Self::with_mode(AckMode::Manual)
    }

    /// A feed whose push primitive is missing; `subscribe` always fails.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::with_mode(AckMode::Manual)
        }
    }

    fn with_mode(ack_mode: AckMode) -> Self {
        Self {
            available: true,
            ack_mode,
            refuse: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            opened: AtomicUsize::new(0),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Makes subsequent `subscribe` calls fail with a transport error.
    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Delivers `payload` to every live subscription on `topic`; returns how many got it.
    pub fn publish(&self, topic: &str, payload: Bytes) -> usize {
        self.fan_out(topic, |topic| {
            FeedSignal::Message(FeedMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            })
        })
    }

    pub fn send_status(&self, topic: &str, status: SubscribeStatus) -> usize {
        self.fan_out(topic, |_| FeedSignal::Status(status))
    }

    fn fan_out(&self, topic: &str, signal: impl Fn(&str) -> FeedSignal) -> usize {
        let guard = self.subscriptions.read();
        let mut delivered = 0;
        for (id, entry) in guard.iter().filter(|(_, e)| e.topic == topic) {
            match entry.tx.try_send(signal(topic)) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        target = "change_feed",
                        subscription = id,
                        topic,
                        error = %err,
                        "dropping feed signal"
                    );
                }
            }
        }
        delivered
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Subscriptions ever opened, including released ones.
    pub fn total_subscriptions(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn filters_for(&self, topic: &str) -> Vec<TopicFilter> {
        self.subscriptions
            .read()
            .values()
            .filter(|e| e.topic == topic)
            .map(|e| e.filter.clone())
            .collect()
    }
}

impl ChangeFeed for LocalChangeFeed {
    fn is_available(&self) -> bool {
        self.available
    }

    fn subscribe(&self, topic: &str, filter: &TopicFilter) -> FeedResult<FeedSubscription> {
        if !self.available {
            return Err(FeedError::Unavailable("local feed disabled".into()));
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(FeedError::Transport(format!("subscribe to {topic} refused")));
        }

        let (tx, signals) = mpsc::channel(SIGNAL_BUFFER);
        if self.ack_mode == AckMode::Immediate {
            tx.try_send(FeedSignal::Status(SubscribeStatus::Subscribed))
                .map_err(|_| FeedError::Closed)?;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.write().insert(
            id,
            Entry {
                topic: topic.to_string(),
                filter: filter.clone(),
                tx,
            },
        );
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(FeedSubscription {
            id,
            topic: topic.to_string(),
            signals,
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) -> FeedResult<()> {
        self.subscriptions.write().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn immediate_ack_then_payload() {
        let feed = LocalChangeFeed::new();
        let mut sub = feed
            .subscribe("ledger:transactions", &TopicFilter::eq("owner_id", "u1"))
            .expect("subscribe ok");
        assert_eq!(
            sub.signals.recv().await,
            Some(FeedSignal::Status(SubscribeStatus::Subscribed))
        );

        assert_eq!(feed.publish("ledger:transactions", Bytes::from_static(b"{}")), 1);
        match sub.signals.recv().await {
            Some(FeedSignal::Message(msg)) => {
                assert_eq!(msg.topic, "ledger:transactions");
                assert_eq!(msg.payload, Bytes::from_static(b"{}"));
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test]
    async fn manual_mode_waits_for_status() {
        let feed = LocalChangeFeed::manual();
        let mut sub = feed
            .subscribe("t", &TopicFilter::eq("owner_id", "u1"))
            .unwrap();
        assert!(sub.signals.try_recv().is_err());
        assert_eq!(feed.send_status("t", SubscribeStatus::TimedOut), 1);
        assert_eq!(
            sub.signals.recv().await,
            Some(FeedSignal::Status(SubscribeStatus::TimedOut))
        );
    }

    #[test]
    fn unsubscribe_is_idempotent_and_tracks_counts() {
        let feed = LocalChangeFeed::new();
        let sub = feed
            .subscribe("t", &TopicFilter::eq("owner_id", "u1"))
            .unwrap();
        assert_eq!(feed.active_subscriptions(), 1);
        feed.unsubscribe(sub.id).unwrap();
        feed.unsubscribe(sub.id).unwrap();
        assert_eq!(feed.active_subscriptions(), 0);
        assert_eq!(feed.total_subscriptions(), 1);
        assert_eq!(feed.publish("t", Bytes::from_static(b"x")), 0);
    }

    #[test]
    fn unavailable_and_refused_feeds_error() {
        let feed = LocalChangeFeed::unavailable();
        assert!(!feed.is_available());
        assert!(matches!(
            feed.subscribe("t", &TopicFilter::eq("owner_id", "u1")),
            Err(FeedError::Unavailable(_))
        ));

        let feed = LocalChangeFeed::new();
        feed.refuse_subscriptions(true);
        assert!(matches!(
            feed.subscribe("t", &TopicFilter::eq("owner_id", "u1")),
            Err(FeedError::Transport(_))
        ));
    }

    #[test]
    fn filter_renders_as_equality() {
        assert_eq!(TopicFilter::eq("owner_id", "u1").to_string(), "owner_id=eq.u1");
    }
}
