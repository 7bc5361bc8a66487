use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    ChangeFeed, FeedError, FeedMessage, FeedResult, FeedSignal, FeedSubscription, SubscribeStatus,
    SubscriptionId, TopicFilter, SIGNAL_BUFFER,
};

/// Server-sent-events feed (`GET <base>/realtime/v1/<topic>?<column>=eq.<value>`).
///
/// The stream's open event counts as the subscription acknowledgement. The event
/// source is closed on the first error so the caller decides what happens next;
/// this feed never reconnects by itself.
pub struct SseChangeFeed {
    http: reqwest::Client,
    base_url: Url,
    token: String,
    next_id: AtomicU64,
    pumps: Mutex<HashMap<SubscriptionId, JoinHandle<()>>>,
}

impl SseChangeFeed {
    pub fn new(base_url: &str, token: impl Into<String>) -> FeedResult<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|err| FeedError::Transport(format!("invalid feed url: {err}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.into(),
            next_id: AtomicU64::new(1),
            pumps: Mutex::new(HashMap::new()),
        })
    }

    fn topic_url(&self, topic: &str, filter: &TopicFilter) -> FeedResult<Url> {
        let mut url = self
            .base_url
            .join(&format!("realtime/v1/{topic}"))
            .map_err(|err| FeedError::Transport(format!("invalid topic url: {err}")))?;
        url.query_pairs_mut()
            .append_pair(&filter.column, &format!("eq.{}", filter.value));
        Ok(url)
    }
}

impl ChangeFeed for SseChangeFeed {
    fn subscribe(&self, topic: &str, filter: &TopicFilter) -> FeedResult<FeedSubscription> {
        let url = self.topic_url(topic, filter)?;
        let request = self
            .http
            .get(url.clone())
            .bearer_auth(&self.token)
            .header("Accept", "text/event-stream");
        let source = EventSource::new(request)
            .map_err(|err| FeedError::Transport(format!("cannot open event source: {err}")))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, signals) = mpsc::channel(SIGNAL_BUFFER);
        info!(target = "change_feed", subscription = id, %url, "opening sse subscription");
        let handle = tokio::spawn(pump(id, topic.to_string(), source, tx));
        self.pumps.lock().insert(id, handle);

        Ok(FeedSubscription {
            id,
            topic: topic.to_string(),
            signals,
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) -> FeedResult<()> {
        if let Some(handle) = self.pumps.lock().remove(&id) {
            handle.abort();
            debug!(target = "change_feed", subscription = id, "sse subscription released");
        }
        Ok(())
    }
}

impl Drop for SseChangeFeed {
    fn drop(&mut self) {
        for (_, handle) in self.pumps.lock().drain() {
            handle.abort();
        }
    }
}

async fn pump(
    id: SubscriptionId,
    topic: String,
    mut source: EventSource,
    tx: mpsc::Sender<FeedSignal>,
) {
    let mut terminal = SubscribeStatus::Closed;
    while let Some(event) = source.next().await {
        let signal = match event {
            Ok(Event::Open) => FeedSignal::Status(SubscribeStatus::Subscribed),
            Ok(Event::Message(message)) if message.event == "timeout" => {
                terminal = SubscribeStatus::TimedOut;
                break;
            }
            Ok(Event::Message(message)) => FeedSignal::Message(FeedMessage {
                topic: topic.clone(),
                payload: Bytes::from(message.data),
            }),
            Err(reqwest_eventsource::Error::StreamEnded) => break,
            Err(err) => {
                warn!(
                    target = "change_feed",
                    subscription = id,
                    topic = %topic,
                    error = %err,
                    "sse stream error"
                );
                terminal = SubscribeStatus::ChannelError;
                break;
            }
        };
        if tx.send(signal).await.is_err() {
            // receiver gone
            source.close();
            return;
        }
    }
    source.close();
    let _ = tx.send(FeedSignal::Status(terminal)).await;
}
