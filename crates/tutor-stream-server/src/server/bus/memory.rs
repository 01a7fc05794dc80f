use super::{ChannelBus, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::sync::mpsc;
use tutor_stream_core::{Error, Result};

/// In-process [`ChannelBus`].
///
/// Each subscriber owns an unbounded FIFO queue. Publishing to a channel
/// happens under one lock, so every subscriber of that channel observes
/// payloads in publish order. Cloning is cheap and yields a handle to the same
/// bus.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
    }

    /// Closes every subscription on `channel`. Subscribers observe the end of
    /// their stream.
    pub fn close_channel(&self, channel: &str) {
        self.inner.channels.lock().remove(channel);
    }

    /// Refuses further publish/subscribe calls and closes every channel.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.channels.lock().clear();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::channel("bus is shut down"));
        }
        Ok(())
    }
}

impl Inner {
    fn remove(&self, channel: &str, id: u64) {
        let mut channels = self.channels.lock();
        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                channels.remove(channel);
            }
        }
    }
}

#[async_trait]
impl ChannelBus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.ensure_open()?;

        let mut channels = self.inner.channels.lock();
        if let Some(subs) = channels.get_mut(channel) {
            // A failed send means the receiver is gone; drop it in passing.
            subs.retain(|s| s.tx.send(payload.clone()).is_ok());
            if subs.is_empty() {
                channels.remove(channel);
            }
        } else {
            tracing::trace!("No subscriber on {channel}, dropping payload");
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.ensure_open()?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let name = channel.to_string();
        Ok(Subscription::new(channel, rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(&name, id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn delivers_in_publish_order_to_every_subscriber() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("llm_response:1").await.unwrap();
        let mut b = bus.subscribe("llm_response:1").await.unwrap();

        for i in 0..100 {
            bus.publish("llm_response:1", Bytes::from(i.to_string()))
                .await
                .unwrap();
        }

        for i in 0..100 {
            assert_eq!(a.recv().await.unwrap(), Bytes::from(i.to_string()));
            assert_eq!(b.recv().await.unwrap(), Bytes::from(i.to_string()));
        }
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = InMemoryBus::new();
        let mut one = bus.subscribe("llm_response:1").await.unwrap();
        let mut two = bus.subscribe("llm_response:2").await.unwrap();

        bus.publish("llm_response:2", Bytes::from_static(b"for two"))
            .await
            .unwrap();
        bus.publish("llm_response:1", Bytes::from_static(b"for one"))
            .await
            .unwrap();

        assert_eq!(one.recv().await.unwrap(), Bytes::from_static(b"for one"));
        assert_eq!(two.recv().await.unwrap(), Bytes::from_static(b"for two"));
    }

    #[tokio::test]
    async fn payloads_without_subscribers_are_not_persisted() {
        let bus = InMemoryBus::new();
        bus.publish("llm_control:1", Bytes::from_static(b"early"))
            .await
            .unwrap();

        let mut sub = bus.subscribe("llm_control:1").await.unwrap();
        bus.publish("llm_control:1", Bytes::from_static(b"late"))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn unsubscribe_and_drop_release_the_subscription() {
        let bus = InMemoryBus::new();
        let a = bus.subscribe("c").await.unwrap();
        let b = bus.subscribe("c").await.unwrap();
        assert_eq!(bus.subscriber_count("c"), 2);

        a.unsubscribe();
        assert_eq!(bus.subscriber_count("c"), 1);

        drop(b);
        assert_eq!(bus.subscriber_count("c"), 0);
    }

    #[tokio::test]
    async fn closing_a_channel_ends_its_streams() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("c").await.unwrap();
        bus.close_channel("c");
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_refuses_new_work() {
        let bus = InMemoryBus::new();
        bus.shutdown();
        assert!(matches!(
            bus.publish("c", Bytes::new()).await,
            Err(Error::ChannelFailure { .. })
        ));
        assert!(bus.subscribe("c").await.is_err());
    }
}
