//! Publish/subscribe transport keyed by channel name.
//!
//! Delivery is at-least-once and ordered per channel. Nothing is persisted:
//! a payload published while a channel has no subscriber is dropped, so
//! subscribers must be in place before the first publish they care about.
//!
//! ## Structure
//!
//! - [`ChannelBus`] - the transport contract consumed by sessions and workers.
//! - [`Subscription`] - an ordered stream of payloads for one channel.
//! - [`memory`] - the in-process implementation used by the server.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::Stream;
use tokio::sync::mpsc;
use tutor_stream_core::{
    Result,
    event::{ControlCommand, ResponseEvent},
    types::{CorrelationId, control_channel, response_channel},
};

pub use memory::InMemoryBus;

/// Transport contract for the response and control channels.
///
/// Implementations must be safe for concurrent use by many tasks.
#[async_trait]
pub trait ChannelBus: Send + Sync + 'static {
    /// Publishes `payload` to every current subscriber of `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelFailure`](tutor_stream_core::Error::ChannelFailure)
    /// if the transport is unavailable.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    /// Subscribes to `channel`. Only payloads published after this call
    /// returns are delivered.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelFailure`](tutor_stream_core::Error::ChannelFailure)
    /// if the transport is unavailable.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Publishes one response event on the response channel of `id`.
pub async fn publish_event(
    bus: &dyn ChannelBus,
    id: &CorrelationId,
    event: &ResponseEvent,
) -> Result<()> {
    bus.publish(&response_channel(id), event.encode()).await
}

/// Publishes one control command on the control channel of `id`.
pub async fn publish_command(
    bus: &dyn ChannelBus,
    id: &CorrelationId,
    command: ControlCommand,
) -> Result<()> {
    bus.publish(&control_channel(id), command.encode()).await
}

/// Ordered stream of payloads published on one channel.
///
/// Dropping the subscription unsubscribes; [`Subscription::unsubscribe`] does
/// the same explicitly.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<Bytes>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Builds a subscription from the receiving half of a channel and a
    /// callback that detaches it from the transport.
    pub fn new(
        channel: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Bytes>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            channel: channel.into(),
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next payload. Returns `None` once the transport has
    /// closed the channel.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
