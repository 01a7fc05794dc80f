use crate::server::bus::Subscription;
use core::time::Duration;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::sync::CancellationToken;
use tutor_stream_core::{event::ResponseEvent, protocol::ServerMessage, types::CorrelationId};

/// Why a relay stopped forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The job's own `end` reached the client.
    Ended,
    /// The relay quit before the job ended: the channel closed, it went
    /// idle, or the client stopped reading. The job may still be running.
    Abandoned,
}

/// Forwards one job's response channel to the client until `end`.
///
/// Events are forwarded verbatim and in publish order. If the channel closes
/// or stays silent for `idle_timeout` before `end` arrives, the relay reports
/// an `error` followed by `end` itself so the client always sees the stream
/// terminate. Undecodable payloads are logged and skipped.
///
/// `ended` is cancelled before the job's own `end` is handed to the client,
/// so by the time the client can react to `end` the session already treats
/// the job as finished.
pub async fn relay_events(
    id: CorrelationId,
    mut sub: Subscription,
    outbound: mpsc::Sender<ServerMessage>,
    idle_timeout: Option<Duration>,
    ended: CancellationToken,
) -> (CorrelationId, RelayExit) {
    let exit = loop {
        let next = match idle_timeout {
            Some(limit) => match timeout(limit, sub.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!("Relay for {id} idle for {limit:?}, giving up");
                    synthesize_end(&outbound, "no response from worker").await;
                    break RelayExit::Abandoned;
                }
            },
            None => sub.recv().await,
        };

        let Some(payload) = next else {
            tracing::warn!("Response channel for {id} closed before end");
            synthesize_end(&outbound, "response channel closed").await;
            break RelayExit::Abandoned;
        };

        let event = match ResponseEvent::decode(&payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Skipping payload on {}: {e}", sub.channel());
                continue;
            }
        };

        let terminal = event.is_terminal();
        if terminal {
            ended.cancel();
        }
        if outbound.send(event.into()).await.is_err() {
            tracing::debug!("Client gone, relay for {id} exiting");
            break if terminal {
                RelayExit::Ended
            } else {
                RelayExit::Abandoned
            };
        }
        if terminal {
            break RelayExit::Ended;
        }
    };

    sub.unsubscribe();
    (id, exit)
}

async fn synthesize_end(outbound: &mpsc::Sender<ServerMessage>, message: &str) {
    for event in [ResponseEvent::error(message), ResponseEvent::end()] {
        if outbound.send(event.into()).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::bus::{ChannelBus, InMemoryBus};
    use tutor_stream_core::{event::EventKind, types::response_channel};

    async fn drain(mut rx: mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn forwards_until_end() {
        let bus = InMemoryBus::new();
        let id = CorrelationId::from("a");
        let sub = bus.subscribe(&response_channel(&id)).await.unwrap();
        let (tx, rx) = mpsc::channel(16);

        for event in [
            ResponseEvent::start(),
            ResponseEvent::message("x"),
            ResponseEvent::end(),
            ResponseEvent::message("after end"),
        ] {
            bus.publish(&response_channel(&id), event.encode())
                .await
                .unwrap();
        }

        let ended = CancellationToken::new();
        assert_eq!(
            relay_events(id.clone(), sub, tx, None, ended.clone()).await,
            (id.clone(), RelayExit::Ended)
        );
        assert!(ended.is_cancelled());
        assert_eq!(
            drain(rx).await,
            vec![
                ResponseEvent::start().into(),
                ResponseEvent::message("x").into(),
                ResponseEvent::end().into(),
            ]
        );
        assert_eq!(bus.subscriber_count(&response_channel(&id)), 0);
    }

    #[tokio::test]
    async fn skips_garbage() {
        let bus = InMemoryBus::new();
        let id = CorrelationId::from("a");
        let sub = bus.subscribe(&response_channel(&id)).await.unwrap();
        let (tx, rx) = mpsc::channel(16);

        bus.publish(&response_channel(&id), "{oops".into())
            .await
            .unwrap();
        bus.publish(&response_channel(&id), ResponseEvent::end().encode())
            .await
            .unwrap();

        relay_events(id, sub, tx, None, CancellationToken::new()).await;
        assert_eq!(drain(rx).await, vec![ResponseEvent::end().into()]);
    }

    #[tokio::test]
    async fn closed_channel_synthesizes_error_and_end() {
        let bus = InMemoryBus::new();
        let id = CorrelationId::from("a");
        let sub = bus.subscribe(&response_channel(&id)).await.unwrap();
        let (tx, rx) = mpsc::channel(16);

        bus.close_channel(&response_channel(&id));
        let ended = CancellationToken::new();
        let (_, exit) = relay_events(id, sub, tx, None, ended.clone()).await;
        assert_eq!(exit, RelayExit::Abandoned);
        assert!(!ended.is_cancelled());

        let messages = drain(rx).await;
        assert!(matches!(
            messages.as_slice(),
            [
                ServerMessage::LlmResponse { event: EventKind::Error, .. },
                ServerMessage::LlmResponse { event: EventKind::End, .. },
            ]
        ));
    }

    #[tokio::test]
    async fn idle_relay_gives_up() {
        let bus = InMemoryBus::new();
        let id = CorrelationId::from("a");
        let sub = bus.subscribe(&response_channel(&id)).await.unwrap();
        let (tx, rx) = mpsc::channel(16);

        let ended = CancellationToken::new();
        let (_, exit) =
            relay_events(id, sub, tx, Some(Duration::from_millis(20)), ended.clone()).await;
        assert_eq!(exit, RelayExit::Abandoned);
        assert!(!ended.is_cancelled());

        let messages = drain(rx).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], ResponseEvent::end().into());
    }
}
