use crate::server::bus::Subscription;
use core::time::Duration;
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tutor_stream_core::event::ControlCommand;

/// Background task watching a job's control channel.
///
/// The listener never blocks generation: it only flips the job's
/// [`CancellationToken`] when a `stop` arrives. Each receive is bounded by
/// the poll interval so the task notices promptly when it is told to finish.
pub struct StopListener {
    done: CancellationToken,
    handle: Option<JoinHandle<Subscription>>,
}

impl StopListener {
    pub fn spawn(mut sub: Subscription, cancel: CancellationToken, poll: Duration) -> Self {
        let done = CancellationToken::new();
        let finished = done.clone();

        let handle = tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let received = tokio::select! {
                    () = finished.cancelled() => break,
                    received = timeout(poll, sub.recv()) => received,
                };
                match received {
                    Err(_elapsed) => {}
                    Ok(None) => {
                        tracing::debug!("Control channel {} closed", sub.channel());
                        break;
                    }
                    Ok(Some(payload)) => match ControlCommand::decode(&payload) {
                        Ok(ControlCommand::Stop) => {
                            tracing::debug!("Stop received on {}", sub.channel());
                            cancel.cancel();
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("Ignoring control payload on {}: {e}", sub.channel());
                        }
                    },
                }
            }
            sub
        });

        Self {
            done,
            handle: Some(handle),
        }
    }

    /// Signals the task to finish, joins it and releases the control
    /// subscription. Failures are logged, not retried.
    pub async fn stop(mut self) {
        self.done.cancel();
        let Some(handle) = self.handle.take() else {
            return;
        };
        match handle.await {
            Ok(sub) => sub.unsubscribe(),
            Err(e) => tracing::warn!("Stop listener did not shut down cleanly: {e}"),
        }
    }
}

impl Drop for StopListener {
    fn drop(&mut self) {
        self.done.cancel();
    }
}
