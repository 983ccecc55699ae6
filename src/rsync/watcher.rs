use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{NotificationStream, ReadyNotifier};
use crate::error::Error;

/// Retry and deadline settings of one watch
#[derive(Clone, Debug, PartialEq)]
pub struct WatchPolicy {
    /// First delay after a transport-closing error
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Overall deadline of a watch, `None` waits forever
    pub timeout: Option<Duration>,
}

impl Default for WatchPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            timeout: None,
        }
    }
}

/// Delay following `current`: doubled, capped at `max`
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Waits on the synchronizer's ready feed for a submitted tree
#[derive(Clone)]
pub struct NotificationWatcher {
    notifier: Arc<dyn ReadyNotifier>,
    client_name: String,
    policy: WatchPolicy,
}

impl NotificationWatcher {
    pub fn new(
        notifier: Arc<dyn ReadyNotifier>,
        client_name: impl Into<String>,
        policy: WatchPolicy,
    ) -> NotificationWatcher {
        NotificationWatcher {
            notifier,
            client_name: client_name.into(),
            policy,
        }
    }

    /// Open the feed for `tree_id`; do this before submitting the tree
    pub async fn subscribe(&self, tree_id: &str) -> Result<NotificationStream, Error> {
        self.notifier.alert(&self.client_name, tree_id).await
    }

    /// Wait until the synchronizer reports the tree ready, then unsubscribe.
    ///
    /// Transport-closing errors re-open the subscription after a backoff.
    /// The feed is client scoped: the first notification ends the wait even
    /// when it names another tree, status is read per tree afterwards.
    pub async fn await_completion(
        &self,
        tree_id: &str,
        stream: NotificationStream,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let wait = self.wait(tree_id, stream, cancel);
        let result = match self.policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "tree {} not ready after {:?}",
                    tree_id, limit
                ))),
            },
            None => wait.await,
        };

        if let Err(e) = self.notifier.unsubscribe(&self.client_name, tree_id).await {
            warn!(tree = %tree_id, error = %e, "unable to unsubscribe from ready notifications");
        }
        result
    }

    async fn wait(
        &self,
        tree_id: &str,
        mut stream: NotificationStream,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let mut delay = self.policy.backoff;
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled(format!("watch of tree {}", tree_id)))
                }
                item = stream.next() => item,
            };

            let err = match item {
                Some(Ok(ready)) => {
                    if ready != tree_id {
                        debug!(tree = %tree_id, notified = %ready, "notification for another tree");
                    }
                    info!(tree = %tree_id, "synchronizer reported ready");
                    return Ok(());
                }
                Some(Err(status)) => Error::from_status(status),
                None => {
                    return Err(Error::Grpc(tonic::Status::unavailable(format!(
                        "notification stream of tree {} ended",
                        tree_id
                    ))))
                }
            };

            if !matches!(err, Error::TransientTransport(_)) {
                error!(tree = %tree_id, error = %err, "notification stream failed");
                return Err(err);
            }

            // transport recycled: back off and re-open the subscription
            loop {
                warn!(
                    tree = %tree_id,
                    delay_ms = delay.as_millis() as u64,
                    "notification transport closing, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(Error::Cancelled(format!("watch of tree {}", tree_id)))
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = next_backoff(delay, self.policy.max_backoff);

                match self.subscribe(tree_id).await {
                    Ok(resubscribed) => {
                        stream = resubscribed;
                        break;
                    }
                    Err(e) if e.is_transient() => continue,
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
