// Single-payload delivery for callers that do not hold a connection open

use crate::hub::registry::Inbox;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// How a poll ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// One payload was taken from the queue
    Delivered(Bytes),
    /// The identity was unregistered while waiting
    Unregistered,
    /// The hub is shutting down
    Cancelled,
}

/// Wait for exactly one payload.
///
/// A caller that disconnects drops this future, which releases the inbox
/// without taking anything from the queue.
pub async fn poll_once(mut inbox: Inbox, cancel: CancellationToken) -> PollOutcome {
    let identity = inbox.identity();

    let outcome = tokio::select! {
        _ = cancel.cancelled() => PollOutcome::Cancelled,
        next = inbox.recv() => match next {
            Some(payload) => PollOutcome::Delivered(payload),
            None => PollOutcome::Unregistered,
        },
    };

    tracing::debug!("Poll for {} finished: {:?}", identity, outcome);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::config::HubConfig;
    use crate::hub::service::Hub;
    use std::time::Duration;

    #[tokio::test]
    async fn test_delivers_one_payload() {
        let hub = Hub::new(HubConfig::default());
        hub.register(Some("1")).await.unwrap();
        hub.route("1", Bytes::from_static(b"one")).await.unwrap();
        hub.route("1", Bytes::from_static(b"two")).await.unwrap();

        let inbox = hub.attach(Some("1")).await.unwrap();
        let outcome = poll_once(inbox, hub.shutdown_token()).await;
        assert_eq!(outcome, PollOutcome::Delivered(Bytes::from_static(b"one")));

        // The second payload stays queued for the next poll
        let inbox = hub.attach(Some("1")).await.unwrap();
        let outcome = poll_once(inbox, hub.shutdown_token()).await;
        assert_eq!(outcome, PollOutcome::Delivered(Bytes::from_static(b"two")));
    }

    #[tokio::test]
    async fn test_dropped_poll_releases_inbox() {
        let hub = Hub::new(HubConfig::default());
        hub.register(Some("1")).await.unwrap();

        let inbox = hub.attach(Some("1")).await.unwrap();
        let pending = poll_once(inbox, hub.shutdown_token());
        let timed_out = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert!(timed_out.is_err());

        hub.route("1", Bytes::from_static(b"kept")).await.unwrap();
        let inbox = hub.attach(Some("1")).await.unwrap();
        let outcome = poll_once(inbox, hub.shutdown_token()).await;
        assert_eq!(outcome, PollOutcome::Delivered(Bytes::from_static(b"kept")));
    }

    #[tokio::test]
    async fn test_unregister_and_shutdown() {
        let hub = Hub::new(HubConfig::default());
        hub.register(Some("1")).await.unwrap();
        hub.register(Some("2")).await.unwrap();

        let inbox = hub.attach(Some("1")).await.unwrap();
        hub.unregister(Some("1")).await.unwrap();
        assert_eq!(
            poll_once(inbox, hub.shutdown_token()).await,
            PollOutcome::Unregistered
        );

        let inbox = hub.attach(Some("2")).await.unwrap();
        hub.shutdown();
        assert_eq!(
            poll_once(inbox, hub.shutdown_token()).await,
            PollOutcome::Cancelled
        );
    }
}
