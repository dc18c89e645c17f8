// Connection pump: bridges one duplex connection to one identity's queue
//
// A pump is established with an already attached inbox, runs a reader
// task and a writer task, and is closed once either side hits a fatal
// condition. Closing unregisters the identity and closes the connection
// exactly once, whichever task gets there first.

use crate::hub::envelope::Envelope;
use crate::hub::error::HubError;
use crate::hub::registry::{Attachment, Identity, Inbox};
use crate::hub::service::Hub;
use bytes::Bytes;
use futures::future::Either;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// One frame read off the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// A message carrying an encoded envelope
    Data(Bytes),
    /// The peer asked to close
    Close,
}

/// Why a pump stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Peer sent a close frame or the stream ended
    PeerClosed,
    /// Reading from the connection failed
    ReadFailed(String),
    /// Writing to the connection failed
    WriteFailed(String),
    /// The identity was unregistered from elsewhere
    Unregistered,
    /// The hub is shutting down
    Shutdown,
    /// One of the pump tasks panicked
    Internal(String),
}

/// Summary of a finished pump
#[derive(Debug, Clone)]
pub struct PumpReport {
    pub identity: Identity,
    pub session: Uuid,
    /// The first fatal condition observed
    pub cause: CloseCause,
    /// Whether this pump's cleanup removed the registry entry
    pub unregistered: bool,
}

impl PumpReport {
    /// The close cause as an error, if the connection failed rather than ended
    pub fn fault(&self) -> Option<HubError> {
        match &self.cause {
            CloseCause::ReadFailed(e) | CloseCause::WriteFailed(e) => {
                Some(HubError::ConnectionFault(e.clone()))
            }
            CloseCause::Internal(e) => Some(HubError::Internal(e.clone())),
            CloseCause::PeerClosed | CloseCause::Unregistered | CloseCause::Shutdown => None,
        }
    }
}

/// Shared one-shot cleanup for the reader and writer tasks
struct Teardown {
    hub: Arc<Hub>,
    attachment: Attachment,
    cause: OnceLock<CloseCause>,
    unregistered: AtomicBool,
    closed: CancellationToken,
}

impl Teardown {
    /// Record the cause, unregister and signal both tasks to stop.
    ///
    /// Only the first call does anything.
    async fn close(&self, cause: CloseCause) {
        if self.cause.set(cause.clone()).is_err() {
            return;
        }

        tracing::info!(
            "Connection for {} closing: {:?}",
            self.attachment.identity(),
            cause
        );

        let removed = self.hub.registry().remove_attached(self.attachment).await;
        self.unregistered.store(removed, Ordering::Release);
        self.closed.cancel();
    }
}

/// Reader/writer pair for one live connection
pub struct ConnectionPump {
    hub: Arc<Hub>,
    inbox: Inbox,
    session: Uuid,
}

impl ConnectionPump {
    /// Bind a pump to an attached inbox
    pub fn new(hub: Arc<Hub>, inbox: Inbox) -> Self {
        Self {
            hub,
            inbox,
            session: Uuid::new_v4(),
        }
    }

    pub fn identity(&self) -> Identity {
        self.inbox.identity()
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Run until the connection or the registration ends.
    ///
    /// `inbound` yields frames from the peer; `outbound` accepts text
    /// frames for the peer. Each half is driven by its own task.
    pub async fn run<R, E, W>(self, inbound: R, outbound: W) -> PumpReport
    where
        R: Stream<Item = Result<WireFrame, E>> + Send + 'static,
        E: Display + Send + 'static,
        W: Sink<String> + Send + 'static,
        W::Error: Display + Send,
    {
        let identity = self.inbox.identity();
        let session = self.session;
        let span = tracing::info_span!("pump", identity, session = %session);

        let teardown = Arc::new(Teardown {
            hub: self.hub.clone(),
            attachment: self.inbox.attachment(),
            cause: OnceLock::new(),
            unregistered: AtomicBool::new(false),
            closed: CancellationToken::new(),
        });

        span.in_scope(|| tracing::info!("Connection established for {}", identity));

        let reader = tokio::spawn(
            read_loop(self.hub.clone(), teardown.clone(), inbound).instrument(span.clone()),
        );
        let writer = tokio::spawn(
            write_loop(
                teardown.clone(),
                self.inbox,
                outbound,
                self.hub.shutdown_token(),
            )
            .instrument(span.clone()),
        );

        let remaining = match futures::future::select(reader, writer).await {
            Either::Left((result, writer)) => {
                if let Err(e) = result {
                    teardown.close(CloseCause::Internal(e.to_string())).await;
                }
                writer
            }
            Either::Right((result, reader)) => {
                if let Err(e) = result {
                    teardown.close(CloseCause::Internal(e.to_string())).await;
                }
                reader
            }
        };
        if let Err(e) = remaining.await {
            teardown.close(CloseCause::Internal(e.to_string())).await;
        }

        let cause = teardown
            .cause
            .get()
            .cloned()
            .unwrap_or(CloseCause::PeerClosed);
        let unregistered = teardown.unregistered.load(Ordering::Acquire);

        span.in_scope(|| tracing::info!("Connection for {} closed", identity));

        PumpReport {
            identity,
            session,
            cause,
            unregistered,
        }
    }
}

async fn read_loop<R, E>(hub: Arc<Hub>, teardown: Arc<Teardown>, inbound: R)
where
    R: Stream<Item = Result<WireFrame, E>>,
    E: Display,
{
    let mut inbound = Box::pin(inbound);
    let mut ahead = None;

    'frames: loop {
        let frame = match ahead.take() {
            Some(frame) => frame,
            None => tokio::select! {
                _ = teardown.closed.cancelled() => break,
                frame = inbound.next() => frame,
            },
        };

        let bytes = match frame {
            Some(Ok(WireFrame::Data(bytes))) => bytes,
            other => {
                teardown.close(close_cause(other)).await;
                break;
            }
        };

        // A route can wait on full queues for a long time. Keep reading so a
        // close is seen right away; at most one data frame is held back.
        let forwarding = forward(&hub, &bytes);
        tokio::pin!(forwarding);
        loop {
            tokio::select! {
                _ = teardown.closed.cancelled() => break 'frames,
                _ = &mut forwarding => break,
                frame = inbound.next(), if ahead.is_none() => {
                    if matches!(frame, Some(Ok(WireFrame::Data(_)))) {
                        ahead = Some(frame);
                    } else {
                        teardown.close(close_cause(frame)).await;
                        break 'frames;
                    }
                }
            }
        }
    }
}

/// Cause for a frame that ends the connection
fn close_cause<E: Display>(frame: Option<Result<WireFrame, E>>) -> CloseCause {
    match frame {
        Some(Err(e)) => CloseCause::ReadFailed(e.to_string()),
        _ => CloseCause::PeerClosed,
    }
}

/// Decode one envelope and route it. Failures only drop this message.
async fn forward(hub: &Hub, bytes: &[u8]) {
    let envelope = match Envelope::from_slice(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Dropping malformed envelope: {}", e);
            return;
        }
    };

    match hub.route(&envelope.recipients, envelope.data).await {
        Ok(delivery) => {
            tracing::debug!("Relayed envelope to {:?}", delivery.recipients);
        }
        Err(e) => {
            tracing::warn!(
                "Dropping envelope for {:?}: {}",
                envelope.recipients,
                e
            );
        }
    }
}

async fn write_loop<W>(
    teardown: Arc<Teardown>,
    mut inbox: Inbox,
    outbound: W,
    shutdown: CancellationToken,
) where
    W: Sink<String>,
    W::Error: Display,
{
    let mut outbound = Box::pin(outbound);
    let identity = inbox.identity().to_string();

    loop {
        let payload = tokio::select! {
            _ = teardown.closed.cancelled() => break,
            _ = shutdown.cancelled() => {
                teardown.close(CloseCause::Shutdown).await;
                break;
            }
            next = inbox.recv() => match next {
                Some(payload) => payload,
                None => {
                    teardown.close(CloseCause::Unregistered).await;
                    break;
                }
            },
        };

        let frame = match Envelope::new(identity.clone(), payload).to_text() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Failed to encode outgoing envelope: {}", e);
                continue;
            }
        };

        let sent = tokio::select! {
            _ = teardown.closed.cancelled() => break,
            sent = outbound.send(frame) => sent,
        };
        if let Err(e) = sent {
            teardown.close(CloseCause::WriteFailed(e.to_string())).await;
            break;
        }
    }

    // The writer owns the outgoing half, so this is the only close
    if let Err(e) = outbound.close().await {
        tracing::debug!("Error closing connection: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::config::HubConfig;
    use futures::channel::mpsc;
    use std::time::Duration;

    type Inbound = mpsc::UnboundedSender<Result<WireFrame, String>>;

    async fn hub_with(ids: &[&str]) -> Arc<Hub> {
        let hub = Arc::new(Hub::new(HubConfig {
            send_timeout: Duration::from_millis(100),
            ..HubConfig::default()
        }));
        for id in ids {
            hub.register(Some(id)).await.unwrap();
        }
        hub
    }

    async fn start(
        hub: &Arc<Hub>,
        id: &str,
    ) -> (
        Inbound,
        mpsc::UnboundedReceiver<String>,
        tokio::task::JoinHandle<PumpReport>,
    ) {
        let inbox = hub.attach(Some(id)).await.unwrap();
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, out_rx) = mpsc::unbounded();
        let pump = ConnectionPump::new(hub.clone(), inbox);
        let handle = tokio::spawn(pump.run(in_rx, out_tx));
        (in_tx, out_rx, handle)
    }

    fn data(envelope: &Envelope) -> Result<WireFrame, String> {
        Ok(WireFrame::Data(Bytes::from(envelope.to_text().unwrap())))
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let hub = hub_with(&["1", "2"]).await;
        let mut other = hub.attach(Some("2")).await.unwrap();
        let (in_tx, mut out_rx, _handle) = start(&hub, "1").await;

        in_tx
            .unbounded_send(data(&Envelope::new("2", "hello")))
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), other.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "hello");

        hub.route("1", Bytes::from_static(b"back")).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), out_rx.next())
            .await
            .unwrap()
            .unwrap();
        let envelope = Envelope::from_slice(frame.as_bytes()).unwrap();
        assert_eq!(envelope.recipients, "1");
        assert_eq!(envelope.data, "back");
    }

    #[tokio::test]
    async fn test_malformed_frame_is_not_fatal() {
        let hub = hub_with(&["1"]).await;
        let (in_tx, mut out_rx, _handle) = start(&hub, "1").await;

        in_tx
            .unbounded_send(Ok(WireFrame::Data(Bytes::from_static(b"{nope"))))
            .unwrap();
        in_tx
            .unbounded_send(data(&Envelope::new("999", "nobody")))
            .unwrap();
        in_tx
            .unbounded_send(data(&Envelope::new("1", "self")))
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), out_rx.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Envelope::from_slice(frame.as_bytes()).unwrap().data, "self");
        assert!(hub.registry().contains(1).await);
    }

    async fn blocked_sender() -> (Arc<Hub>, Inbound, tokio::task::JoinHandle<PumpReport>) {
        let hub = Arc::new(Hub::new(HubConfig {
            queue_capacity: 1,
            send_timeout: Duration::from_secs(3),
            ..HubConfig::default()
        }));
        hub.register(Some("1")).await.unwrap();
        hub.register(Some("2")).await.unwrap();
        hub.route("2", Bytes::from_static(b"backlog")).await.unwrap();

        let (in_tx, _out_rx, handle) = start(&hub, "1").await;
        in_tx
            .unbounded_send(data(&Envelope::new("2", "stuck")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        (hub, in_tx, handle)
    }

    #[tokio::test]
    async fn test_peer_close_during_blocked_route() {
        let (hub, in_tx, handle) = blocked_sender().await;

        in_tx.unbounded_send(Ok(WireFrame::Close)).unwrap();
        let report = tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("pump should not wait out the send timeout")
            .unwrap();

        assert_eq!(report.cause, CloseCause::PeerClosed);
        assert!(!hub.registry().contains(1).await);
    }

    #[tokio::test]
    async fn test_shutdown_during_blocked_route() {
        let (hub, _in_tx, handle) = blocked_sender().await;

        hub.shutdown();
        let report = tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("pump should not wait out the send timeout")
            .unwrap();

        assert_eq!(report.cause, CloseCause::Shutdown);
    }

    #[tokio::test]
    async fn test_frame_read_during_route_is_kept() {
        let hub = hub_with(&["1", "2"]).await;
        let mut other = hub.attach(Some("2")).await.unwrap();
        let (in_tx, _out_rx, _handle) = start(&hub, "1").await;

        for text in ["one", "two", "three"] {
            in_tx
                .unbounded_send(data(&Envelope::new("2", text)))
                .unwrap();
        }

        for text in ["one", "two", "three"] {
            let received = tokio::time::timeout(Duration::from_secs(1), other.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received, text);
        }
    }

    #[tokio::test]
    async fn test_envelope_without_data_is_dropped() {
        let hub = hub_with(&["1", "2"]).await;
        let mut other = hub.attach(Some("2")).await.unwrap();
        let (in_tx, _out_rx, _handle) = start(&hub, "1").await;

        in_tx
            .unbounded_send(Ok(WireFrame::Data(Bytes::from_static(br#"{"Recipients":"2"}"#))))
            .unwrap();
        in_tx
            .unbounded_send(data(&Envelope::new("2", "real")))
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), other.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "real");
        assert!(hub.registry().contains(1).await);
    }

    #[tokio::test]
    async fn test_read_failure_unregisters() {
        let hub = hub_with(&["1"]).await;
        let (in_tx, _out_rx, handle) = start(&hub, "1").await;

        in_tx
            .unbounded_send(Err("connection reset".to_string()))
            .unwrap();
        let report = handle.await.unwrap();

        assert_eq!(report.cause, CloseCause::ReadFailed("connection reset".into()));
        assert!(matches!(report.fault(), Some(HubError::ConnectionFault(_))));
        assert!(report.unregistered);
        assert!(!hub.registry().contains(1).await);
    }

    #[tokio::test]
    async fn test_peer_close() {
        let hub = hub_with(&["1"]).await;
        let (in_tx, mut out_rx, handle) = start(&hub, "1").await;

        in_tx.unbounded_send(Ok(WireFrame::Close)).unwrap();
        let report = handle.await.unwrap();

        assert_eq!(report.cause, CloseCause::PeerClosed);
        assert!(report.fault().is_none());
        assert!(report.unregistered);
        // Writer closed its half
        assert!(out_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_failures_clean_up_once() {
        let hub = hub_with(&["1"]).await;
        let (in_tx, out_rx, handle) = start(&hub, "1").await;

        // Break both directions at once
        drop(out_rx);
        hub.route("1", Bytes::from_static(b"doomed")).await.unwrap();
        in_tx.unbounded_send(Err("eof".to_string())).unwrap();

        let report = handle.await.unwrap();

        assert!(matches!(
            report.cause,
            CloseCause::ReadFailed(_) | CloseCause::WriteFailed(_)
        ));
        assert!(report.unregistered);
        assert!(!hub.registry().contains(1).await);
        assert!(hub.register(Some("1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_late_cleanup_spares_reregistration() {
        let hub = hub_with(&["7"]).await;
        let stale = hub.attach(Some("7")).await.unwrap();
        hub.unregister(Some("7")).await.unwrap();
        hub.register(Some("7")).await.unwrap();

        let (in_tx, in_rx) = mpsc::unbounded::<Result<WireFrame, String>>();
        let (out_tx, _out_rx) = mpsc::unbounded::<String>();
        in_tx.unbounded_send(Err("reset".to_string())).unwrap();

        let report = ConnectionPump::new(hub.clone(), stale)
            .run(in_rx, out_tx)
            .await;

        assert!(!report.unregistered);
        assert!(hub.registry().contains(7).await);
    }

    #[tokio::test]
    async fn test_explicit_unregister_closes_pump() {
        let hub = hub_with(&["3"]).await;
        let (_in_tx, _out_rx, handle) = start(&hub, "3").await;

        hub.unregister(Some("3")).await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.cause, CloseCause::Unregistered);
        assert!(!report.unregistered);
    }

    #[tokio::test]
    async fn test_shutdown_closes_pump() {
        let hub = hub_with(&["4"]).await;
        let (_in_tx, _out_rx, handle) = start(&hub, "4").await;

        hub.shutdown();
        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.cause, CloseCause::Shutdown);
        assert!(report.unregistered);
    }
}
