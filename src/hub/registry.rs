// Registry of connected identities and their inbound queues

use crate::hub::error::HubError;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};

/// A client handle, unique among currently registered clients
pub type Identity = u64;

type Receiver = mpsc::Receiver<Bytes>;

struct Entry {
    generation: u64,
    tx: mpsc::Sender<Bytes>,
    rx: Arc<Mutex<Receiver>>,
}

/// Concurrent map from identity to a bounded FIFO queue of payloads.
///
/// Every map access goes through the read/write lock: lookups and
/// snapshots share it, inserts and removals take it exclusively.
pub struct Registry {
    entries: RwLock<HashMap<Identity, Entry>>,
    queue_capacity: usize,
    next_generation: AtomicU64,
}

impl Registry {
    /// Create an empty registry whose queues hold `queue_capacity` payloads
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Insert a fresh entry, failing if the identity is already present
    pub async fn insert(&self, identity: Identity) -> Result<(), HubError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&identity) {
            return Err(HubError::IdentityInUse(identity));
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            identity,
            Entry {
                generation,
                tx,
                rx: Arc::new(Mutex::new(rx)),
            },
        );

        tracing::info!("Identity {} registered", identity);
        Ok(())
    }

    /// Remove an identity. Returns false if it was not present.
    pub async fn remove(&self, identity: Identity) -> bool {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(&identity).is_some();
        if removed {
            tracing::info!("Identity {} unregistered", identity);
        }
        removed
    }

    /// Remove the exact entry an inbox was attached to.
    ///
    /// A later registration of the same identity is left in place.
    pub async fn remove_attached(&self, attachment: Attachment) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(&attachment.identity) {
            Some(entry) if entry.generation == attachment.generation => {
                entries.remove(&attachment.identity);
                tracing::info!("Identity {} unregistered", attachment.identity);
                true
            }
            _ => false,
        }
    }

    /// Get a producer handle for an identity's queue
    pub async fn lookup(&self, identity: Identity) -> Result<Outbox, HubError> {
        let entries = self.entries.read().await;
        entries
            .get(&identity)
            .map(|entry| Outbox {
                identity,
                tx: entry.tx.clone(),
            })
            .ok_or(HubError::NotRegistered(identity))
    }

    /// Resolve every identity under a single read lock.
    ///
    /// Fails on the first absent identity without returning any handles.
    pub async fn resolve(&self, identities: &[Identity]) -> Result<Vec<Outbox>, HubError> {
        let entries = self.entries.read().await;
        identities
            .iter()
            .map(|&identity| {
                entries
                    .get(&identity)
                    .map(|entry| Outbox {
                        identity,
                        tx: entry.tx.clone(),
                    })
                    .ok_or(HubError::RecipientNotRegistered(identity))
            })
            .collect()
    }

    /// Take the consumer side of an identity's queue.
    ///
    /// Only one inbox per entry can be held at a time; a second attempt
    /// fails with `ReceiverBusy` until the first is dropped.
    pub async fn attach(&self, identity: Identity) -> Result<Inbox, HubError> {
        let (generation, rx) = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(&identity)
                .ok_or(HubError::NotRegistered(identity))?;
            (entry.generation, entry.rx.clone())
        };

        let guard = rx
            .try_lock_owned()
            .map_err(|_| HubError::ReceiverBusy(identity))?;

        Ok(Inbox {
            attachment: Attachment {
                identity,
                generation,
            },
            rx: guard,
        })
    }

    /// Whether an identity is currently registered
    pub async fn contains(&self, identity: Identity) -> bool {
        let entries = self.entries.read().await;
        entries.contains_key(&identity)
    }

    /// Point-in-time copy of every registered identity
    pub async fn snapshot(&self) -> Vec<Identity> {
        let entries = self.entries.read().await;
        entries.keys().copied().collect()
    }

    /// Number of registered identities
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Why a push onto a queue did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The queue stayed full for the whole timeout
    Full,
    /// The entry was unregistered and its consumer is gone
    Closed,
}

/// Producer handle for one identity's queue
#[derive(Clone)]
pub struct Outbox {
    identity: Identity,
    tx: mpsc::Sender<Bytes>,
}

impl Outbox {
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Push a payload, waiting up to `timeout` for room in the queue
    pub async fn push(&self, payload: Bytes, timeout: Duration) -> Result<(), PushError> {
        self.tx
            .send_timeout(payload, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => PushError::Full,
                SendTimeoutError::Closed(_) => PushError::Closed,
            })
    }
}

/// Names one specific registry entry, not just its identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    identity: Identity,
    generation: u64,
}

impl Attachment {
    pub fn identity(&self) -> Identity {
        self.identity
    }
}

/// Exclusive consumer handle for one identity's queue
pub struct Inbox {
    attachment: Attachment,
    rx: OwnedMutexGuard<Receiver>,
}

impl Inbox {
    pub fn identity(&self) -> Identity {
        self.attachment.identity
    }

    /// The entry this inbox drains
    pub fn attachment(&self) -> Attachment {
        self.attachment
    }

    /// Wait for the next payload.
    ///
    /// Returns `None` once the entry has been unregistered and every
    /// payload queued before that has been drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let registry = Registry::new(4);

        registry.insert(100).await.unwrap();
        let err = registry.insert(100).await.unwrap_err();
        assert!(matches!(err, HubError::IdentityInUse(100)));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = Registry::new(4);
        registry.insert(7).await.unwrap();

        assert!(registry.remove(7).await);
        assert!(!registry.remove(7).await);
        assert!(!registry.remove(8).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let registry = Registry::new(4);
        registry.insert(100).await.unwrap();
        registry.insert(200).await.unwrap();

        let mut snapshot = registry.snapshot().await;
        registry.remove(100).await;
        snapshot.sort_unstable();

        assert_eq!(snapshot, vec![100, 200]);
        assert_eq!(registry.snapshot().await, vec![200]);
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let registry = Registry::new(4);
        registry.insert(1).await.unwrap();

        let outbox = registry.lookup(1).await.unwrap();
        let mut inbox = registry.attach(1).await.unwrap();

        for msg in ["a", "b", "c"] {
            outbox
                .push(Bytes::from(msg), Duration::from_millis(10))
                .await
                .unwrap();
        }

        assert_eq!(inbox.recv().await.unwrap(), "a");
        assert_eq!(inbox.recv().await.unwrap(), "b");
        assert_eq!(inbox.recv().await.unwrap(), "c");
    }

    #[tokio::test]
    async fn test_push_times_out_when_full() {
        let registry = Registry::new(1);
        registry.insert(1).await.unwrap();
        let outbox = registry.lookup(1).await.unwrap();

        outbox
            .push(Bytes::from_static(b"first"), Duration::from_millis(10))
            .await
            .unwrap();
        let result = outbox
            .push(Bytes::from_static(b"second"), Duration::from_millis(20))
            .await;

        assert_eq!(result, Err(PushError::Full));
    }

    #[tokio::test]
    async fn test_single_consumer() {
        let registry = Registry::new(4);
        registry.insert(5).await.unwrap();

        let inbox = registry.attach(5).await.unwrap();
        assert!(matches!(
            registry.attach(5).await,
            Err(HubError::ReceiverBusy(5))
        ));

        drop(inbox);
        assert!(registry.attach(5).await.is_ok());
    }

    #[tokio::test]
    async fn test_inbox_closes_after_remove() {
        let registry = Registry::new(4);
        registry.insert(9).await.unwrap();
        let mut inbox = registry.attach(9).await.unwrap();

        registry
            .lookup(9)
            .await
            .unwrap()
            .push(Bytes::from_static(b"last"), Duration::from_millis(10))
            .await
            .unwrap();
        registry.remove(9).await;

        assert_eq!(inbox.recv().await.unwrap(), "last");
        assert!(inbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_remove_attached_spares_reregistration() {
        let registry = Registry::new(4);
        registry.insert(42).await.unwrap();
        let stale = registry.attach(42).await.unwrap();

        registry.remove(42).await;
        registry.insert(42).await.unwrap();

        assert!(!registry.remove_attached(stale.attachment()).await);
        assert!(registry.contains(42).await);
    }

    #[tokio::test]
    async fn test_resolve_is_all_or_nothing() {
        let registry = Registry::new(4);
        registry.insert(1).await.unwrap();
        registry.insert(2).await.unwrap();

        let resolved = registry.resolve(&[1, 2]).await.unwrap();
        assert_eq!(resolved.len(), 2);

        let err = registry.resolve(&[1, 3, 2]).await.err().unwrap();
        assert!(matches!(err, HubError::RecipientNotRegistered(3)));
    }
}
