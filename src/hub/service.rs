// The hub instance: registry, allocator and router behind one handle

use crate::hub::allocator::{parse_identity, IdentityAllocator};
use crate::hub::config::HubConfig;
use crate::hub::error::HubError;
use crate::hub::registry::{Identity, Inbox, Registry};
use crate::hub::router::{Delivery, MessageRouter};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// One independent hub. Nothing is global, so several can share a process.
pub struct Hub {
    config: HubConfig,
    registry: Registry,
    allocator: IdentityAllocator,
    router: MessageRouter,
    shutdown: CancellationToken,
}

impl Hub {
    /// Create a hub drawing random identities
    pub fn new(config: HubConfig) -> Self {
        let allocator = IdentityAllocator::new(config.allocation_attempts);
        Self::with_allocator(config, allocator)
    }

    /// Create a hub with a custom allocator
    pub fn with_allocator(config: HubConfig, allocator: IdentityAllocator) -> Self {
        let router = MessageRouter::new(
            config.max_recipients,
            config.max_payload_bytes,
            config.send_timeout,
        );

        Self {
            registry: Registry::new(config.queue_capacity),
            allocator,
            router,
            shutdown: CancellationToken::new(),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Register the requested identity, or a random one if none given
    pub async fn register(&self, requested: Option<&str>) -> Result<Identity, HubError> {
        self.allocator.register(&self.registry, requested).await
    }

    /// Confirm an identity is registered
    pub async fn identify(&self, raw: Option<&str>) -> Result<Identity, HubError> {
        self.allocator.identify(&self.registry, raw).await
    }

    /// Drop an identity and its queue
    pub async fn unregister(&self, raw: Option<&str>) -> Result<Identity, HubError> {
        let identity = parse_identity(raw)?;
        if self.registry.remove(identity).await {
            Ok(identity)
        } else {
            Err(HubError::NotRegistered(identity))
        }
    }

    /// Registered identities other than `caller`
    pub async fn list_others(&self, caller: Option<Identity>) -> Vec<Identity> {
        self.router.list_others(&self.registry, caller).await
    }

    /// Deliver `payload` to every identity in the csv `recipients`
    pub async fn route(&self, recipients: &str, payload: Bytes) -> Result<Delivery, HubError> {
        self.router.route(&self.registry, recipients, payload).await
    }

    /// Validate an identity parameter and take the consumer side of its queue
    pub async fn attach(&self, raw: Option<&str>) -> Result<Inbox, HubError> {
        let identity = parse_identity(raw)?;
        self.registry.attach(identity).await
    }

    /// Token cancelled when the hub shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting requests and end every pump and poll
    pub fn shutdown(&self) {
        tracing::info!("Hub shutting down");
        self.shutdown.cancel();
    }
}
