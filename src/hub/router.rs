// Recipient validation and fan-out

use crate::hub::error::HubError;
use crate::hub::registry::{Identity, PushError, Registry};
use bytes::Bytes;
use std::time::Duration;

/// Validated, de-duplicated recipients in the order they were given
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientList(Vec<Identity>);

impl RecipientList {
    /// Parse a comma separated list of identities.
    ///
    /// The token count is checked against `max` before any token is parsed.
    pub fn parse(raw: &str, max: usize) -> Result<Self, HubError> {
        if raw.trim().is_empty() {
            return Err(HubError::MissingRecipients);
        }

        let count = raw.split(',').count();
        if count > max {
            return Err(HubError::TooManyRecipients { count, max });
        }

        let mut ids = Vec::with_capacity(count);
        for token in raw.split(',').map(str::trim) {
            let id = token
                .parse::<Identity>()
                .map_err(|e| HubError::InvalidRecipient {
                    raw: token.to_string(),
                    reason: e.to_string(),
                })?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        Ok(Self(ids))
    }

    pub fn as_slice(&self) -> &[Identity] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Outcome of a fully successful fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Recipients that received the payload, in delivery order
    pub recipients: Vec<Identity>,
}

/// Validates recipients and fans payloads out to their queues
pub struct MessageRouter {
    max_recipients: usize,
    max_payload_bytes: usize,
    send_timeout: Duration,
}

impl MessageRouter {
    pub fn new(max_recipients: usize, max_payload_bytes: usize, send_timeout: Duration) -> Self {
        Self {
            max_recipients,
            max_payload_bytes,
            send_timeout,
        }
    }

    pub fn max_recipients(&self) -> usize {
        self.max_recipients
    }

    /// Every registered identity except the caller's own
    pub async fn list_others(&self, registry: &Registry, caller: Option<Identity>) -> Vec<Identity> {
        let mut ids = registry.snapshot().await;
        if let Some(caller) = caller {
            ids.retain(|&id| id != caller);
        }
        ids
    }

    /// Parse `recipients` and deliver `payload` to each of them
    pub async fn route(
        &self,
        registry: &Registry,
        recipients: &str,
        payload: Bytes,
    ) -> Result<Delivery, HubError> {
        let recipients = RecipientList::parse(recipients, self.max_recipients)?;
        self.route_to(registry, &recipients, payload).await
    }

    /// Deliver `payload` to an already parsed recipient list.
    ///
    /// Every recipient is resolved before the first push, so an unknown
    /// recipient leaves all queues untouched. Only a push that times out
    /// (or loses its recipient mid-delivery) can leave earlier recipients
    /// delivered; that error carries the list of who got the payload.
    pub async fn route_to(
        &self,
        registry: &Registry,
        recipients: &RecipientList,
        payload: Bytes,
    ) -> Result<Delivery, HubError> {
        if payload.is_empty() {
            return Err(HubError::MissingPayload);
        }
        if payload.len() > self.max_payload_bytes {
            return Err(HubError::PayloadTooLarge {
                max: self.max_payload_bytes,
            });
        }

        let outboxes = registry.resolve(recipients.as_slice()).await?;

        let mut delivered = Vec::with_capacity(outboxes.len());
        for outbox in outboxes {
            let recipient = outbox.identity();
            match outbox.push(payload.clone(), self.send_timeout).await {
                Ok(()) => delivered.push(recipient),
                Err(PushError::Full) => {
                    tracing::warn!(
                        "Queue for {} still full after {:?}, {} of {} recipients delivered",
                        recipient,
                        self.send_timeout,
                        delivered.len(),
                        recipients.len()
                    );
                    return Err(HubError::RecipientQueueFull {
                        recipient,
                        delivered,
                    });
                }
                Err(PushError::Closed) => {
                    return Err(HubError::RecipientDisconnected {
                        recipient,
                        delivered,
                    });
                }
            }
        }

        tracing::debug!(
            "Routed {} bytes to {} recipient(s)",
            payload.len(),
            delivered.len()
        );
        Ok(Delivery {
            recipients: delivered,
        })
    }
}
