// Error taxonomy for the hub and its HTTP mapping

use crate::hub::registry::Identity;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad category of a [`HubError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed identity or recipient, missing required parameter
    InvalidArgument,
    /// Identity already registered, or already has a receiver attached
    Conflict,
    /// Identity or recipient not registered
    NotFound,
    /// Allocation retries exhausted, or a recipient queue stayed full
    ResourceExhausted,
    /// I/O failure on an established duplex connection
    ConnectionFault,
    /// Anything unexpected
    Internal,
}

/// Errors produced by the registry, allocator, router and pump
#[derive(Debug, Error)]
pub enum HubError {
    #[error("ID is required")]
    MissingIdentity,

    #[error("parsing {raw:?}: {reason}")]
    InvalidIdentity { raw: String, reason: String },

    #[error("ID already in use")]
    IdentityInUse(Identity),

    #[error("ID not registered")]
    NotRegistered(Identity),

    #[error("ID already has an active receiver")]
    ReceiverBusy(Identity),

    #[error("Failed to find ID not in use after {attempts} attempts")]
    AllocationExhausted { attempts: usize },

    #[error("IDs are required (csv)")]
    MissingRecipients,

    #[error("Maximum number of clients to send messages is {max}")]
    TooManyRecipients { count: usize, max: usize },

    #[error("parsing recipient {raw:?}: {reason}")]
    InvalidRecipient { raw: String, reason: String },

    #[error("ID not registered: {0}")]
    RecipientNotRegistered(Identity),

    #[error("Body expected for a sendmessage call")]
    MissingPayload,

    #[error("Payload exceeds the {max} byte limit")]
    PayloadTooLarge { max: usize },

    #[error("queue for recipient {recipient} is full; delivered to {delivered:?} before giving up")]
    RecipientQueueFull {
        recipient: Identity,
        delivered: Vec<Identity>,
    },

    #[error("recipient {recipient} unregistered during delivery; delivered to {delivered:?}")]
    RecipientDisconnected {
        recipient: Identity,
        delivered: Vec<Identity>,
    },

    #[error("connection fault: {0}")]
    ConnectionFault(String),

    #[error("{0}")]
    Internal(String),
}

impl HubError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::MissingIdentity
            | HubError::InvalidIdentity { .. }
            | HubError::MissingRecipients
            | HubError::TooManyRecipients { .. }
            | HubError::InvalidRecipient { .. }
            | HubError::MissingPayload
            | HubError::PayloadTooLarge { .. } => ErrorKind::InvalidArgument,
            HubError::IdentityInUse(_) | HubError::ReceiverBusy(_) => ErrorKind::Conflict,
            HubError::NotRegistered(_)
            | HubError::RecipientNotRegistered(_)
            | HubError::RecipientDisconnected { .. } => ErrorKind::NotFound,
            HubError::AllocationExhausted { .. } | HubError::RecipientQueueFull { .. } => {
                ErrorKind::ResourceExhausted
            }
            HubError::ConnectionFault(_) => ErrorKind::ConnectionFault,
            HubError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when some, but not all, recipients already received the payload
    pub fn is_partial_delivery(&self) -> bool {
        matches!(
            self,
            HubError::RecipientQueueFull { .. } | HubError::RecipientDisconnected { .. }
        )
    }

    /// HTTP status the facade answers with
    pub fn status_code(&self) -> StatusCode {
        match self {
            HubError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            e if e.is_partial_delivery() => StatusCode::SERVICE_UNAVAILABLE,
            e => match e.kind() {
                ErrorKind::InvalidArgument | ErrorKind::Conflict | ErrorKind::NotFound => {
                    StatusCode::BAD_REQUEST
                }
                ErrorKind::ResourceExhausted
                | ErrorKind::ConnectionFault
                | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

/// JSON body of every error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: status.canonical_reason().unwrap_or("Unknown").to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::warn!("Request rejected: {}", self);
        }
        (status, Json(ErrorBody::new(status, self.to_string()))).into_response()
    }
}
