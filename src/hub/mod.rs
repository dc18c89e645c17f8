// Rendezvous hub: identity registry, message routing and connection pumps
//
// Clients register to obtain a numeric identity, discover other
// identities, and exchange byte payloads addressed by identity, either
// over plain HTTP requests or over a persistent WebSocket connection.

pub mod allocator;
pub mod cli;
pub mod commands;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod poll;
pub mod pump;
pub mod registry;
pub mod router;
pub mod server;
pub mod service;

pub use allocator::{parse_identity, IdentityAllocator};
pub use cli::{ClientCli, ClientCommand, HubArgs};
pub use client::{verify_recipients, HubClient, HubConnection};
pub use config::HubConfig;
pub use envelope::{Envelope, ListResponse};
pub use error::{ErrorBody, ErrorKind, HubError};
pub use poll::{poll_once, PollOutcome};
pub use pump::{CloseCause, ConnectionPump, PumpReport, WireFrame};
pub use registry::{Identity, Inbox, Outbox, Registry};
pub use router::{Delivery, MessageRouter, RecipientList};
pub use server::{router, serve};
pub use service::Hub;
