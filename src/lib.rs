//! relayhub - in-memory rendezvous hub
//!
//! Clients register to obtain a 64-bit identity, list other identities,
//! and relay opaque byte payloads to one or more of them. Nothing is
//! persisted and nothing is authenticated.

pub mod hub;

pub use hub::{Hub, HubConfig, HubError};
