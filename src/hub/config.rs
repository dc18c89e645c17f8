// Hub configuration

use crate::hub::cli::HubArgs;
use anyhow::{bail, Result};
use std::time::Duration;

/// Limits, timeouts and listen address for one hub instance
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Interface to bind the HTTP listener to
    pub host: String,

    /// Port to listen on (0 = auto-assign)
    pub port: u16,

    /// Maximum recipients accepted in one send
    pub max_recipients: usize,

    /// Payloads buffered per identity before senders block
    pub queue_capacity: usize,

    /// How long a send waits on a full recipient queue
    pub send_timeout: Duration,

    /// Random candidates tried before allocation gives up
    pub allocation_attempts: usize,

    /// Largest payload accepted over HTTP or WebSocket
    pub max_payload_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_recipients: 255,
            queue_capacity: 64,
            send_timeout: Duration::from_secs(5),
            allocation_attempts: 10,
            max_payload_bytes: 1_024_000,
        }
    }
}

impl HubConfig {
    /// Build a configuration from command-line arguments
    pub fn from_args(args: &HubArgs) -> Result<Self> {
        let config = Self {
            host: args.host.clone(),
            port: args.port,
            max_recipients: args.max_recipients,
            queue_capacity: args.queue_capacity,
            send_timeout: Duration::from_millis(args.send_timeout_ms),
            allocation_attempts: args.allocation_attempts,
            max_payload_bytes: args.max_payload_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make the hub unusable
    pub fn validate(&self) -> Result<()> {
        if self.max_recipients == 0 {
            bail!("max recipients must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be at least 1");
        }
        if self.allocation_attempts == 0 {
            bail!("allocation attempts must be at least 1");
        }
        if self.max_payload_bytes == 0 {
            bail!("max payload size must be at least 1 byte");
        }
        Ok(())
    }

    /// Host and port to bind the listener to; the host may be a name
    pub fn listen_addr(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}
