// CLI definitions for the hub server and the command client

use clap::{Args, Parser, Subcommand};

/// Hub server arguments
#[derive(Debug, Clone, Parser)]
#[command(name = "relayhub")]
#[command(about = "In-memory rendezvous hub relaying byte payloads between registered clients")]
pub struct HubArgs {
    /// Interface to bind to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port the hub is exposed on (0 = auto-assign)
    #[arg(short, long, default_value = "8080")]
    pub port: u16,

    /// Maximum recipients accepted in one send
    #[arg(long, default_value = "255")]
    pub max_recipients: usize,

    /// Payloads buffered per identity before senders block
    #[arg(long, default_value = "64")]
    pub queue_capacity: usize,

    /// How long a send waits on a full recipient queue, in milliseconds
    #[arg(long, default_value = "5000")]
    pub send_timeout_ms: u64,

    /// Random identities tried before registration gives up
    #[arg(long, default_value = "10")]
    pub allocation_attempts: usize,

    /// Largest payload accepted, in bytes
    #[arg(long, default_value = "1024000")]
    pub max_payload_bytes: usize,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

/// Command client arguments
#[derive(Debug, Parser)]
#[command(name = "relayhub-client")]
#[command(about = "Talk to a relayhub from the command line")]
pub struct ClientCli {
    /// Address and port of the hub
    #[arg(short, long, default_value = "localhost:8080", global = true)]
    pub address: String,

    #[command(subcommand)]
    pub command: ClientCommand,
}

/// Identity to act as; omitted means register a fresh one
#[derive(Debug, Clone, Args)]
pub struct IdentityArg {
    /// Use this already registered identity
    #[arg(short, long)]
    pub id: Option<u64>,
}

/// Command client subcommands
#[derive(Debug, Subcommand)]
pub enum ClientCommand {
    /// Register an identity (random unless --id is given) and print it
    Register {
        /// Identity to request
        #[arg(short, long)]
        id: Option<u64>,
    },

    /// Confirm an identity is registered
    Identify {
        /// Identity to check
        id: u64,
    },

    /// List other registered identities
    Users {
        #[command(flatten)]
        identity: IdentityArg,
    },

    /// Send data to one or more recipients
    Send {
        /// Recipient identities (csv)
        #[arg(short, long)]
        recipients: String,

        /// Data to send; read from --file or stdin when omitted
        message: Option<String>,

        /// Send the contents of this file
        #[arg(short, long, conflicts_with = "message")]
        file: Option<std::path::PathBuf>,

        #[command(flatten)]
        identity: IdentityArg,
    },

    /// Open a WebSocket and print incoming payloads
    Listen {
        #[command(flatten)]
        identity: IdentityArg,

        /// Exit after this many payloads
        #[arg(short, long)]
        count: Option<usize>,
    },

    /// Unregister an identity
    Unregister {
        /// Identity to drop
        id: u64,
    },
}
