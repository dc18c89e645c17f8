// Command handlers for the command client

use crate::hub::cli::{ClientCommand, IdentityArg};
use crate::hub::client::{verify_recipients, HubClient, MAX_DATA_SIZE, MAX_RECIPIENTS};
use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::Path;

/// Execute a client command against the hub at `address`
pub async fn execute_command(address: &str, command: ClientCommand) -> Result<()> {
    match command {
        ClientCommand::Register { id } => handle_register(address, id).await,
        ClientCommand::Identify { id } => handle_identify(address, id).await,
        ClientCommand::Users { identity } => handle_users(address, identity).await,
        ClientCommand::Send {
            recipients,
            message,
            file,
            identity,
        } => handle_send(address, identity, recipients, message, file.as_deref()).await,
        ClientCommand::Listen { identity, count } => {
            handle_listen(address, identity, count).await
        }
        ClientCommand::Unregister { id } => handle_unregister(address, id).await,
    }
}

/// Client for `--id`, or for an identity registered just for this command.
///
/// The flag is true for the latter; pass it to [`release`] when done.
async fn client_for(address: &str, identity: IdentityArg) -> Result<(HubClient, bool)> {
    match identity.id {
        Some(id) => Ok((HubClient::attach(address, id), false)),
        None => Ok((HubClient::register(address).await?, true)),
    }
}

/// Unregister an identity that `client_for` registered for one command
async fn release(client: &HubClient, temporary: bool) -> Result<()> {
    if temporary {
        client
            .unregister()
            .await
            .with_context(|| format!("Failed to unregister temporary ID {}", client.id()))?;
    }
    Ok(())
}

async fn handle_register(address: &str, id: Option<u64>) -> Result<()> {
    let client = HubClient::register_with(address, id).await?;
    println!("{}", client.id());
    Ok(())
}

async fn handle_identify(address: &str, id: u64) -> Result<()> {
    let id = HubClient::attach(address, id).identify().await?;
    println!("Your ID: {}", id);
    Ok(())
}

async fn handle_users(address: &str, identity: IdentityArg) -> Result<()> {
    let (client, temporary) = client_for(address, identity).await?;
    let ids = client.list_users().await;
    release(&client, temporary).await?;
    let ids = ids?;

    if ids.is_empty() {
        println!("No other users connected");
    } else {
        println!("Connected users:");
        for id in ids {
            println!("  {}", id);
        }
    }
    Ok(())
}

async fn handle_send(
    address: &str,
    identity: IdentityArg,
    recipients: String,
    message: Option<String>,
    file: Option<&Path>,
) -> Result<()> {
    let recipients = recipients.trim().to_string();
    verify_recipients(&recipients, MAX_RECIPIENTS)?;

    let data = match (message, file) {
        (Some(message), _) => message.into_bytes(),
        (None, Some(path)) => read_file(path)?,
        (None, None) => {
            let mut buf = Vec::new();
            std::io::stdin()
                .take(MAX_DATA_SIZE as u64 + 1)
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    if data.len() > MAX_DATA_SIZE {
        bail!("Data is larger than max size({}) was {}", MAX_DATA_SIZE, data.len());
    }

    let (client, temporary) = client_for(address, identity).await?;
    let sent = client.send(&recipients, data).await;
    release(&client, temporary).await?;
    sent?;
    println!("✓ Sent to {}", recipients);
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat file {:?}", path))?;
    if meta.len() > MAX_DATA_SIZE as u64 {
        bail!("File exceeded max size({}) was: {}", MAX_DATA_SIZE, meta.len());
    }
    std::fs::read(path).with_context(|| format!("Failed to open file {:?}", path))
}

async fn handle_listen(address: &str, identity: IdentityArg, count: Option<usize>) -> Result<()> {
    // Closing the connection unregisters the identity
    let (client, temporary) = client_for(address, identity).await?;
    let mut conn = match client.connect().await {
        Ok(conn) => conn,
        Err(e) => {
            release(&client, temporary).await?;
            return Err(e);
        }
    };

    println!("Connected to hub {}. Your ID: {}", address, client.id());
    println!("Press Ctrl+C to stop listening\n");

    let mut received = 0usize;
    loop {
        tokio::select! {
            next = conn.next_payload() => match next? {
                Some(data) => {
                    println!("Incoming data: {}", String::from_utf8_lossy(&data));
                    received += 1;
                    if count.is_some_and(|max| received >= max) {
                        break;
                    }
                }
                None => {
                    println!("Hub closed the connection");
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    conn.close().await?;
    Ok(())
}

async fn handle_unregister(address: &str, id: u64) -> Result<()> {
    HubClient::attach(address, id).unregister().await?;
    println!("✓ Unregistered {}", id);
    Ok(())
}
