// Client for the hub's HTTP and WebSocket interfaces

use crate::hub::envelope::{Envelope, ListResponse};
use crate::hub::error::ErrorBody;
use crate::hub::registry::Identity;
use crate::hub::router::RecipientList;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Most recipients the hub accepts by default
pub const MAX_RECIPIENTS: usize = 255;

/// Largest payload the hub accepts by default
pub const MAX_DATA_SIZE: usize = 1_024_000;

/// Check a recipient csv the same way the hub will
pub fn verify_recipients(recipients: &str, max: usize) -> Result<()> {
    RecipientList::parse(recipients, max)
        .map(|_| ())
        .context("Invalid recipients")
}

/// A registered client of one hub
pub struct HubClient {
    http: reqwest::Client,
    address: String,
    id: Identity,
}

impl HubClient {
    /// Register a fresh random identity with the hub at `address` (host:port)
    pub async fn register(address: &str) -> Result<Self> {
        Self::register_with(address, None).await
    }

    /// Register, requesting a specific identity if given
    pub async fn register_with(address: &str, requested: Option<Identity>) -> Result<Self> {
        let http = reqwest::Client::new();
        let mut url = format!("http://{}/register", address);
        if let Some(id) = requested {
            url.push_str(&format!("?id={}", id));
        }

        let id: Identity = fetch_json(http.get(&url))
            .await
            .context("Failed to register client")?;

        tracing::debug!("Registered with {} as {}", address, id);

        Ok(Self {
            http,
            address: address.to_string(),
            id,
        })
    }

    /// Act as an identity registered earlier
    pub fn attach(address: &str, id: Identity) -> Self {
        Self {
            http: reqwest::Client::new(),
            address: address.to_string(),
            id,
        }
    }

    pub fn id(&self) -> Identity {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    /// Ask the hub to confirm this client's identity
    pub async fn identify(&self) -> Result<Identity> {
        let url = self.url(&format!("/identify?id={}", self.id));
        fetch_json(self.http.get(&url)).await
    }

    /// Identities registered besides this one
    pub async fn list_users(&self) -> Result<Vec<Identity>> {
        let url = self.url(&format!("/users?id={}", self.id));
        let resp: ListResponse = fetch_json(self.http.get(&url)).await?;
        Ok(resp.ids)
    }

    /// Every registered identity
    pub async fn list_all(&self) -> Result<Vec<Identity>> {
        let resp: ListResponse = fetch_json(self.http.get(self.url("/list"))).await?;
        Ok(resp.ids)
    }

    /// Send `data` to the recipients in `recipients` (csv) over HTTP
    pub async fn send(&self, recipients: &str, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let resp = self
            .http
            .post(self.url("/send"))
            .query(&[("ids", recipients)])
            .body(data)
            .send()
            .await
            .with_context(|| format!("Failed to reach hub {}", self.address))?;
        check_status(resp).await?;
        Ok(())
    }

    /// Wait for one payload addressed to this client
    pub async fn poll(&self) -> Result<Bytes> {
        let url = self.url(&format!("/stream?id={}", self.id));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach hub {}", self.address))?;
        let resp = check_status(resp).await?;
        resp.bytes().await.context("Failed to read payload")
    }

    /// Drop this client's registration
    pub async fn unregister(&self) -> Result<()> {
        let url = self.url(&format!("/unregister?id={}", self.id));
        let _: Identity = fetch_json(self.http.post(&url)).await?;
        Ok(())
    }

    /// Open the duplex connection for this identity
    pub async fn connect(&self) -> Result<HubConnection> {
        let url = format!("ws://{}/ws?id={}", self.address, self.id);
        let (ws, resp) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to dial websocket {}", url))?;

        // 101 = Switching Protocols
        if resp.status().as_u16() != 101 {
            bail!("Non-101 return code: {}", resp.status());
        }

        Ok(HubConnection { ws, id: self.id })
    }
}

/// Live WebSocket connection to the hub
pub struct HubConnection {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    id: Identity,
}

impl HubConnection {
    pub fn id(&self) -> Identity {
        self.id
    }

    /// Send `data` to the recipients in `recipients` (csv)
    pub async fn send(&mut self, recipients: &str, data: impl Into<Bytes>) -> Result<()> {
        let text = Envelope::new(recipients, data)
            .to_text()
            .context("Failed to marshal message")?;
        self.send_raw(text).await
    }

    /// Send a text frame as-is
    pub async fn send_raw(&mut self, text: String) -> Result<()> {
        self.ws
            .send(Message::Text(text))
            .await
            .context("Failed to write message")
    }

    /// Next envelope from the hub, or `None` once the connection closed
    pub async fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        while let Some(message) = self.ws.next().await {
            match message.context("Failed to read message")? {
                Message::Text(text) => return Ok(Some(Envelope::from_slice(text.as_bytes())?)),
                Message::Binary(data) => return Ok(Some(Envelope::from_slice(&data)?)),
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }

    /// Next payload addressed to this client
    pub async fn next_payload(&mut self) -> Result<Option<Bytes>> {
        Ok(self.next_envelope().await?.map(|envelope| envelope.data))
    }

    /// Close the connection; the hub unregisters this identity
    pub async fn close(mut self) -> Result<()> {
        self.ws
            .close(None)
            .await
            .context("Failed to close websocket")
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }

    let status = resp.status();
    match resp.json::<ErrorBody>().await {
        Ok(body) => bail!("{}: {}", body.status, body.message),
        Err(_) => bail!("Hub returned {}", status),
    }
}

async fn fetch_json<T: DeserializeOwned>(req: reqwest::RequestBuilder) -> Result<T> {
    let resp = req.send().await.context("Failed to reach hub")?;
    let resp = check_status(resp).await?;
    resp.json::<T>()
        .await
        .context("Failed to unmarshal response")
}
