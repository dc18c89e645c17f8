// HTTP facade over the hub
//
// Every endpoint is a thin translation from query/body parameters to a
// Hub call; errors become {"status", "message"} JSON bodies.

use crate::hub::allocator::parse_identity;
use crate::hub::envelope::ListResponse;
use crate::hub::error::{ErrorBody, HubError};
use crate::hub::poll::{poll_once, PollOutcome};
use crate::hub::pump::{ConnectionPump, WireFrame};
use crate::hub::registry::{Identity, Inbox};
use crate::hub::service::Hub;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        rejection::BytesRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// `?id=` query parameter
#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: Option<String>,
}

/// `?ids=` query parameter
#[derive(Debug, Deserialize)]
pub struct SendQuery {
    pub ids: Option<String>,
}

/// Build the router for a hub instance
pub fn router(hub: Arc<Hub>) -> Router {
    // One byte of slack so oversized bodies reach the router's own check
    let body_limit = hub.config().max_payload_bytes.saturating_add(1);

    Router::new()
        .route("/health", get(handle_health))
        .route("/register", get(handle_register))
        .route("/identify", get(handle_identify))
        .route("/unregister", post(handle_unregister))
        .route("/users", get(handle_users))
        .route("/list", get(handle_list))
        .route("/send", post(handle_send))
        .route("/stream", get(handle_stream))
        .route("/ws", get(handle_ws))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

/// Bind the configured address and serve until the hub shuts down.
///
/// Returns the bound address (useful when port=0) and the server task.
pub async fn serve(hub: Arc<Hub>) -> Result<(SocketAddr, JoinHandle<()>)> {
    let (host, port) = hub.config().listen_addr();
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", host, port))?;
    let actual_addr = listener.local_addr()?;

    let shutdown = hub.shutdown_token();
    let app = router(hub);

    info!("Hub listening on {}", actual_addr);

    let handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!("Server error: {}", e);
        }
        info!("Hub stopped");
    });

    Ok((actual_addr, handle))
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_register(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<Identity>, HubError> {
    let identity = hub.register(query.id.as_deref()).await?;
    Ok(Json(identity))
}

async fn handle_identify(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<Identity>, HubError> {
    let identity = hub.identify(query.id.as_deref()).await?;
    Ok(Json(identity))
}

async fn handle_unregister(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<Identity>, HubError> {
    let identity = hub.unregister(query.id.as_deref()).await?;
    Ok(Json(identity))
}

async fn handle_users(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<IdQuery>,
) -> Result<Json<ListResponse>, HubError> {
    let caller = parse_identity(query.id.as_deref())?;
    let ids = hub.list_others(Some(caller)).await;
    Ok(Json(ListResponse { ids }))
}

async fn handle_list(State(hub): State<Arc<Hub>>) -> Json<ListResponse> {
    let ids = hub.list_others(None).await;
    Json(ListResponse { ids })
}

async fn handle_send(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<SendQuery>,
    body: Result<Bytes, BytesRejection>,
) -> Result<StatusCode, HubError> {
    let ids = query
        .ids
        .as_deref()
        .filter(|ids| !ids.trim().is_empty())
        .ok_or(HubError::MissingRecipients)?;

    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            HubError::PayloadTooLarge {
                max: hub.config().max_payload_bytes,
            }
        } else {
            HubError::Internal(format!("Failed to read body: {}", rejection.body_text()))
        }
    })?;
    if body.is_empty() {
        return Err(HubError::MissingPayload);
    }

    hub.route(ids, body).await?;
    Ok(StatusCode::OK)
}

async fn handle_stream(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<IdQuery>,
) -> Result<Response, HubError> {
    let inbox = hub.attach(query.id.as_deref()).await?;
    let identity = inbox.identity();

    match poll_once(inbox, hub.shutdown_token()).await {
        PollOutcome::Delivered(payload) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            payload,
        )
            .into_response()),
        PollOutcome::Unregistered => Err(HubError::NotRegistered(identity)),
        PollOutcome::Cancelled => {
            let status = StatusCode::SERVICE_UNAVAILABLE;
            Ok((status, Json(ErrorBody::new(status, "Hub is shutting down"))).into_response())
        }
    }
}

async fn handle_ws(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<IdQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, HubError> {
    // Identity is checked before the upgrade so failures get a JSON body
    let inbox = hub.attach(query.id.as_deref()).await?;

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    // Base64 and the JSON wrapper inflate the payload
    let frame_limit = hub.config().max_payload_bytes.saturating_mul(2);

    Ok(ws
        .max_message_size(frame_limit)
        .on_upgrade(move |socket| run_socket(hub, inbox, socket)))
}

async fn run_socket(hub: Arc<Hub>, inbox: Inbox, socket: WebSocket) {
    let (sink, stream) = socket.split();

    let inbound = stream.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Text(text)) => Some(Ok(WireFrame::Data(Bytes::from(text)))),
            Ok(Message::Binary(data)) => Some(Ok(WireFrame::Data(Bytes::from(data)))),
            Ok(Message::Close(_)) => Some(Ok(WireFrame::Close)),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Err(e) => Some(Err(e)),
        })
    });
    let outbound =
        sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))));

    let report = ConnectionPump::new(hub, inbox).run(inbound, outbound).await;
    match report.fault() {
        Some(e) => warn!(
            "WebSocket session {} for {} failed: {}",
            report.session, report.identity, e
        ),
        None => debug!(
            "WebSocket session {} for {} ended: {:?}",
            report.session, report.identity, report.cause
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::config::HubConfig;

    #[tokio::test]
    async fn test_server_starts() {
        let hub = Arc::new(Hub::new(HubConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..HubConfig::default()
        }));

        let (addr, handle) = serve(hub.clone()).await.unwrap();
        assert!(addr.port() > 0);

        hub.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_binds_hostname() {
        let hub = Arc::new(Hub::new(HubConfig {
            host: "localhost".to_string(),
            port: 0,
            ..HubConfig::default()
        }));

        let (addr, handle) = serve(hub.clone()).await.unwrap();
        assert!(addr.ip().is_loopback());

        hub.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
