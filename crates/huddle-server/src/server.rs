//! WebSocket transport for the Huddle gateway.
//!
//! Each upgrade is authenticated, registered with the [`Gateway`] and then
//! served by two halves: a writer task draining the connection's outbound
//! queue, and a read loop feeding decoded events to the session one at a time.

use crate::auth::{AuthError, Authenticator, TrustedHeader};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use huddle_core::{Gateway, Outbound, Session};
use huddle_protocol::{
    ClientEvent, Encoding, ErrorCode, FrameCodec, ServerEvent, UserId, WireFrame, PROTOCOL_VERSION,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Shared server state.
pub struct AppState {
    /// The connection lifecycle controller.
    pub gateway: Gateway,
    /// Server configuration.
    pub config: Config,
    authenticator: Box<dyn Authenticator>,
    codec: FrameCodec,
}

impl AppState {
    /// Build the standard gateway, identifying peers by the configured header.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured identity header is invalid.
    pub fn new(config: Config) -> Result<Self, AuthError> {
        let authenticator = TrustedHeader::from_config(&config.auth)?;
        Ok(Self::with_authenticator(config, authenticator))
    }

    #[must_use]
    pub fn with_authenticator(config: Config, authenticator: impl Authenticator + 'static) -> Self {
        Self {
            gateway: Gateway::standard(config.gateway()),
            codec: config.codec(),
            authenticator: Box::new(authenticator),
            config,
        }
    }
}

/// Handshake query parameters.
#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    encoding: Option<String>,
    v: Option<u8>,
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()).context("Invalid auth configuration")?);

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Huddle server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.gateway.rooms().stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": stats.connection_count,
        "rooms": stats.room_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    // Soft limit: upgrades racing past this check may overshoot it briefly.
    let max_connections = state.config.limits.max_connections;
    if state.gateway.registry().len() >= max_connections {
        warn!(max = max_connections, "Connection limit reached");
        metrics::record_rejection("capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    }

    let encoding = match params.encoding.as_deref().map(str::parse::<Encoding>) {
        None => Encoding::default(),
        Some(Ok(encoding)) => encoding,
        Some(Err(e)) => {
            metrics::record_rejection("encoding");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    if let Err(e) = PROTOCOL_VERSION.negotiate(params.v) {
        debug!(error = %e, "Protocol version rejected");
        metrics::record_rejection("version");
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    let user_id = match state.authenticator.authenticate(&headers) {
        Ok(user_id) => user_id,
        Err(e) => {
            debug!(error = %e, "Upgrade rejected");
            metrics::record_rejection("auth");
            let status = match e {
                AuthError::Missing => StatusCode::UNAUTHORIZED,
                _ => StatusCode::BAD_REQUEST,
            };
            return (status, e.to_string()).into_response();
        }
    };

    let max_frame_size = state.codec.max_frame_size();
    ws.max_message_size(max_frame_size)
        .max_frame_size(max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, user_id, encoding))
}

/// Serve one WebSocket connection until it closes.
///
/// Teardown runs however the read side ends, including a panic inside it.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: Option<UserId>,
    encoding: Encoding,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (session, outbound) = state.gateway.connect(user_id);
    let id = session.id().clone();
    let span = session.socket().span().clone();
    let (sender, receiver) = socket.split();

    let mut writer = tokio::spawn(
        write_loop(sender, outbound, state.codec, encoding).instrument(span.clone()),
    );
    let mut reader = tokio::spawn(
        read_loop(receiver, session, Arc::clone(&state)).instrument(span.clone()),
    );

    async {
        debug!(encoding = encoding.as_str(), "WebSocket connected");

        tokio::select! {
            result = &mut reader => {
                if let Err(e) = result {
                    error!(error = %e, "Read loop aborted");
                    metrics::record_error("reader");
                }
            }
            _ = &mut writer => {
                debug!("Writer finished");
                reader.abort();
            }
        }

        state.gateway.disconnect(&id).await;
        writer.abort();
        metrics::set_active_rooms(state.gateway.rooms().stats().room_count);
        debug!("WebSocket disconnected");
    }
    .instrument(span)
    .await;
}

/// Forward outbound events to the peer until the queue closes or the peer
/// stops accepting frames.
async fn write_loop(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound: Outbound,
    codec: FrameCodec,
    encoding: Encoding,
) {
    while let Some(event) = outbound.recv().await {
        let frame = match codec.encode_server(&event, encoding) {
            Ok(frame) => frame,
            Err(e) => {
                error!(event = %event.kind(), error = %e, "Failed to encode event");
                metrics::record_error("encode");
                continue;
            }
        };

        metrics::record_frame(frame.len(), "outbound");
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data),
        };
        if sender.send(message).await.is_err() {
            debug!("Peer stopped accepting frames");
            break;
        }
    }

    let _ = sender.close().await;
}

async fn read_loop(
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    session: Session,
    state: Arc<AppState>,
) {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_frame(&session, &state, text.as_bytes(), Encoding::Json).await;
            }
            Ok(Message::Binary(data)) => {
                handle_frame(&session, &state, &data, Encoding::MessagePack).await;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Pongs are queued by the WebSocket layer itself.
                trace!("Heartbeat");
            }
            Ok(Message::Close(_)) => {
                debug!("Received close frame");
                return;
            }
            Err(e) => {
                warn!(error = %e, "WebSocket error");
                metrics::record_error("websocket");
                return;
            }
        }
    }

    debug!("WebSocket stream ended");
}

/// Decode and dispatch one inbound frame.
///
/// Text frames carry JSON and binary frames carry MessagePack, whatever the
/// connection negotiated for outbound traffic.
async fn handle_frame(session: &Session, state: &AppState, data: &[u8], encoding: Encoding) {
    metrics::record_frame(data.len(), "inbound");

    let event = match state.codec.decode_client(data, encoding) {
        Ok(event) => event,
        Err(e) => {
            warn!(encoding = encoding.as_str(), error = %e, "Rejected inbound frame");
            metrics::record_error("decode");
            if let Err(e) = session
                .socket()
                .emit(ServerEvent::error(ErrorCode::InvalidPayload, e.to_string()))
            {
                warn!(error = %e, "Could not report invalid payload");
            }
            return;
        }
    };

    let membership_change = matches!(
        event,
        ClientEvent::RoomJoin(_) | ClientEvent::RoomLeave(_)
    );

    let start = Instant::now();
    session.dispatch(event).await;
    metrics::record_dispatch(start.elapsed().as_secs_f64());

    if membership_change {
        metrics::set_active_rooms(state.gateway.rooms().stats().room_count);
    }
}
