use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::flights_logic::config::Settings;
use crate::flights_logic::model::{FlightMessage, ParametersMessage};
use crate::flights_logic::state::AppState;
use lib_flights::{
    ClientIdentity, FlightOutbound, FlightRecord, InboundError, OutboundError, ParameterInbound,
    SearchParameters, SessionOutcome, SourceConnector,
};

// Close frame reasons are limited to 123 bytes.
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Default, Deserialize)]
pub struct AccessQuery {
    pub access_token: Option<String>,
}

pub fn router<C: SourceConnector>(app_state: AppState<C>) -> Router {
    Router::new()
        .route("/flights", get(ws_handler::<C>))
        .route("/health", get(health_handler::<C>))
        .with_state(app_state)
}

/// Serves until `shutdown` fires, over TLS when configured.
pub async fn run<C: SourceConnector>(
    settings: Settings,
    app_state: AppState<C>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    if let Some(tls) = settings.tls {
        let tls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
            .await
            .with_context(|| format!("loading TLS configuration from {}", tls.cert.display()))?;

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        let grace = settings.shutdown_grace;
        tokio::spawn(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
            shutdown_handle.graceful_shutdown(Some(grace));
        });

        log::info!("Downstream server listening on {} (TLS)", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(router(app_state).into_make_service())
            .await
            .context("TLS server failed")?;
    } else {
        log::warn!("TLS certificate or key not found, serving plain TCP.");
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        serve(listener, app_state, shutdown).await?;
    }

    Ok(())
}

/// Serves plain HTTP on an already bound listener until `shutdown` fires.
pub async fn serve<C: SourceConnector>(
    listener: TcpListener,
    app_state: AppState<C>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    log::info!("Downstream server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(app_state))
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await
        .context("server failed")?;
    Ok(())
}

async fn health_handler<C: SourceConnector>(State(state): State<AppState<C>>) -> impl IntoResponse {
    if state.is_serving() {
        (StatusCode::OK, "SERVING")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_SERVING")
    }
}

async fn ws_handler<C: SourceConnector>(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<AccessQuery>,
    State(state): State<AppState<C>>,
) -> Response {
    let Some(shutdown) = state.subscribe_shutdown() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "server stopping").into_response();
    };

    let credential = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.access_token);

    let identity = match state.authorizer.authorize(credential.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => {
            let outcome = SessionOutcome::Unauthorized(e.to_string());
            log::warn!("rejecting session: {}", outcome);
            return (StatusCode::UNAUTHORIZED, outcome.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity, shutdown))
}

async fn handle_socket<C: SourceConnector>(
    socket: WebSocket,
    state: AppState<C>,
    identity: ClientIdentity,
    shutdown: broadcast::Receiver<()>,
) {
    log::info!("[{}] client connected", identity);
    let (sink, stream) = socket.split();

    let session = state.coordinator.run(
        identity.clone(),
        WsInbound { stream },
        WsOutbound { sink },
        shutdown,
    );
    let outcome = state.sessions.track_future(session).await;

    log::info!("[{}] client disconnected: {}", identity, outcome);
}

/// Reads [`ParametersMessage`] frames off the socket.
pub struct WsInbound {
    stream: SplitStream<WebSocket>,
}

impl WsInbound {
    fn decode(bytes: &[u8]) -> Result<Option<SearchParameters>, InboundError> {
        // Empty frames (keep-alives) carry no parameters.
        if bytes.trim_ascii().is_empty() {
            return Ok(None);
        }
        serde_json::from_slice::<ParametersMessage>(bytes)
            .map(|msg| Some(msg.into()))
            .map_err(|e| InboundError::Transient(format!("invalid search parameters: {}", e)))
    }
}

impl ParameterInbound for WsInbound {
    async fn next_parameters(&mut self) -> Result<Option<SearchParameters>, InboundError> {
        match self.stream.next().await {
            None | Some(Ok(Message::Close(_))) => Err(InboundError::Closed),
            Some(Err(e)) => Err(InboundError::Transient(e.to_string())),
            Some(Ok(Message::Text(text))) => Self::decode(text.as_str().as_bytes()),
            Some(Ok(Message::Binary(bytes))) => Self::decode(&bytes),
            // Pings are answered by axum itself.
            Some(Ok(_)) => Ok(None),
        }
    }
}

/// Writes one [`FlightMessage`] text frame per flight.
pub struct WsOutbound {
    sink: SplitSink<WebSocket, Message>,
}

impl FlightOutbound for WsOutbound {
    async fn send_flight(&mut self, flight: &FlightRecord) -> Result<(), OutboundError> {
        let json = serde_json::to_string(&FlightMessage::from(flight))
            .map_err(|e| OutboundError::Disconnected(e.to_string()))?;
        self.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| OutboundError::Disconnected(e.to_string()))
    }

    async fn close(mut self, outcome: &SessionOutcome) {
        let frame = close_frame(outcome);
        // The peer may already be gone.
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            log::debug!("close frame not delivered: {}", e);
        }
        if let Err(e) = self.sink.close().await {
            log::debug!("websocket sink not closed cleanly: {}", e);
        }
    }
}

fn close_frame(outcome: &SessionOutcome) -> CloseFrame {
    let code = match outcome {
        SessionOutcome::ClientClosed => close_code::NORMAL,
        SessionOutcome::ServerStopped => close_code::AWAY,
        SessionOutcome::Unauthorized(_) => close_code::POLICY,
        SessionOutcome::InternalError(_) => close_code::ERROR,
    };
    CloseFrame {
        code,
        reason: truncate_reason(&outcome.to_string()).into(),
    }
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
