use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use server_api::{delete_message, get_messages, health, parse_window, send_message, update_message};
use shared::{
    error::ApiError,
    protocol::{
        DeleteMessageRequest, MessageUpdate, MessagesResponse, SendMessageRequest,
        SendMessageResponse, WindowQuery,
    },
};
use storage::Storage;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod hub;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

const MAX_BODY_BYTES: usize = 64 * 1024;

type HttpError = (StatusCode, String);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState::new(storage, &settings);
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let request_timeout = state.request_timeout;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/send-message", post(http_send_message))
        .route("/get-messages", get(http_get_messages))
        .route("/delete-message", post(http_delete_message))
        .route("/update-message", post(http_update_message))
        .route("/ws", get(ws_handler))
        .fallback(teapot)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    health(&state.api).await.map_err(server_error)?;
    Ok("ok")
}

async fn teapot() -> impl IntoResponse {
    (StatusCode::IM_A_TEAPOT, "I'm a teapot")
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SendMessageResponse>), HttpError> {
    let Json(req) = payload.map_err(bad_body)?;
    let message_id = send_message(&state.api, req).await.map_err(server_error)?;
    Ok((StatusCode::CREATED, Json(SendMessageResponse { message_id })))
}

async fn http_get_messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WindowQuery>,
) -> Result<Json<MessagesResponse>, HttpError> {
    let window = parse_window(q.start.as_deref(), q.end.as_deref()).map_err(server_error)?;
    let messages = get_messages(&state.api, window)
        .await
        .map_err(server_error)?;
    Ok(Json(MessagesResponse { messages }))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DeleteMessageRequest>, JsonRejection>,
) -> Result<StatusCode, HttpError> {
    let Json(req) = payload.map_err(bad_body)?;
    delete_message(&state.api, req.message_id)
        .await
        .map_err(server_error)?;
    Ok(StatusCode::OK)
}

async fn http_update_message(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MessageUpdate>, JsonRejection>,
) -> Result<StatusCode, HttpError> {
    let Json(update) = payload.map_err(bad_body)?;
    update_message(&state.api, update)
        .await
        .map_err(server_error)?;
    Ok(StatusCode::OK)
}

fn server_error(err: ApiError) -> HttpError {
    warn!(code = ?err.code, message = %err.message, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, err.message)
}

fn bad_body(rejection: JsonRejection) -> HttpError {
    warn!(%rejection, "rejected request body");
    (StatusCode::INTERNAL_SERVER_ERROR, rejection.body_text())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (session, mut frames_rx) = state.hub.connect().await;
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(error) => {
                    warn!(%error, kind = frame.kind(), "failed to encode realtime frame");
                    continue;
                }
            };
            if sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Text(text) => state.hub.handle_inbound(session, &text).await,
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    state.hub.close(session).await;
    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
