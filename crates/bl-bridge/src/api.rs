//! HTTP API: bootloader commands, device status and the SSE event stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::multipart::MultipartError;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bl_protocol::{Command, EraseFlashRequest, ReadFlashRequest, WriteFlashRequest};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::bridge::CommandBridge;
use crate::error::{BridgeError, HubError};
use crate::hub::{ConnectivityEvent, HubHandle};
use crate::stats::{LinkStats, StatsSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<CommandBridge>,
    pub hub: HubHandle,
    pub stats: Arc<LinkStats>,
}

async fn log_request(request: Request, next: Next) -> Response {
    info!("{} {}", request.method(), request.uri().path());
    next.run(request).await
}

/// Room for multipart boundaries and the `address` part on top of the file.
const FORM_OVERHEAD_BYTES: usize = 16 * 1024;

/// Router for the HTTP API. Uploads larger than `max_upload_bytes` are refused.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/bl/version", get(read_version))
        .route("/bl/erase", post(erase_flash))
        .route("/bl/flash", post(write_flash))
        .route("/bl/read", post(read_flash))
        .route("/bl/jump", post(jump_to_app))
        .route("/bl/status", get(status))
        .route("/bl/health", get(health))
        .route("/events", get(events))
        .layer(DefaultBodyLimit::max(max_upload_bytes.saturating_add(FORM_OVERHEAD_BYTES)))
        .layer(middleware::from_fn(log_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn run(state: &AppState, command: Command) -> Result<Response, ApiError> {
    let response = state.bridge.execute(command).await?;
    Ok(Json(response).into_response())
}

async fn read_version(State(state): State<AppState>) -> Result<Response, ApiError> {
    run(&state, Command::ReadVersion).await
}

async fn erase_flash(
    State(state): State<AppState>,
    body: Result<Json<EraseFlashRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(ApiError::from_rejection)?;
    run(&state, Command::EraseFlash(request)).await
}

async fn read_flash(
    State(state): State<AppState>,
    body: Result<Json<ReadFlashRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(ApiError::from_rejection)?;
    run(&state, Command::ReadFlash(request)).await
}

async fn jump_to_app(State(state): State<AppState>) -> Result<Response, ApiError> {
    run(&state, Command::JumpToApp).await
}

/// Multipart upload: a `file` part with the image and an `address` part.
async fn write_flash(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut data = None;
    let mut address = None;

    while let Some(field) = multipart.next_field().await.map_err(ApiError::from_multipart)? {
        match field.name() {
            Some("file") => {
                let bytes = field.bytes().await.map_err(ApiError::from_multipart)?;
                data = Some(bytes.to_vec());
            }
            Some("address") => {
                let text = field.text().await.map_err(ApiError::from_multipart)?;
                address = Some(parse_address(&text)?);
            }
            _ => {}
        }
    }

    let data = data.ok_or_else(|| ApiError::bad_request("missing multipart field `file`"))?;
    let address = address.ok_or_else(|| ApiError::bad_request("missing multipart field `address`"))?;
    info!(address, size = data.len(), "firmware upload received");
    run(&state, Command::WriteFlash(WriteFlashRequest::new(address, data))).await
}

/// Decimal, or hexadecimal with a `0x` prefix.
fn parse_address(text: &str) -> Result<u32, ApiError> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| ApiError::bad_request(&format!("invalid address `{text}`")))
}

async fn status(State(state): State<AppState>) -> Result<Json<ConnectivityEvent>, ApiError> {
    Ok(Json(state.hub.current().await?))
}

#[derive(Debug, Serialize)]
struct Health {
    connectivity: ConnectivityEvent,
    pending_commands: usize,
    active_callers: usize,
    subscribers: usize,
    #[serde(flatten)]
    stats: StatsSnapshot,
}

async fn health(State(state): State<AppState>) -> Result<Json<Health>, ApiError> {
    Ok(Json(Health {
        connectivity: state.hub.current().await?,
        pending_commands: state.bridge.pending(),
        active_callers: state.bridge.callers(),
        subscribers: state.hub.subscriber_count().await?,
        stats: state.stats.snapshot(),
    }))
}

async fn events(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.hub.register().await?;
    let stream = subscription
        .map(|event| Ok::<Event, Infallible>(Event::default().event("message").data(event.as_str())));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }

    fn from_rejection(rejection: JsonRejection) -> Self {
        Self::bad_request(&rejection.body_text())
    }

    fn from_multipart(err: MultipartError) -> Self {
        Self::bad_request(&err.body_text())
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        let status = match &err {
            BridgeError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::LinkLost | BridgeError::DeviceTimeout(_) | BridgeError::Malformed(_) => {
                StatusCode::BAD_GATEWAY
            }
            BridgeError::ResponseDropped | BridgeError::Mismatch { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        warn!(%status, error = %err, "command failed");
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = Json(serde_json::json!({
            "error": self.message,
        }))
        .into_response();
        *response.status_mut() = self.status;
        response
    }
}
