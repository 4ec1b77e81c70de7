use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::engine::Capabilities;
use crate::engine::ChannelId;
use crate::engine::Command;
use crate::engine::CommandError;
use crate::engine::DEFAULT_CHANNEL;
use crate::engine::Device;
use crate::engine::Engine;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    gateway: String,
    devices: usize,
    complete_devices: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// A device as served by the API
#[derive(Serialize)]
struct DeviceView {
    key: String,
    #[serde(flatten)]
    device: Device,
    capabilities: Capabilities,
    complete: bool,
}

impl From<Device> for DeviceView {
    fn from(device: Device) -> Self {
        Self {
            key: device.key().to_string(),
            capabilities: device.capabilities(),
            complete: device.is_complete(),
            device,
        }
    }
}

/// Body of POST /v1/devices/:key/command
#[derive(Debug, Deserialize)]
struct CommandRequest {
    #[serde(default)]
    channel: Option<ChannelId>,
    command: Command,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
}

fn error(status: StatusCode, message: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            gateway: state.engine.gateway_id().to_string(),
            devices: state.engine.store().len(),
            complete_devices: state.engine.complete_devices().len(),
        }),
    )
}

/// Handler for GET /v1/devices
#[tracing::instrument(skip(state))]
async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let devices: Vec<DeviceView> = state
        .engine
        .devices()
        .into_iter()
        .map(DeviceView::from)
        .collect();
    Json(devices)
}

/// Handler for GET /v1/devices/:key
#[tracing::instrument(skip(state))]
async fn get_device(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.engine.device(&key) {
        Some(device) => Json(DeviceView::from(device)).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("unknown device: {}", key)),
    }
}

/// Handler for DELETE /v1/devices/:key
#[tracing::instrument(skip(state))]
async fn remove_device(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    match state.engine.remove_device(&key) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => error(StatusCode::NOT_FOUND, format!("unknown device: {}", key)),
    }
}

/// Handler for POST /v1/devices/:key/command
#[tracing::instrument(skip(state))]
async fn send_command(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Response {
    let channel = request.channel.unwrap_or(DEFAULT_CHANNEL);
    match state.engine.send_command(&key, channel, &request.command) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            let status = match e {
                CommandError::UnknownDevice(_) => StatusCode::NOT_FOUND,
                CommandError::InvalidValue(_) => StatusCode::BAD_REQUEST,
                CommandError::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            };
            tracing::warn!("Command for {} rejected: {}", key, e);
            error(status, e)
        }
    }
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/devices", get(list_devices))
        .route("/v1/devices/:key", get(get_device).delete(remove_device))
        .route("/v1/devices/:key/command", post(send_command))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires.
pub async fn serve(
    listen: String,
    port: u16,
    engine: Arc<Engine>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState { version, engine });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
