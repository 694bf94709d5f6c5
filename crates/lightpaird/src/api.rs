use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
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

use crate::pairing::Activation;
use crate::pairing::DeviceHost;
use crate::pairing::DeviceInfo;
use crate::pairing::FormField;
use crate::pairing::PairingEntity;
use crate::pairing::PairingError;
use crate::pairing::PairingForm;
use crate::pairing::PairingId;
use crate::pairing::PairingRegistry;
use crate::pairing::PairingState;
use crate::pairing::RegistryError;
use crate::pairing::TurnOnOutcome;
use crate::pairing::device::Brightness;
use crate::pairing::device::Color;
use crate::pairing::device::XyColor;

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
    pairings: usize,
}

/// A pairing as returned by the pairing endpoints
#[derive(Debug, Serialize)]
struct PairingResponse {
    id: PairingId,
    name: String,
    physical_device: String,
    smart_device: String,
    brightness_on_switch: u8,
    turn_off_physical_on_off: bool,
    awaiting_smart_device: bool,
    revision: u64,
    state: PairingState,
    device_info: DeviceInfo,
}

impl PairingResponse {
    fn from_entity<D: DeviceHost>(entity: &PairingEntity<D>) -> Self {
        let config = entity.config();
        let snapshot = entity.snapshot();
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            physical_device: config.physical_device.to_string(),
            smart_device: config.smart_device.to_string(),
            brightness_on_switch: config.brightness_on_switch,
            turn_off_physical_on_off: config.turn_off_physical_on_off,
            awaiting_smart_device: entity.controller().is_awaiting_smart_device(),
            revision: snapshot.revision,
            state: snapshot.state,
            device_info: entity.device_info(),
        }
    }
}

#[derive(Serialize)]
struct TurnOnResponse {
    outcome: &'static str,
    pairing: PairingResponse,
}

/// Body of POST /v1/pairings/:id/turn_on. Every field is optional; at most
/// one brightness form and one color form may be given.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TurnOnRequest {
    brightness_pct: Option<u8>,
    brightness: Option<u8>,
    color_temp: Option<u16>,
    xy_color: Option<[f32; 2]>,
}

impl TurnOnRequest {
    fn into_activation(self) -> Result<Activation, ApiError> {
        let brightness = match (self.brightness_pct, self.brightness) {
            (Some(_), Some(_)) => {
                return Err(ApiError::BadRequest(
                    "brightness_pct and brightness are mutually exclusive".to_string(),
                ));
            }
            (Some(pct), None) if pct > 100 => {
                return Err(ApiError::BadRequest(format!(
                    "brightness_pct {} is outside 0..=100",
                    pct
                )));
            }
            (Some(pct), None) => Some(Brightness::Percent(pct)),
            (None, Some(abs)) => Some(Brightness::Absolute(abs)),
            (None, None) => None,
        };

        let color = match (self.color_temp, self.xy_color) {
            (Some(_), Some(_)) => {
                return Err(ApiError::BadRequest(
                    "color_temp and xy_color are mutually exclusive".to_string(),
                ));
            }
            (Some(mireds), None) => Some(Color::Temperature(mireds)),
            (None, Some([x, y])) => Some(Color::Xy(XyColor { x, y })),
            (None, None) => None,
        };

        Ok(Activation { brightness, color })
    }
}

#[derive(Debug, Deserialize)]
struct CreatePairingRequest {
    id: String,
    #[serde(flatten)]
    form: PairingForm,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<FormField>,
}

#[derive(Debug)]
enum ApiError {
    Registry(RegistryError),
    Pairing(PairingError),
    BadRequest(String),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::Registry(e)
    }
}

impl From<PairingError> for ApiError {
    fn from(e: PairingError) -> Self {
        ApiError::Pairing(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, field) = match &self {
            ApiError::Registry(RegistryError::NotFound(_)) => (StatusCode::NOT_FOUND, None),
            ApiError::Registry(RegistryError::DuplicateId(_)) => (StatusCode::CONFLICT, None),
            ApiError::Registry(RegistryError::Configuration(e)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, Some(e.field))
            }
            ApiError::Pairing(PairingError::DeviceUnreachable {
                timed_out: true, ..
            }) => (StatusCode::GATEWAY_TIMEOUT, None),
            ApiError::Pairing(_) => (StatusCode::BAD_GATEWAY, None),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, None),
        };

        let error = match self {
            ApiError::Registry(e) => e.to_string(),
            ApiError::Pairing(e) => e.to_string(),
            ApiError::BadRequest(message) => message,
        };
        tracing::debug!(%status, "request failed: {}", error);

        (status, Json(ErrorResponse { error, field })).into_response()
    }
}

/// Shared application state
struct AppState<D> {
    version: &'static str,
    registry: Arc<PairingRegistry<D>>,
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
async fn info<D: DeviceHost>(State(state): State<Arc<AppState<D>>>) -> impl IntoResponse {
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
            pairings: state.registry.list().await.len(),
        }),
    )
}

async fn list_pairings<D: DeviceHost>(
    State(state): State<Arc<AppState<D>>>,
) -> Json<Vec<PairingResponse>> {
    let entities = state.registry.list().await;
    Json(
        entities
            .iter()
            .map(|e| PairingResponse::from_entity(e))
            .collect(),
    )
}

async fn lookup<D: DeviceHost>(
    state: &AppState<D>,
    id: String,
) -> Result<Arc<PairingEntity<D>>, ApiError> {
    let id = PairingId::new(id);
    state
        .registry
        .get(&id)
        .await
        .ok_or(ApiError::Registry(RegistryError::NotFound(id)))
}

async fn get_pairing<D: DeviceHost>(
    State(state): State<Arc<AppState<D>>>,
    Path(id): Path<String>,
) -> Result<Json<PairingResponse>, ApiError> {
    let entity = lookup(&state, id).await?;
    Ok(Json(PairingResponse::from_entity(&entity)))
}

#[tracing::instrument(skip(state, body))]
async fn turn_on<D: DeviceHost>(
    State(state): State<Arc<AppState<D>>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<TurnOnResponse>, ApiError> {
    // An empty body is a plain turn-on
    let request: TurnOnRequest = if body.is_empty() {
        TurnOnRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let activation = request.into_activation()?;
    let entity = lookup(&state, id).await?;

    let outcome = match entity.turn_on(activation).await? {
        TurnOnOutcome::Activated => "activated",
        TurnOnOutcome::PhysicalSwitchedOff => "physical_switched_off",
        TurnOnOutcome::Cancelled => "cancelled",
    };

    Ok(Json(TurnOnResponse {
        outcome,
        pairing: PairingResponse::from_entity(&entity),
    }))
}

#[tracing::instrument(skip(state))]
async fn turn_off<D: DeviceHost>(
    State(state): State<Arc<AppState<D>>>,
    Path(id): Path<String>,
) -> Result<Json<PairingResponse>, ApiError> {
    let entity = lookup(&state, id).await?;
    entity.turn_off().await?;
    Ok(Json(PairingResponse::from_entity(&entity)))
}

#[tracing::instrument(skip(state))]
async fn refresh<D: DeviceHost>(
    State(state): State<Arc<AppState<D>>>,
    Path(id): Path<String>,
) -> Result<Json<PairingResponse>, ApiError> {
    let entity = lookup(&state, id).await?;
    entity.update().await?;
    Ok(Json(PairingResponse::from_entity(&entity)))
}

#[tracing::instrument(skip(state, request), fields(id = %request.id))]
async fn create_pairing<D: DeviceHost>(
    State(state): State<Arc<AppState<D>>>,
    Json(request): Json<CreatePairingRequest>,
) -> Result<(StatusCode, Json<PairingResponse>), ApiError> {
    let entity = state
        .registry
        .create(PairingId::new(request.id), &request.form)
        .await?;
    Ok((StatusCode::CREATED, Json(PairingResponse::from_entity(&entity))))
}

#[tracing::instrument(skip(state, form))]
async fn reconfigure_pairing<D: DeviceHost>(
    State(state): State<Arc<AppState<D>>>,
    Path(id): Path<String>,
    Json(form): Json<PairingForm>,
) -> Result<Json<PairingResponse>, ApiError> {
    let id = PairingId::new(id);
    state.registry.reconfigure(&id, &form).await?;
    let entity = lookup(&state, id.to_string()).await?;
    Ok(Json(PairingResponse::from_entity(&entity)))
}

#[tracing::instrument(skip(state))]
async fn delete_pairing<D: DeviceHost>(
    State(state): State<Arc<AppState<D>>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.remove(&PairingId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create the API router with all endpoints
pub fn create_router<D: DeviceHost>(registry: Arc<PairingRegistry<D>>) -> Router {
    let state = Arc::new(AppState {
        version: env!("CARGO_PKG_VERSION"),
        registry,
    });

    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info::<D>))
        .route(
            "/v1/pairings",
            get(list_pairings::<D>).post(create_pairing::<D>),
        )
        .route(
            "/v1/pairings/:id",
            get(get_pairing::<D>)
                .put(reconfigure_pairing::<D>)
                .delete(delete_pairing::<D>),
        )
        .route("/v1/pairings/:id/turn_on", post(turn_on::<D>))
        .route("/v1/pairings/:id/turn_off", post(turn_off::<D>))
        .route("/v1/pairings/:id/refresh", post(refresh::<D>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// This function will bind to the specified address and serve the API endpoints.
/// It will run until the provided shutdown signal is triggered.
///
/// # Arguments
/// * `listen` - The IP address to listen on (e.g., 127.0.0.1)
/// * `port` - The port to listen on (e.g., 8566)
/// * `router` - The router built by [`create_router`]
/// * `shutdown_rx` - A oneshot receiver that will trigger graceful shutdown
pub async fn serve(
    listen: IpAddr,
    port: u16,
    router: Router,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::new(listen, port);
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
