use crate::access_control::AccessControl;
use crate::error::ServiceError;
use crate::models::{MqttAction, ThresholdKey, ThresholdRule, ThresholdUpdate};
use crate::mqtt_service::MqttService;
use crate::provisioning::{provision_device, ProvisionRequest, ProvisionedDevice};
use crate::store::Store;
use crate::threshold_engine::ThresholdEngine;
use crate::topic;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use http::{header, Method, StatusCode};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub access: Arc<AccessControl>,
    pub engine: Arc<ThresholdEngine>,
    /// `None` when MQTT is disabled.
    pub mqtt: Option<Arc<MqttService>>,
    pub auth_ignore_anonymous: bool,
    /// bcrypt work factor for provisioned device secrets.
    pub secret_hash_cost: u32,
}

/// Broker hook request for `/auth`. Every field is optional so that a partial
/// body still yields a decision instead of a rejection.
#[derive(Debug, Deserialize)]
struct AuthRequest {
    clientid: Option<String>,
    username: Option<String>,
    password: Option<String>,
    peerhost: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AclRequest {
    clientid: Option<String>,
    username: Option<String>,
    topic: Option<String>,
    action: Option<String>,
    qos: Option<u8>,
    peerhost: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum HookResult {
    Allow,
    Deny,
    Ignore,
}

impl From<bool> for HookResult {
    fn from(allowed: bool) -> Self {
        if allowed {
            HookResult::Allow
        } else {
            HookResult::Deny
        }
    }
}

#[derive(Debug, Serialize)]
struct HookResponse {
    result: HookResult,
}

fn hook(result: HookResult) -> Json<HookResponse> {
    Json(HookResponse { result })
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// JSON error for the device API. Broker hooks never return one.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(message) => {
                ApiError::new(StatusCode::BAD_REQUEST, "validation_error", message)
            }
            ServiceError::NotFound(message) => ApiError::new(StatusCode::NOT_FOUND, "not_found", message),
            ServiceError::Conflict(message) => ApiError::new(StatusCode::CONFLICT, "conflict", message),
            ServiceError::Persistence(e) => {
                error!(error = %e, "Store failure while serving request");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "storage failure")
            }
            ServiceError::Hashing(e) => {
                error!(error = %e, "Secret hashing failed while serving request");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "credential failure")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
    }
}

async fn auth_hook(
    State(state): State<AppState>,
    body: Result<Json<AuthRequest>, JsonRejection>,
) -> Json<HookResponse> {
    let Ok(Json(request)) = body else {
        warn!("Malformed auth hook request, denying");
        return hook(HookResult::Deny);
    };
    debug!(clientid = ?request.clientid, username = ?request.username, peerhost = ?request.peerhost, "Auth hook");

    let username = request.username.as_deref().map(str::trim).unwrap_or_default();
    if username.is_empty() {
        return hook(if state.auth_ignore_anonymous {
            HookResult::Ignore
        } else {
            HookResult::Deny
        });
    }

    let allowed = state
        .access
        .authenticate(
            username,
            request.password.as_deref().unwrap_or_default(),
            request.clientid.as_deref(),
        )
        .await;
    hook(allowed.into())
}

async fn acl_hook(
    State(state): State<AppState>,
    body: Result<Json<AclRequest>, JsonRejection>,
) -> Json<HookResponse> {
    let Ok(Json(request)) = body else {
        warn!("Malformed ACL hook request, denying");
        return hook(HookResult::Deny);
    };
    debug!(clientid = ?request.clientid, username = ?request.username, topic = ?request.topic, peerhost = ?request.peerhost, "ACL hook");

    let Some(action) = request.action.as_deref().and_then(MqttAction::from_request) else {
        warn!(action = ?request.action, "Unknown ACL action, denying");
        return hook(HookResult::Deny);
    };

    let allowed = state
        .access
        .authorize(
            request.username.as_deref().unwrap_or_default(),
            request.clientid.as_deref(),
            request.topic.as_deref().unwrap_or_default(),
            action,
            request.qos.unwrap_or(0),
        )
        .await;
    hook(allowed.into())
}

async fn create_device(
    State(state): State<AppState>,
    body: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProvisionedDevice>), ApiError> {
    let Json(request) = body?;
    info!(device_name = %request.device_name, mqtt_username = %request.mqtt_username, "Device creation request");
    let device = provision_device(state.store.as_ref(), request, state.secret_hash_cost).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn ensure_device(state: &AppState, client_id: &str) -> Result<(), ApiError> {
    let exists = state
        .store
        .exists_by_client_id(client_id)
        .await
        .map_err(ServiceError::from)?;
    if !exists {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("device '{client_id}' not found"),
        ));
    }
    Ok(())
}

async fn list_thresholds(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<Vec<ThresholdRule>>, ApiError> {
    ensure_device(&state, &client_id).await?;
    let rules = state
        .store
        .list_threshold_rules(&client_id)
        .await
        .map_err(ServiceError::from)?;
    Ok(Json(rules))
}

async fn update_threshold(
    State(state): State<AppState>,
    Path((client_id, sensor_key)): Path<(String, String)>,
    body: Result<Json<ThresholdUpdate>, JsonRejection>,
) -> Result<Json<ThresholdRule>, ApiError> {
    let Json(update) = body?;
    validate_bounds(&update)?;

    let key = ThresholdKey::new(client_id, sensor_key);
    let rule = state
        .store
        .update_threshold_rule(&key, update)
        .await
        .map_err(ServiceError::from)?;
    state.engine.cache().insert(key.clone(), rule.clone());
    info!(%key, min = ?rule.min_value, max = ?rule.max_value, "Threshold rule updated");
    Ok(Json(rule))
}

fn validate_bounds(update: &ThresholdUpdate) -> Result<(), ServiceError> {
    let finite = |bound: Option<f64>| bound.map_or(true, f64::is_finite);
    if !finite(update.min_value) || !finite(update.max_value) {
        return Err(ServiceError::Validation("bounds must be finite numbers".to_string()));
    }
    if let (Some(min), Some(max)) = (update.min_value, update.max_value) {
        if min > max {
            return Err(ServiceError::Validation(format!(
                "min_value {min} is greater than max_value {max}"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CommandAccepted {
    topic: String,
}

async fn send_command(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<CommandAccepted>), ApiError> {
    let Json(command) = body?;
    let Some(mqtt) = state.mqtt.clone() else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "mqtt_disabled",
            "MQTT is disabled",
        ));
    };
    ensure_device(&state, &client_id).await?;

    let topic = topic::command_topic(&client_id);
    mqtt.publish_message(&topic, &command.to_string(), QoS::AtLeastOnce, false)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "mqtt_unavailable", e.to_string()))?;
    Ok((StatusCode::ACCEPTED, Json(CommandAccepted { topic })))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
    mqtt: &'static str,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let mqtt = match &state.mqtt {
        Some(mqtt) => mqtt.connection_state().await,
        None => "disabled",
    };
    let store = state.store.backend_name();
    match state.store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                store,
                mqtt,
            }),
        ),
        Err(e) => {
            error!(error = %e, "Store health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded",
                    store,
                    mqtt,
                }),
            )
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/auth", post(auth_hook))
        .route("/acl", post(acl_hook))
        .route("/health", get(health))
        .route("/api/v1/devices/create", post(create_device))
        .route("/api/v1/devices/{client_id}/thresholds", get(list_thresholds))
        .route(
            "/api/v1/devices/{client_id}/thresholds/{sensor_key}",
            put(update_threshold),
        )
        .route("/api/v1/devices/{client_id}/command", post(send_command))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

pub async fn run_rest_server(
    state: AppState,
    bind: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("REST server listening on {}", bind);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            info!("REST server shutting down...");
        })
        .await
}
