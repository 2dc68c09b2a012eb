//! Control API and http ingress.
//!
//! One axum server carries both surfaces: a middleware ahead of the admin
//! routes matches the request Host against the router's http routes and
//! proxies on a hit; everything else falls through to the admin chain.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::header::HOST;
use axum::http::StatusCode;
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;

use warptail_core::config::{RouteType, ServiceConfig};
use warptail_core::service::ServiceStatus;
use warptail_core::tailnet::{TailnetPeer, TailnetStatus, TailscaleConfig};
use warptail_core::{ErrorKind, RouterError};

use crate::metrics::ServiceMetrics;

/// Pluggable checks for `private` and bot-protected routes. Enforcement
/// belongs to the authentication and bot-challenge collaborators; without an
/// installed auth hook, private routes fail closed.
pub type RequestHook = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<warptail_core::Router>,
    pub metrics: Arc<ServiceMetrics>,
    pub auth_hook: Option<RequestHook>,
    pub bot_hook: Option<RequestHook>,
}

impl AppState {
    pub fn new(router: Arc<warptail_core::Router>, metrics: Arc<ServiceMetrics>) -> AppState {
        AppState {
            router,
            metrics,
            auth_hook: None,
            bot_hook: None,
        }
    }
}

#[derive(Serialize)]
pub struct ApiErrorResponse {
    pub error: ApiError,
}

#[derive(Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiErrorResponse>)>;

fn error_response(err: RouterError) -> (StatusCode, Json<ApiErrorResponse>) {
    let status = match err.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::BadRequest | ErrorKind::Unsupported => StatusCode::BAD_REQUEST,
        ErrorKind::OverlayUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Transient => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiErrorResponse {
            error: ApiError {
                code: err.kind().code(),
                message: err.message().to_string(),
            },
        }),
    )
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_services(State(state): State<AppState>) -> Json<Vec<ServiceStatus>> {
    Json(state.router.statuses(false).await)
}

async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServiceStatus>> {
    state
        .router
        .status_of(&id, true)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn create_service(
    State(state): State<AppState>,
    Json(config): Json<ServiceConfig>,
) -> ApiResult<(StatusCode, Json<ServiceStatus>)> {
    let status = state.router.create(config).await.map_err(error_response)?;
    state.router.save().await;
    Ok((StatusCode::CREATED, Json(status)))
}

async fn update_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<ServiceConfig>,
) -> ApiResult<Json<ServiceStatus>> {
    let status = state
        .router
        .update(&id, config)
        .await
        .map_err(error_response)?;
    state.router.save().await;
    Ok(Json(status))
}

async fn delete_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.router.remove(&id).await.map_err(error_response)?;
    state.router.save().await;
    Ok(StatusCode::OK)
}

async fn start_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServiceStatus>> {
    let status = state
        .router
        .start_service(&id)
        .await
        .map_err(error_response)?;
    state.router.save().await;
    Ok(Json(status))
}

async fn stop_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServiceStatus>> {
    let status = state
        .router
        .stop_service(&id)
        .await
        .map_err(error_response)?;
    state.router.save().await;
    Ok(Json(status))
}

async fn tailscale_settings(State(state): State<AppState>) -> Json<TailscaleConfig> {
    Json(state.router.node().config().unwrap_or_default())
}

async fn update_tailscale_settings(
    State(state): State<AppState>,
    Json(config): Json<TailscaleConfig>,
) -> ApiResult<StatusCode> {
    state
        .router
        .update_tailnet(&config)
        .await
        .map_err(error_response)?;
    state.router.save().await;
    state.router.start_all().await;
    Ok(StatusCode::OK)
}

async fn tailscale_status(State(state): State<AppState>) -> ApiResult<Json<TailnetStatus>> {
    state
        .router
        .node()
        .status()
        .await
        .map(Json)
        .map_err(error_response)
}

async fn tailscale_nodes(State(state): State<AppState>) -> ApiResult<Json<Vec<TailnetPeer>>> {
    state.router.get_peers().await.map(Json).map_err(error_response)
}

async fn metrics_exposition(State(state): State<AppState>) -> String {
    state.metrics.gather()
}

/// Host-keyed ingress ahead of the admin chain.
async fn proxy_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(strip_port)
        .map(str::to_string);

    if let Some(host) = host {
        if let Some(route) = state.router.get_http_route(&host).await {
            let config = route.config();
            if config.private {
                let authorized = state.auth_hook.as_ref().map(|hook| hook(&request)).unwrap_or(false);
                if !authorized {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
            }
            if config.bot_protect && config.kind == RouteType::Https {
                if let Some(hook) = &state.bot_hook {
                    if !hook(&request) {
                        return StatusCode::FORBIDDEN.into_response();
                    }
                }
            }
            return route.handle(request).await;
        }
    }

    next.run(request).await
}

fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_exposition))
        .route("/api/services", get(list_services))
        .route("/api/services", post(create_service))
        .route("/api/services/:id", get(get_service))
        .route("/api/services/:id", put(update_service))
        .route("/api/services/:id", delete(delete_service))
        .route("/api/services/:id/start", post(start_service))
        .route("/api/services/:id/stop", post(stop_service))
        .route("/api/settings/tailscale", get(tailscale_settings))
        .route("/api/settings/tailscale", post(update_tailscale_settings))
        .route("/api/settings/tailscale/status", get(tailscale_status))
        .route("/api/tailsale/nodes", get(tailscale_nodes))
        .layer(from_fn_with_state(state.clone(), proxy_middleware))
        .with_state(state)
}
