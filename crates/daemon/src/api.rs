// Cloudflared Tunnel Manager - REST API Module
// Stateless request handlers translating external calls into store,
// supervisor, route-manager, and auth-flow operations.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use tracing::{info, warn};
use zeroize::Zeroizing;

use cfd_tunnel_common::{
    AddRouteRequest, AuthStatus, CreateTunnelRequest, Error, ErrorResponse, LoginRequest,
    LoginResponse, MeResponse, MessageResponse, RegisterRequest, RegisterResponse, SetupStatus,
    Tunnel, TunnelListResponse,
};

use crate::auth::{self, AuthLayerState, CurrentUser, SessionStore};
use crate::authflow::AuthFlowCoordinator;
use crate::cloudflared::CloudflaredCli;
use crate::ingress;
use crate::routes::RouteManager;
use crate::store::TunnelStore;
use crate::supervisor::ProcessSupervisor;
use crate::users::UserStore;

/// Shared application state
pub struct AppState {
    pub store: TunnelStore,
    pub supervisor: ProcessSupervisor,
    pub auth_flow: AuthFlowCoordinator,
    pub route_manager: RouteManager,
    pub users: UserStore,
    pub sessions: SessionStore,
    pub cloudflared: CloudflaredCli,
    pub cloudflared_dir: PathBuf,
}

/// Maps the shared error taxonomy onto HTTP statuses in one place
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::TunnelNotFound(_) | Error::RouteNotFound(_) => StatusCode::NOT_FOUND,
            Error::TunnelExists(_)
            | Error::DuplicateDomain { .. }
            | Error::AlreadyRunning(_)
            | Error::NotRunning(_)
            | Error::StillRunning(_)
            | Error::LoginInProgress
            | Error::UserExists(_) => StatusCode::CONFLICT,
            Error::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Error::Process(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Io(_) | Error::Json(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the API router. Setup, register, and login stay public so the
/// first operator can bootstrap; everything else sits behind the session
/// middleware.
pub fn create_router(state: Arc<AppState>, require_auth: bool) -> Router {
    let auth_state = AuthLayerState {
        sessions: state.sessions.clone(),
        require_auth,
    };

    let public = Router::new()
        .route("/api/health", get(health))
        .route("/api/setup", get(setup_status))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login));

    let protected = Router::new()
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/tunnels", get(list_tunnels).post(create_tunnel))
        .route("/api/tunnels/:name", get(get_tunnel).delete(delete_tunnel))
        .route("/api/tunnels/:name/start", post(start_tunnel))
        .route("/api/tunnels/:name/stop", post(stop_tunnel))
        .route("/api/tunnels/:name/routes", post(add_route))
        .route("/api/tunnels/:name/routes/:domain", delete(remove_route))
        .route(
            "/api/login-flow",
            post(begin_login_flow)
                .get(login_flow_status)
                .delete(cancel_login_flow),
        )
        .layer(middleware::from_fn_with_state(
            auth_state,
            auth::auth_middleware,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        // The dashboard is served separately; the API itself is loopback-only
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

async fn setup_status(State(state): State<Arc<AppState>>) -> Json<SetupStatus> {
    let user_count = state.users.count().await;
    Json(SetupStatus {
        needs_setup: user_count == 0,
        has_users: user_count > 0,
        has_tunnels: state.store.has_tunnels().await,
        user_count,
    })
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    info!("API: register request for '{}'", request.username);
    let password = Zeroizing::new(request.password);
    let record = state.users.register(&request.username, &password).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: format!("User '{}' registered", record.username),
            is_admin: record.is_admin,
        }),
    ))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let password = Zeroizing::new(request.password);
    let user = state.users.verify(&request.username, &password).await?;
    let token = state.sessions.issue(&user.username).await;
    info!("User '{}' logged in", user.username);
    Ok(Json(LoginResponse { token }))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<MessageResponse> {
    if let Some(token) = auth::bearer_token(&headers) {
        state.sessions.revoke(token).await;
    }
    Json(MessageResponse {
        message: "Logged out".to_string(),
    })
}

async fn me(
    State(state): State<Arc<AppState>>,
    user: Option<Extension<CurrentUser>>,
) -> Result<Json<MeResponse>, ApiError> {
    let Some(Extension(CurrentUser(username))) = user else {
        return Err(Error::InvalidCredentials.into());
    };
    let record = state
        .users
        .get(&username)
        .await
        .ok_or(Error::InvalidCredentials)?;
    Ok(Json(MeResponse {
        username: record.username,
        is_admin: record.is_admin,
    }))
}

async fn list_tunnels(State(state): State<Arc<AppState>>) -> Json<TunnelListResponse> {
    Json(TunnelListResponse {
        tunnels: state.store.list().await,
    })
}

async fn get_tunnel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Tunnel>, ApiError> {
    Ok(Json(state.store.get(&name).await?))
}

async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTunnelRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    info!(
        "API: create tunnel '{}' (auto_start: {})",
        request.name, request.auto_start
    );
    let tunnel = state.store.create(&request.name, request.auto_start).await?;
    ingress::write_config(&state.cloudflared_dir, &tunnel)?;

    // Register with Cloudflare so the credentials file appears. The daemon
    // may not be logged in yet; the tunnel still exists locally and the
    // registration is retried implicitly by running it.
    if let Err(e) = state.cloudflared.create_tunnel(&request.name).await {
        warn!("cloudflared registration for '{}' failed: {}", request.name, e);
    }

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            message: format!("Tunnel '{}' created", request.name),
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    force: bool,
}

async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<MessageResponse>, ApiError> {
    info!("API: delete tunnel '{}' (force: {})", name, params.force);

    let _guard = state.supervisor.lock_ops(&name).await;

    let tunnel = state.store.get(&name).await?;
    if tunnel.status.is_active() && !params.force {
        return Err(Error::StillRunning(name).into());
    }

    if state.supervisor.is_supervised(&name).await {
        state.supervisor.stop_locked(&name).await?;
    } else {
        state.supervisor.cancel_pending_restart(&name).await;
        if tunnel.status.is_active() {
            // Active status with no live process is stale; settle it so
            // the delete below can proceed
            state
                .store
                .set_status(&name, cfd_tunnel_common::TunnelStatus::Stopped)
                .await?;
        }
    }

    state.store.delete(&name).await?;
    ingress::remove_config(&state.cloudflared_dir, &name);

    if let Err(e) = state.cloudflared.delete_tunnel(&name).await {
        warn!("cloudflared deregistration for '{}' failed: {}", name, e);
    }

    Ok(Json(MessageResponse {
        message: format!("Tunnel '{}' deleted", name),
    }))
}

async fn start_tunnel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    info!("API: start tunnel request for '{}'", name);
    state.supervisor.start(&name).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: format!("Tunnel '{}' starting", name),
        }),
    ))
}

async fn stop_tunnel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    info!("API: stop tunnel request for '{}'", name);
    state.supervisor.stop(&name).await?;
    Ok(Json(MessageResponse {
        message: format!("Tunnel '{}' stopped", name),
    }))
}

async fn add_route(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<AddRouteRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    info!("API: add route {} to tunnel '{}'", request.domain, name);
    let outcome = state.route_manager.add(&name, request).await?;

    let message = if outcome.degraded {
        format!(
            "Route {} added, but the DNS binding failed; the hostname is not publicly reachable yet",
            outcome.domain
        )
    } else {
        format!("Route {} added", outcome.domain)
    };
    Ok((StatusCode::CREATED, Json(MessageResponse { message })))
}

async fn remove_route(
    State(state): State<Arc<AppState>>,
    Path((name, domain)): Path<(String, String)>,
) -> Result<Json<MessageResponse>, ApiError> {
    info!("API: remove route {} from tunnel '{}'", domain, name);
    state.route_manager.remove(&name, &domain).await?;
    Ok(Json(MessageResponse {
        message: format!("Route {} removed", domain),
    }))
}

async fn begin_login_flow(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<AuthStatus>), ApiError> {
    info!("API: begin Cloudflare login flow");
    let status = state.auth_flow.begin().await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn login_flow_status(State(state): State<Arc<AppState>>) -> Json<AuthStatus> {
    Json(state.auth_flow.status().await)
}

async fn cancel_login_flow(
    State(state): State<Arc<AppState>>,
) -> Result<Json<MessageResponse>, ApiError> {
    info!("API: cancel Cloudflare login flow");
    state.auth_flow.cancel().await?;
    Ok(Json(MessageResponse {
        message: "Login flow cancelled".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authflow::AuthFlowSettings;
    use crate::supervisor::SupervisorSettings;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn write_script(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("fake-cloudflared");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_router(dir: &TempDir, require_auth: bool) -> (Router, Arc<AppState>) {
        let script = write_script(dir.path(), "exit 0");
        let cloudflared_dir = dir.path().join("cloudflared");

        let store = TunnelStore::load(dir.path().join("state.json")).unwrap();
        let users = UserStore::load(dir.path().join("users.json")).unwrap();
        let sessions = SessionStore::new();
        let supervisor = ProcessSupervisor::new(
            store.clone(),
            SupervisorSettings {
                cloudflared_path: script.clone(),
                cloudflared_dir: cloudflared_dir.clone(),
                startup_grace: Duration::from_millis(100),
                stop_timeout: Duration::from_secs(2),
                restart_max_attempts: 0,
                restart_base_delay: Duration::from_millis(50),
            },
        );
        let cloudflared = CloudflaredCli::new(script.clone(), Duration::from_secs(5));
        let route_manager = RouteManager::new(
            store.clone(),
            supervisor.clone(),
            cloudflared.clone(),
            cloudflared_dir.clone(),
        );
        let auth_flow = AuthFlowCoordinator::new(AuthFlowSettings {
            cloudflared_path: script,
            cert_path: cloudflared_dir.join("cert.pem"),
            login_timeout: Duration::from_secs(5),
        });

        let state = Arc::new(AppState {
            store,
            supervisor,
            auth_flow,
            route_manager,
            users,
            sessions,
            cloudflared,
            cloudflared_dir,
        });
        (create_router(state.clone(), require_auth), state)
    }

    fn json_request(method: Method, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_list_and_conflict() {
        let dir = TempDir::new().unwrap();
        let (router, _state) = test_router(&dir, false);

        let response = router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/tunnels",
                serde_json::json!({"name": "t1", "auto_start": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/tunnels",
                serde_json::json!({"name": "t1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = router
            .oneshot(empty_request(Method::GET, "/api/tunnels"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["tunnels"][0]["name"], "t1");
        assert_eq!(body["tunnels"][0]["auto_start"], true);
        assert_eq!(body["tunnels"][0]["status"], "stopped");
    }

    #[tokio::test]
    async fn invalid_port_is_a_bad_request_with_no_side_effect() {
        let dir = TempDir::new().unwrap();
        let (router, state) = test_router(&dir, false);

        router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/tunnels",
                serde_json::json!({"name": "t1"}),
            ))
            .await
            .unwrap();

        let response = router
            .oneshot(json_request(
                Method::POST,
                "/api/tunnels/t1/routes",
                serde_json::json!({"domain": "app.example.com", "port": 70000}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        assert!(state.store.get("t1").await.unwrap().routes.is_empty());
    }

    #[tokio::test]
    async fn duplicate_domain_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let (router, _state) = test_router(&dir, false);

        for name in ["t1", "t2"] {
            router
                .clone()
                .oneshot(json_request(
                    Method::POST,
                    "/api/tunnels",
                    serde_json::json!({ "name": name }),
                ))
                .await
                .unwrap();
        }

        let response = router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/tunnels/t1/routes",
                serde_json::json!({"domain": "app.example.com", "port": 3000}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .oneshot(json_request(
                Method::POST,
                "/api/tunnels/t2/routes",
                serde_json::json!({"domain": "app.example.com", "port": 4000}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_tunnel_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (router, _state) = test_router(&dir, false);

        let response = router
            .oneshot(empty_request(Method::POST, "/api/tunnels/ghost/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_of_running_tunnel_requires_force() {
        let dir = TempDir::new().unwrap();
        let (router, state) = test_router(&dir, false);

        router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/tunnels",
                serde_json::json!({"name": "t1"}),
            ))
            .await
            .unwrap();
        state
            .store
            .set_status("t1", cfd_tunnel_common::TunnelStatus::Running)
            .await
            .unwrap();

        let response = router
            .clone()
            .oneshot(empty_request(Method::DELETE, "/api/tunnels/t1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(state.store.get("t1").await.is_ok());
    }

    #[tokio::test]
    async fn protected_routes_reject_missing_tokens() {
        let dir = TempDir::new().unwrap();
        let (router, _state) = test_router(&dir, true);

        // Setup endpoint stays public
        let response = router
            .clone()
            .oneshot(empty_request(Method::GET, "/api/setup"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["needs_setup"], true);

        let response = router
            .oneshot(empty_request(Method::GET, "/api/tunnels"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn register_login_and_use_a_token() {
        let dir = TempDir::new().unwrap();
        let (router, _state) = test_router(&dir, true);

        let response = router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/auth/register",
                serde_json::json!({"username": "alice", "password": "correct-horse"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["is_admin"], true);

        let response = router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/auth/login",
                serde_json::json!({"username": "alice", "password": "correct-horse"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let token = body_json(response).await["token"].as_str().unwrap().to_string();

        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/auth/me")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["username"], "alice");
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let dir = TempDir::new().unwrap();
        let (router, _state) = test_router(&dir, true);

        router
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/auth/register",
                serde_json::json!({"username": "alice", "password": "correct-horse"}),
            ))
            .await
            .unwrap();

        let response = router
            .oneshot(json_request(
                Method::POST,
                "/api/auth/login",
                serde_json::json!({"username": "alice", "password": "wrong"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
