use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, Method},
    middleware,
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_shared::constants::{MAX_FETCH_LIMIT, WS_PATH};
use courier_shared::{ConfirmedMessage, ConversationId};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::relay::RelayHub;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RelayHub>,
    pub rate_limiter: RateLimiter<IpAddr>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(hub: Arc<RelayHub>, config: ServerConfig) -> Self {
        Self {
            hub,
            rate_limiter: RateLimiter::default(),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route(WS_PATH, get(ws_upgrade))
        .route("/admin/status", get(admin_status))
        .route("/admin/conversations/:id/messages", get(admin_messages))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    ws_path: &'static str,
    heartbeat_interval_secs: u64,
    presence_timeout_secs: u64,
    max_sessions: usize,
}

#[derive(Serialize)]
struct AdminStatusResponse {
    name: String,
    uptime_secs: u64,
    active_sessions: usize,
    online_users: usize,
    stored_messages: u64,
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    after: i64,
    limit: Option<usize>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        ws_path: WS_PATH,
        heartbeat_interval_secs: state.config.heartbeat_interval.as_secs(),
        presence_timeout_secs: state.config.presence_timeout().as_secs(),
        max_sessions: state.config.max_sessions,
    })
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| ws::handle_socket(socket, hub))
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let status = state.hub.status().await?;
    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        active_sessions: status.active_sessions,
        online_users: status.online_users,
        stored_messages: status.stored_messages,
    }))
}

async fn admin_messages(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ConfirmedMessage>>, ServerError> {
    verify_admin_token(&headers, &state.config)?;

    let messages = state
        .hub
        .conversation_history(
            &ConversationId(id),
            query.after,
            query.limit.unwrap_or(MAX_FETCH_LIMIT),
        )
        .await?;
    Ok(Json(messages))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(state, listener).await
}

/// Serve on an already bound listener.
pub async fn serve_listener(
    state: AppState,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting HTTP API server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::relay::HubSettings;

    fn state(admin_token: Option<&str>) -> AppState {
        let config = ServerConfig {
            admin_token: admin_token.map(String::from),
            ..ServerConfig::default()
        };
        let hub = RelayHub::in_memory(HubSettings {
            presence_timeout: Duration::from_secs(90),
            max_sessions: 0,
            send_rate_per_sec: 10.0,
            send_burst: 10.0,
        })
        .unwrap();
        AppState::new(Arc::new(hub), config)
    }

    async fn get_json(
        app: Router,
        uri: &str,
        token: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().uri(uri);
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        let resp = app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(build_router(state(None)), "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_info_reports_presence_timeout() {
        let (status, body) = get_json(build_router(state(None)), "/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ws_path"], "/ws");
        assert_eq!(body["presence_timeout_secs"], 90);
    }

    #[tokio::test]
    async fn test_admin_disabled_without_token() {
        let (status, body) =
            get_json(build_router(state(None)), "/admin/status", Some("x")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap().contains("disabled"));
    }

    #[tokio::test]
    async fn test_admin_rejects_wrong_token() {
        let (status, _) =
            get_json(build_router(state(Some("secret"))), "/admin/status", Some("nope")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_status_and_history() {
        let app = build_router(state(Some("secret")));

        let (status, body) = get_json(app.clone(), "/admin/status", Some("secret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stored_messages"], 0);

        let (status, _) = get_json(
            app,
            "/admin/conversations/c_missing/messages?after=0",
            Some("secret"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
