//! Shared API state, error responses and the auth endpoints

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::error;

use crate::auth::{
    AuthUser, Authenticator, Claims, JwtConfig, LoginLimiter, LoginOutcome, SessionStore,
};
use crate::cloudflare::RouteProvider;
use crate::config::ConfigHandle;
use crate::error::{CloudMailError, Result};
use crate::generator::AccountGenerator;
use crate::ingest::MailService;
use crate::store::Database;

/// Shared application state
pub struct AppState {
    pub db: Database,
    pub config: ConfigHandle,
    pub jwt_config: JwtConfig,
    pub sessions: SessionStore,
    pub authenticator: Authenticator,
    pub mail: MailService,
    pub routes: Arc<dyn RouteProvider>,
    pub generator: AccountGenerator,
}

impl AppState {
    /// Wire the auth layer from the current configuration
    pub async fn build(
        db: Database,
        config: ConfigHandle,
        routes: Arc<dyn RouteProvider>,
        mail: MailService,
    ) -> Result<Self> {
        let snapshot = config.snapshot().await;
        let limiter = LoginLimiter::from_config(&snapshot.login_limiter);

        Ok(Self {
            jwt_config: JwtConfig::from_settings(&snapshot.jwt)?,
            sessions: SessionStore::default(),
            authenticator: Authenticator::new(db.clone(), config.clone(), limiter),
            generator: AccountGenerator::default(),
            db,
            config,
            mail,
            routes,
        })
    }
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub success: bool,
    pub error: String,
}

impl ApiError {
    pub fn new(msg: &str) -> Self {
        Self {
            success: false,
            error: msg.to_string(),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, (StatusCode, Json<ApiError>)>;

pub fn reject(status: StatusCode, msg: &str) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError::new(msg)))
}

/// Status code for an error surfacing from the service layer
pub fn status_for(e: &CloudMailError) -> StatusCode {
    match e {
        CloudMailError::NotFound(_) => StatusCode::NOT_FOUND,
        CloudMailError::Validation(_) | CloudMailError::Config(_) => StatusCode::BAD_REQUEST,
        CloudMailError::Unauthorized(_) | CloudMailError::Jwt(_) => StatusCode::UNAUTHORIZED,
        CloudMailError::Cloudflare(_) | CloudMailError::Http(_) | CloudMailError::Imap(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a service error to an API error; internals are logged, not echoed.
pub fn api_error(e: CloudMailError) -> (StatusCode, Json<ApiError>) {
    let status = status_for(&e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {}", e);
        return reject(status, "Internal server error");
    }
    reject(status, &e.to_string())
}

pub fn require_admin(claims: &Claims) -> ApiResult<()> {
    if claims.is_admin {
        Ok(())
    } else {
        Err(reject(StatusCode::FORBIDDEN, "Admin access required"))
    }
}

/// Client address for login limiting: first `X-Forwarded-For` hop, else the peer address
pub fn client_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Login request body
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Login response
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub token: String,
    pub user: AuthUser,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub success: bool,
    pub token: String,
}

/// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.db.health_check().await {
        Ok(()) => Json(serde_json::json!({
            "success": true,
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
        }))
        .into_response(),
        Err(e) => {
            error!("Health check failed: {}", e);
            reject(StatusCode::SERVICE_UNAVAILABLE, "Database unavailable").into_response()
        }
    }
}

/// POST /api/auth/login - Authenticate and get JWT token
pub async fn login(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Response {
    let ip = client_ip(&headers, peer.as_ref());

    let outcome = match state
        .authenticator
        .login(&req.username, &req.password, &ip)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return api_error(e).into_response(),
    };

    match outcome {
        LoginOutcome::Success(user) => match state.jwt_config.create_token(&user) {
            Ok(token) => (
                StatusCode::OK,
                Json(LoginResponse {
                    success: true,
                    token,
                    user,
                }),
            )
                .into_response(),
            Err(e) => {
                error!("Failed to create token: {}", e);
                reject(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create token").into_response()
            }
        },
        LoginOutcome::Locked { .. } => {
            reject(StatusCode::TOO_MANY_REQUESTS, &outcome.message()).into_response()
        }
        LoginOutcome::Invalid(attempt) if attempt.locked => {
            reject(StatusCode::TOO_MANY_REQUESTS, &outcome.message()).into_response()
        }
        LoginOutcome::Invalid(_) => {
            reject(StatusCode::UNAUTHORIZED, &outcome.message()).into_response()
        }
    }
}

/// POST /api/auth/refresh - New token for the current one
pub async fn refresh(State(state): State<Arc<AppState>>, claims: Claims) -> ApiResult<Json<TokenResponse>> {
    let token = state
        .jwt_config
        .create_token(&claims.user())
        .map_err(api_error)?;
    Ok(Json(TokenResponse {
        success: true,
        token,
    }))
}
