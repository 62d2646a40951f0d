use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::admin::{AdminCredentials, AdminSessions, PURGE_INTERVAL};
use crate::config::Config;
use crate::db::SqliteStore;
use crate::error::PoolError;
use crate::gateway::StreamingGateway;
use crate::models::{ChatCompletion, ChatRequest, Frame};
use crate::pool::{AddOutcome, SessionPool, CREDENTIAL_DELIMITER};
use crate::registry::StreamRegistry;
use crate::transcript::{self, AVAILABLE_MODELS};

const DEFAULT_MODEL: &str = "anthropic-sonnet-4";
const VALID_ROLES: &[&str] = &["system", "user", "assistant"];

/**
 * \brief 路由共享状态。
 */
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<SessionPool>,
    pub registry: StreamRegistry,
    pub gateway: StreamingGateway,
    pub sessions: Arc<AdminSessions>,
    auth_token: Arc<str>,
    admin: Arc<AdminCredentials>,
}

impl AppState {
    /**
     * \brief 管理员默认为 admin，密码与 Bearer 令牌相同。
     */
    pub fn new(gateway: StreamingGateway, auth_token: &str) -> Self {
        AppState {
            pool: gateway.pool().clone(),
            registry: gateway.registry().clone(),
            gateway,
            sessions: Arc::new(AdminSessions::default()),
            auth_token: Arc::from(auth_token),
            admin: Arc::new(AdminCredentials {
                username: "admin".to_string(),
                password: auth_token.to_string(),
            }),
        }
    }

    pub fn with_admin(mut self, admin: AdminCredentials) -> Self {
        self.admin = Arc::new(admin);
        self
    }

    /**
     * \brief 打开存储、初始化凭据池并构建网关。
     * \details 没有任何可用凭据时返回错误，服务不应启动。
     */
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.db_path)?);
        let pool = Arc::new(SessionPool::new(Some(store)));
        let blob = config.load_cookie_blob().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "no configured credentials, relying on saved ones");
            String::new()
        });
        pool.initialize(&blob).context("initialize session pool")?;
        let gateway = StreamingGateway::new(pool, StreamRegistry::new(), config.gateway.clone())?;
        Ok(AppState::new(gateway, &config.auth_token).with_admin(config.admin_credentials()))
    }
}

/**
 * \brief OpenAI 风格的错误响应。
 */
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    kind: &'static str,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
            kind,
        }
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication_error", message)
    }

    fn server(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "server_error", message)
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found_error", err.to_string()),
            PoolError::Invalid(_) => Self::invalid_request(err.to_string()),
            PoolError::NoCredentials { .. } => Self::server(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                message: self.message,
                kind: self.kind,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/**
 * \brief 构建路由；除 /health 外均需 Bearer 令牌。
 */
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/cookies/status", get(cookies_status))
        .route("/cookies/add", post(add_cookies))
        .route("/cookies/thread", put(set_thread))
        .route("/cookies/{user_id}", delete(remove_cookie))
        .route("/cookies/{user_id}/toggle", put(toggle_cookie))
        .route("/cookies/{user_id}/revalidate", post(revalidate_cookie))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health))
        .route("/admin/login", post(admin_login))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/**
 * \brief 启动 HTTP 服务，Ctrl-C 时关闭全部输出流并有序退出。
 */
pub async fn run(config: Config) -> Result<()> {
    let state = AppState::from_config(&config)?;
    let registry = state.registry.clone();
    let pool = state.pool.clone();
    let purge = tokio::spawn(purge_sessions(state.sessions.clone()));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry.clone()))
        .await?;
    registry.close_all();
    purge.abort();
    if let Err(err) = tokio::task::spawn_blocking(move || pool.flush()).await {
        tracing::error!(error = %err, "failed to flush credential store");
    }
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal(registry: StreamRegistry) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown requested");
    registry.close_all();
}

async fn purge_sessions(sessions: Arc<AdminSessions>) {
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let removed = sessions.purge_expired();
        if removed > 0 {
            tracing::debug!(removed, "purged expired admin sessions");
        }
    }
}

async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match token {
        None => Err(ApiError::unauthorized(
            "Authentication required. Please provide a valid Bearer token.",
        )),
        Some(token) if token.trim() == state.auth_token.as_ref() => Ok(next.run(request).await),
        Some(token) => match state.sessions.verify(token.trim()) {
            Some(username) => {
                tracing::debug!(%username, "authenticated with admin session");
                Ok(next.run(request).await)
            }
            None => {
                tracing::warn!("rejected request with invalid token");
                Err(ApiError::unauthorized("Invalid authentication credentials"))
            }
        },
    }
}

/**
 * \brief 校验入站聊天请求并解析为 ChatRequest。
 */
pub fn validate_chat_request(mut body: Value) -> Result<ChatRequest, String> {
    let messages = match body.get("messages") {
        None | Some(Value::Null) => {
            return Err("Invalid request: 'messages' field is required.".to_string())
        }
        Some(Value::Array(messages)) => messages,
        Some(_) => return Err("Invalid request: 'messages' field must be an array.".to_string()),
    };
    if messages.is_empty() {
        return Err("Invalid request: 'messages' field must be a non-empty array.".to_string());
    }
    for message in messages {
        let role = message.get("role").and_then(Value::as_str);
        if !role.is_some_and(|r| VALID_ROLES.contains(&r)) {
            return Err(
                "Invalid message format: each message must have a valid 'role' field.".to_string(),
            );
        }
        if matches!(message.get("content"), None | Some(Value::Null)) {
            return Err(
                "Invalid message format: each message must have a 'content' field.".to_string(),
            );
        }
    }
    if let Some(object) = body.as_object_mut() {
        if !object.get("model").is_some_and(Value::is_string) {
            object.insert("model".to_string(), Value::from(DEFAULT_MODEL));
        }
    }
    serde_json::from_value(body).map_err(|err| format!("Invalid request: {}", err))
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let client_id = headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let request = validate_chat_request(body).map_err(ApiError::invalid_request)?;
    let credential = state.pool.active().ok_or_else(|| {
        ApiError::server("No valid credentials available. Check the NOTION_COOKIE configuration.")
    })?;

    tracing::info!(client_id = %client_id, model = %request.model, stream = request.stream, "chat completion");
    let payload = transcript::build(
        &request,
        &credential,
        OffsetDateTime::now_utc(),
        transcript::new_trace_id,
    );
    let session = state
        .gateway
        .execute(payload, credential, &client_id, &request.model);

    if request.stream {
        let events = session
            .into_stream()
            .map(|frame| Ok::<_, Infallible>(Event::default().data(frame.data())));
        return Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response());
    }

    let frames = session.collect_frames().await;
    let (id, created) = frames
        .iter()
        .find_map(|f| match f {
            Frame::Chunk(chunk) => Some((chunk.id.clone(), chunk.created)),
            Frame::Done => None,
        })
        .unwrap_or_else(|| {
            (
                format!("chatcmpl-{}", Uuid::new_v4()),
                OffsetDateTime::now_utc().unix_timestamp(),
            )
        });
    Ok(Json(ChatCompletion::aggregate(id, created, &request.model, &frames)).into_response())
}

async fn list_models() -> Json<Value> {
    let data: Vec<Value> = AVAILABLE_MODELS
        .iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "notion"}))
        .collect();
    Json(json!({"object": "list", "data": data}))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        "initialized": !state.pool.is_empty(),
        "valid_cookies": state.pool.valid_count(),
        "active_streams": state.registry.active_count(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/**
 * \brief 管理员登录，成功后签发 24 小时有效的会话令牌。
 */
async fn admin_login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> (StatusCode, Json<Value>) {
    let (Some(username), Some(password)) = (
        body.username.filter(|u| !u.is_empty()),
        body.password.filter(|p| !p.is_empty()),
    ) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "message": "username and password are required"})),
        );
    };
    if !state.admin.matches(&username, &password) {
        tracing::warn!(%username, "admin login rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "message": "invalid username or password"})),
        );
    }
    let token = state.sessions.issue(&username);
    tracing::info!(%username, "admin logged in");
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "user": {"username": username},
            "token": token,
            "message": "login succeeded",
        })),
    )
}

async fn cookies_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "total_cookies": state.pool.valid_count(),
        "cookies": state.pool.status(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddCookiesRequest {
    #[serde(default)]
    cookies: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct AddCookiesResponse {
    success: bool,
    added: usize,
    updated: usize,
    failed: usize,
    errors: Vec<String>,
}

async fn add_cookies(
    State(state): State<AppState>,
    Json(body): Json<AddCookiesRequest>,
) -> Result<Json<AddCookiesResponse>, ApiError> {
    let raw = body
        .cookies
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::invalid_request("'cookies' field is required."))?;
    let thread_id = body.thread_id.filter(|t| !t.trim().is_empty());

    let mut response = AddCookiesResponse {
        success: false,
        added: 0,
        updated: 0,
        failed: 0,
        errors: Vec::new(),
    };
    for (idx, cookie) in raw
        .split(CREDENTIAL_DELIMITER)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .enumerate()
    {
        match state.pool.add_credential(cookie, thread_id.clone()) {
            Ok(AddOutcome::Added) => response.added += 1,
            Ok(AddOutcome::Updated) => response.updated += 1,
            Err(err) => {
                response.failed += 1;
                response.errors.push(format!("cookie {}: {}", idx + 1, err));
            }
        }
    }
    response.success = response.added + response.updated > 0;
    tracing::info!(added = response.added, updated = response.updated, failed = response.failed, "credentials added");
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetThreadRequest {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
}

async fn set_thread(
    State(state): State<AppState>,
    Json(body): Json<SetThreadRequest>,
) -> Result<Json<Value>, ApiError> {
    let user_id = body
        .user_id
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::invalid_request("'userId' field is required."))?;
    let thread_id = body.thread_id.filter(|t| !t.trim().is_empty());
    state.pool.set_context(&user_id, thread_id.clone())?;
    Ok(Json(json!({"success": true, "userId": user_id, "threadId": thread_id})))
}

async fn remove_cookie(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.pool.remove(&user_id)?;
    Ok(Json(json!({"success": true})))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    #[serde(default)]
    enabled: Option<bool>,
}

async fn toggle_cookie(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<ToggleRequest>,
) -> Result<Json<Value>, ApiError> {
    let enabled = body
        .enabled
        .ok_or_else(|| ApiError::invalid_request("'enabled' must be true or false."))?;
    state.pool.set_enabled(&user_id, enabled)?;
    Ok(Json(json!({"success": true, "enabled": enabled})))
}

async fn revalidate_cookie(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.pool.revalidate(&user_id)?;
    Ok(Json(json!({"success": true})))
}
