use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::header;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;

use parley_core::{
    clear_session_cookie, extract_session_token, session_cookie, AuthError, StoreError,
};
use parley_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use parley_providers::is_valid_model_id;
use parley_types::{
    ChatMessage, CreateChatRequest, CredentialsRequest, RenameChatRequest, SendMessageRequest,
    SendMessageResponse,
};

use crate::{AppState, StartupStatus};

const MODEL_FAILURE_MESSAGE: &str = "Failed to get response from Gemini";

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

/// The authenticated caller, attached to the request by `auth_gate`.
#[derive(Debug, Clone)]
struct CurrentUser {
    username: String,
    token: String,
}

type ApiResult<T> = Result<T, Response>;

fn error_response(status: StatusCode, error: impl Into<String>, code: &str) -> Response {
    (
        status,
        Json(ErrorEnvelope {
            error: error.into(),
            code: Some(code.to_string()),
        }),
    )
        .into_response()
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::ChatNotFound => {
            error_response(StatusCode::NOT_FOUND, err.to_string(), "CHAT_NOT_FOUND")
        }
        StoreError::MessageNotFound => {
            error_response(StatusCode::NOT_FOUND, err.to_string(), "MESSAGE_NOT_FOUND")
        }
        StoreError::Validation(message) => {
            error_response(StatusCode::BAD_REQUEST, message, "VALIDATION_FAILED")
        }
        StoreError::Io(_) | StoreError::Serialization(_) => {
            tracing::error!(error = %err, "chat store write failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to save chats",
                "STORAGE_ERROR",
            )
        }
    }
}

fn auth_error_response(err: AuthError) -> Response {
    match err {
        AuthError::InvalidCredentials => {
            error_response(StatusCode::UNAUTHORIZED, err.to_string(), "INVALID_CREDENTIALS")
        }
        AuthError::UserExists => error_response(StatusCode::CONFLICT, err.to_string(), "USER_EXISTS"),
        AuthError::Validation(message) => {
            error_response(StatusCode::BAD_REQUEST, message, "VALIDATION_FAILED")
        }
        AuthError::Hash(_) | AuthError::Io(_) | AuthError::Serialization(_) => {
            tracing::error!(error = %err, "user store failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Authentication backend failed",
                "AUTH_BACKEND_ERROR",
            )
        }
    }
}

/// Lenient JSON body: an empty body means "all defaults".
fn parse_json_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("Invalid JSON body: {err}"),
            "INVALID_BODY",
        )
    })
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/chats", get(list_chats).post(create_chat))
        .route("/api/chats/{id}", get(get_chat).delete(delete_chat))
        .route("/api/chats/{id}/title", put(rename_chat))
        .route("/api/chats/{id}/messages", post(send_message))
        .route("/api/chats/{id}/messages/{index}", delete(delete_message))
        .route("/api/providers", get(list_providers))
        .merge(crate::webui::web_ui_router())
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(middleware::from_fn_with_state(state.clone(), startup_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn requires_session(path: &str) -> bool {
    path == "/api/chats"
        || path.starts_with("/api/chats/")
        || path == "/api/providers"
        || path == "/api/auth/me"
        || path == "/api/auth/logout"
}

fn request_session_token(headers: &HeaderMap) -> Option<String> {
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok());
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    extract_session_token(cookie, authorization)
}

async fn auth_gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS || !requires_session(request.uri().path()) {
        return next.run(request).await;
    }

    if let Some(token) = request_session_token(request.headers()) {
        if let Some(username) = state.sessions.validate(&token).await {
            request
                .extensions_mut()
                .insert(CurrentUser { username, token });
            return next.run(request).await;
        }
    }

    error_response(
        StatusCode::UNAUTHORIZED,
        "Unauthorized: sign in to continue",
        "AUTH_REQUIRED",
    )
}

async fn startup_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if request.uri().path() == "/global/health" {
        return next.run(request).await;
    }
    if state.is_ready() {
        return next.run(request).await;
    }

    let snapshot = state.startup_snapshot().await;
    let code = match snapshot.status {
        StartupStatus::Failed => "ENGINE_STARTUP_FAILED",
        _ => "ENGINE_STARTING",
    };
    let error = format!(
        "Server {}: phase={} attempt_id={} elapsed_ms={}{}",
        snapshot.status.as_str(),
        snapshot.phase,
        snapshot.attempt_id,
        snapshot.elapsed_ms,
        snapshot
            .last_error
            .as_ref()
            .map(|e| format!(" error={}", e))
            .unwrap_or_default()
    );
    error_response(StatusCode::SERVICE_UNAVAILABLE, error, code)
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    let startup = state.startup_snapshot().await;
    let (offline, active_sessions) = if state.is_ready() {
        (
            Some(state.providers.is_offline().await),
            Some(state.sessions.active_count().await),
        )
    } else {
        (None, None)
    };
    Json(json!({
        "healthy": startup.status != StartupStatus::Failed,
        "ready": state.is_ready(),
        "phase": startup.phase,
        "startup_attempt_id": startup.attempt_id,
        "startup_elapsed_ms": startup.elapsed_ms,
        "last_error": startup.last_error,
        "offline_provider": offline,
        "active_sessions": active_sessions,
        "version": env!("CARGO_PKG_VERSION"),
        "build_id": crate::build_id(),
    }))
}

fn session_response(
    status: StatusCode,
    token: &str,
    ttl_secs: u64,
    secure: bool,
    username: &str,
) -> Response {
    (
        status,
        [(header::SET_COOKIE, session_cookie(token, ttl_secs, secure))],
        Json(json!({ "username": username })),
    )
        .into_response()
}

async fn register(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let input = parse_json_body::<CredentialsRequest>(&body)?;
    let auth = state.config.get().await.auth;
    if !auth.allow_registration {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "Registration is closed",
            "REGISTRATION_CLOSED",
        ));
    }
    let username = state
        .users
        .register(&input.username, &input.password)
        .await
        .map_err(auth_error_response)?;
    emit_event(
        Level::INFO,
        ProcessKind::Server,
        ObservabilityEvent {
            event: "auth.register",
            component: "http",
            username: Some(&username),
            status: Some("ok"),
            ..Default::default()
        },
    );
    let token = state.sessions.issue(&username).await;
    Ok(session_response(
        StatusCode::CREATED,
        &token,
        state.sessions.ttl_secs(),
        auth.cookie_secure,
        &username,
    ))
}

async fn login(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let input = parse_json_body::<CredentialsRequest>(&body)?;
    let username = match state.users.verify(&input.username, &input.password).await {
        Ok(username) => username,
        Err(err) => {
            let attempted = redact_text(&input.username);
            emit_event(
                Level::WARN,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "auth.login",
                    component: "http",
                    username: Some(&attempted),
                    status: Some("rejected"),
                    ..Default::default()
                },
            );
            return Err(auth_error_response(err));
        }
    };
    let token = state.sessions.issue(&username).await;
    emit_event(
        Level::INFO,
        ProcessKind::Server,
        ObservabilityEvent {
            event: "auth.login",
            component: "http",
            username: Some(&username),
            status: Some("ok"),
            ..Default::default()
        },
    );
    let secure = state.config.get().await.auth.cookie_secure;
    Ok(session_response(
        StatusCode::OK,
        &token,
        state.sessions.ttl_secs(),
        secure,
        &username,
    ))
}

async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> impl IntoResponse {
    state.sessions.revoke(&user.token).await;
    (
        [(header::SET_COOKIE, clear_session_cookie())],
        Json(json!({ "ok": true })),
    )
}

async fn me(Extension(user): Extension<CurrentUser>) -> impl IntoResponse {
    Json(json!({ "username": user.username }))
}

async fn list_chats(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> impl IntoResponse {
    Json(state.chats.list_chats(&user.username).await)
}

async fn create_chat(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    body: Bytes,
) -> ApiResult<Response> {
    let input = parse_json_body::<CreateChatRequest>(&body)?;
    let chat = state
        .chats
        .create_chat(&user.username, input.title.as_deref())
        .await
        .map_err(store_error_response)?;
    tracing::info!(chat_id = %chat.id, owner = %user.username, "chat created");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "chat_id": chat.id, "chat": chat })),
    )
        .into_response())
}

async fn get_chat(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    match state.chats.get_chat(&user.username, &id).await {
        Some(chat) => Ok(Json(chat).into_response()),
        None => Err(store_error_response(StoreError::ChatNotFound)),
    }
}

async fn delete_chat(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .chats
        .delete_chat(&user.username, &id)
        .await
        .map_err(store_error_response)?;
    Ok(Json(json!({ "message": "Chat deleted successfully" })))
}

async fn rename_chat(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let input = parse_json_body::<RenameChatRequest>(&body)?;
    let title = state
        .chats
        .rename_chat(&user.username, &id, &input.title)
        .await
        .map_err(store_error_response)?;
    Ok(Json(json!({ "title": title })))
}

/// One chat turn. The model is called without holding any store lock, and the
/// user message plus reply are only written once the reply exists.
async fn send_message(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<SendMessageResponse>> {
    let input = parse_json_body::<SendMessageRequest>(&body)?;
    let Some(chat) = state.chats.get_chat(&user.username, &id).await else {
        return Err(store_error_response(StoreError::ChatNotFound));
    };
    let message = input.message.trim();
    if message.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Message cannot be empty",
            "VALIDATION_FAILED",
        ));
    }

    let model = input
        .model
        .as_deref()
        .map(|m| m.trim().trim_start_matches("models/"))
        .filter(|m| !m.is_empty());
    if let Some(model) = model {
        if !is_valid_model_id(model) {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid model id: {model}"),
                "INVALID_MODEL",
            ));
        }
    }

    let pending = ChatMessage::user(message);
    let prompt = state
        .context_builder()
        .await
        .build(&chat.messages, &pending);
    let reply = match state
        .providers
        .complete_for_provider(None, &prompt, model)
        .await
    {
        Ok(reply) => reply,
        Err(err) => {
            let detail = err.to_string();
            emit_event(
                Level::WARN,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "chat.reply",
                    component: "http",
                    chat_id: Some(&id),
                    username: Some(&user.username),
                    model_id: model,
                    status: Some("failed"),
                    error_code: Some(err.code()),
                    detail: Some(&detail),
                    ..Default::default()
                },
            );
            return Err(error_response(
                StatusCode::BAD_GATEWAY,
                MODEL_FAILURE_MESSAGE,
                err.code(),
            ));
        }
    };

    let content = redact_text(message);
    emit_event(
        Level::INFO,
        ProcessKind::Server,
        ObservabilityEvent {
            event: "chat.reply",
            component: "http",
            chat_id: Some(&id),
            username: Some(&user.username),
            model_id: model,
            status: Some("ok"),
            detail: Some(&content),
            ..Default::default()
        },
    );

    let assistant = ChatMessage::assistant(reply.clone());
    state
        .chats
        .append_exchange(&user.username, &id, pending, assistant)
        .await
        .map_err(store_error_response)?;

    Ok(Json(SendMessageResponse {
        user_message: message.to_string(),
        assistant_message: reply,
    }))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path((id, index)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    if state.chats.get_chat(&user.username, &id).await.is_none() {
        return Err(store_error_response(StoreError::ChatNotFound));
    }
    let Ok(index) = index.parse::<usize>() else {
        return Err(store_error_response(StoreError::MessageNotFound));
    };
    state
        .chats
        .truncate_messages(&user.username, &id, index)
        .await
        .map_err(store_error_response)?;
    Ok(Json(json!({ "message": "Message deleted successfully" })))
}

async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.get().await;
    let providers = state.providers.list().await;
    let default = match state.providers.select_provider(None).await {
        Ok(provider) => Some(provider.info().id),
        Err(_) => config.default_provider,
    };
    Json(json!({
        "providers": providers,
        "default": default,
        "offline": state.providers.is_offline().await,
    }))
}
