//! HTTP transport: the project WebSocket and a small REST API.
//!
//! Every project route goes through the session gate first. The WebSocket
//! endpoint (`/ws?projectId=...`) authenticates and joins the channel
//! before upgrading, so a refused client never becomes a member.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use devroom_sdk::{ClientEvent, CommandSpec, ServerEvent};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::bus::{ChannelJoinError, ConnectionId, Membership};
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::gate::{CredentialSource, Identity, SESSION_COOKIE, Unauthorized};

/// `Set-Cookie` value that clears the session cookie.
const CLEAR_SESSION_COOKIE: &str = "token=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax";

pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub started: Instant,
    pub cors_origins: Vec<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = {
        use axum::http::Method;
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(
                state.cors_origins.iter().filter_map(|o| o.parse().ok()),
            ))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_credentials(true)
    };

    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/health", get(api_health))
        .route("/api/auth/logout", post(api_logout))
        .route("/api/projects/{id}/messages", get(api_messages))
        .route("/api/projects/{id}/sandbox", get(api_sandbox))
        .route("/api/projects/{id}/file-tree", get(api_file_tree))
        .route("/api/projects/{id}/run", post(api_run))
        .layer(axum::extract::DefaultBodyLimit::max(8 * 1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Credentials ────────────────────────────────────────────────────────

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
}

fn credentials(headers: &HeaderMap) -> CredentialSource<'_> {
    CredentialSource {
        cookie: cookie_value(headers, SESSION_COOKIE),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    }
}

fn unauthorized(err: &Unauthorized) -> Response {
    let body = Json(serde_json::json!({ "error": err.to_string() }));
    if err.clear_cookie {
        (
            StatusCode::UNAUTHORIZED,
            [(header::SET_COOKIE, CLEAR_SESSION_COOKIE)],
            body,
        )
            .into_response()
    } else {
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Identity, Response> {
    state
        .coordinator
        .gate()
        .authenticate(credentials(headers))
        .await
        .map_err(|e| unauthorized(&e))
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (status, Json(serde_json::json!({ "error": message.to_string() }))).into_response()
}

// ── WebSocket ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    project_id: String,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state
        .coordinator
        .connect(&query.project_id, credentials(&headers))
        .await
    {
        // If the upgrade never completes the membership is dropped with the
        // closure and the bus evicts the dead queue on its next broadcast.
        Ok(membership) => {
            let coordinator = Arc::clone(&state.coordinator);
            ws.on_upgrade(move |socket| handle_ws(socket, coordinator, membership))
                .into_response()
        }
        Err(ChannelJoinError::Unauthenticated(e)) => unauthorized(&e),
        Err(e @ ChannelJoinError::InvalidProject) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

async fn handle_ws(socket: WebSocket, coordinator: Arc<Coordinator>, membership: Membership) {
    let Membership {
        connection,
        project_id,
        identity,
        mut events,
    } = membership;
    let (mut sink, mut stream) = socket.split();

    // Outbound: channel events → frames. Ends when the bus drops this
    // connection (leave or eviction) or the socket fails.
    let outbound = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if sink.send(WsMessage::Text(event.to_json().into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        match serde_json::from_str::<ClientEvent>(text.as_str()) {
            Ok(event) => {
                handle_client_event(&coordinator, &project_id, connection, &identity, event).await
            }
            Err(e) => {
                coordinator.bus().send_to(
                    &project_id,
                    connection,
                    ServerEvent::Error {
                        message: format!("invalid frame: {e}"),
                    },
                );
            }
        }
        if outbound.is_finished() {
            tracing::info!(project = %project_id, connection, "Connection evicted");
            break;
        }
    }

    outbound.abort();
    coordinator.disconnect(&project_id, connection).await;
}

async fn handle_client_event(
    coordinator: &Arc<Coordinator>,
    project_id: &str,
    connection: ConnectionId,
    identity: &Identity,
    event: ClientEvent,
) {
    match event {
        ClientEvent::ProjectMessage { message } => {
            coordinator.send(project_id, identity, message);
        }
        ClientEvent::UpdateFileTree { file_tree } => {
            // Awaited inline so one sender's edits apply in the order sent.
            if let Err(e) = coordinator.update_tree(project_id, identity, file_tree).await {
                report_to(coordinator, project_id, connection, &e);
            }
        }
        ClientEvent::Run {
            build_command,
            start_command,
        } => spawn_run(
            Arc::clone(coordinator),
            project_id.to_string(),
            Some(connection),
            build_command,
            start_command,
        ),
    }
}

fn report_to(coordinator: &Coordinator, project_id: &str, connection: ConnectionId, err: &CoordinatorError) {
    tracing::warn!(project = %project_id, connection, "Request failed: {err}");
    coordinator.bus().send_to(
        project_id,
        connection,
        ServerEvent::Error {
            message: err.to_string(),
        },
    );
}

/// Runs take as long as the build step; never block the caller on them.
fn spawn_run(
    coordinator: Arc<Coordinator>,
    project_id: String,
    requested_by: Option<ConnectionId>,
    build: Option<CommandSpec>,
    start: Option<CommandSpec>,
) {
    tokio::spawn(async move {
        match coordinator.run(&project_id, build, start).await {
            Ok(_) => {}
            // Already published as sandbox-status by the controller.
            Err(CoordinatorError::Sandbox(devroom_sandbox::SandboxError::Spawn(_))) => {}
            Err(CoordinatorError::Sandbox(devroom_sandbox::SandboxError::Superseded)) => {
                tracing::debug!(project = %project_id, "Run superseded");
            }
            Err(e) => match requested_by {
                Some(connection) => report_to(&coordinator, &project_id, connection, &e),
                None => tracing::warn!(project = %project_id, "Run failed: {e}"),
            },
        }
    });
}

// ── REST ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    connections: usize,
    channels: usize,
    sandboxes: usize,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    #[serde(default)]
    build_command: Option<CommandSpec>,
    #[serde(default)]
    start_command: Option<CommandSpec>,
}

async fn api_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let coordinator = &state.coordinator;
    Json(HealthResponse {
        connections: coordinator.bus().connection_count(),
        channels: coordinator.bus().channel_count(),
        sandboxes: coordinator.sandboxes().projects().len(),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

async fn api_logout(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.logout(credentials(&headers)).await {
        Ok(identity) => (
            StatusCode::OK,
            [(header::SET_COOKIE, CLEAR_SESSION_COOKIE)],
            Json(serde_json::json!({ "loggedOut": identity.sub })),
        )
            .into_response(),
        Err(e) => unauthorized(&e),
    }
}

async fn api_messages(
    Path(project_id): Path<String>,
    Query(params): Query<HistoryQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers).await {
        return resp;
    }
    let limit = params.limit.unwrap_or(50).min(200);
    Json(state.coordinator.bus().history(&project_id, limit)).into_response()
}

async fn api_sandbox(
    Path(project_id): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers).await {
        return resp;
    }
    match state.coordinator.sandbox_snapshot(&project_id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no sandbox for this project"),
    }
}

async fn api_file_tree(
    Path(project_id): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers).await {
        return resp;
    }
    match state.coordinator.tree(&project_id).await {
        Ok(Some(tree)) => Json(serde_json::json!({ "fileTree": tree })).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no file tree for this project"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn api_run(
    Path(project_id): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Response {
    let identity = match authorize(&state, &headers).await {
        Ok(identity) => identity,
        Err(resp) => return resp,
    };
    let request: RunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid run request: {e}")),
        }
    };

    if state.coordinator.bus().participants(&project_id).is_empty() {
        return error_response(StatusCode::CONFLICT, CoordinatorError::NoParticipants);
    }
    let (build, start) = match state.coordinator.resolve_commands(
        &project_id,
        request.build_command,
        request.start_command,
    ) {
        Ok(commands) => commands,
        Err(e) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, e),
    };
    tracing::info!(project = %project_id, participant = %identity.sub, "Run requested over HTTP");
    spawn_run(
        Arc::clone(&state.coordinator),
        project_id,
        None,
        build.clone(),
        Some(start.clone()),
    );
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "buildCommand": build,
            "startCommand": start,
        })),
    )
        .into_response()
}
