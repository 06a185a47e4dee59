use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, services::ServeDir};

use crate::{
    config::{save_config, validate_definition, ServerDefinition},
    error::ProcessError,
    palworld::PalworldSettings,
    state::{AppState, ManagedServer},
};

const CONSOLE_BACKLOG_LINES: usize = 100;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn err_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: msg.into() })).into_response()
}

fn not_found(id: &str) -> Response {
    err_response(StatusCode::NOT_FOUND, format!("Server '{}' not found", id))
}

fn process_error_response(e: ProcessError) -> Response {
    let status = match e {
        ProcessError::AlreadyRunning | ProcessError::NotRunning => StatusCode::CONFLICT,
        ProcessError::Spawn { .. } => StatusCode::BAD_REQUEST,
        ProcessError::Io(_) | ProcessError::MissingPipe(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    err_response(status, e.to_string())
}

fn lookup(state: &AppState, id: &str) -> Result<Arc<ManagedServer>, Response> {
    state.server(id).ok_or_else(|| not_found(id))
}

/// The local control surface. Unknown paths fall through to `public_dir`
/// when one is configured.
pub fn router(state: AppState, public_dir: Option<&FsPath>) -> Router {
    let app = Router::new()
        .route("/api/servers", get(list_servers).post(create_server))
        .route(
            "/api/servers/{id}",
            get(get_server).put(update_server).delete(delete_server),
        )
        .route("/api/servers/{id}/start", post(start_server))
        .route("/api/servers/{id}/stop", post(stop_server))
        .route("/api/servers/{id}/restart", post(restart_server))
        .route("/api/servers/{id}/refresh", post(refresh_server))
        .route("/api/servers/{id}/command", post(send_command))
        .route("/api/servers/{id}/status", get(server_status))
        .route("/api/servers/{id}/settings", get(get_settings).put(put_settings))
        .route("/api/servers/{id}/console/ws", get(console_ws))
        .route("/api/servers/{id}/status/ws", get(status_ws))
        .layer(CorsLayer::permissive())
        .with_state(state);

    match public_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    }
}

pub async fn list_servers(State(state): State<AppState>) -> impl IntoResponse {
    let ids: Vec<String> = {
        let config = state.config.read().await;
        config.list().iter().map(|d| d.id.clone()).collect()
    };
    let mut result = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(server) = state.server(&id) {
            result.push(server.summary());
        }
    }
    Json(result)
}

pub async fn get_server(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match lookup(&state, &id) {
        Ok(server) => Json(server.summary()).into_response(),
        Err(resp) => resp,
    }
}

pub async fn create_server(
    State(state): State<AppState>,
    Json(input): Json<ServerDefinition>,
) -> Response {
    if let Err(e) = validate_definition(&input) {
        return err_response(StatusCode::BAD_REQUEST, e);
    }
    let stored = {
        let mut config = state.config.write().await;
        if config.get(&input.id).is_some() {
            return err_response(
                StatusCode::CONFLICT,
                format!("Server id '{}' already exists", input.id),
            );
        }
        let stored = config.upsert(input);
        if let Err(e) = save_config(&state.config_path, &config).await {
            config.remove(&stored.id);
            return err_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e));
        }
        stored
    };
    state.replace_server(stored.clone()).await;
    tracing::info!("Created server '{}'", stored.id);
    (StatusCode::CREATED, Json(stored)).into_response()
}

pub async fn update_server(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(input): Json<ServerDefinition>,
) -> Response {
    if input.id != id {
        return err_response(StatusCode::BAD_REQUEST, "id in path must match id in body");
    }
    if let Err(e) = validate_definition(&input) {
        return err_response(StatusCode::BAD_REQUEST, e);
    }
    if state.server(&id).is_some_and(|s| s.process().is_running()) {
        return err_response(
            StatusCode::CONFLICT,
            "Server must be stopped before it can be reconfigured",
        );
    }
    let stored = {
        let mut config = state.config.write().await;
        let Some(previous) = config.get(&id).cloned() else {
            return not_found(&id);
        };
        let stored = config.upsert(input);
        if let Err(e) = save_config(&state.config_path, &config).await {
            config.upsert(previous);
            return err_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e));
        }
        stored
    };
    state.replace_server(stored.clone()).await;
    tracing::info!("Updated server '{}'", id);
    Json(stored).into_response()
}

pub async fn delete_server(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    if state.server(&id).is_some_and(|s| s.process().is_running()) {
        return err_response(StatusCode::CONFLICT, "Server must be stopped before deletion");
    }
    {
        let mut config = state.config.write().await;
        let Some(removed) = config.remove(&id) else {
            return not_found(&id);
        };
        if let Err(e) = save_config(&state.config_path, &config).await {
            config.upsert(removed);
            return err_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e));
        }
    }
    state.remove_server(&id).await;
    tracing::info!("Deleted server '{}'", id);
    StatusCode::NO_CONTENT.into_response()
}

pub async fn start_server(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    let server = match lookup(&state, &id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match server.start().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => process_error_response(e),
    }
}

pub async fn stop_server(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    let server = match lookup(&state, &id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match server.stop().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => process_error_response(e),
    }
}

pub async fn restart_server(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    let server = match lookup(&state, &id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match server.restart().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => process_error_response(e),
    }
}

pub async fn refresh_server(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    let server = match lookup(&state, &id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let outcome = server.monitor().force_refresh().await;
    Json(serde_json::json!({
        "outcome": outcome,
        "model": server.monitor().snapshot(),
    }))
    .into_response()
}

pub async fn server_status(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match lookup(&state, &id) {
        Ok(server) => Json(server.monitor().snapshot()).into_response(),
        Err(resp) => resp,
    }
}

#[derive(Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

pub async fn send_command(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(input): Json<CommandRequest>,
) -> Response {
    let server = match lookup(&state, &id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    if input.command.trim().is_empty() {
        return err_response(StatusCode::BAD_REQUEST, "command must not be empty");
    }
    match server.process().send_command(input.command.trim()).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => process_error_response(e),
    }
}

pub async fn get_settings(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match lookup(&state, &id) {
        Ok(server) => Json(server.monitor().title().settings().await).into_response(),
        Err(resp) => resp,
    }
}

pub async fn put_settings(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(input): Json<PalworldSettings>,
) -> Response {
    let server = match lookup(&state, &id) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    match server.monitor().title().save_settings(input).await {
        Ok(()) => Json(server.monitor().title().settings().await).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
    }
}

pub async fn console_ws(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_console_ws(socket, id, state))
}

async fn handle_console_ws(mut socket: WebSocket, id: String, state: AppState) {
    let Some(server) = state.server(&id) else {
        let _ = socket
            .send(Message::Text(format!("Server '{}' not found", id).into()))
            .await;
        return;
    };

    // Subscribe before reading the backlog so no line falls in between.
    let mut console_rx = server.process().subscribe_output();
    for line in server.process().console().tail(CONSOLE_BACKLOG_LINES).await {
        if socket.send(Message::Text(line.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            msg = console_rx.recv() => {
                match msg {
                    Ok(line) => {
                        if socket.send(Message::Text(line.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("Console viewer for '{}' skipped {} lines", id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            ws_msg = socket.recv() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        #[derive(Deserialize)]
                        struct WsCommand {
                            #[serde(rename = "type")]
                            kind: String,
                            data: String,
                        }
                        if let Ok(cmd) = serde_json::from_str::<WsCommand>(&text) {
                            if cmd.kind == "command" {
                                if let Err(e) = server.process().send_command(&cmd.data).await {
                                    let _ = socket.send(Message::Text(e.to_string().into())).await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

pub async fn status_ws(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_status_ws(socket, id, state))
}

/// Each open connection is one monitor subscriber.
async fn handle_status_ws(mut socket: WebSocket, id: String, state: AppState) {
    let Some(server) = state.server(&id) else {
        let _ = socket
            .send(Message::Text(format!("Server '{}' not found", id).into()))
            .await;
        return;
    };

    let mut subscription = server.monitor().subscribe();
    let mut next = Some(subscription.current());

    loop {
        if let Some(model) = next.take() {
            match serde_json::to_string(&model) {
                Ok(json) => {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Failed to encode status for '{}': {}", id, e),
            }
        }

        tokio::select! {
            changed = subscription.changed() => {
                match changed {
                    Some(model) => next = Some(model),
                    None => {
                        // the server was replaced or removed
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            ws_msg = socket.recv() => {
                match ws_msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
