use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde_json::{json, Value};

use crate::api::models::{AddProfileRequest, ExportQuery, ImportBody, LogsQuery, StatsQuery};
use crate::database::models::{AppSettings, PortableServer, StatsPeriod};
use crate::error::{ApiError, ApiResult, DisconnectReason};
use crate::server::manager::ServerUpdate;
use crate::server::ConnectSource;
use crate::state::AppState;

pub async fn ping(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "pong": true,
        "port": state.manager.api_port(),
        "uptime": state.manager.uptime_secs(),
    }))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.manager.status())
}

pub async fn tunnels(State(state): State<Arc<AppState>>) -> Json<Value> {
    let tunnels = state.manager.tunnels();
    Json(json!({ "tunnels": tunnels, "count": tunnels.len() }))
}

pub async fn servers(State(state): State<Arc<AppState>>) -> Json<Value> {
    let servers = state.manager.list_servers().await;
    Json(json!({ "servers": servers, "count": servers.len() }))
}

pub async fn add_server(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PortableServer>,
) -> ApiResult<Json<Value>> {
    let id = state.manager.add_server(body).await?;
    Ok(Json(json!({ "id": id })))
}

pub async fn update_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<ServerUpdate>,
) -> ApiResult<Json<Value>> {
    let record = state.manager.update_server(&id, update).await?;
    Ok(Json(json!({ "server": record })))
}

pub async fn delete_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.manager.delete_server(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

/// POST alias kept for clients that cannot issue DELETE.
pub async fn delete_server_post(
    state: State<Arc<AppState>>,
    id: Path<String>,
) -> ApiResult<Json<Value>> {
    delete_server(state, id).await
}

pub async fn connect(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.manager.connect(&id, ConnectSource::Api).await?;
    Ok(Json(json!({ "connecting": id })))
}

pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .manager
        .disconnect(&id, DisconnectReason::ApiDisconnect, true)
        .await?;
    Ok(Json(json!({ "disconnecting": id })))
}

pub async fn disconnect_all(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let count = state
        .manager
        .disconnect_all(DisconnectReason::ApiDisconnectAll)
        .await;
    Ok(Json(json!({ "disconnected": count })))
}

pub async fn start_scan(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    state.manager.start_scan()?;
    Ok(Json(json!({ "scanning": true })))
}

pub async fn scan_progress(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(state.manager.scan_progress_snapshot()).unwrap_or_default())
}

pub async fn logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Json<Value> {
    let entries = state.manager.log_tail(query.limit.unwrap_or(100));
    Json(json!({ "logs": entries, "count": entries.len() }))
}

pub async fn export(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExportQuery>,
) -> Json<Value> {
    Json(state.manager.export(query.include_keys).await)
}

pub async fn import(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ImportBody>,
) -> ApiResult<Json<Value>> {
    let (imported, skipped) = state.manager.import(body.into_servers()).await?;
    Ok(Json(json!({ "imported": imported, "skipped": skipped })))
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<Value>> {
    let period = query.period.as_deref().unwrap_or("24h");
    let period = StatsPeriod::parse(period)
        .ok_or_else(|| ApiError::BadRequest("period must be one of 1h, 24h, 7d".into()))?;
    let report = state.manager.stats(&id, period).await?;
    Ok(Json(serde_json::to_value(report).unwrap_or_default()))
}

pub async fn profiles(State(state): State<Arc<AppState>>) -> Json<Value> {
    let profiles = state.manager.list_profiles().await;
    Json(json!({ "profiles": profiles, "count": profiles.len() }))
}

pub async fn add_profile(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddProfileRequest>,
) -> ApiResult<Json<Value>> {
    let id = state
        .manager
        .add_profile(&body.server_id, &body.display_name, body.socks_port_override)
        .await?;
    Ok(Json(json!({ "id": id })))
}

pub async fn connect_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.manager.connect_profile(&id).await?;
    Ok(Json(json!({ "connecting": id })))
}

pub async fn delete_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.manager.delete_profile(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

pub async fn get_settings(State(state): State<Arc<AppState>>) -> Json<AppSettings> {
    Json(state.manager.get_settings().await)
}

pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<AppSettings>,
) -> ApiResult<Json<AppSettings>> {
    Ok(Json(state.manager.put_settings(settings).await?))
}

pub async fn regenerate_token(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let token = state.manager.regenerate_token().await?;
    Ok(Json(json!({ "token": token })))
}

pub async fn enable_auth(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    state.manager.set_auth_enabled(true).await?;
    Ok(Json(json!({ "authEnabled": true })))
}

pub async fn disable_auth(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    state.manager.set_auth_enabled(false).await?;
    Ok(Json(json!({ "authEnabled": false })))
}

pub async fn help() -> Json<Value> {
    Json(json!({
        "endpoints": [
            "GET  /ping",
            "GET  /status",
            "GET  /tunnels",
            "GET  /servers",
            "POST /servers/add",
            "PUT  /servers/{id}",
            "DELETE /servers/{id}  (alias: POST /servers/delete/{id})",
            "POST /connect/{id}",
            "POST /disconnect/{id}",
            "POST /disconnect-all",
            "POST /scan",
            "GET  /scan/progress",
            "GET  /logs?limit=N",
            "GET  /export?includeKeys=bool",
            "POST /import",
            "GET  /stats/{id}?period=1h|24h|7d",
            "GET  /profiles",
            "POST /profiles/add",
            "POST /profiles/connect/{id}",
            "DELETE /profiles/{id}",
            "GET  /settings",
            "PUT  /settings",
            "POST /token/regenerate",
            "POST /auth/enable",
            "POST /auth/disable",
            "GET  /ws/events  (WebSocket)",
        ],
        "auth": "Authorization: Bearer <token> or ?token=<token>; /ping and /ws/events are public",
    }))
}
