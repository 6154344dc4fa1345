//! Admin HTTP API.
//!
//! Thin axum layer over [`Bridge`]: every operation a host or dashboard can
//! perform, plus `/events` streaming [`BridgeEvent`]s as server-sent events.
//! Operation results come back as [`ActionResult`] JSON with 200, 422 or 429.

use std::convert::Infallible;
use std::time::Duration;

use avaconf::{ActionParams, BridgeConfig, GiftAction};
use avaproto::OscValue;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::bridge::Bridge;
use crate::chat::ChatMessage;
use crate::error::{ActionResult, BridgeError};
use crate::events::BridgeEvent;
use crate::expressions::{ComboStep, ExpressionClass};
use crate::gifts::GiftEvent;
use crate::physbones::{AnimationKind, AnimationParams};
use crate::presets::PresetValue;

pub fn router(bridge: Bridge) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/config", get(get_config).put(put_config))
        .route("/events", get(events))
        .route("/send", post(send_raw))
        .route("/actions/{action}", post(perform_action))
        .route("/parameters", get(list_parameters).post(send_parameter))
        .route("/parameters/tree", get(parameter_tree))
        .route("/gifts", post(gift))
        .route("/chat", post(chat))
        .route("/chatbox", post(chatbox))
        .route("/chatbox/typing", post(typing))
        .route("/avatar", post(switch_avatar))
        .route("/expressions", post(expression))
        .route("/combos", post(play_combo).delete(stop_combo))
        .route("/physbones", delete(stop_all_physbones))
        .route("/physbones/{bone}", post(trigger_physbone).delete(stop_physbone))
        .route("/state", get(state))
        .route("/history", get(history))
        .route("/presets", get(list_presets))
        .route("/presets/{name}", put(save_preset).delete(delete_preset))
        .route("/presets/{name}/apply", post(apply_preset))
        .with_state(bridge)
}

fn invalid(message: impl Into<String>) -> ActionResult {
    BridgeError::Validation(message.into()).into()
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn status(State(bridge): State<Bridge>) -> impl IntoResponse {
    Json(bridge.stats().await)
}

async fn start(State(bridge): State<Bridge>) -> ActionResult {
    bridge.start().await
}

async fn stop(State(bridge): State<Bridge>) -> ActionResult {
    bridge.stop().await
}

async fn get_config(State(bridge): State<Bridge>) -> impl IntoResponse {
    Json(bridge.config().await.as_ref().clone())
}

async fn put_config(State(bridge): State<Bridge>, Json(config): Json<BridgeConfig>) -> ActionResult {
    bridge.update_config(config).await
}

#[tracing::instrument(skip(bridge))]
async fn events(State(bridge): State<Bridge>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("event stream client connected");

    let stream = BroadcastStream::new(bridge.subscribe()).filter_map(|result| match result {
        Ok(event) => Some(Ok(to_sse_event(&event))),
        Err(e) => {
            debug!("event stream receive error: {}", e);
            None
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn to_sse_event(event: &BridgeEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.kind()).data(data)
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    address: String,
    #[serde(default)]
    args: Vec<Value>,
}

async fn send_raw(State(bridge): State<Bridge>, Json(req): Json<SendRequest>) -> ActionResult {
    let mut args = Vec::with_capacity(req.args.len());
    for arg in &req.args {
        match OscValue::from_json(arg) {
            Some(value) => args.push(value),
            None => return invalid(format!("unsupported argument {}", arg)),
        }
    }
    bridge.send_raw(&req.address, args).await
}

async fn perform_action(
    State(bridge): State<Bridge>,
    Path(action): Path<String>,
    body: Bytes,
) -> ActionResult {
    let Some(action) = GiftAction::parse(&action) else {
        return invalid(format!("unknown action {}", action));
    };
    // Parameters are optional; an empty body means defaults.
    let params = if body.iter().all(u8::is_ascii_whitespace) {
        ActionParams::default()
    } else {
        match serde_json::from_slice::<ActionParams>(&body) {
            Ok(params) => params,
            Err(e) => return invalid(format!("bad action parameters: {}", e)),
        }
    };
    bridge.perform_action(action, &params, None).await
}

#[derive(Debug, Deserialize)]
struct ParameterRequest {
    name: String,
    value: Value,
}

async fn send_parameter(
    State(bridge): State<Bridge>,
    Json(req): Json<ParameterRequest>,
) -> ActionResult {
    match OscValue::from_json(&req.value) {
        Some(value) => bridge.send_parameter(&req.name, value).await,
        None => invalid(format!("unsupported value {}", req.value)),
    }
}

#[derive(Debug, Deserialize)]
struct PatternQuery {
    pattern: Option<String>,
}

async fn list_parameters(
    State(bridge): State<Bridge>,
    Query(query): Query<PatternQuery>,
) -> Response {
    match bridge.discovered_parameters(query.pattern.as_deref()).await {
        Ok(params) => Json(params).into_response(),
        Err(e) => ActionResult::from(e).into_response(),
    }
}

async fn parameter_tree(State(bridge): State<Bridge>) -> Response {
    match bridge.parameter_tree().await {
        Ok(tree) => Json(tree).into_response(),
        Err(e) => ActionResult::from(e).into_response(),
    }
}

async fn gift(State(bridge): State<Bridge>, Json(event): Json<GiftEvent>) -> ActionResult {
    bridge.dispatch_gift_event(event).await
}

async fn chat(State(bridge): State<Bridge>, Json(msg): Json<ChatMessage>) -> ActionResult {
    bridge.handle_chat_message(msg).await
}

#[derive(Debug, Deserialize)]
struct ChatboxRequest {
    text: String,
}

async fn chatbox(State(bridge): State<Bridge>, Json(req): Json<ChatboxRequest>) -> ActionResult {
    bridge.send_chatbox(&req.text).await
}

#[derive(Debug, Deserialize)]
struct TypingRequest {
    typing: bool,
}

async fn typing(State(bridge): State<Bridge>, Json(req): Json<TypingRequest>) -> ActionResult {
    bridge.set_typing(req.typing).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvatarRequest {
    avatar_id: Option<String>,
    avatar_name: Option<String>,
    requested_by: Option<String>,
}

async fn switch_avatar(State(bridge): State<Bridge>, Json(req): Json<AvatarRequest>) -> ActionResult {
    let (id, name) = match (req.avatar_id, req.avatar_name) {
        (Some(id), name) => (id, name),
        (None, Some(name)) => {
            let config = bridge.config().await;
            match config.find_avatar(&name) {
                Some(entry) => (entry.id.clone(), Some(entry.name.clone())),
                None => return invalid(format!("unknown avatar {}", name)),
            }
        }
        (None, None) => return invalid("avatarId or avatarName is required"),
    };
    bridge
        .switch_avatar(&id, name, req.requested_by.as_deref())
        .await
}

#[derive(Debug, Deserialize)]
struct ExpressionRequest {
    class: String,
    slot: i32,
    #[serde(default = "default_hold")]
    hold: bool,
}

fn default_hold() -> bool {
    true
}

async fn expression(
    State(bridge): State<Bridge>,
    Json(req): Json<ExpressionRequest>,
) -> ActionResult {
    let Some(class) = ExpressionClass::parse(&req.class) else {
        return invalid(format!("unknown expression class {}", req.class));
    };
    bridge.trigger_expression(class, req.slot, req.hold).await
}

#[derive(Debug, Deserialize)]
struct ComboRequest {
    steps: Vec<ComboStep>,
    #[serde(default)]
    queue: bool,
}

async fn play_combo(State(bridge): State<Bridge>, Json(req): Json<ComboRequest>) -> ActionResult {
    bridge.play_combo(req.steps, req.queue).await
}

async fn stop_combo(State(bridge): State<Bridge>) -> ActionResult {
    bridge.stop_combo().await
}

#[derive(Debug, Deserialize)]
struct AnimationRequest {
    kind: AnimationKind,
    #[serde(flatten)]
    params: AnimationParams,
}

async fn trigger_physbone(
    State(bridge): State<Bridge>,
    Path(bone): Path<String>,
    Json(req): Json<AnimationRequest>,
) -> Response {
    match bridge.trigger_physbone(&bone, req.kind, req.params).await {
        Ok(id) => (StatusCode::OK, Json(json!({ "success": true, "id": id }))).into_response(),
        Err(e) => ActionResult::from(e).into_response(),
    }
}

async fn stop_physbone(State(bridge): State<Bridge>, Path(bone): Path<String>) -> ActionResult {
    bridge.stop_physbone(Some(&bone)).await
}

async fn stop_all_physbones(State(bridge): State<Bridge>) -> ActionResult {
    bridge.stop_physbone(None).await
}

async fn state(State(bridge): State<Bridge>) -> impl IntoResponse {
    Json(bridge.get_state().await)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    address: String,
}

async fn history(State(bridge): State<Bridge>, Query(query): Query<HistoryQuery>) -> impl IntoResponse {
    Json(bridge.get_history(&query.address).await)
}

async fn list_presets(State(bridge): State<Bridge>) -> impl IntoResponse {
    Json(bridge.list_presets().await)
}

#[derive(Debug, Deserialize)]
struct PresetRequest {
    values: Vec<PresetValue>,
}

async fn save_preset(
    State(bridge): State<Bridge>,
    Path(name): Path<String>,
    Json(req): Json<PresetRequest>,
) -> ActionResult {
    bridge.save_preset(&name, req.values).await
}

async fn delete_preset(State(bridge): State<Bridge>, Path(name): Path<String>) -> ActionResult {
    bridge.delete_preset(&name).await
}

async fn apply_preset(State(bridge): State<Bridge>, Path(name): Path<String>) -> ActionResult {
    bridge.apply_preset(&name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn bridge(dir: &tempfile::TempDir) -> Bridge {
        let mut config = BridgeConfig::default();
        config.send_host = "127.0.0.1".into();
        config.send_port = 9;
        config.receive_port = 0;
        config.discovery.enabled = false;
        config.auto_retry_on_error = false;
        config.paths.state_dir = dir.path().to_path_buf();
        Bridge::new(config).unwrap()
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(req.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = call(router(bridge(&dir)), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn start_send_stop() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir);
        let app = router(bridge.clone());

        let (status, body) = call(app.clone(), "POST", "/send", Some(json!({"address": "/avatar/parameters/Wave", "args": [1]}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], false);

        let (status, _) = call(app.clone(), "POST", "/start", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(app.clone(), "POST", "/send", Some(json!({"address": "/avatar/parameters/Wave", "args": [1]}))).await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let (status, _) = call(app.clone(), "POST", "/send", Some(json!({"address": "/avatar/../x", "args": [1]}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (_, stats) = call(app.clone(), "GET", "/status", None).await;
        assert_eq!(stats["status"], "running");

        let (status, _) = call(app, "POST", "/stop", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = call(router(bridge(&dir)), "POST", "/actions/moonwalk", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["message"].as_str().unwrap().contains("moonwalk"));
    }

    #[tokio::test]
    async fn bad_animation_parameters_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&dir);
        bridge.start().await;
        let app = router(bridge.clone());

        let (status, _) = call(app.clone(), "POST", "/physbones/Tail", Some(json!({"kind": "sine", "amplitude": 4.0}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = call(app.clone(), "POST", "/physbones/Tail", Some(json!({"kind": "sine", "durationMs": 100}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["id"].is_string());

        let (status, _) = call(app, "DELETE", "/physbones", None).await;
        assert_eq!(status, StatusCode::OK);
        bridge.stop().await;
    }

    #[tokio::test]
    async fn preset_routes() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(bridge(&dir));

        let (status, _) = call(
            app.clone(),
            "PUT",
            "/presets/cozy",
            Some(json!({"values": [{"address": "/avatar/parameters/Hat", "value": true}]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, list) = call(app.clone(), "GET", "/presets", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["name"], "cozy");

        let (status, _) = call(app.clone(), "DELETE", "/presets/cozy", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(app, "DELETE", "/presets/cozy", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn history_for_unknown_address_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = call(
            router(bridge(&dir)),
            "GET",
            "/history?address=/avatar/parameters/Nope",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }
}
