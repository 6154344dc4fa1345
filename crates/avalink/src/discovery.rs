//! Remote self-description client.
//!
//! The remote application serves its parameter tree as JSON over HTTP
//! (OSCQuery layout: nested nodes with `FULL_PATH`, `CONTENTS`, `TYPE`,
//! `ACCESS`, `VALUE`, `RANGE`). This client walks that tree into typed
//! [`Parameter`]s, follows a server-sent-events stream of value changes, and
//! polls the `/avatar/change` node to spot avatar swaps.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use avaconf::DiscoveryConfig;
use avaproto::{is_valid_address, parse_physbone_address, OscValue, ValueType, AVATAR_CHANGE};
use futures::future::BoxFuture;
use futures::StreamExt;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::events::{BridgeEvent, EventBus};
use crate::model::{Access, Parameter, Range};
use crate::state::AvatarListener;

/// Server-sent events endpoint carrying `{"address": ..., "value": ...}`.
pub const LIVE_STREAM_PATH: &str = "/events";

/// Deepest node nesting accepted from the remote tree.
const MAX_DEPTH: usize = 32;

/// One pushed value change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveUpdate {
    pub address: String,
    pub value: OscValue,
}

pub type LiveUpdateCallback = Arc<dyn Fn(LiveUpdate) -> BoxFuture<'static, ()> + Send + Sync>;
pub type AvatarChangeCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct DiscoveryClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    parameters: RwLock<BTreeMap<String, Parameter>>,
    events: EventBus,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryClient {
    pub fn new(config: &DiscoveryConfig, events: EventBus, cancel: CancellationToken) -> Result<Self> {
        Self::with_base_url(
            config.base_url(),
            config.request_timeout_duration(),
            events,
            cancel,
        )
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        request_timeout: Duration,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Result<Self> {
        // No overall client timeout: it would cut the event stream short.
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            parameters: RwLock::new(BTreeMap::new()),
            events,
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?
            .error_for_status()?;
        response
            .json()
            .await
            .map_err(|e| BridgeError::Protocol(format!("{} returned invalid JSON: {}", url, e)))
    }

    /// Fetch and walk the full tree. On failure the previously known
    /// parameters are kept.
    #[tracing::instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn discover(&self) -> Result<usize> {
        let parsed = match self.get_json("/").await.and_then(|root| parse_tree(&root)) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("discovery failed, keeping known parameters: {}", e);
                return Err(e);
            }
        };

        let bones: BTreeSet<&str> = parsed
            .iter()
            .filter_map(|p| parse_physbone_address(&p.address).map(|(bone, _)| bone))
            .collect();
        let physbones = bones.len();
        let count = parsed.len();

        {
            let mut known = self.parameters.write().await;
            known.clear();
            known.extend(parsed.into_iter().map(|p| (p.address.clone(), p)));
        }

        info!(parameters = count, physbones, "discovery completed");
        self.events.emit(BridgeEvent::DiscoveryCompleted {
            parameters: count,
            physbones,
        });
        Ok(count)
    }

    pub async fn get_all_parameters(&self) -> Vec<Parameter> {
        self.parameters.read().await.values().cloned().collect()
    }

    pub async fn parameter_count(&self) -> usize {
        self.parameters.read().await.len()
    }

    /// Parameters whose address matches `pattern` (a regular expression).
    pub async fn get_parameters_by_pattern(&self, pattern: &str) -> Result<Vec<Parameter>> {
        let re = Regex::new(pattern)
            .map_err(|e| BridgeError::Validation(format!("bad pattern {:?}: {}", pattern, e)))?;
        Ok(self
            .parameters
            .read()
            .await
            .values()
            .filter(|p| re.is_match(&p.address))
            .cloned()
            .collect())
    }

    /// Known parameters nested by path segment:
    /// `/avatar/parameters/Wave` lands at `tree["avatar"]["parameters"]["Wave"]`.
    pub async fn get_parameter_tree(&self) -> Value {
        build_tree(self.parameters.read().await.values())
    }

    /// Current avatar id as reported by the `/avatar/change` node.
    pub async fn fetch_avatar_id(&self) -> Result<Option<String>> {
        let node = self.get_json(AVATAR_CHANGE).await?;
        Ok(node_value(&node).and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Open the value-change stream. False when the connection cannot be
    /// established; otherwise updates flow to `callback` until shutdown.
    pub async fn subscribe(self: &Arc<Self>, callback: LiveUpdateCallback) -> bool {
        let url = format!("{}{}", self.base_url, LIVE_STREAM_PATH);
        let response = match self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(%url, status = %response.status(), "live subscription refused");
                return false;
            }
            Err(e) => {
                warn!(%url, "live subscription failed: {}", e);
                return false;
            }
        };

        let mut tasks = self.tasks.lock().await;
        if self.cancel.is_cancelled() {
            debug!(%url, "client shut down while subscribing");
            return false;
        }
        info!(%url, "live subscription open");
        let client = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::default();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        for data in parser.push(&bytes) {
                            match parse_live_update(&data) {
                                Some(update) => client.apply_live(update, &callback).await,
                                None => debug!(data, "ignoring unparseable live event"),
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("live subscription error: {}", e);
                        break;
                    }
                    None => {
                        info!("live subscription closed by server");
                        break;
                    }
                }
            }
        });
        tasks.push(handle);
        true
    }

    async fn apply_live(&self, update: LiveUpdate, callback: &LiveUpdateCallback) {
        if let Some(param) = self.parameters.write().await.get_mut(&update.address) {
            param.value = Some(match param.value_type {
                Some(declared) => update
                    .value
                    .coerce_to(declared)
                    .unwrap_or_else(|| update.value.clone()),
                None => update.value.clone(),
            });
            param.updated_at = Some(chrono::Utc::now());
        }
        self.events.emit(BridgeEvent::LiveUpdate {
            address: update.address.clone(),
            value: update.value.clone(),
        });
        callback(update).await;
    }

    /// Poll the avatar node every `interval`. A new id runs `callback`, then a
    /// fresh discovery. Failed polls are logged and polling continues.
    pub async fn start_avatar_watcher(self: &Arc<Self>, interval: Duration, callback: AvatarChangeCallback) {
        let mut tasks = self.tasks.lock().await;
        if self.cancel.is_cancelled() {
            return;
        }
        let client = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last: Option<String> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match client.fetch_avatar_id().await {
                    Ok(Some(id)) if last.as_deref() != Some(id.as_str()) => {
                        debug!(avatar_id = %id, "avatar watcher saw a new avatar");
                        last = Some(id.clone());
                        callback(id).await;
                        if let Err(e) = client.discover().await {
                            debug!("re-discovery after avatar change failed: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!("avatar poll failed: {}", e),
                }
            }
        });
        tasks.push(handle);
    }

    /// Resolves once [`DiscoveryClient::shutdown`] has begun.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Stop the stream and watcher and wait for them to exit. Tasks are only
    /// registered while not cancelled, under the same lock, so none are missed.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                debug!("discovery task ended abnormally: {}", e);
            }
        }
    }
}

#[async_trait]
impl AvatarListener for DiscoveryClient {
    async fn avatar_changed(&self, _avatar_id: &str) {
        // The old tree describes the old avatar.
        self.parameters.write().await.clear();
    }
}

/// Walk a discovery root into parameters.
pub fn parse_tree(root: &Value) -> Result<Vec<Parameter>> {
    let Some(obj) = root.as_object() else {
        return Err(BridgeError::Protocol("discovery root is not an object".into()));
    };
    if !obj.contains_key("CONTENTS") && !obj.contains_key("TYPE") {
        return Err(BridgeError::Protocol(
            "discovery root has neither CONTENTS nor TYPE".into(),
        ));
    }
    let mut out = Vec::new();
    walk(root, 0, &mut out);
    Ok(out)
}

fn walk(node: &Value, depth: usize, out: &mut Vec<Parameter>) {
    if depth > MAX_DEPTH {
        warn!("discovery tree nested deeper than {}, truncating", MAX_DEPTH);
        return;
    }
    if node.get("TYPE").is_some() {
        if let Some(param) = parse_leaf(node) {
            out.push(param);
        }
    }
    if let Some(contents) = node.get("CONTENTS").and_then(Value::as_object) {
        for child in contents.values() {
            walk(child, depth + 1, out);
        }
    }
}

fn parse_leaf(node: &Value) -> Option<Parameter> {
    let address = node.get("FULL_PATH")?.as_str()?;
    if !is_valid_address(address) {
        debug!(address, "skipping node with unsafe address");
        return None;
    }

    let value_type = node
        .get("TYPE")
        .and_then(Value::as_str)
        .and_then(ValueType::from_type_tag);
    let access = node
        .get("ACCESS")
        .and_then(Value::as_i64)
        .map(Access::from_code)
        .unwrap_or_default();
    let value = node_value(node).and_then(OscValue::from_json).map(|v| match value_type {
        Some(t) => v.coerce_to(t).unwrap_or(v),
        None => v,
    });
    let range = node
        .get("RANGE")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
        .map(|r| Range {
            min: r.get("MIN").and_then(Value::as_f64),
            max: r.get("MAX").and_then(Value::as_f64),
        });

    Some(Parameter {
        address: address.to_string(),
        value_type,
        access,
        value,
        range,
        description: node
            .get("DESCRIPTION")
            .and_then(Value::as_str)
            .map(str::to_string),
        updated_at: None,
    })
}

/// `VALUE` is an array of arguments; parameters carry one.
fn node_value(node: &Value) -> Option<&Value> {
    match node.get("VALUE")? {
        Value::Array(values) => values.first(),
        other => Some(other),
    }
}

pub fn build_tree<'a>(params: impl IntoIterator<Item = &'a Parameter>) -> Value {
    let mut root = serde_json::Map::new();
    'params: for param in params {
        let segments: Vec<&str> = param.segments().collect();
        let Some((leaf, parents)) = segments.split_last() else {
            continue;
        };
        let mut node = &mut root;
        for segment in parents {
            let child = node
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            // A leaf that is also a parent becomes a plain branch.
            if !child.is_object() {
                *child = Value::Object(serde_json::Map::new());
            }
            match child {
                Value::Object(map) => node = map,
                _ => continue 'params,
            }
        }
        node.insert(
            leaf.to_string(),
            serde_json::to_value(param).unwrap_or(Value::Null),
        );
    }
    Value::Object(root)
}

/// Parse one SSE `data` payload: `{"address": "...", "value": <scalar | [scalar]>}`.
pub fn parse_live_update(data: &str) -> Option<LiveUpdate> {
    let json: Value = serde_json::from_str(data).ok()?;
    let address = json.get("address")?.as_str()?;
    if !is_valid_address(address) {
        return None;
    }
    let raw = match json.get("value")? {
        Value::Array(values) => values.first()?,
        other => other,
    };
    Some(LiveUpdate {
        address: address.to_string(),
        value: OscValue::from_json(raw)?,
    })
}

/// Longest partial event buffered while waiting for its blank line.
pub const MAX_EVENT_BYTES: usize = 1 << 20;

/// Incremental server-sent-events framing: feed bytes, get complete `data`
/// payloads back. Bytes are only decoded once a whole event has arrived.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Bytes already searched for a terminator.
    scanned: usize,
    /// Dropping the tail of an oversized event.
    skipping: bool,
}

impl SseParser {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer
            .extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        loop {
            let from = self.scanned.saturating_sub(1);
            let Some(pos) = self.buffer[from..].windows(2).position(|w| w == b"\n\n") else {
                self.scanned = self.buffer.len();
                break;
            };
            let block: Vec<u8> = self.buffer.drain(..from + pos + 2).collect();
            self.scanned = 0;
            if std::mem::take(&mut self.skipping) {
                continue;
            }

            let block = String::from_utf8_lossy(&block);
            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect();
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }

        if self.buffer.len() > MAX_EVENT_BYTES {
            warn!(bytes = self.buffer.len(), "oversized live event discarded");
            self.buffer.clear();
            self.scanned = 0;
            self.skipping = true;
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tree() -> Value {
        json!({
            "DESCRIPTION": "root node",
            "FULL_PATH": "/",
            "ACCESS": 0,
            "CONTENTS": {
                "avatar": {
                    "FULL_PATH": "/avatar",
                    "ACCESS": 0,
                    "CONTENTS": {
                        "change": {
                            "FULL_PATH": "/avatar/change",
                            "TYPE": "s",
                            "ACCESS": 3,
                            "VALUE": ["avtr_1"]
                        },
                        "parameters": {
                            "FULL_PATH": "/avatar/parameters",
                            "ACCESS": 0,
                            "CONTENTS": {
                                "Wave": {
                                    "FULL_PATH": "/avatar/parameters/Wave",
                                    "TYPE": "i",
                                    "ACCESS": 3,
                                    "VALUE": [0]
                                },
                                "VelocityX": {
                                    "FULL_PATH": "/avatar/parameters/VelocityX",
                                    "TYPE": "f",
                                    "ACCESS": 1,
                                    "VALUE": [0.0],
                                    "RANGE": [{"MIN": -1.0, "MAX": 1.0}]
                                }
                            }
                        },
                        "physbones": {
                            "FULL_PATH": "/avatar/physbones",
                            "CONTENTS": {
                                "Tail": {
                                    "FULL_PATH": "/avatar/physbones/Tail",
                                    "CONTENTS": {
                                        "Angle": {
                                            "FULL_PATH": "/avatar/physbones/Tail/Angle",
                                            "TYPE": "f",
                                            "ACCESS": 3,
                                            "VALUE": [0.0]
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn walks_every_leaf() {
        let params = parse_tree(&sample_tree()).unwrap();
        let addresses: BTreeSet<_> = params.iter().map(|p| p.address.as_str()).collect();
        assert_eq!(
            addresses,
            BTreeSet::from([
                "/avatar/change",
                "/avatar/parameters/Wave",
                "/avatar/parameters/VelocityX",
                "/avatar/physbones/Tail/Angle",
            ])
        );

        let velocity = params
            .iter()
            .find(|p| p.address == "/avatar/parameters/VelocityX")
            .unwrap();
        assert_eq!(velocity.value_type, Some(ValueType::Float));
        assert_eq!(velocity.access, Access::Read);
        assert_eq!(velocity.value, Some(OscValue::Float(0.0)));
        assert_eq!(velocity.range.unwrap().min, Some(-1.0));
    }

    #[test]
    fn tree_nests_by_segment() {
        let params = parse_tree(&sample_tree()).unwrap();
        let tree = build_tree(&params);
        assert_eq!(
            tree["avatar"]["parameters"]["Wave"]["address"],
            "/avatar/parameters/Wave"
        );
        assert_eq!(
            tree["avatar"]["physbones"]["Tail"]["Angle"]["address"],
            "/avatar/physbones/Tail/Angle"
        );
    }

    #[test]
    fn malformed_root_is_a_protocol_error() {
        assert!(matches!(parse_tree(&json!([1, 2])), Err(BridgeError::Protocol(_))));
        assert!(matches!(
            parse_tree(&json!({"FULL_PATH": "/"})),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn unsafe_addresses_are_skipped() {
        let root = json!({
            "CONTENTS": {
                "bad": {"FULL_PATH": "/avatar/../etc", "TYPE": "i"},
                "good": {"FULL_PATH": "/avatar/parameters/Ok", "TYPE": "T", "VALUE": [true]}
            }
        });
        let params = parse_tree(&root).unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].value, Some(OscValue::Bool(true)));
    }

    #[test]
    fn sse_framing_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"data: {\"address\":\"/a\",").is_empty());
        let events = parser.push(b"\"value\":1}\r\n\r\n: comment\n\ndata: x\n\n");
        assert_eq!(events, vec![r#"{"address":"/a","value":1}"#.to_string(), "x".to_string()]);
    }

    #[test]
    fn sse_keeps_characters_split_across_chunks() {
        let payload = "data: {\"v\":\"é\"}\n\n".as_bytes();
        let split = payload.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut parser = SseParser::default();
        assert!(parser.push(&payload[..split]).is_empty());
        assert_eq!(parser.push(&payload[split..]), vec![r#"{"v":"é"}"#.to_string()]);
    }

    #[test]
    fn sse_drops_an_event_that_never_ends() {
        let mut parser = SseParser::default();
        let chunk = vec![b'a'; 64 * 1024];
        for _ in 0..(MAX_EVENT_BYTES / chunk.len() + 1) {
            assert!(parser.push(&chunk).is_empty());
        }
        assert!(parser.buffer.len() <= MAX_EVENT_BYTES);

        // The rest of the oversized event is skipped, the next one parses.
        assert!(parser.push(b"data: tail\n\n").is_empty());
        assert_eq!(parser.push(b"data: ok\n\n"), vec!["ok".to_string()]);
    }

    #[test]
    fn live_update_accepts_scalar_or_array() {
        assert_eq!(
            parse_live_update(r#"{"address":"/avatar/parameters/Wave","value":[1]}"#),
            Some(LiveUpdate {
                address: "/avatar/parameters/Wave".into(),
                value: OscValue::Int(1)
            })
        );
        assert_eq!(
            parse_live_update(r#"{"address":"/a","value":0.5}"#).map(|u| u.value),
            Some(OscValue::Float(0.5))
        );
        assert_eq!(parse_live_update(r#"{"address":"x","value":1}"#), None);
        assert_eq!(parse_live_update("not json"), None);
    }
}
