//! Bridge orchestrator.
//!
//! Owns the lifecycle (stopped → starting → running → stopping → stopped,
//! with `error` on socket failure) and everything that only exists while
//! running: the transport, the outbound path, the controllers, the discovery
//! client and the background tasks. Host-facing operations return
//! [`ActionResult`]; nothing here panics across the API.
//!
//! The state store, presets, cooldown records and event bus outlive a
//! restart.

use std::sync::Arc;
use std::time::Duration;

use avaconf::{ActionParams, BridgeConfig, ConfigValue, GiftAction};
use avaproto::{
    parameter_address, Message, OscValue, AVATAR_CHANGE, CHATBOX_INPUT, CHATBOX_TYPING,
    PARAMETER_PREFIX, PHYSBONE_PREFIX,
};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chat::{ChatCommand, ChatMessage, ParseError};
use crate::cooldown::{remaining_secs, AvatarSwitchCooldown, ChatRateLimiter, RateDecision};
use crate::discovery::{AvatarChangeCallback, DiscoveryClient, LiveUpdate, LiveUpdateCallback};
use crate::error::{ActionResult, BridgeError, Result};
use crate::events::{BridgeEvent, BridgeStatus, EventBus};
use crate::expressions::{ComboStep, ExpressionClass, ExpressionController};
use crate::gifts::{find_mapping, GiftEvent};
use crate::model::{HistoryEntry, Parameter};
use crate::outbound::{OutboundPath, ParameterSink};
use crate::physbones::{AnimationKind, AnimationParams, PhysBoneController};
use crate::presets::{Preset, PresetStore, PresetValue};
use crate::state::{StateSnapshot, StateStore};
use crate::transport::{InboundPacket, OscTransport, Outbound, TransportOptions, TransportStatsSnapshot};

/// Chatbox text limit enforced by the remote application.
pub const CHATBOX_MAX_CHARS: usize = 144;

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

const DEFAULT_ACTION_MS: u64 = 1_000;
const INBOUND_QUEUE: usize = 1024;

/// Handles shared by every operation while running. All cheap to clone.
#[derive(Clone)]
struct Handles {
    config: Arc<BridgeConfig>,
    transport: Arc<OscTransport>,
    outbound: Arc<OutboundPath>,
    expressions: ExpressionController,
    physbones: PhysBoneController,
    discovery: Option<Arc<DiscoveryClient>>,
    /// Delayed releases of pulsed actions.
    pulses: Arc<Mutex<Vec<JoinHandle<()>>>>,
    pulse_cancel: CancellationToken,
}

struct Runtime {
    handles: Handles,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Animations, combo and held slots first, so their resets make the final
    /// flush; then tasks; then the socket.
    async fn shutdown(self, state: &StateStore) {
        let h = self.handles;

        h.pulse_cancel.cancel();
        let pulses: Vec<_> = h.pulses.lock().await.drain(..).collect();
        for pulse in pulses {
            if let Err(e) = pulse.await {
                debug!("pulse task ended abnormally: {}", e);
            }
        }

        let animations = h.physbones.stop_all_animations().await;
        h.expressions.stop_combo().await;
        let released = h.expressions.release_all().await;
        h.outbound.flush().await;
        h.outbound.clear().await;

        if let Some(discovery) = &h.discovery {
            discovery.shutdown().await;
        }
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                debug!("bridge task ended abnormally: {}", e);
            }
        }

        state.clear_listeners().await;
        h.transport.close();
        info!(animations, released, "bridge runtime shut down");
    }
}

/// Aggregate counters for dashboards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    pub status: BridgeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportStatsSnapshot>,
    pub cache_size: usize,
    pub pending_messages: usize,
    pub active_animations: usize,
    pub held_slots: usize,
    pub combo_playing: bool,
    pub known_parameters: usize,
    pub presets: usize,
    pub event_subscribers: usize,
}

struct Inner {
    config: RwLock<Arc<BridgeConfig>>,
    status: RwLock<BridgeStatus>,
    /// Also serializes start/stop.
    runtime: Mutex<Option<Runtime>>,
    retry: Mutex<Option<JoinHandle<()>>>,
    events: EventBus,
    state: Arc<StateStore>,
    presets: Mutex<PresetStore>,
    switch_cooldown: Arc<Mutex<AvatarSwitchCooldown>>,
    chat_limiter: Arc<Mutex<ChatRateLimiter>>,
}

#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    /// Build a stopped bridge. Loads presets from `paths.stateDir`.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new();
        let state = Arc::new(StateStore::new(&config.live_monitoring, events.clone()));
        let presets = PresetStore::open(config.paths.presets_file())?;

        Ok(Self {
            inner: Arc::new(Inner {
                switch_cooldown: Arc::new(Mutex::new(AvatarSwitchCooldown::from_config(
                    &config.chat_commands,
                ))),
                chat_limiter: Arc::new(Mutex::new(ChatRateLimiter::from_config(
                    &config.chat_commands,
                ))),
                config: RwLock::new(Arc::new(config)),
                status: RwLock::new(BridgeStatus::Stopped),
                runtime: Mutex::new(None),
                retry: Mutex::new(None),
                events,
                state,
                presets: Mutex::new(presets),
            }),
        })
    }

    pub async fn config(&self) -> Arc<BridgeConfig> {
        Arc::clone(&*self.inner.config.read().await)
    }

    pub async fn status(&self) -> BridgeStatus {
        *self.inner.status.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.inner.state
    }

    async fn set_status(&self, status: BridgeStatus, detail: Option<String>) {
        {
            let mut current = self.inner.status.write().await;
            if *current == status && detail.is_none() {
                return;
            }
            *current = status;
        }
        info!(status = %status, detail = ?detail, "bridge status changed");
        self.inner
            .events
            .emit(BridgeEvent::StatusChanged { status, detail });
    }

    async fn handles(&self) -> Result<Handles> {
        self.inner
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|rt| rt.handles.clone())
            .ok_or_else(|| BridgeError::Lifecycle("bridge is not running".into()))
    }

    pub async fn local_port(&self) -> Option<u16> {
        self.handles().await.ok().map(|h| h.transport.local_port())
    }

    // ---- lifecycle ----

    pub async fn start(&self) -> ActionResult {
        match self.try_start().await {
            Ok(port) => ActionResult::ok(format!("Bridge started on port {}", port)),
            Err(e @ BridgeError::Lifecycle(_)) => e.into(),
            Err(e) => {
                self.after_start_failure().await;
                e.into()
            }
        }
    }

    /// One start attempt; no retry scheduling.
    async fn try_start(&self) -> Result<u16> {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            return Err(BridgeError::Lifecycle("bridge is already running".into()));
        }
        let config = self.config().await;
        if !config.enabled {
            return Err(BridgeError::Lifecycle(
                "bridge is disabled in configuration".into(),
            ));
        }

        self.set_status(BridgeStatus::Starting, None).await;
        match self.build_runtime(Arc::clone(&config)).await {
            Ok(rt) => {
                let port = rt.handles.transport.local_port();
                *runtime = Some(rt);
                drop(runtime);
                self.set_status(BridgeStatus::Running, None).await;
                Ok(port)
            }
            Err(e) => {
                error!("bridge failed to start: {}", e);
                self.set_status(BridgeStatus::Error, Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Schedule restarts when auto-retry is on, else settle in `stopped`.
    async fn after_start_failure(&self) {
        let config = self.config().await;
        if !config.auto_retry_on_error {
            self.set_status(BridgeStatus::Stopped, None).await;
            return;
        }

        let bridge = self.clone();
        let delay = config.retry_delay_duration();
        let attempts = config.max_bind_retries.max(1);
        let handle = tokio::spawn(async move {
            for attempt in 1..=attempts {
                tokio::time::sleep(delay).await;
                info!(attempt, attempts, "retrying bridge start");
                match bridge.try_start().await {
                    Ok(_) | Err(BridgeError::Lifecycle(_)) => return,
                    Err(e) => debug!(attempt, "retry failed: {}", e),
                }
            }
            warn!(attempts, "giving up on bridge start");
            bridge.set_status(BridgeStatus::Stopped, None).await;
        });

        if let Some(old) = self.inner.retry.lock().await.replace(handle) {
            old.abort();
        }
    }

    async fn build_runtime(&self, config: Arc<BridgeConfig>) -> Result<Runtime> {
        let events = self.inner.events.clone();
        let state = Arc::clone(&self.inner.state);

        let transport = Arc::new(OscTransport::open(&TransportOptions::from_config(&config)).await?);
        let bound = transport.local_port();
        if config.receive_port != 0 && bound != config.receive_port {
            warn!(requested = config.receive_port, bound, "bound a different receive port");
            events.emit(BridgeEvent::ReceivePortChanged {
                requested: config.receive_port,
                bound,
            });
            let mut updated = (*config).clone();
            updated.receive_port = bound;
            *self.inner.config.write().await = Arc::new(updated);
        }

        let out: Arc<dyn Outbound> = transport.clone();
        let outbound = Arc::new(OutboundPath::new(
            &config,
            out,
            Arc::clone(&state),
            events.clone(),
        ));
        let sink: Arc<dyn ParameterSink> = outbound.clone();
        let expressions = ExpressionController::new(&config.expressions, Arc::clone(&sink), events.clone());
        let physbones = PhysBoneController::new(
            &config.physics_bones,
            sink,
            Arc::clone(&state),
            events.clone(),
        );

        let cancel = CancellationToken::new();
        let discovery = if config.discovery.enabled {
            Some(Arc::new(DiscoveryClient::new(
                &config.discovery,
                events.clone(),
                cancel.child_token(),
            )?))
        } else {
            None
        };

        // Animations stop before the cache is cleared so no tick refills it.
        state.clear_listeners().await;
        state.add_listener(Arc::new(physbones.clone())).await;
        state.add_listener(outbound.clone()).await;
        if let Some(client) = &discovery {
            state.add_listener(client.clone()).await;
        }

        let handles = Handles {
            config: Arc::clone(&config),
            transport: Arc::clone(&transport),
            outbound,
            expressions,
            physbones,
            discovery,
            pulses: Arc::new(Mutex::new(Vec::new())),
            pulse_cancel: CancellationToken::new(),
        };

        let mut tasks = Vec::new();
        let rediscover = Arc::new(Notify::new());
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        tasks.push(transport.spawn_receiver(tx, cancel.child_token()));
        tasks.push(tokio::spawn(route_inbound(
            rx,
            Arc::clone(&state),
            events.clone(),
            Arc::clone(&config),
            Arc::clone(&rediscover),
            cancel.child_token(),
        )));
        if config.live_monitoring.enabled {
            tasks.push(
                state.spawn_notifier(config.live_monitoring.update_duration(), cancel.child_token()),
            );
        }
        tasks.push(self.spawn_cleanup(&handles, cancel.child_token()));
        if let Some(client) = &handles.discovery {
            tasks.push(spawn_discovery(
                Arc::clone(client),
                Arc::clone(&state),
                handles.physbones.clone(),
                Arc::clone(&config),
                events.clone(),
                rediscover,
                cancel.child_token(),
            ));
        }

        Ok(Runtime {
            handles,
            cancel,
            tasks,
        })
    }

    fn spawn_cleanup(&self, handles: &Handles, cancel: CancellationToken) -> JoinHandle<()> {
        let expressions = handles.expressions.clone();
        let outbound = Arc::clone(&handles.outbound);
        let state = Arc::clone(&self.inner.state);
        let switch_cooldown = Arc::clone(&self.inner.switch_cooldown);
        let chat_limiter = Arc::clone(&self.inner.chat_limiter);
        let history_age = handles.config.live_monitoring.history_window();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let now = Instant::now();
                let slots = expressions.cleanup().await;
                let cached = outbound.sweep_cache().await;
                let history = state.sweep_history(history_age).await;
                let switches = switch_cooldown.lock().await.sweep(now);
                let chatters = chat_limiter.lock().await.sweep(now);
                debug!(slots, cached, history, switches, chatters, "cleanup sweep");
            }
        })
    }

    pub async fn stop(&self) -> ActionResult {
        match self.try_stop().await {
            Ok(()) => ActionResult::ok("Bridge stopped"),
            Err(e) => e.into(),
        }
    }

    async fn try_stop(&self) -> Result<()> {
        let retry = self.inner.retry.lock().await.take();
        let was_retrying = retry.as_ref().is_some_and(|r| !r.is_finished());
        if let Some(retry) = retry {
            retry.abort();
        }

        let mut runtime = self.inner.runtime.lock().await;
        let Some(rt) = runtime.take() else {
            if was_retrying {
                self.set_status(BridgeStatus::Stopped, None).await;
                return Ok(());
            }
            return Err(BridgeError::Lifecycle("bridge is not running".into()));
        };

        self.set_status(BridgeStatus::Stopping, None).await;
        rt.shutdown(&self.inner.state).await;
        drop(runtime);
        self.set_status(BridgeStatus::Stopped, None).await;
        Ok(())
    }

    /// Swap the configuration snapshot. A running bridge is stopped, rebuilt
    /// and restarted.
    pub async fn update_config(&self, config: BridgeConfig) -> ActionResult {
        if let Err(e) = config.validate() {
            return BridgeError::from(e).into();
        }

        let was_running = self.inner.runtime.lock().await.is_some();
        if was_running {
            if let Err(e) = self.try_stop().await {
                return e.into();
            }
        }

        *self.inner.switch_cooldown.lock().await =
            AvatarSwitchCooldown::from_config(&config.chat_commands);
        *self.inner.chat_limiter.lock().await = ChatRateLimiter::from_config(&config.chat_commands);
        *self.inner.config.write().await = Arc::new(config);
        info!(was_running, "configuration updated");

        if was_running {
            let result = self.start().await;
            if !result.success {
                return result;
            }
            return ActionResult::ok("Configuration updated, bridge restarted");
        }
        ActionResult::ok("Configuration updated")
    }

    // ---- raw sends ----

    pub async fn send_raw(&self, address: &str, args: Vec<OscValue>) -> ActionResult {
        let result = async {
            let h = self.handles().await?;
            avaproto::validate_address(address)?;
            if !h.outbound.send(Message::new(address, args)).await {
                return Err(BridgeError::Transport(format!("send to {} failed", address)));
            }
            Ok::<_, BridgeError>(format!("Sent {}", address))
        };
        result.await.into()
    }

    /// Write one avatar parameter by name or full address.
    pub async fn send_parameter(&self, name: &str, value: OscValue) -> ActionResult {
        self.send_raw(&parameter_address(name), vec![value]).await
    }

    pub async fn send_chatbox(&self, text: &str) -> ActionResult {
        let text: String = text.chars().take(CHATBOX_MAX_CHARS).collect();
        let result = async {
            let h = self.handles().await?;
            let message = Message::new(
                CHATBOX_INPUT,
                vec![OscValue::Str(text), OscValue::Bool(true), OscValue::Bool(false)],
            );
            if !h.outbound.send_forced(message).await {
                return Err(BridgeError::Transport("chatbox send failed".into()));
            }
            Ok::<_, BridgeError>("Chatbox message sent".to_string())
        };
        result.await.into()
    }

    pub async fn set_typing(&self, typing: bool) -> ActionResult {
        let result = async {
            let h = self.handles().await?;
            if !h
                .outbound
                .send_forced(Message::single(CHATBOX_TYPING, typing))
                .await
            {
                return Err(BridgeError::Transport("typing indicator send failed".into()));
            }
            Ok::<_, BridgeError>(format!("Typing {}", if typing { "on" } else { "off" }))
        };
        result.await.into()
    }

    // ---- actions ----

    /// Run a predefined action with its parameters.
    pub async fn perform_action(
        &self,
        action: GiftAction,
        params: &ActionParams,
        actor: Option<&str>,
    ) -> ActionResult {
        self.run_action(action, params, actor).await.into()
    }

    async fn run_action(
        &self,
        action: GiftAction,
        params: &ActionParams,
        actor: Option<&str>,
    ) -> Result<String> {
        let h = self.handles().await?;
        let hold = Duration::from_millis(params.duration.unwrap_or(DEFAULT_ACTION_MS));

        match action {
            GiftAction::Wave
            | GiftAction::Celebrate
            | GiftAction::Dance
            | GiftAction::Hearts
            | GiftAction::Confetti => {
                let name = action.pulse_parameter().unwrap_or(action.as_str());
                let address = parameter_address(name);
                self.pulse(&h, &address, OscValue::Int(1), OscValue::Int(0), hold)
                    .await?;
                Ok(format!("Triggered {}", action))
            }
            GiftAction::Emote => {
                let slot = params.slot.unwrap_or(0);
                if !h
                    .expressions
                    .trigger_expression(ExpressionClass::Emote, slot, true)
                    .await
                {
                    return Err(BridgeError::policy(format!(
                        "Emote {} is unavailable right now",
                        slot
                    )));
                }
                let expressions = h.expressions.clone();
                self.schedule(&h, hold, async move {
                    expressions
                        .trigger_expression(ExpressionClass::Emote, slot, false)
                        .await;
                })
                .await;
                Ok(format!("Emote {}", slot))
            }
            GiftAction::AvatarSwitch => {
                let (id, name) = match (&params.avatar_id, &params.avatar_name) {
                    (Some(id), name) => (id.clone(), name.clone()),
                    (None, Some(name)) => {
                        let entry = h.config.find_avatar(name).ok_or_else(|| {
                            BridgeError::Validation(format!("unknown avatar {}", name))
                        })?;
                        (entry.id.clone(), Some(entry.name.clone()))
                    }
                    (None, None) => {
                        return Err(BridgeError::Validation(
                            "avatar-switch needs avatarId or avatarName".into(),
                        ))
                    }
                };
                self.switch_avatar_inner(&h, &id, name, actor).await
            }
            GiftAction::CustomParameter => {
                let parameter = params.parameter.as_deref().ok_or_else(|| {
                    BridgeError::Validation("custom-parameter needs a parameter".into())
                })?;
                let address = parameter_address(parameter);
                let value = params
                    .value
                    .as_ref()
                    .map(config_value)
                    .unwrap_or(OscValue::Int(1));
                match (params.duration, &params.reset_value) {
                    (None, None) => {
                        avaproto::validate_address(&address)?;
                        if !h.outbound.send_parameter(&address, value).await {
                            return Err(BridgeError::Transport(format!(
                                "send to {} failed",
                                address
                            )));
                        }
                    }
                    (_, reset) => {
                        let reset = reset.as_ref().map(config_value).unwrap_or_else(|| zero_like(&value));
                        self.pulse(&h, &address, value, reset, hold).await?;
                    }
                }
                Ok(format!("Set {}", address))
            }
        }
    }

    /// Write `on`, then `off` after `hold`.
    async fn pulse(
        &self,
        h: &Handles,
        address: &str,
        on: OscValue,
        off: OscValue,
        hold: Duration,
    ) -> Result<()> {
        avaproto::validate_address(address)?;
        if !h.outbound.send_parameter(address, on).await {
            return Err(BridgeError::Transport(format!("send to {} failed", address)));
        }
        let outbound = Arc::clone(&h.outbound);
        let address = address.to_string();
        self.schedule(h, hold, async move {
            outbound.send_parameter(&address, off).await;
        })
        .await;
        Ok(())
    }

    /// Run `release` after `delay`, or immediately when the bridge stops.
    async fn schedule<F>(&self, h: &Handles, delay: Duration, release: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = h.pulse_cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            release.await;
        });
        let mut pulses = h.pulses.lock().await;
        pulses.retain(|p| !p.is_finished());
        pulses.push(handle);
    }

    pub async fn dispatch_gift_event(&self, event: GiftEvent) -> ActionResult {
        let config = self.config().await;
        let Some(mapping) = find_mapping(&config.gift_mappings, &event) else {
            debug!(gift = %event.label(), "no mapping for gift");
            return ActionResult::fail(format!("No mapping for gift {}", event.label()));
        };

        info!(
            gift = %event.label(),
            user = ?event.user,
            action = %mapping.action,
            "gift received"
        );
        let result = self
            .perform_action(mapping.action, &mapping.params, event.user.as_deref())
            .await;

        self.inner.events.emit(BridgeEvent::GiftAction {
            gift_id: event.gift_id,
            gift_name: event.gift_name.clone(),
            action: mapping.action,
            user: event.user.clone(),
            success: result.success,
        });
        result
    }

    // ---- avatar switching ----

    /// Send `/avatar/change`. Cooldowns are the caller's business.
    pub async fn switch_avatar(
        &self,
        avatar_id: &str,
        avatar_name: Option<String>,
        requested_by: Option<&str>,
    ) -> ActionResult {
        let result = async {
            let h = self.handles().await?;
            self.switch_avatar_inner(&h, avatar_id, avatar_name, requested_by)
                .await
        };
        result.await.into()
    }

    async fn switch_avatar_inner(
        &self,
        h: &Handles,
        avatar_id: &str,
        avatar_name: Option<String>,
        requested_by: Option<&str>,
    ) -> Result<String> {
        let avatar_id = avatar_id.trim();
        if avatar_id.is_empty() {
            return Err(BridgeError::Validation("avatar id is empty".into()));
        }
        if !avatar_id.starts_with("avtr_") {
            warn!(avatar_id, "avatar id lacks the avtr_ prefix, sending anyway");
        }

        if !h
            .outbound
            .send_forced(Message::single(AVATAR_CHANGE, avatar_id))
            .await
        {
            return Err(BridgeError::Transport("avatar change send failed".into()));
        }

        let label = avatar_name.clone().unwrap_or_else(|| avatar_id.to_string());
        info!(avatar_id, requested_by = ?requested_by, "avatar switch sent");
        self.inner.events.emit(BridgeEvent::AvatarSwitched {
            avatar_id: avatar_id.to_string(),
            avatar_name,
            requested_by: requested_by.map(str::to_string),
        });
        Ok(format!("Switched to {}", label))
    }

    /// Whole seconds until `actor` may switch again; `None` when allowed.
    pub async fn check_avatar_switch_cooldown(&self, actor: &str) -> Option<u64> {
        self.inner
            .switch_cooldown
            .lock()
            .await
            .check(actor, Instant::now())
            .map(remaining_secs)
    }

    pub async fn update_avatar_switch_cooldown(&self, actor: &str) {
        self.inner
            .switch_cooldown
            .lock()
            .await
            .record(actor, Instant::now());
    }

    // ---- chat ----

    /// Run a chat command. The result message is the reply for chat.
    pub async fn handle_chat_message(&self, msg: ChatMessage) -> ActionResult {
        self.run_chat(&msg).await.into()
    }

    async fn run_chat(&self, msg: &ChatMessage) -> Result<String> {
        let config = self.config().await;
        let chat = &config.chat_commands;
        if !chat.enabled {
            return Err(BridgeError::policy("Chat commands are disabled"));
        }

        let command = match ChatCommand::parse(&msg.text) {
            Ok(command) => command,
            Err(ParseError::NotCommand) => {
                return Err(BridgeError::Validation("not a command".into()))
            }
            Err(ParseError::Unknown(name)) => {
                return Err(BridgeError::Validation(format!("Unknown command !{}", name)))
            }
            Err(ParseError::Usage(usage)) => return Err(BridgeError::Validation(usage.into())),
        };

        match self
            .inner
            .chat_limiter
            .lock()
            .await
            .try_acquire(&msg.user, Instant::now())
        {
            RateDecision::Allowed => {}
            RateDecision::Cooldown(left) => {
                let secs = remaining_secs(left);
                return Err(BridgeError::cooldown(
                    format!("@{} slow down, try again in {}s", msg.user, secs),
                    secs,
                ));
            }
            RateDecision::RateLimited(left) => {
                let secs = remaining_secs(left);
                return Err(BridgeError::cooldown(
                    format!("@{} too many commands, try again in {}s", msg.user, secs),
                    secs,
                ));
            }
        }

        debug!(user = %msg.user, command = ?command, "chat command");
        match command {
            ChatCommand::ListAvatars => {
                if config.avatars.is_empty() {
                    return Ok("No avatars configured".into());
                }
                let names: Vec<&str> = config.avatars.iter().map(|a| a.name.as_str()).collect();
                Ok(format!("Avatars: {}", names.join(", ")))
            }
            ChatCommand::Avatar(query) => {
                let switch = &chat.avatar_switch;
                if !switch.enabled {
                    return Err(BridgeError::policy("Avatar switching is disabled"));
                }
                if !msg.has(switch.permission) {
                    return Err(BridgeError::policy(format!(
                        "@{} avatar switching is limited to {:?}s",
                        msg.user, switch.permission
                    )));
                }
                let entry = config.find_avatar(&query).ok_or_else(|| {
                    BridgeError::Validation(format!("Unknown avatar {}, try !avatars", query))
                })?;
                let h = self.handles().await?;
                let reservation = self
                    .inner
                    .switch_cooldown
                    .lock()
                    .await
                    .try_reserve(&msg.user, Instant::now())
                    .map_err(|left| {
                        let secs = remaining_secs(left);
                        BridgeError::cooldown(
                            format!("Avatar switch on cooldown, try again in {}s", secs),
                            secs,
                        )
                    })?;

                let switched = self
                    .switch_avatar_inner(&h, &entry.id, Some(entry.name.clone()), Some(&msg.user))
                    .await;
                if switched.is_err() {
                    self.inner.switch_cooldown.lock().await.rollback(reservation);
                }
                switched
            }
            ChatCommand::Action(action) => {
                self.run_action(action, &ActionParams::default(), Some(&msg.user))
                    .await?;
                Ok(format!("@{} triggered {}", msg.user, action))
            }
            ChatCommand::Emote(slot) => {
                let params = ActionParams {
                    slot: Some(slot),
                    ..Default::default()
                };
                self.run_action(GiftAction::Emote, &params, Some(&msg.user))
                    .await?;
                Ok(format!("@{} used emote {}", msg.user, slot))
            }
        }
    }

    // ---- expressions ----

    pub async fn trigger_expression(
        &self,
        class: ExpressionClass,
        slot: i32,
        hold: bool,
    ) -> ActionResult {
        let result = async {
            let h = self.handles().await?;
            if !h.expressions.trigger_expression(class, slot, hold).await {
                return Err(BridgeError::policy(format!(
                    "{} {} rejected (range, cooldown or spam)",
                    class.as_str(),
                    slot
                )));
            }
            Ok::<_, BridgeError>(format!(
                "{} {} {}",
                class.as_str(),
                slot,
                if hold { "held" } else { "released" }
            ))
        };
        result.await.into()
    }

    /// Play now, or enqueue behind the current combo when `queue` is set.
    pub async fn play_combo(&self, steps: Vec<ComboStep>, queue: bool) -> ActionResult {
        let result = async {
            let h = self.handles().await?;
            let count = steps.len();
            let accepted = if queue {
                h.expressions.queue_combo(steps).await
            } else {
                h.expressions.play_combo(steps).await
            };
            if !accepted {
                return Err(BridgeError::policy(
                    "combo rejected (invalid steps or another combo is playing)",
                ));
            }
            Ok::<_, BridgeError>(format!("Combo of {} steps started", count))
        };
        result.await.into()
    }

    pub async fn stop_combo(&self) -> ActionResult {
        let result = async {
            let h = self.handles().await?;
            if h.expressions.stop_combo().await {
                Ok::<_, BridgeError>("Combo stopped".to_string())
            } else {
                Err(BridgeError::Validation("no combo is playing".into()))
            }
        };
        result.await.into()
    }

    // ---- physics bones ----

    pub async fn trigger_physbone(
        &self,
        bone: &str,
        kind: AnimationKind,
        params: AnimationParams,
    ) -> Result<Uuid> {
        let h = self.handles().await?;
        h.physbones.trigger_animation(bone, kind, params).await
    }

    /// Stop animations on `bone`, or every bone when `None`.
    pub async fn stop_physbone(&self, bone: Option<&str>) -> ActionResult {
        let result = async {
            let h = self.handles().await?;
            let stopped = match bone {
                Some(bone) => h.physbones.stop_animation(bone).await,
                None => h.physbones.stop_all_animations().await,
            };
            Ok::<_, BridgeError>(format!("Stopped {} animations", stopped))
        };
        result.await.into()
    }

    // ---- presets ----

    /// Send every value in the preset, bypassing the cache.
    pub async fn apply_preset(&self, name: &str) -> ActionResult {
        let result = async {
            let preset = self
                .inner
                .presets
                .lock()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| BridgeError::Validation(format!("no preset named {}", name)))?;
            let h = self.handles().await?;

            let mut failed = 0;
            for v in &preset.values {
                if !h
                    .outbound
                    .send_forced(Message::single(v.address.as_str(), v.value.clone()))
                    .await
                {
                    failed += 1;
                }
            }
            if failed > 0 {
                return Err(BridgeError::Transport(format!(
                    "{} of {} preset values failed to send",
                    failed,
                    preset.values.len()
                )));
            }
            Ok::<_, BridgeError>(format!("Applied preset {} ({} values)", name, preset.values.len()))
        };
        result.await.into()
    }

    pub async fn save_preset(&self, name: &str, values: Vec<PresetValue>) -> ActionResult {
        let result = async {
            let mut presets = self.inner.presets.lock().await;
            let preset = presets.upsert(name, values)?;
            Ok::<_, BridgeError>(format!("Saved preset {} ({} values)", preset.name, preset.values.len()))
        };
        result.await.into()
    }

    pub async fn delete_preset(&self, name: &str) -> ActionResult {
        match self.inner.presets.lock().await.remove(name) {
            Ok(true) => ActionResult::ok(format!("Deleted preset {}", name)),
            Ok(false) => ActionResult::fail(format!("No preset named {}", name)),
            Err(e) => e.into(),
        }
    }

    pub async fn list_presets(&self) -> Vec<Preset> {
        self.inner.presets.lock().await.list()
    }

    // ---- queries ----

    pub async fn get_state(&self) -> StateSnapshot {
        self.inner.state.get_state().await
    }

    pub async fn get_history(&self, address: &str) -> Vec<HistoryEntry> {
        self.inner.state.get_history(address).await
    }

    /// Discovered parameters, optionally filtered by a regular expression.
    pub async fn discovered_parameters(&self, pattern: Option<&str>) -> Result<Vec<Parameter>> {
        let h = self.handles().await?;
        let client = h
            .discovery
            .ok_or_else(|| BridgeError::Lifecycle("discovery is disabled".into()))?;
        match pattern {
            Some(pattern) => client.get_parameters_by_pattern(pattern).await,
            None => Ok(client.get_all_parameters().await),
        }
    }

    pub async fn parameter_tree(&self) -> Result<Value> {
        let h = self.handles().await?;
        let client = h
            .discovery
            .ok_or_else(|| BridgeError::Lifecycle("discovery is disabled".into()))?;
        Ok(client.get_parameter_tree().await)
    }

    pub async fn stats(&self) -> BridgeStats {
        let status = self.status().await;
        let presets = self.inner.presets.lock().await.len();
        let known_parameters = self.inner.state.parameter_count().await;
        let event_subscribers = self.inner.events.subscriber_count();

        let mut stats = BridgeStats {
            status,
            local_port: None,
            transport: None,
            cache_size: 0,
            pending_messages: 0,
            active_animations: 0,
            held_slots: 0,
            combo_playing: false,
            known_parameters,
            presets,
            event_subscribers,
        };
        if let Ok(h) = self.handles().await {
            stats.local_port = Some(h.transport.local_port());
            stats.transport = Some(h.transport.stats());
            stats.cache_size = h.outbound.cache_len().await;
            stats.pending_messages = h.outbound.pending().await;
            stats.active_animations = h.physbones.active_count().await;
            stats.held_slots = h.expressions.held_slots().await;
            stats.combo_playing = h.expressions.combo_playing().await;
        }
        stats
    }
}

/// Inbound router: announce every message and fold avatar traffic into state.
async fn route_inbound(
    mut rx: mpsc::Receiver<InboundPacket>,
    state: Arc<StateStore>,
    events: EventBus,
    config: Arc<BridgeConfig>,
    rediscover: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        let origin = packet.origin.to_string();
        for message in packet.messages {
            match (message.address.as_str(), message.args.as_slice()) {
                (AVATAR_CHANGE, [OscValue::Str(id)]) => {
                    let name = config.avatars.iter().find(|a| a.id == *id).map(|a| a.name.clone());
                    if state.set_current_avatar(id, name).await {
                        rediscover.notify_one();
                    }
                }
                (address, [value])
                    if address.starts_with(PARAMETER_PREFIX) || address.starts_with(PHYSBONE_PREFIX) =>
                {
                    state.update_parameter(address, value.clone()).await;
                }
                _ => {}
            }

            events.emit(BridgeEvent::MessageReceived {
                address: message.address,
                args: message.args,
                origin: origin.clone(),
            });
        }
    }
    debug!("inbound router stopped");
}

/// Initial discovery, live subscription and avatar watcher; afterwards keeps
/// the state store in step with every completed discovery and re-discovers
/// when inbound traffic reports a new avatar.
fn spawn_discovery(
    client: Arc<DiscoveryClient>,
    state: Arc<StateStore>,
    physbones: PhysBoneController,
    config: Arc<BridgeConfig>,
    events: EventBus,
    rediscover: Arc<Notify>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    // Subscribe before the first discover() so its completion is seen.
    let mut rx = events.subscribe();

    tokio::spawn(async move {
        let setup = async {
            if let Err(e) = client.discover().await {
                info!("initial discovery failed, will retry on avatar change: {}", e);
            }

            if config.discovery.auto_subscribe {
                let live_state = Arc::clone(&state);
                let on_update: LiveUpdateCallback = Arc::new(move |update: LiveUpdate| {
                    let state = Arc::clone(&live_state);
                    async move {
                        state.update_parameter(&update.address, update.value).await;
                    }
                    .boxed()
                });
                client.subscribe(on_update).await;
            }

            let watch_state = Arc::clone(&state);
            let avatars = config.avatars.clone();
            let on_avatar: AvatarChangeCallback = Arc::new(move |id: String| {
                let state = Arc::clone(&watch_state);
                let name = avatars.iter().find(|a| a.id == id).map(|a| a.name.clone());
                async move {
                    state.set_current_avatar(&id, name).await;
                }
                .boxed()
            });
            client
                .start_avatar_watcher(config.discovery.avatar_poll_duration(), on_avatar)
                .await;
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = client.closed() => return,
            _ = setup => {}
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = rediscover.notified() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = client.discover() => {
                            if let Err(e) = result {
                                debug!("re-discovery after avatar change failed: {}", e);
                            }
                        }
                    }
                    continue;
                }
                event = rx.recv() => event,
            };
            match event {
                Ok(BridgeEvent::DiscoveryCompleted { .. }) => {
                    let params = client.get_all_parameters().await;
                    let bones = state.merge_discovered(&params).await;
                    physbones.auto_discover(&client).await;
                    debug!(parameters = params.len(), bones, "discovered parameters merged");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "discovery sync lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn config_value(value: &ConfigValue) -> OscValue {
    match value {
        ConfigValue::Bool(b) => OscValue::Bool(*b),
        ConfigValue::Int(i) => match i32::try_from(*i) {
            Ok(i) => OscValue::Int(i),
            Err(_) => OscValue::Float(*i as f32),
        },
        ConfigValue::Float(f) => OscValue::Float(*f as f32),
        ConfigValue::Text(s) => OscValue::Str(s.clone()),
    }
}

fn zero_like(value: &OscValue) -> OscValue {
    match value {
        OscValue::Bool(_) => OscValue::Bool(false),
        OscValue::Int(_) => OscValue::Int(0),
        OscValue::Float(_) => OscValue::Float(0.0),
        OscValue::Str(_) => OscValue::Str(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avaconf::{AvatarEntry, GiftMapping};

    fn config(dir: &tempfile::TempDir) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.send_host = "127.0.0.1".into();
        config.send_port = 9;
        config.receive_port = 0;
        config.auto_retry_on_error = false;
        config.discovery.enabled = false;
        config.message_batching.enabled = false;
        config.paths.state_dir = dir.path().to_path_buf();
        config
    }

    #[test]
    fn config_values_convert() {
        assert_eq!(config_value(&ConfigValue::Int(3)), OscValue::Int(3));
        assert_eq!(config_value(&ConfigValue::Float(0.5)), OscValue::Float(0.5));
        assert_eq!(config_value(&ConfigValue::Bool(true)), OscValue::Bool(true));
        assert_eq!(zero_like(&OscValue::Float(0.7)), OscValue::Float(0.0));
    }

    #[tokio::test]
    async fn lifecycle_misuse_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(config(&dir)).unwrap();

        let stopped = bridge.stop().await;
        assert!(!stopped.success);
        assert_eq!(bridge.status().await, BridgeStatus::Stopped);

        assert!(bridge.start().await.success);
        assert_eq!(bridge.status().await, BridgeStatus::Running);
        assert!(!bridge.start().await.success);

        assert!(bridge.stop().await.success);
        assert_eq!(bridge.status().await, BridgeStatus::Stopped);
        assert!(bridge.local_port().await.is_none());
    }

    #[tokio::test]
    async fn operations_need_a_running_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(config(&dir)).unwrap();
        let result = bridge.send_parameter("Wave", OscValue::Int(1)).await;
        assert!(!result.success);
        assert!(result.message.contains("not running"));
    }

    #[tokio::test]
    async fn unmapped_gift_fails_softly() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(config(&dir)).unwrap();
        bridge.start().await;
        let result = bridge.dispatch_gift_event(GiftEvent::new(1, "Pebble")).await;
        assert!(!result.success);
        assert!(result.message.contains("Pebble"));
        bridge.stop().await;
    }

    #[tokio::test]
    async fn chat_permission_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.chat_commands.avatar_switch.permission = avaconf::Permission::Subscriber;
        config.avatars = vec![AvatarEntry {
            id: "avtr_fox".into(),
            name: "Fox".into(),
            aliases: vec![],
        }];
        let bridge = Bridge::new(config).unwrap();
        bridge.start().await;

        let denied = bridge
            .handle_chat_message(ChatMessage::new("viewer", "!avatar fox"))
            .await;
        assert!(!denied.success);
        assert_eq!(denied.retry_after_secs, None);

        let mut sub = ChatMessage::new("fan", "!avatar fox");
        sub.is_subscriber = true;
        let allowed = bridge.handle_chat_message(sub).await;
        assert!(allowed.success, "{}", allowed.message);
        assert_eq!(allowed.message, "Switched to Fox");

        bridge.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_chat_switches_share_one_cooldown_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.avatars = vec![
            AvatarEntry {
                id: "avtr_fox".into(),
                name: "Fox".into(),
                aliases: vec![],
            },
            AvatarEntry {
                id: "avtr_cat".into(),
                name: "Cat".into(),
                aliases: vec![],
            },
        ];
        let bridge = Bridge::new(config).unwrap();
        let mut rx = bridge.subscribe();
        bridge.start().await;

        let requests = [("alice", "!avatar fox"), ("bob", "!avatar cat"), ("carol", "!avatar fox")];
        let tasks: Vec<_> = requests
            .into_iter()
            .map(|(user, text)| {
                let bridge = bridge.clone();
                tokio::spawn(async move { bridge.handle_chat_message(ChatMessage::new(user, text)).await })
            })
            .collect();
        let mut succeeded = 0;
        for task in tasks {
            let result = task.await.unwrap();
            if result.success {
                succeeded += 1;
            } else {
                assert!(result.retry_after_secs.is_some(), "{}", result.message);
            }
        }
        assert_eq!(succeeded, 1);

        let mut switches = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BridgeEvent::AvatarSwitched { .. }) {
                switches += 1;
            }
        }
        assert_eq!(switches, 1);
        assert!(bridge.check_avatar_switch_cooldown("dave").await.is_some());
        bridge.stop().await;
    }

    #[tokio::test]
    async fn presets_are_crud_and_apply() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(config(&dir)).unwrap();
        let values = vec![PresetValue {
            address: "/avatar/parameters/Hat".into(),
            value: OscValue::Bool(true),
        }];
        assert!(bridge.save_preset("hat", values).await.success);
        assert_eq!(bridge.list_presets().await.len(), 1);

        assert!(!bridge.apply_preset("hat").await.success, "not running yet");
        bridge.start().await;
        assert!(bridge.apply_preset("hat").await.success);
        assert!(!bridge.apply_preset("nope").await.success);
        bridge.stop().await;

        assert!(bridge.delete_preset("hat").await.success);
        assert!(!bridge.delete_preset("hat").await.success);
    }

    #[tokio::test]
    async fn gift_mapping_reports_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.gift_mappings = vec![GiftMapping {
            gift_id: Some(7),
            gift_name: None,
            action: GiftAction::Wave,
            params: ActionParams::default(),
        }];
        let bridge = Bridge::new(config).unwrap();
        let mut rx = bridge.subscribe();
        bridge.start().await;

        assert!(bridge.dispatch_gift_event(GiftEvent::new(7, "Wave")).await.success);
        let mut saw = false;
        while let Ok(event) = rx.try_recv() {
            if let BridgeEvent::GiftAction { success, action, .. } = event {
                assert!(success);
                assert_eq!(action, GiftAction::Wave);
                saw = true;
            }
        }
        assert!(saw);
        bridge.stop().await;
    }

    #[tokio::test]
    async fn update_config_restarts_a_running_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(config(&dir)).unwrap();
        bridge.start().await;

        let mut next = config(&dir);
        next.verbose_mode = true;
        assert!(bridge.update_config(next).await.success);
        assert_eq!(bridge.status().await, BridgeStatus::Running);
        assert!(bridge.config().await.verbose_mode);

        let mut bad = config(&dir);
        bad.send_host = String::new();
        assert!(!bridge.update_config(bad).await.success);
        bridge.stop().await;
    }
}
