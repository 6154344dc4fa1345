//! Procedural physics-bone animation.
//!
//! Each animation is its own task ticking at `physicsBones.tickRate` and
//! writing waveform samples through the outbound path. Every task owns a
//! cancellation token checked in `select!`, so stopping takes effect within
//! one tick. A finished or stopped animation writes the rest value back;
//! animations stopped by an avatar change do not, since the addresses belong
//! to the old avatar.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use avaconf::PhysBonesConfig;
use avaproto::{parse_physbone_address, physbone_address, OscValue, PhysBoneSub};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::DiscoveryClient;
use crate::error::{BridgeError, Result};
use crate::events::{BridgeEvent, EventBus};
use crate::outbound::ParameterSink;
use crate::state::{AvatarListener, StateStore};

pub const MAX_DURATION_MS: u64 = 30_000;
pub const MAX_FREQUENCY_HZ: f32 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimationKind {
    Wiggle,
    Sine,
    Wave,
    Stretch,
    Grab,
    Twitch,
}

impl AnimationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnimationKind::Wiggle => "wiggle",
            AnimationKind::Sine => "sine",
            AnimationKind::Wave => "wave",
            AnimationKind::Stretch => "stretch",
            AnimationKind::Grab => "grab",
            AnimationKind::Twitch => "twitch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wiggle" => Some(AnimationKind::Wiggle),
            "sine" => Some(AnimationKind::Sine),
            "wave" => Some(AnimationKind::Wave),
            "stretch" => Some(AnimationKind::Stretch),
            "grab" => Some(AnimationKind::Grab),
            "twitch" => Some(AnimationKind::Twitch),
            _ => None,
        }
    }

    /// The sub-parameter this kind drives.
    pub fn target(&self) -> PhysBoneSub {
        match self {
            AnimationKind::Stretch => PhysBoneSub::Stretch,
            AnimationKind::Grab => PhysBoneSub::IsGrabbed,
            _ => PhysBoneSub::Angle,
        }
    }

    /// (duration ms, amplitude, frequency Hz)
    fn defaults(&self) -> (u64, f32, f32) {
        match self {
            AnimationKind::Wiggle => (1_500, 0.6, 6.0),
            AnimationKind::Sine => (3_000, 0.5, 1.0),
            AnimationKind::Wave => (2_000, 0.8, 2.0),
            AnimationKind::Stretch => (1_000, 1.0, 1.0),
            AnimationKind::Grab => (1_000, 1.0, 1.0),
            AnimationKind::Twitch => (150, 0.4, 1.0),
        }
    }
}

impl std::fmt::Display for AnimationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied overrides; unset fields take the kind's defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnimationParams {
    pub duration_ms: Option<u64>,
    pub amplitude: Option<f32>,
    pub frequency: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waveform {
    pub kind: AnimationKind,
    pub duration: Duration,
    pub amplitude: f32,
    pub frequency: f32,
}

impl Waveform {
    pub fn resolve(kind: AnimationKind, params: AnimationParams) -> Result<Self> {
        let (duration_ms, amplitude, frequency) = kind.defaults();
        let duration_ms = params.duration_ms.unwrap_or(duration_ms);
        let amplitude = params.amplitude.unwrap_or(amplitude);
        let frequency = params.frequency.unwrap_or(frequency);

        if !(1..=MAX_DURATION_MS).contains(&duration_ms) {
            return Err(BridgeError::Validation(format!(
                "duration must be 1..={} ms, got {}",
                MAX_DURATION_MS, duration_ms
            )));
        }
        if !(0.0..=1.0).contains(&amplitude) {
            return Err(BridgeError::Validation(format!(
                "amplitude must be within 0..=1, got {}",
                amplitude
            )));
        }
        if !(frequency > 0.0 && frequency <= MAX_FREQUENCY_HZ) {
            return Err(BridgeError::Validation(format!(
                "frequency must be within (0, {}] Hz, got {}",
                MAX_FREQUENCY_HZ, frequency
            )));
        }

        Ok(Self {
            kind,
            duration: Duration::from_millis(duration_ms),
            amplitude,
            frequency,
        })
    }

    /// Value at `t` seconds into the animation.
    pub fn sample(&self, t: f32) -> OscValue {
        let d = self.duration.as_secs_f32();
        let progress = (t / d).clamp(0.0, 1.0);
        let phase = std::f32::consts::TAU * self.frequency * t;
        let a = self.amplitude;

        let v = match self.kind {
            AnimationKind::Wiggle => a * (-3.0 * progress).exp() * phase.sin(),
            AnimationKind::Sine => a * phase.sin(),
            AnimationKind::Wave => a * (1.0 - progress) * phase.sin(),
            AnimationKind::Stretch => {
                // Ramp up over the first quarter, hold, ramp down over the last.
                let envelope = if progress < 0.25 {
                    progress / 0.25
                } else if progress > 0.75 {
                    (1.0 - progress) / 0.25
                } else {
                    1.0
                };
                a * envelope
            }
            AnimationKind::Twitch => a * (std::f32::consts::PI * progress).sin(),
            AnimationKind::Grab => return OscValue::Bool(progress < 1.0),
        };
        OscValue::Float(v.clamp(-1.0, 1.0))
    }

    pub fn rest(&self) -> OscValue {
        match self.kind {
            AnimationKind::Grab => OscValue::Bool(false),
            _ => OscValue::Float(0.0),
        }
    }
}

/// An animation currently running.
#[derive(Debug, Clone, Serialize)]
pub struct AnimationInfo {
    pub id: Uuid,
    pub bone: String,
    pub kind: AnimationKind,
}

struct Running {
    bone: String,
    kind: AnimationKind,
    cancel: CancellationToken,
    reset: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct Inner {
    sink: Arc<dyn ParameterSink>,
    state: Arc<StateStore>,
    events: EventBus,
    enabled: bool,
    tick: Duration,
    running: Mutex<HashMap<Uuid, Running>>,
}

#[derive(Clone)]
pub struct PhysBoneController {
    inner: Arc<Inner>,
}

impl PhysBoneController {
    pub fn new(
        config: &PhysBonesConfig,
        sink: Arc<dyn ParameterSink>,
        state: Arc<StateStore>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                state,
                events,
                enabled: config.enabled,
                tick: config.tick_interval(),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start an animation on `bone`; returns its id.
    pub async fn trigger_animation(
        &self,
        bone: &str,
        kind: AnimationKind,
        params: AnimationParams,
    ) -> Result<Uuid> {
        if !self.inner.enabled {
            return Err(BridgeError::policy("physics bone animation is disabled"));
        }
        if bone.is_empty() || bone.contains('/') {
            return Err(BridgeError::Validation(format!("bad bone name {:?}", bone)));
        }
        let waveform = Waveform::resolve(kind, params)?;

        // Prefer the address the avatar actually exposes for this sub-parameter.
        let sub = kind.target();
        let address = self
            .inner
            .state
            .physbone(bone)
            .await
            .and_then(|b| b.parameters.get(sub.as_str()).cloned())
            .unwrap_or_else(|| physbone_address(bone, sub));

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let reset = Arc::new(AtomicBool::new(true));

        // Hold the map lock across spawn so the task cannot finish and
        // deregister before it is registered.
        let mut running = self.inner.running.lock().await;
        let handle = tokio::spawn(Arc::clone(&self.inner).animate(
            id,
            bone.to_string(),
            address,
            waveform,
            cancel.clone(),
            Arc::clone(&reset),
        ));
        running.insert(
            id,
            Running {
                bone: bone.to_string(),
                kind,
                cancel,
                reset,
                handle,
            },
        );
        drop(running);

        info!(%id, bone, kind = kind.as_str(), "animation started");
        self.inner.events.emit(BridgeEvent::AnimationStarted {
            id,
            bone: bone.to_string(),
            kind: kind.as_str().to_string(),
        });
        Ok(id)
    }

    /// Stop every animation on `bone`; returns how many were stopped.
    pub async fn stop_animation(&self, bone: &str) -> usize {
        self.inner.stop_where(|r| r.bone == bone, true).await
    }

    pub async fn stop_all_animations(&self) -> usize {
        self.inner.stop_where(|_| true, true).await
    }

    pub async fn active_count(&self) -> usize {
        self.inner.running.lock().await.len()
    }

    pub async fn active_animations(&self) -> Vec<AnimationInfo> {
        self.inner
            .running
            .lock()
            .await
            .iter()
            .map(|(id, r)| AnimationInfo {
                id: *id,
                bone: r.bone.clone(),
                kind: r.kind,
            })
            .collect()
    }

    /// Register every bone the discovery client knows about; returns their
    /// names.
    pub async fn auto_discover(&self, discovery: &DiscoveryClient) -> Vec<String> {
        let mut bones = BTreeSet::new();
        for param in discovery.get_all_parameters().await {
            if let Some((bone, sub)) = parse_physbone_address(&param.address) {
                self.inner
                    .state
                    .register_physbone(bone, sub, &param.address)
                    .await;
                bones.insert(bone.to_string());
            }
        }
        debug!(bones = bones.len(), "physics bones discovered");
        bones.into_iter().collect()
    }
}

#[async_trait]
impl AvatarListener for PhysBoneController {
    async fn avatar_changed(&self, avatar_id: &str) {
        let stopped = self.inner.stop_where(|_| true, false).await;
        if stopped > 0 {
            info!(avatar_id, stopped, "avatar changed, animations stopped");
        }
    }
}

impl Inner {
    async fn stop_where(&self, matches: impl Fn(&Running) -> bool, reset: bool) -> usize {
        let stopped: Vec<Running> = {
            let mut running = self.running.lock().await;
            let ids: Vec<Uuid> = running
                .iter()
                .filter(|(_, r)| matches(r))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| running.remove(id)).collect()
        };

        for r in &stopped {
            r.reset.store(reset, Ordering::SeqCst);
            r.cancel.cancel();
        }
        let count = stopped.len();
        for r in stopped {
            if let Err(e) = r.handle.await {
                warn!(bone = %r.bone, "animation task ended abnormally: {}", e);
            }
        }
        count
    }

    async fn animate(
        self: Arc<Self>,
        id: Uuid,
        bone: String,
        address: String,
        waveform: Waveform,
        cancel: CancellationToken,
        reset: Arc<AtomicBool>,
    ) {
        let cancelled = if waveform.kind == AnimationKind::Grab {
            self.sink.send_parameter(&address, OscValue::Bool(true)).await;
            tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(waveform.duration) => false,
            }
        } else {
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let start = Instant::now();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break true,
                    _ = ticker.tick() => {}
                }
                let t = start.elapsed();
                if t >= waveform.duration {
                    break false;
                }
                self.sink
                    .send_parameter(&address, waveform.sample(t.as_secs_f32()))
                    .await;
            }
        };

        if !cancelled || reset.load(Ordering::SeqCst) {
            self.sink.send_parameter(&address, waveform.rest()).await;
        }

        self.running.lock().await.remove(&id);
        debug!(%id, bone, cancelled, "animation finished");
        self.events.emit(BridgeEvent::AnimationFinished {
            id,
            bone,
            kind: waveform.kind.as_str().to_string(),
            cancelled,
        });
    }
}
