//! Outward notifications.
//!
//! Every component reports through one [`EventBus`] (a tokio broadcast
//! channel). Hosts, the admin SSE stream and tests subscribe to it; a lagging
//! subscriber loses old events rather than slowing the bridge down.

use avaconf::GiftAction;
use avaproto::OscValue;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Default channel capacity.
pub const EVENT_CAPACITY: usize = 1024;

/// Bridge lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl BridgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Stopped => "stopped",
            BridgeStatus::Starting => "starting",
            BridgeStatus::Running => "running",
            BridgeStatus::Stopping => "stopping",
            BridgeStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    StatusChanged {
        status: BridgeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    MessageSent {
        address: String,
        args: Vec<OscValue>,
    },
    MessageReceived {
        address: String,
        args: Vec<OscValue>,
        origin: String,
    },
    GiftAction {
        gift_id: Option<u64>,
        gift_name: Option<String>,
        action: GiftAction,
        user: Option<String>,
        success: bool,
    },
    AvatarSwitched {
        avatar_id: String,
        avatar_name: Option<String>,
        requested_by: Option<String>,
    },
    AvatarChanged {
        avatar_id: String,
        previous: Option<String>,
    },
    DiscoveryCompleted {
        parameters: usize,
        physbones: usize,
    },
    LiveUpdate {
        address: String,
        value: OscValue,
    },
    StateChanged {
        changed: Vec<String>,
    },
    ComboCompleted {
        steps: usize,
        interrupted: bool,
    },
    ExpressionTriggered {
        class: String,
        slot: i32,
        held: bool,
    },
    AnimationStarted {
        id: Uuid,
        bone: String,
        kind: String,
    },
    AnimationFinished {
        id: Uuid,
        bone: String,
        kind: String,
        cancelled: bool,
    },
    ReceivePortChanged {
        requested: u16,
        bound: u16,
    },
}

impl BridgeEvent {
    /// Event name used for the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeEvent::StatusChanged { .. } => "status_changed",
            BridgeEvent::MessageSent { .. } => "message_sent",
            BridgeEvent::MessageReceived { .. } => "message_received",
            BridgeEvent::GiftAction { .. } => "gift_action",
            BridgeEvent::AvatarSwitched { .. } => "avatar_switched",
            BridgeEvent::AvatarChanged { .. } => "avatar_changed",
            BridgeEvent::DiscoveryCompleted { .. } => "discovery_completed",
            BridgeEvent::LiveUpdate { .. } => "live_update",
            BridgeEvent::StateChanged { .. } => "state_changed",
            BridgeEvent::ComboCompleted { .. } => "combo_completed",
            BridgeEvent::ExpressionTriggered { .. } => "expression_triggered",
            BridgeEvent::AnimationStarted { .. } => "animation_started",
            BridgeEvent::AnimationFinished { .. } => "animation_finished",
            BridgeEvent::ReceivePortChanged { .. } => "receive_port_changed",
        }
    }
}

/// Cloneable handle to the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: BridgeEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!("no event subscribers: {}", e.0.kind());
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
