//! avalink - live-stream events to OSC avatar control
//!
//! This library provides:
//! - `transport`, `batcher`, `cache`, `outbound`: the UDP send/receive path
//! - `discovery`, `state`: remote parameter tree, live values and history
//! - `expressions`, `physbones`: emote/action slots, combos and bone animation
//! - `gifts`, `chat`, `cooldown`, `presets`: stream-facing policy and storage
//! - `bridge`: lifecycle and the host-facing operations
//! - `api`: the admin HTTP API and event stream
//!
//! The `avalink` binary wraps all of this in a CLI.

pub mod api;
pub mod batcher;
pub mod bridge;
pub mod cache;
pub mod chat;
pub mod commands;
pub mod cooldown;
pub mod discovery;
pub mod error;
pub mod events;
pub mod expressions;
pub mod gifts;
pub mod model;
pub mod outbound;
pub mod physbones;
pub mod presets;
pub mod serve;
pub mod state;
pub mod telemetry;
pub mod transport;

pub use bridge::{Bridge, BridgeStats};
pub use chat::ChatMessage;
pub use error::{ActionResult, BridgeError, Result};
pub use events::{BridgeEvent, BridgeStatus, EventBus};
pub use gifts::GiftEvent;
