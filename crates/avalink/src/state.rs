//! Live avatar state.
//!
//! The store is the canonical snapshot of every known parameter for the
//! current avatar, a bounded per-address history, and the physics bones seen
//! in discovery or traffic. Writes are last-writer-wins per address. Changes
//! are collected and published as one `StateChanged` event per notifier tick.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use avaconf::MonitoringConfig;
use avaproto::{parse_physbone_address, OscValue, PhysBoneSub};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::{BridgeEvent, EventBus};
use crate::model::{AvatarContext, HistoryEntry, Parameter, PhysBone};

/// Notified, in registration order, when the avatar is replaced. Listeners
/// run before the old avatar's state is cleared, so anything they stop has
/// finished writing by then.
#[async_trait]
pub trait AvatarListener: Send + Sync {
    async fn avatar_changed(&self, avatar_id: &str);
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub parameters: Vec<Parameter>,
    pub physbones: Vec<PhysBone>,
    pub current_avatar: AvatarContext,
}

#[derive(Default)]
struct Inner {
    parameters: BTreeMap<String, Parameter>,
    history: HashMap<String, VecDeque<HistoryEntry>>,
    physbones: BTreeMap<String, PhysBone>,
    avatar: AvatarContext,
    changed: BTreeSet<String>,
}

impl Inner {
    fn register_bone(&mut self, bone: &str, sub: PhysBoneSub, address: &str) -> bool {
        let entry = self.physbones.entry(bone.to_string()).or_insert_with(|| {
            debug!(bone, "physics bone registered");
            PhysBone::new(bone)
        });
        entry
            .parameters
            .insert(sub.as_str().to_string(), address.to_string())
            .is_none()
    }
}

pub struct StateStore {
    inner: RwLock<Inner>,
    /// Bumped under the `inner` write lock on every avatar swap.
    epoch: AtomicU64,
    swap: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn AvatarListener>>>,
    events: EventBus,
    record_history: bool,
    history_limit: usize,
}

impl StateStore {
    pub fn new(config: &MonitoringConfig, events: EventBus) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            epoch: AtomicU64::new(0),
            swap: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
            events,
            record_history: config.enabled,
            history_limit: config.history_limit.max(1),
        }
    }

    /// Upsert a parameter value from inbound or outbound traffic.
    pub async fn update_parameter(&self, address: &str, value: OscValue) {
        let mut inner = self.inner.write().await;
        self.upsert(&mut inner, address, value);
    }

    /// Generation of the current avatar; changes on every swap.
    pub fn avatar_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Record a value sent while `epoch` was current. Dropped when the avatar
    /// has been swapped since. Returns whether it was recorded.
    pub async fn record_sent(&self, epoch: u64, address: &str, value: OscValue) -> bool {
        let mut inner = self.inner.write().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(address, "dropping write sent for the previous avatar");
            return false;
        }
        self.upsert(&mut inner, address, value);
        true
    }

    fn upsert(&self, inner: &mut Inner, address: &str, value: OscValue) {
        let stored = match inner.parameters.get_mut(address) {
            Some(param) => {
                let value = match param.value_type {
                    Some(declared) => value.coerce_to(declared).unwrap_or(value),
                    None => {
                        param.value_type = Some(value.value_type());
                        value
                    }
                };
                param.value = Some(value.clone());
                param.updated_at = Some(Utc::now());
                value
            }
            None => {
                inner
                    .parameters
                    .insert(address.to_string(), Parameter::observed(address, value.clone()));
                value
            }
        };

        if self.record_history {
            let limit = self.history_limit;
            let ring = inner.history.entry(address.to_string()).or_default();
            ring.push_back(HistoryEntry {
                value: stored,
                timestamp: Utc::now(),
            });
            while ring.len() > limit {
                ring.pop_front();
            }
        }

        inner.changed.insert(address.to_string());

        if let Some((bone, sub)) = parse_physbone_address(address) {
            inner.register_bone(bone, sub, address);
        }
    }

    /// Merge parameters from discovery. Metadata is replaced; a value already
    /// observed in traffic wins over the discovered one. Returns the number of
    /// physics bones known afterwards.
    pub async fn merge_discovered(&self, discovered: &[Parameter]) -> usize {
        let mut inner = self.inner.write().await;
        for param in discovered {
            match inner.parameters.get_mut(&param.address) {
                Some(existing) => {
                    existing.value_type = param.value_type.or(existing.value_type);
                    existing.access = param.access;
                    existing.range = param.range;
                    existing.description = param.description.clone();
                    if existing.value.is_none() {
                        existing.value = param.value.clone();
                    }
                }
                None => {
                    inner
                        .parameters
                        .insert(param.address.clone(), param.clone());
                }
            }
            if let Some((bone, sub)) = parse_physbone_address(&param.address) {
                inner.register_bone(bone, sub, &param.address);
            }
        }
        inner.physbones.len()
    }

    pub async fn register_physbone(&self, bone: &str, sub: PhysBoneSub, address: &str) -> bool {
        self.inner.write().await.register_bone(bone, sub, address)
    }

    pub async fn physbone(&self, name: &str) -> Option<PhysBone> {
        self.inner.read().await.physbones.get(name).cloned()
    }

    pub async fn get_parameter(&self, address: &str) -> Option<Parameter> {
        self.inner.read().await.parameters.get(address).cloned()
    }

    pub async fn parameter_count(&self) -> usize {
        self.inner.read().await.parameters.len()
    }

    pub async fn get_state(&self) -> StateSnapshot {
        let inner = self.inner.read().await;
        StateSnapshot {
            parameters: inner.parameters.values().cloned().collect(),
            physbones: inner.physbones.values().cloned().collect(),
            current_avatar: inner.avatar.clone(),
        }
    }

    /// Oldest first; empty for unknown addresses.
    pub async fn get_history(&self, address: &str) -> Vec<HistoryEntry> {
        self.inner
            .read()
            .await
            .history
            .get(address)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn current_avatar(&self) -> AvatarContext {
        self.inner.read().await.avatar.clone()
    }

    pub async fn add_listener(&self, listener: Arc<dyn AvatarListener>) {
        self.listeners.write().await.push(listener);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
    }

    /// Replace the avatar context. Returns false if `avatar_id` is already
    /// current. Every listener runs first; then parameters, physics bones and
    /// history are cleared in one write.
    pub async fn set_current_avatar(&self, avatar_id: &str, name: Option<String>) -> bool {
        let _swap = self.swap.lock().await;
        if self.inner.read().await.avatar.id.as_deref() == Some(avatar_id) {
            return false;
        }

        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            listener.avatar_changed(avatar_id).await;
        }

        let previous = {
            let mut inner = self.inner.write().await;
            self.epoch.fetch_add(1, Ordering::SeqCst);
            let previous = inner.avatar.id.take();
            inner.parameters.clear();
            inner.physbones.clear();
            inner.history.clear();
            inner.changed.clear();
            inner.avatar = AvatarContext {
                id: Some(avatar_id.to_string()),
                name,
                loaded_at: Some(Utc::now()),
            };
            previous
        };

        info!(avatar_id, previous = ?previous, "avatar changed");
        self.events.emit(BridgeEvent::AvatarChanged {
            avatar_id: avatar_id.to_string(),
            previous,
        });
        true
    }

    /// Addresses changed since the last call.
    pub async fn take_changed(&self) -> Vec<String> {
        let mut inner = self.inner.write().await;
        std::mem::take(&mut inner.changed).into_iter().collect()
    }

    /// Drop history entries older than `max_age`; returns how many went.
    pub async fn sweep_history(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut inner = self.inner.write().await;
        let mut removed = 0;
        inner.history.retain(|_, ring| {
            while ring.front().is_some_and(|e| e.timestamp < cutoff) {
                ring.pop_front();
                removed += 1;
            }
            !ring.is_empty()
        });
        removed
    }

    /// Publish collected changes at most once per `interval`.
    pub fn spawn_notifier(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let changed = store.take_changed().await;
                if !changed.is_empty() {
                    store.events.emit(BridgeEvent::StateChanged { changed });
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Access;
    use avaproto::ValueType;
    use std::sync::Mutex as StdMutex;

    fn store() -> StateStore {
        StateStore::new(&MonitoringConfig::default(), EventBus::new())
    }

    #[tokio::test]
    async fn update_creates_then_overwrites() {
        let state = store();
        state
            .update_parameter("/avatar/parameters/Wave", OscValue::Int(1))
            .await;
        state
            .update_parameter("/avatar/parameters/Wave", OscValue::Int(0))
            .await;

        let param = state.get_parameter("/avatar/parameters/Wave").await.unwrap();
        assert_eq!(param.value, Some(OscValue::Int(0)));
        assert_eq!(state.get_history("/avatar/parameters/Wave").await.len(), 2);
        assert!(state.get_history("/nope").await.is_empty());
    }

    #[tokio::test]
    async fn declared_type_wins_over_wire_type() {
        let state = store();
        state
            .merge_discovered(&[Parameter {
                address: "/avatar/parameters/Toggle".into(),
                value_type: Some(ValueType::Bool),
                access: Access::ReadWrite,
                value: None,
                range: None,
                description: None,
                updated_at: None,
            }])
            .await;
        state
            .update_parameter("/avatar/parameters/Toggle", OscValue::Int(1))
            .await;
        let param = state.get_parameter("/avatar/parameters/Toggle").await.unwrap();
        assert_eq!(param.value, Some(OscValue::Bool(true)));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let config = MonitoringConfig {
            history_limit: 3,
            ..MonitoringConfig::default()
        };
        let state = StateStore::new(&config, EventBus::new());
        for i in 0..10 {
            state.update_parameter("/a", OscValue::Int(i)).await;
        }
        let history = state.get_history("/a").await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value, OscValue::Int(7));
    }

    #[tokio::test]
    async fn physbones_register_from_traffic() {
        let state = store();
        state
            .update_parameter("/avatar/physbones/Tail/Angle", OscValue::Float(0.2))
            .await;
        state
            .update_parameter("/avatar/parameters/Tail_IsGrabbed", OscValue::Bool(false))
            .await;

        let tail = state.physbone("Tail").await.unwrap();
        assert_eq!(
            tail.parameters.get("Angle").map(String::as_str),
            Some("/avatar/physbones/Tail/Angle")
        );
        assert!(tail.parameters.contains_key("IsGrabbed"));
    }

    struct Recording(StdMutex<Vec<String>>);

    #[async_trait]
    impl AvatarListener for Recording {
        async fn avatar_changed(&self, avatar_id: &str) {
            self.0.lock().unwrap().push(avatar_id.to_string());
        }
    }

    #[tokio::test]
    async fn avatar_swap_clears_and_notifies_before_returning() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let state = StateStore::new(&MonitoringConfig::default(), events);
        let listener = Arc::new(Recording(StdMutex::new(vec![])));
        state.add_listener(listener.clone()).await;

        state
            .update_parameter("/avatar/physbones/Tail/Angle", OscValue::Float(0.5))
            .await;
        assert!(state.set_current_avatar("avtr_a", Some("Fox".into())).await);

        assert_eq!(*listener.0.lock().unwrap(), vec!["avtr_a".to_string()]);
        let snapshot = state.get_state().await;
        assert!(snapshot.parameters.is_empty());
        assert!(snapshot.physbones.is_empty());
        assert_eq!(snapshot.current_avatar.id.as_deref(), Some("avtr_a"));
        assert!(state.get_history("/avatar/physbones/Tail/Angle").await.is_empty());

        assert!(!state.set_current_avatar("avtr_a", None).await);
        assert_eq!(listener.0.lock().unwrap().len(), 1);

        match rx.recv().await.unwrap() {
            BridgeEvent::AvatarChanged { avatar_id, previous } => {
                assert_eq!(avatar_id, "avtr_a");
                assert_eq!(previous, None);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn notifier_coalesces_changes() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let state = Arc::new(StateStore::new(&MonitoringConfig::default(), events));
        let cancel = CancellationToken::new();

        for i in 0..5 {
            state.update_parameter("/a", OscValue::Int(i)).await;
        }
        state.update_parameter("/b", OscValue::Int(1)).await;

        let handle = state.spawn_notifier(Duration::from_millis(100), cancel.clone());
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            BridgeEvent::StateChanged {
                changed: vec!["/a".into(), "/b".into()]
            }
        );

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn sweep_history_by_age() {
        let state = store();
        state.update_parameter("/a", OscValue::Int(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(state.sweep_history(Duration::from_secs(60)).await, 0);
        assert_eq!(state.sweep_history(Duration::from_millis(5)).await, 1);
        assert!(state.get_history("/a").await.is_empty());
    }
}
