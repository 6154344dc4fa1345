//! Emote and action slots.
//!
//! A slot is held (1) and released (0). Holds are rate-limited per slot: a
//! cooldown between holds, and a rolling spam window over recent holds.
//! Releases always go through so a slot can never get stuck on. Combos play
//! a sequence of hold/wait/release/pause steps on a single player task;
//! extra combos can be queued behind it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use avaconf::ExpressionsConfig;
use avaproto::{parameter_address, OscValue};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{BridgeEvent, EventBus};
use crate::outbound::ParameterSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpressionClass {
    Emote,
    Action,
}

impl ExpressionClass {
    pub fn slot_count(&self) -> i32 {
        match self {
            ExpressionClass::Emote => 8,
            ExpressionClass::Action => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExpressionClass::Emote => "emote",
            ExpressionClass::Action => "action",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "emote" => Some(ExpressionClass::Emote),
            "action" => Some(ExpressionClass::Action),
            _ => None,
        }
    }

    pub fn contains(&self, slot: i32) -> bool {
        (0..self.slot_count()).contains(&slot)
    }

    /// Parameter address for a slot: `/avatar/parameters/Emote3`.
    pub fn address(&self, slot: i32) -> String {
        let prefix = match self {
            ExpressionClass::Emote => "Emote",
            ExpressionClass::Action => "Action",
        };
        parameter_address(&format!("{}{}", prefix, slot))
    }
}

type SlotKey = (ExpressionClass, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldRejection {
    Cooldown { remaining: Duration },
    Spam,
}

#[derive(Debug, Default)]
struct SlotHistory {
    last_hold: Option<Instant>,
    recent: VecDeque<Instant>,
}

/// Per-slot hold bookkeeping. Pure policy, no I/O.
#[derive(Debug)]
pub struct SlotBook {
    cooldown: Duration,
    spam_window: Duration,
    spam_threshold: usize,
    slots: HashMap<SlotKey, SlotHistory>,
}

impl SlotBook {
    pub fn new(config: &ExpressionsConfig) -> Self {
        Self {
            cooldown: config.cooldown_duration(),
            spam_window: config.spam_window_duration(),
            spam_threshold: config.spam_threshold,
            slots: HashMap::new(),
        }
    }

    pub fn check_hold(&self, class: ExpressionClass, slot: i32, now: Instant) -> Result<(), HoldRejection> {
        let Some(history) = self.slots.get(&(class, slot)) else {
            return Ok(());
        };
        if let Some(last) = history.last_hold {
            let since = now.saturating_duration_since(last);
            if since < self.cooldown {
                return Err(HoldRejection::Cooldown {
                    remaining: self.cooldown - since,
                });
            }
        }
        let in_window = history
            .recent
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.spam_window)
            .count();
        if in_window >= self.spam_threshold {
            return Err(HoldRejection::Spam);
        }
        Ok(())
    }

    pub fn record_hold(&mut self, class: ExpressionClass, slot: i32, now: Instant) {
        let window = self.spam_window;
        let history = self.slots.entry((class, slot)).or_default();
        history.last_hold = Some(now);
        history.recent.push_back(now);
        while history
            .recent
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            history.recent.pop_front();
        }
    }

    /// Forget holds that no longer affect any decision.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let (cooldown, window) = (self.cooldown, self.spam_window);
        let before = self.slots.len();
        self.slots.retain(|_, h| {
            h.recent
                .retain(|t| now.saturating_duration_since(*t) < window);
            let cooling = h
                .last_hold
                .is_some_and(|t| now.saturating_duration_since(t) < cooldown);
            cooling || !h.recent.is_empty()
        });
        before - self.slots.len()
    }
}

/// One combo step: hold the slot for `duration_ms`, release, wait `pause_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComboStep {
    pub class: ExpressionClass,
    pub slot: i32,
    #[serde(default = "ComboStep::default_duration")]
    pub duration_ms: u64,
    #[serde(default = "ComboStep::default_pause")]
    pub pause_ms: u64,
}

impl ComboStep {
    fn default_duration() -> u64 {
        500
    }

    fn default_pause() -> u64 {
        200
    }

    pub fn new(class: ExpressionClass, slot: i32, duration_ms: u64, pause_ms: u64) -> Self {
        Self {
            class,
            slot,
            duration_ms,
            pause_ms,
        }
    }
}

struct ComboRun {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ComboState {
    current: Option<ComboRun>,
    queue: VecDeque<Vec<ComboStep>>,
    next_id: u64,
}

struct Inner {
    sink: Arc<dyn ParameterSink>,
    events: EventBus,
    max_combo_steps: usize,
    book: Mutex<SlotBook>,
    active: Mutex<HashSet<SlotKey>>,
    combo: Mutex<ComboState>,
}

#[derive(Clone)]
pub struct ExpressionController {
    inner: Arc<Inner>,
}

impl ExpressionController {
    pub fn new(config: &ExpressionsConfig, sink: Arc<dyn ParameterSink>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                events,
                max_combo_steps: config.max_combo_steps,
                book: Mutex::new(SlotBook::new(config)),
                active: Mutex::new(HashSet::new()),
                combo: Mutex::new(ComboState::default()),
            }),
        }
    }

    /// Hold (`hold = true`) or release a slot. Out-of-range slots, holds on
    /// cooldown and spammed holds return false.
    pub async fn trigger_expression(&self, class: ExpressionClass, slot: i32, hold: bool) -> bool {
        self.inner.press(class, slot, hold, true).await
    }

    /// Play a combo now. False if it is empty, too long, names a bad slot, or
    /// another combo is playing.
    pub async fn play_combo(&self, steps: Vec<ComboStep>) -> bool {
        if !self.inner.valid_combo(&steps) {
            return false;
        }
        let mut combo = self.inner.combo.lock().await;
        if combo.current.is_some() {
            debug!("combo rejected, another is playing");
            return false;
        }
        self.start_locked(&mut combo, steps);
        true
    }

    /// Play a combo now, or after the ones already playing/queued.
    pub async fn queue_combo(&self, steps: Vec<ComboStep>) -> bool {
        if !self.inner.valid_combo(&steps) {
            return false;
        }
        let mut combo = self.inner.combo.lock().await;
        if combo.current.is_some() {
            combo.queue.push_back(steps);
            debug!(queued = combo.queue.len(), "combo queued");
        } else {
            self.start_locked(&mut combo, steps);
        }
        true
    }

    fn start_locked(&self, combo: &mut ComboState, steps: Vec<ComboStep>) {
        combo.next_id += 1;
        let id = combo.next_id;
        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { inner.run_combos(id, steps, token).await });
        combo.current = Some(ComboRun { id, cancel, handle });
    }

    /// Halt the playing combo (releasing its held slot) and drop the queue.
    pub async fn stop_combo(&self) -> bool {
        let current = {
            let mut combo = self.inner.combo.lock().await;
            combo.queue.clear();
            combo.current.take()
        };
        let Some(run) = current else {
            return false;
        };
        run.cancel.cancel();
        if let Err(e) = run.handle.await {
            warn!("combo player ended abnormally: {}", e);
        }
        true
    }

    pub async fn combo_playing(&self) -> bool {
        self.inner.combo.lock().await.current.is_some()
    }

    pub async fn queued_combos(&self) -> usize {
        self.inner.combo.lock().await.queue.len()
    }

    /// Release every held slot; returns how many were released.
    pub async fn release_all(&self) -> usize {
        let held: Vec<SlotKey> = self.inner.active.lock().await.drain().collect();
        for (class, slot) in &held {
            self.inner
                .sink
                .send_parameter(&class.address(*slot), OscValue::Int(0))
                .await;
        }
        if !held.is_empty() {
            info!(released = held.len(), "released held expression slots");
        }
        held.len()
    }

    pub async fn held_slots(&self) -> usize {
        self.inner.active.lock().await.len()
    }

    /// Forget stale cooldown and spam history.
    pub async fn cleanup(&self) -> usize {
        self.inner.book.lock().await.sweep(Instant::now())
    }
}

impl Inner {
    fn valid_combo(&self, steps: &[ComboStep]) -> bool {
        if steps.is_empty() || steps.len() > self.max_combo_steps {
            debug!(steps = steps.len(), "combo length out of range");
            return false;
        }
        steps.iter().all(|s| s.class.contains(s.slot))
    }

    async fn press(&self, class: ExpressionClass, slot: i32, hold: bool, enforce: bool) -> bool {
        if !class.contains(slot) {
            debug!(class = class.as_str(), slot, "slot out of range");
            return false;
        }

        if hold && enforce {
            let mut book = self.book.lock().await;
            let now = Instant::now();
            if let Err(rejection) = book.check_hold(class, slot, now) {
                debug!(class = class.as_str(), slot, ?rejection, "hold rejected");
                return false;
            }
            book.record_hold(class, slot, now);
        }

        let value = OscValue::Int(i32::from(hold));
        if !self.sink.send_parameter(&class.address(slot), value).await {
            return false;
        }

        {
            let mut active = self.active.lock().await;
            if hold {
                active.insert((class, slot));
            } else {
                active.remove(&(class, slot));
            }
        }

        self.events.emit(BridgeEvent::ExpressionTriggered {
            class: class.as_str().to_string(),
            slot,
            held: hold,
        });
        true
    }

    /// Returns true if every step ran to completion.
    async fn play_steps(&self, steps: &[ComboStep], cancel: &CancellationToken) -> bool {
        for step in steps {
            self.press(step.class, step.slot, true, false).await;
            let held = tokio::select! {
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(Duration::from_millis(step.duration_ms)) => true,
            };
            self.press(step.class, step.slot, false, false).await;
            if !held {
                return false;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(Duration::from_millis(step.pause_ms)) => {}
            }
        }
        true
    }

    async fn run_combos(self: Arc<Self>, id: u64, first: Vec<ComboStep>, cancel: CancellationToken) {
        let mut next = Some(first);
        while let Some(steps) = next {
            let completed = self.play_steps(&steps, &cancel).await;
            self.events.emit(BridgeEvent::ComboCompleted {
                steps: steps.len(),
                interrupted: !completed,
            });
            if !completed {
                // stop_combo already took `current`.
                return;
            }
            next = {
                let mut combo = self.combo.lock().await;
                if combo.current.as_ref().map(|run| run.id) != Some(id) {
                    // Stopped after the last step; `current` and the queue
                    // now belong to a newer run.
                    return;
                }
                let queued = combo.queue.pop_front();
                if queued.is_none() {
                    combo.current = None;
                }
                queued
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        sent: StdMutex<Vec<(String, OscValue)>>,
    }

    #[async_trait]
    impl ParameterSink for Recorder {
        async fn send_parameter(&self, address: &str, value: OscValue) -> bool {
            self.sent.lock().unwrap().push((address.to_string(), value));
            true
        }
    }

    impl Recorder {
        fn values(&self) -> Vec<(String, OscValue)> {
            self.sent.lock().unwrap().clone()
        }
    }

    fn controller() -> (Arc<Recorder>, ExpressionController, EventBus) {
        let rec = Arc::new(Recorder::default());
        let events = EventBus::new();
        let ctl = ExpressionController::new(&ExpressionsConfig::default(), rec.clone(), events.clone());
        (rec, ctl, events)
    }

    #[tokio::test]
    async fn slot_range_is_enforced() {
        let (rec, ctl, _) = controller();
        assert!(!ctl.trigger_expression(ExpressionClass::Emote, 8, true).await);
        assert!(!ctl.trigger_expression(ExpressionClass::Emote, -1, true).await);
        assert!(!ctl.trigger_expression(ExpressionClass::Action, 4, true).await);
        assert!(ctl.trigger_expression(ExpressionClass::Action, 3, true).await);
        assert_eq!(rec.values(), vec![("/avatar/parameters/Action3".into(), OscValue::Int(1))]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_hold_within_cooldown_is_rejected() {
        let (_rec, ctl, _) = controller();
        assert!(ctl.trigger_expression(ExpressionClass::Emote, 2, true).await);
        assert!(ctl.trigger_expression(ExpressionClass::Emote, 2, false).await);
        assert!(!ctl.trigger_expression(ExpressionClass::Emote, 2, true).await);
        // Other slots have their own cooldown.
        assert!(ctl.trigger_expression(ExpressionClass::Emote, 3, true).await);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(ctl.trigger_expression(ExpressionClass::Emote, 2, true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn spam_threshold_within_window() {
        let (_rec, ctl, _) = controller();
        for _ in 0..5 {
            assert!(ctl.trigger_expression(ExpressionClass::Emote, 0, true).await);
            tokio::time::advance(Duration::from_millis(1_100)).await;
        }
        // Sixth hold inside 10 s is spam even though the cooldown passed.
        assert!(!ctl.trigger_expression(ExpressionClass::Emote, 0, true).await);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(ctl.trigger_expression(ExpressionClass::Emote, 0, true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn releases_are_never_rate_limited() {
        let (rec, ctl, _) = controller();
        assert!(ctl.trigger_expression(ExpressionClass::Emote, 1, true).await);
        assert!(ctl.trigger_expression(ExpressionClass::Emote, 1, false).await);
        assert!(ctl.trigger_expression(ExpressionClass::Emote, 1, false).await);
        assert_eq!(rec.values().len(), 3);
        assert_eq!(ctl.held_slots().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn combo_plays_steps_in_order() {
        let (rec, ctl, events) = controller();
        let mut rx = events.subscribe();
        let steps = vec![
            ComboStep::new(ExpressionClass::Emote, 1, 100, 50),
            ComboStep::new(ExpressionClass::Emote, 1, 100, 50),
            ComboStep::new(ExpressionClass::Action, 0, 100, 0),
        ];
        assert!(ctl.play_combo(steps).await);
        assert!(ctl.combo_playing().await);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(!ctl.combo_playing().await);

        let e1 = "/avatar/parameters/Emote1".to_string();
        let a0 = "/avatar/parameters/Action0".to_string();
        assert_eq!(
            rec.values(),
            vec![
                (e1.clone(), OscValue::Int(1)),
                (e1.clone(), OscValue::Int(0)),
                (e1.clone(), OscValue::Int(1)),
                (e1, OscValue::Int(0)),
                (a0.clone(), OscValue::Int(1)),
                (a0, OscValue::Int(0)),
            ]
        );

        let mut completed = None;
        while let Ok(event) = rx.try_recv() {
            if let BridgeEvent::ComboCompleted { steps, interrupted } = event {
                completed = Some((steps, interrupted));
            }
        }
        assert_eq!(completed, Some((3, false)));
    }

    #[tokio::test(start_paused = true)]
    async fn combos_are_mutually_exclusive() {
        let (_rec, ctl, _) = controller();
        let steps = vec![ComboStep::new(ExpressionClass::Emote, 0, 500, 0)];
        assert!(ctl.play_combo(steps.clone()).await);
        assert!(!ctl.play_combo(steps).await);
        assert!(!ctl.play_combo(vec![]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_combo_halts_and_releases() {
        let (rec, ctl, _) = controller();
        let steps = vec![
            ComboStep::new(ExpressionClass::Emote, 4, 1_000, 0),
            ComboStep::new(ExpressionClass::Emote, 5, 1_000, 0),
        ];
        assert!(ctl.play_combo(steps).await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(ctl.stop_combo().await);
        assert!(!ctl.combo_playing().await);
        assert!(!ctl.stop_combo().await);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let e4 = "/avatar/parameters/Emote4".to_string();
        assert_eq!(
            rec.values(),
            vec![(e4.clone(), OscValue::Int(1)), (e4, OscValue::Int(0))]
        );
        assert_eq!(ctl.held_slots().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_combos_play_in_order() {
        let (rec, ctl, _) = controller();
        assert!(ctl.queue_combo(vec![ComboStep::new(ExpressionClass::Emote, 0, 100, 0)]).await);
        assert!(ctl.queue_combo(vec![ComboStep::new(ExpressionClass::Emote, 7, 100, 0)]).await);
        assert_eq!(ctl.queued_combos().await, 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let addresses: Vec<String> = rec.values().into_iter().map(|(a, _)| a).collect();
        assert_eq!(
            addresses,
            vec![
                "/avatar/parameters/Emote0",
                "/avatar/parameters/Emote0",
                "/avatar/parameters/Emote7",
                "/avatar/parameters/Emote7",
            ]
        );
        assert!(!ctl.combo_playing().await);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_run_leaves_a_newer_combo_tracked() {
        let (_rec, ctl, _) = controller();
        assert!(ctl.play_combo(vec![ComboStep::new(ExpressionClass::Emote, 0, 100, 0)]).await);

        // Hold the combo lock while the first run finishes its last step, then
        // swap in a second run the way stop_combo + play_combo would.
        let mut combo = ctl.inner.combo.lock().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let first = combo.current.take().unwrap();
        ctl.start_locked(&mut combo, vec![ComboStep::new(ExpressionClass::Emote, 1, 5_000, 0)]);
        drop(combo);
        first.handle.await.unwrap();

        assert!(ctl.combo_playing().await);
        assert!(!ctl.play_combo(vec![ComboStep::new(ExpressionClass::Emote, 2, 100, 0)]).await);
        assert!(ctl.stop_combo().await);
        assert!(!ctl.combo_playing().await);
    }

    #[tokio::test]
    async fn release_all_sends_zero_for_each_held_slot() {
        let (rec, ctl, _) = controller();
        ctl.trigger_expression(ExpressionClass::Emote, 0, true).await;
        ctl.trigger_expression(ExpressionClass::Action, 1, true).await;
        assert_eq!(ctl.release_all().await, 2);
        assert_eq!(ctl.release_all().await, 0);

        let zeros = rec
            .values()
            .into_iter()
            .filter(|(_, v)| *v == OscValue::Int(0))
            .count();
        assert_eq!(zeros, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_forgets_stale_slots() {
        let (_rec, ctl, _) = controller();
        ctl.trigger_expression(ExpressionClass::Emote, 0, true).await;
        assert_eq!(ctl.cleanup().await, 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(ctl.cleanup().await, 1);
    }
}
