//! The single outbound funnel.
//!
//! Every controller writes through [`OutboundPath`]: validate the address,
//! consult the cache, queue in the batcher (or send directly), then record
//! the value in the state store and announce it. One path means one queue,
//! so writes to the same address leave in program order.

use std::sync::Arc;

use async_trait::async_trait;
use avaconf::BridgeConfig;
use avaproto::{validate_address, Message, OscValue, PARAMETER_PREFIX, PHYSBONE_PREFIX};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::batcher::MessageBatcher;
use crate::cache::ParameterCache;
use crate::events::{BridgeEvent, EventBus};
use crate::state::{AvatarListener, StateStore};
use crate::transport::Outbound;

/// Parameter writes from controllers.
#[async_trait]
pub trait ParameterSink: Send + Sync {
    /// Send one value, subject to redundant-send suppression. False when the
    /// address is invalid or the transport is closed.
    async fn send_parameter(&self, address: &str, value: OscValue) -> bool;
}

pub struct OutboundPath {
    out: Arc<dyn Outbound>,
    batcher: Option<MessageBatcher>,
    cache: Option<Mutex<ParameterCache>>,
    state: Arc<StateStore>,
    events: EventBus,
}

impl OutboundPath {
    pub fn new(
        config: &BridgeConfig,
        out: Arc<dyn Outbound>,
        state: Arc<StateStore>,
        events: EventBus,
    ) -> Self {
        let batcher = config
            .message_batching
            .enabled
            .then(|| MessageBatcher::new(Arc::clone(&out), config.message_batching.window()));
        let cache = config
            .parameter_caching
            .enabled
            .then(|| Mutex::new(ParameterCache::new(config.parameter_caching.ttl_duration())));

        Self {
            out,
            batcher,
            cache,
            state,
            events,
        }
    }

    pub async fn send(&self, message: Message) -> bool {
        self.dispatch(message, false).await
    }

    /// Send bypassing the cache (presets, avatar switches, chatbox).
    pub async fn send_forced(&self, message: Message) -> bool {
        self.dispatch(message, true).await
    }

    async fn dispatch(&self, message: Message, force: bool) -> bool {
        // Writes that straddle an avatar swap are sent but not recorded.
        let epoch = self.state.avatar_epoch();
        if let Err(e) = validate_address(&message.address) {
            warn!(address = %message.address, "rejected outbound message: {}", e);
            return false;
        }
        if !self.out.is_open() {
            return false;
        }

        let single = match message.args.as_slice() {
            [value] => Some(value.clone()),
            _ => None,
        };

        if let (false, Some(cache), Some(value)) = (force, &self.cache, &single) {
            if !cache.lock().await.should_send(&message.address, value) {
                trace!(address = %message.address, "suppressed unchanged value");
                return true;
            }
        }

        let sent = match &self.batcher {
            Some(batcher) => {
                batcher.add(message.clone()).await;
                true
            }
            None => self.out.send_message(&message).await,
        };
        if !sent {
            return false;
        }

        if let Some(value) = single {
            if let Some(cache) = &self.cache {
                cache.lock().await.update(&message.address, value.clone());
            }
            if message.address.starts_with(PARAMETER_PREFIX)
                || message.address.starts_with(PHYSBONE_PREFIX)
            {
                self.state.record_sent(epoch, &message.address, value).await;
            }
        }

        self.events.emit(BridgeEvent::MessageSent {
            address: message.address,
            args: message.args,
        });
        true
    }

    /// Flush the batch queue now. True when batching is off.
    pub async fn flush(&self) -> bool {
        match &self.batcher {
            Some(batcher) => batcher.flush().await,
            None => true,
        }
    }

    /// Drop queued messages without sending.
    pub async fn clear(&self) {
        if let Some(batcher) = &self.batcher {
            batcher.clear().await;
        }
    }

    pub async fn pending(&self) -> usize {
        match &self.batcher {
            Some(batcher) => batcher.pending().await,
            None => 0,
        }
    }

    pub async fn sweep_cache(&self) -> usize {
        match &self.cache {
            Some(cache) => cache.lock().await.sweep(),
            None => 0,
        }
    }

    pub async fn cache_len(&self) -> usize {
        match &self.cache {
            Some(cache) => cache.lock().await.len(),
            None => 0,
        }
    }
}

#[async_trait]
impl ParameterSink for OutboundPath {
    async fn send_parameter(&self, address: &str, value: OscValue) -> bool {
        self.send(Message::single(address, value)).await
    }
}

#[async_trait]
impl AvatarListener for OutboundPath {
    async fn avatar_changed(&self, _avatar_id: &str) {
        if let Some(cache) = &self.cache {
            cache.lock().await.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avaconf::MonitoringConfig;
    use avaproto::Bundle;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        messages: StdMutex<Vec<Message>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Outbound for Recorder {
        async fn send_message(&self, message: &Message) -> bool {
            self.messages.lock().unwrap().push(message.clone());
            true
        }

        async fn send_bundle(&self, bundle: &Bundle) -> bool {
            self.messages
                .lock()
                .unwrap()
                .extend(bundle.messages.iter().cloned());
            true
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    fn path(batching: bool) -> (Arc<Recorder>, Arc<StateStore>, OutboundPath) {
        let mut config = BridgeConfig::default();
        config.message_batching.enabled = batching;
        let rec = Arc::new(Recorder::default());
        let events = EventBus::new();
        let state = Arc::new(StateStore::new(&MonitoringConfig::default(), events.clone()));
        let out = OutboundPath::new(&config, rec.clone(), state.clone(), events);
        (rec, state, out)
    }

    #[tokio::test]
    async fn unchanged_values_are_suppressed() {
        let (rec, state, out) = path(false);
        assert!(out.send_parameter("/avatar/parameters/Wave", OscValue::Int(1)).await);
        assert!(out.send_parameter("/avatar/parameters/Wave", OscValue::Int(1)).await);
        assert!(out.send_parameter("/avatar/parameters/Wave", OscValue::Int(0)).await);

        assert_eq!(rec.messages.lock().unwrap().len(), 2);
        let param = state.get_parameter("/avatar/parameters/Wave").await.unwrap();
        assert_eq!(param.value, Some(OscValue::Int(0)));
    }

    #[tokio::test]
    async fn forced_sends_bypass_the_cache() {
        let (rec, _state, out) = path(false);
        let msg = Message::single("/avatar/parameters/Wave", 1);
        assert!(out.send_forced(msg.clone()).await);
        assert!(out.send_forced(msg).await);
        assert_eq!(rec.messages.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_or_closed_is_false() {
        let (rec, _state, out) = path(false);
        assert!(!out.send_parameter("/avatar/../x", OscValue::Int(1)).await);
        rec.closed.store(true, Ordering::SeqCst);
        assert!(!out.send_parameter("/avatar/parameters/Wave", OscValue::Int(1)).await);
        assert!(rec.messages.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn batched_sends_keep_program_order() {
        let (rec, _state, out) = path(true);
        out.send_parameter("/avatar/parameters/A", OscValue::Int(1)).await;
        out.send_parameter("/avatar/parameters/B", OscValue::Int(1)).await;
        out.send_parameter("/avatar/parameters/A", OscValue::Int(0)).await;
        assert_eq!(out.pending().await, 3);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let sent: Vec<_> = rec
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| (m.address.clone(), m.first().cloned()))
            .collect();
        assert_eq!(
            sent,
            vec![
                ("/avatar/parameters/A".to_string(), Some(OscValue::Int(1))),
                ("/avatar/parameters/B".to_string(), Some(OscValue::Int(1))),
                ("/avatar/parameters/A".to_string(), Some(OscValue::Int(0))),
            ]
        );
    }

    #[tokio::test]
    async fn writes_sent_before_a_swap_are_not_recorded() {
        let (rec, state, out) = path(false);
        let before = state.avatar_epoch();
        assert!(state.set_current_avatar("avtr_new", None).await);
        assert!(state.avatar_epoch() != before);
        assert!(
            !state
                .record_sent(before, "/avatar/parameters/Wave", OscValue::Int(1))
                .await
        );

        assert!(out.send_parameter("/avatar/parameters/Wave", OscValue::Int(1)).await);
        assert_eq!(rec.messages.lock().unwrap().len(), 1);
        assert!(state.get_parameter("/avatar/parameters/Wave").await.is_some());
    }

    #[tokio::test]
    async fn avatar_change_clears_the_cache() {
        let (rec, _state, out) = path(false);
        out.send_parameter("/avatar/parameters/Wave", OscValue::Int(1)).await;
        out.avatar_changed("avtr_new").await;
        out.send_parameter("/avatar/parameters/Wave", OscValue::Int(1)).await;
        assert_eq!(rec.messages.lock().unwrap().len(), 2);
    }
}
