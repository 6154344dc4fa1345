//! "Last value sent" table for redundant-send suppression.

use std::collections::HashMap;
use std::time::Duration;

use avaproto::OscValue;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: OscValue,
    sent_at: Instant,
}

#[derive(Debug)]
pub struct ParameterCache {
    ttl: Duration,
    entries: HashMap<String, Entry>,
}

impl ParameterCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// True when the address is unseen, its entry expired, or the value
    /// differs from the last one sent.
    pub fn should_send(&self, address: &str, value: &OscValue) -> bool {
        match self.entries.get(address) {
            None => true,
            Some(entry) => entry.sent_at.elapsed() >= self.ttl || entry.value != *value,
        }
    }

    pub fn update(&mut self, address: &str, value: OscValue) {
        self.entries.insert(
            address.to_string(),
            Entry {
                value,
                sent_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.sent_at.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "/avatar/parameters/Hearts";

    #[test]
    fn unseen_address_is_always_sent() {
        let cache = ParameterCache::new(Duration::from_secs(5));
        assert!(cache.should_send(ADDR, &OscValue::Int(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn same_value_is_suppressed_until_ttl() {
        let mut cache = ParameterCache::new(Duration::from_secs(5));
        cache.update(ADDR, OscValue::Int(1));

        assert!(!cache.should_send(ADDR, &OscValue::Int(1)));
        assert!(cache.should_send(ADDR, &OscValue::Int(0)));
        assert!(cache.should_send(ADDR, &OscValue::Float(1.0)));

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(!cache.should_send(ADDR, &OscValue::Int(1)));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.should_send(ADDR, &OscValue::Int(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired() {
        let mut cache = ParameterCache::new(Duration::from_secs(5));
        cache.update("/a", OscValue::Int(1));
        tokio::time::advance(Duration::from_secs(3)).await;
        cache.update("/b", OscValue::Int(1));
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.should_send("/b", &OscValue::Int(1)));

        cache.clear();
        assert!(cache.is_empty());
    }
}
