//! Avatar-switch cooldowns and chat rate limiting.
//!
//! Both are plain bookkeeping over `tokio::time::Instant`; callers pass `now`
//! so the same code runs under paused test time.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use avaconf::{ChatCommandsConfig, CooldownType};
use tokio::time::Instant;

/// Records older than this are swept.
pub const SWITCH_RETENTION: Duration = Duration::from_secs(3600);

const GLOBAL_KEY: &str = "";

/// Whole seconds left, rounded up and never zero.
pub fn remaining_secs(remaining: Duration) -> u64 {
    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    secs.max(1)
}

#[derive(Debug)]
pub struct AvatarSwitchCooldown {
    kind: CooldownType,
    window: Duration,
    last: HashMap<String, Instant>,
}

impl AvatarSwitchCooldown {
    pub fn new(kind: CooldownType, window: Duration) -> Self {
        Self {
            kind,
            window,
            last: HashMap::new(),
        }
    }

    pub fn from_config(config: &ChatCommandsConfig) -> Self {
        Self::new(
            config.avatar_switch.cooldown_type,
            Duration::from_secs(config.avatar_switch.cooldown_seconds),
        )
    }

    fn key<'a>(&self, actor: &'a str) -> &'a str {
        match self.kind {
            CooldownType::Global => GLOBAL_KEY,
            CooldownType::PerUser => actor,
        }
    }

    /// Time left before `actor` may switch again, if any.
    pub fn check(&self, actor: &str, now: Instant) -> Option<Duration> {
        let last = self.last.get(self.key(actor))?;
        let elapsed = now.saturating_duration_since(*last);
        (elapsed < self.window).then(|| self.window - elapsed)
    }

    pub fn record(&mut self, actor: &str, now: Instant) {
        let key = self.key(actor).to_string();
        self.last.insert(key, now);
    }

    /// Check and record in one step. On success returns the reservation to
    /// hand back to [`AvatarSwitchCooldown::rollback`] if the switch fails.
    pub fn try_reserve(&mut self, actor: &str, now: Instant) -> Result<Reservation, Duration> {
        if let Some(left) = self.check(actor, now) {
            return Err(left);
        }
        let key = self.key(actor).to_string();
        let previous = self.last.insert(key.clone(), now);
        Ok(Reservation {
            key,
            at: now,
            previous,
        })
    }

    /// Undo a reservation unless a later one replaced it.
    pub fn rollback(&mut self, reservation: Reservation) {
        if self.last.get(&reservation.key) != Some(&reservation.at) {
            return;
        }
        match reservation.previous {
            Some(previous) => {
                self.last.insert(reservation.key, previous);
            }
            None => {
                self.last.remove(&reservation.key);
            }
        }
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.last.len();
        let keep = SWITCH_RETENTION.max(self.window);
        self.last
            .retain(|_, at| now.saturating_duration_since(*at) < keep);
        before - self.last.len()
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

/// A switch slot taken by [`AvatarSwitchCooldown::try_reserve`].
#[derive(Debug)]
pub struct Reservation {
    key: String,
    at: Instant,
    previous: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed,
    /// The per-user gap between commands has not elapsed.
    Cooldown(Duration),
    /// Too many commands in the last minute.
    RateLimited(Duration),
}

/// Per-user chat command throttling: a minimum gap between commands plus a
/// cap per rolling minute.
#[derive(Debug)]
pub struct ChatRateLimiter {
    gap: Duration,
    per_minute: usize,
    users: HashMap<String, VecDeque<Instant>>,
}

const MINUTE: Duration = Duration::from_secs(60);

impl ChatRateLimiter {
    pub fn new(gap: Duration, per_minute: u32) -> Self {
        Self {
            gap,
            per_minute: per_minute as usize,
            users: HashMap::new(),
        }
    }

    pub fn from_config(config: &ChatCommandsConfig) -> Self {
        Self::new(
            Duration::from_secs(config.cooldown_seconds),
            config.rate_limit_per_minute,
        )
    }

    /// Check and, when allowed, record a command from `user`.
    pub fn try_acquire(&mut self, user: &str, now: Instant) -> RateDecision {
        let recent = self.users.entry(user.to_string()).or_default();
        while recent
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= MINUTE)
        {
            recent.pop_front();
        }

        if let Some(last) = recent.back() {
            let since = now.saturating_duration_since(*last);
            if since < self.gap {
                return RateDecision::Cooldown(self.gap - since);
            }
        }
        if self.per_minute > 0 && recent.len() >= self.per_minute {
            let oldest = recent.front().copied().unwrap_or(now);
            return RateDecision::RateLimited(MINUTE - now.saturating_duration_since(oldest));
        }

        recent.push_back(now);
        RateDecision::Allowed
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.users.len();
        self.users.retain(|_, recent| {
            recent
                .back()
                .is_some_and(|at| now.saturating_duration_since(*at) < MINUTE)
        });
        before - self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(remaining_secs(Duration::from_millis(59_001)), 60);
        assert_eq!(remaining_secs(Duration::from_secs(5)), 5);
        assert_eq!(remaining_secs(Duration::from_millis(1)), 1);
        assert_eq!(remaining_secs(Duration::ZERO), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn global_cooldown_is_shared() {
        let mut cd = AvatarSwitchCooldown::new(CooldownType::Global, Duration::from_secs(60));
        let t0 = Instant::now();
        assert_eq!(cd.check("alice", t0), None);
        cd.record("alice", t0);

        let left = cd.check("bob", t0 + Duration::from_secs(10)).unwrap();
        assert_eq!(left, Duration::from_secs(50));
        assert_eq!(cd.check("bob", t0 + Duration::from_secs(60)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn per_user_cooldown_is_separate() {
        let mut cd = AvatarSwitchCooldown::new(CooldownType::PerUser, Duration::from_secs(60));
        let t0 = Instant::now();
        cd.record("alice", t0);
        assert!(cd.check("alice", t0 + Duration::from_secs(1)).is_some());
        assert_eq!(cd.check("bob", t0 + Duration::from_secs(1)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_blocks_until_rolled_back() {
        let mut cd = AvatarSwitchCooldown::new(CooldownType::Global, Duration::from_secs(60));
        let t0 = Instant::now();
        let held = cd.try_reserve("alice", t0).unwrap();
        assert_eq!(
            cd.try_reserve("bob", t0).unwrap_err(),
            Duration::from_secs(60)
        );

        cd.rollback(held);
        assert!(cd.is_empty());
        assert!(cd.try_reserve("bob", t0).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_restores_the_earlier_switch() {
        let mut cd = AvatarSwitchCooldown::new(CooldownType::PerUser, Duration::from_secs(60));
        let t0 = Instant::now();
        cd.record("alice", t0);
        let later = t0 + Duration::from_secs(61);
        let held = cd.try_reserve("alice", later).unwrap();
        cd.rollback(held);
        assert_eq!(cd.check("alice", later), None);
        assert_eq!(
            cd.check("alice", t0 + Duration::from_secs(30)),
            Some(Duration::from_secs(30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn old_records_are_swept() {
        let mut cd = AvatarSwitchCooldown::new(CooldownType::PerUser, Duration::from_secs(60));
        let t0 = Instant::now();
        cd.record("alice", t0);
        cd.record("bob", t0 + Duration::from_secs(1800));
        assert_eq!(cd.sweep(t0 + Duration::from_secs(3601)), 1);
        assert_eq!(cd.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn chat_gap_and_minute_cap() {
        let mut limiter = ChatRateLimiter::new(Duration::from_secs(3), 3);
        let t0 = Instant::now();
        assert_eq!(limiter.try_acquire("alice", t0), RateDecision::Allowed);
        assert_eq!(
            limiter.try_acquire("alice", t0 + Duration::from_secs(1)),
            RateDecision::Cooldown(Duration::from_secs(2))
        );
        assert_eq!(limiter.try_acquire("bob", t0), RateDecision::Allowed);

        assert_eq!(
            limiter.try_acquire("alice", t0 + Duration::from_secs(3)),
            RateDecision::Allowed
        );
        assert_eq!(
            limiter.try_acquire("alice", t0 + Duration::from_secs(6)),
            RateDecision::Allowed
        );
        assert_eq!(
            limiter.try_acquire("alice", t0 + Duration::from_secs(10)),
            RateDecision::RateLimited(Duration::from_secs(50))
        );
        assert_eq!(
            limiter.try_acquire("alice", t0 + Duration::from_secs(60)),
            RateDecision::Allowed
        );
    }
}
