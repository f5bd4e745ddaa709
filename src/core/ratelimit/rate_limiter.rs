// Per-actor, per-command token buckets for shedding command floods.
//
// Buckets are ephemeral: a restart resets flood protection, never case data.
// Refill is computed lazily from elapsed time on access; there is no
// background timer. Bucket updates go through the DashMap entry API, so each
// key mutates atomically without any lock shared across guilds.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Capacity and refill rate for one command, taken from its spec.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl RateLimitPolicy {
    pub const fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }
}

/// Bucket key. Cooldowns are scoped per guild, consistent with guild
/// ownership of moderation state.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct BucketKey {
    guild_id: u64,
    actor_id: u64,
    command: &'static str,
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

pub struct RateLimiter {
    buckets: DashMap<BucketKey, Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Take one token from the (guild, actor, command) bucket, refilling it
    /// first from the time elapsed since the last refill. Returns false when
    /// the bucket is empty.
    pub fn try_acquire(
        &self,
        guild_id: u64,
        actor_id: u64,
        command: &'static str,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> bool {
        let key = BucketKey {
            guild_id,
            actor_id,
            command,
        };

        // entry() holds the shard lock for the whole read-modify-write.
        let mut entry = self.buckets.entry(key).or_insert(Bucket {
            tokens: policy.capacity as f64,
            last_refill: now,
        });

        let elapsed = (now - entry.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        entry.tokens =
            (entry.tokens + elapsed * policy.refill_per_sec).min(policy.capacity as f64);
        entry.last_refill = now;

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const POLICY: RateLimitPolicy = RateLimitPolicy::new(3, 1.0);

    #[test]
    fn burst_up_to_capacity_then_denied() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for _ in 0..3 {
            assert!(limiter.try_acquire(1, 2, "warn", POLICY, now));
        }
        assert!(!limiter.try_acquire(1, 2, "warn", POLICY, now));
    }

    #[test]
    fn one_second_refills_exactly_one_token() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for _ in 0..3 {
            assert!(limiter.try_acquire(1, 2, "warn", POLICY, now));
        }
        assert!(!limiter.try_acquire(1, 2, "warn", POLICY, now));

        let later = now + Duration::seconds(1);
        assert!(limiter.try_acquire(1, 2, "warn", POLICY, later));
        assert!(!limiter.try_acquire(1, 2, "warn", POLICY, later));
    }

    #[test]
    fn buckets_are_isolated_per_command_and_actor() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for _ in 0..3 {
            assert!(limiter.try_acquire(1, 2, "warn", POLICY, now));
        }
        assert!(!limiter.try_acquire(1, 2, "warn", POLICY, now));

        // Different command, same actor: fresh bucket.
        assert!(limiter.try_acquire(1, 2, "mute", POLICY, now));
        // Same command, different actor: fresh bucket.
        assert!(limiter.try_acquire(1, 3, "warn", POLICY, now));
        // Same actor and command, different guild: fresh bucket.
        assert!(limiter.try_acquire(9, 2, "warn", POLICY, now));
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        assert!(limiter.try_acquire(1, 2, "warn", POLICY, now));

        // A long idle period refills to capacity, not beyond.
        let much_later = now + Duration::seconds(3600);
        for _ in 0..3 {
            assert!(limiter.try_acquire(1, 2, "warn", POLICY, much_later));
        }
        assert!(!limiter.try_acquire(1, 2, "warn", POLICY, much_later));
    }
}
