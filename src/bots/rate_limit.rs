use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// 按机器人划分的令牌桶，容量与补充速率均为每分钟 `per_minute` 条。
#[derive(Clone, Default)]
pub struct BotRateLimiter {
    buckets: Arc<Mutex<HashMap<i64, BucketState>>>,
}

impl BotRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `per_minute <= 0` 表示不限流。
    pub fn try_acquire(&self, bot_id: i64, per_minute: i64) -> bool {
        self.try_acquire_at(bot_id, per_minute, Instant::now())
    }

    pub fn try_acquire_at(&self, bot_id: i64, per_minute: i64, now: Instant) -> bool {
        if per_minute <= 0 {
            return true;
        }
        let capacity = per_minute as f64;
        let mut buckets = self.buckets.lock();
        let state = match buckets.entry(bot_id) {
            Entry::Vacant(entry) => entry.insert(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
            Entry::Occupied(entry) => entry.into_mut(),
        };
        let elapsed = now.saturating_duration_since(state.last_refill);
        let refill = elapsed.as_secs_f64() * capacity / 60.0;
        state.tokens = (state.tokens + refill).min(capacity);
        state.last_refill = now;
        if state.tokens < 1.0 {
            return false;
        }
        state.tokens -= 1.0;
        true
    }
}
