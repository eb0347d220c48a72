//! Token-bucket limiter (C1): a named bucket backed by the shared KV engine,
//! atomic via a single Lua script so concurrent callers across replicas
//! never read-modify-write a stale value.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Script;

/// `tokens = min(capacity, tokens + elapsed * rate)`; if `tokens >= cost`,
/// deduct and allow, else report how long the caller should wait.
///
/// KEYS[1] = bucket key
/// ARGV[1] = capacity, ARGV[2] = refill_rate_per_sec, ARGV[3] = cost,
/// ARGV[4] = now_micros
const REFILL_AND_TAKE: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local bucket = redis.call("HMGET", key, "tokens", "ts")
local tokens = tonumber(bucket[1])
local last = tonumber(bucket[2])
if tokens == nil then
    tokens = capacity
    last = now
end

local elapsed = math.max(0, now - last) / 1000000.0
tokens = math.min(capacity, tokens + elapsed * rate)

local allowed = 0
local wait_ms = 0
if tokens >= cost then
    tokens = tokens - cost
    allowed = 1
else
    local deficit = cost - tokens
    wait_ms = math.ceil((deficit / rate) * 1000)
end

redis.call("HMSET", key, "tokens", tokens, "ts", now)
redis.call("PEXPIRE", key, 60000)

return { allowed, wait_ms, tokens }
"#;

pub struct AcquireResult {
    pub allowed: bool,
    pub wait_ms: u64,
}

/// `clamp(max(2*rate, 10), .., 30*rate)` per spec §4.1.
pub fn burst_capacity(rate_per_sec: u32) -> u32 {
    let lower = rate_per_sec.saturating_mul(2).max(10);
    let upper = rate_per_sec.saturating_mul(30);
    lower.min(upper.max(lower))
}

#[derive(Clone)]
pub struct TokenBucket {
    redis: ConnectionManager,
    script: Arc<Script>,
}

impl TokenBucket {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis, script: Arc::new(Script::new(REFILL_AND_TAKE)) }
    }

    /// Blocks (polling) until tokens are available or `max_wait` elapses.
    /// On a KV round-trip error this **fails open**: the unavailability of
    /// the limiter must not halt user traffic, and duplicate-send risk is
    /// covered at the hot-state layer instead (§4.1).
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn acquire(
        &self,
        key: &str,
        rate_per_sec: u32,
        cost: u32,
        max_wait: Duration,
    ) -> AcquireResult {
        let capacity = burst_capacity(rate_per_sec);
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            match self.try_take(key, capacity, rate_per_sec, cost).await {
                Ok(r) if r.allowed => return r,
                Ok(r) => {
                    if tokio::time::Instant::now() + Duration::from_millis(r.wait_ms) > deadline {
                        return AcquireResult { allowed: false, wait_ms: r.wait_ms };
                    }
                    tokio::time::sleep(Duration::from_millis(r.wait_ms.min(250))).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "token bucket KV error, failing open");
                    return AcquireResult { allowed: true, wait_ms: 0 };
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return AcquireResult { allowed: false, wait_ms: 0 };
            }
        }
    }

    async fn try_take(
        &self,
        key: &str,
        capacity: u32,
        rate_per_sec: u32,
        cost: u32,
    ) -> Result<AcquireResult, anyhow::Error> {
        let now_micros = chrono::Utc::now().timestamp_micros();
        let mut conn = self.redis.clone();
        let (allowed, wait_ms, _tokens): (i64, i64, f64) = self
            .script
            .key(key)
            .arg(capacity)
            .arg(rate_per_sec)
            .arg(cost)
            .arg(now_micros)
            .invoke_async(&mut conn)
            .await?;
        Ok(AcquireResult { allowed: allowed == 1, wait_ms: wait_ms.max(0) as u64 })
    }
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::burst_capacity;

    #[test]
    fn burst_capacity_respects_floor_and_ceiling() {
        assert_eq!(burst_capacity(1), 10);
        assert_eq!(burst_capacity(10), 20);
        assert_eq!(burst_capacity(1000), 2000);
    }

    /// §8 scenario S3: whatever the per-provider rate, the effective burst
    /// never exceeds `30 * rate` nor drops below the 10-token floor.
    #[quickcheck]
    fn burst_capacity_stays_within_documented_bounds(rate_per_sec: u32) -> bool {
        let capacity = burst_capacity(rate_per_sec);
        capacity >= 10 && capacity <= rate_per_sec.max(1).saturating_mul(30)
    }
}
