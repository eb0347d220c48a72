//! Hot state manager (C3): the authoritative view of in-flight batch
//! progress. Every counter increment and terminal per-recipient write goes
//! here first; `crate::sync` mirrors committed state into Postgres.

pub mod compact;

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use redis::Script;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::circuit_breaker::Circuit;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::WorkerError;
use crate::hotstate::compact::CompactState;

const ACTIVE_BATCHES_KEY: &str = "hotstate:active_batches";

fn counters_key(batch_id: Uuid) -> String {
    format!("batch:{batch_id}:counters")
}
fn recipients_key(batch_id: Uuid) -> String {
    format!("batch:{batch_id}:recipients")
}
fn pending_sync_key(batch_id: Uuid) -> String {
    format!("batch:{batch_id}:pending_sync")
}

#[derive(Debug, Clone, Copy)]
pub struct BatchCounters {
    pub sent: i64,
    pub failed: i64,
    pub total: i64,
}

impl BatchCounters {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.sent + self.failed >= self.total
    }
}

pub struct RecordOutcome {
    pub counters: BatchCounters,
    pub is_complete: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct HotStateTtls {
    pub active_batch_secs: u64,
    pub completed_batch_secs: u64,
}

impl Default for HotStateTtls {
    fn default() -> Self {
        Self { active_batch_secs: 86_400, completed_batch_secs: 3_600 }
    }
}

/// Bytes-per-recipient estimate used by the backpressure check (§4.3.4).
const BYTES_PER_RECIPIENT_ESTIMATE: u64 = 50;
const MEMORY_PRESSURE_RATIO: f64 = 0.85;

/// Records an increment of `sent` or `failed` alongside the compact
/// per-recipient write, atomically.
/// KEYS[1]=counters KEYS[2]=recipients KEYS[3]=pending_sync
/// ARGV[1]=field ("sent"|"failed") ARGV[2]=recipient_id ARGV[3]=compact_value
/// ARGV[4]=ttl_secs
const RECORD_TERMINAL: &str = r#"
local counters_key = KEYS[1]
local recipients_key = KEYS[2]
local pending_key = KEYS[3]
local field = ARGV[1]
local recipient_id = ARGV[2]
local compact_value = ARGV[3]
local ttl = tonumber(ARGV[4])

redis.call("HINCRBY", counters_key, field, 1)
redis.call("HSET", recipients_key, recipient_id, compact_value)
redis.call("SADD", pending_key, recipient_id)

redis.call("EXPIRE", counters_key, ttl)
redis.call("EXPIRE", recipients_key, ttl)
redis.call("EXPIRE", pending_key, ttl)

local sent = tonumber(redis.call("HGET", counters_key, "sent")) or 0
local failed = tonumber(redis.call("HGET", counters_key, "failed")) or 0
local total = tonumber(redis.call("HGET", counters_key, "total")) or 0

return { sent, failed, total }
"#;

pub struct HotStateManager {
    redis: ConnectionManager,
    record_terminal: Arc<Script>,
    circuit: RwLock<Circuit>,
    circuit_cfg: CircuitBreakerConfig,
    ttls: HotStateTtls,
}

impl HotStateManager {
    pub fn new(redis: ConnectionManager, circuit_cfg: CircuitBreakerConfig, ttls: HotStateTtls) -> Self {
        Self {
            redis,
            record_terminal: Arc::new(Script::new(RECORD_TERMINAL)),
            circuit: RwLock::new(Circuit::default()),
            circuit_cfg,
            ttls,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Gates every hot-state call through the circuit breaker (§4.3.2): on a
    /// KV exception the breaker records a failure; once the threshold trips
    /// within the window the circuit opens for `reset_secs`.
    async fn circuit_allows(&self) -> bool {
        let now = Self::now_ms();
        let result = self.circuit.read().await.clone().check(&self.circuit_cfg, now);
        *self.circuit.write().await = result.circuit;
        result.can_proceed
    }

    async fn record_circuit_failure(&self) {
        let now = Self::now_ms();
        let mut guard = self.circuit.write().await;
        *guard = guard.clone().record_failure(&self.circuit_cfg, now);
        tracing::warn!(
            recent_failures = guard.failures.len(),
            window_secs = self.circuit_cfg.failure_window_secs,
            "hot-state circuit recorded failure"
        );
    }

    async fn record_circuit_success(&self) {
        let mut guard = self.circuit.write().await;
        *guard = guard.clone().record_success();
    }

    /// Before accepting a new batch, refuse if KV memory pressure exceeds
    /// 85% (estimate = 50 bytes * total_recipients). Unavailable memory
    /// stats fail open (§4.3.4) — this is a diagnostic, not a correctness
    /// guard.
    async fn check_backpressure(&self, total_recipients: i64) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let info: Result<String, redis::RedisError> =
            redis::cmd("INFO").arg("memory").query_async(&mut conn).await;
        let Ok(info) = info else {
            tracing::debug!("memory info unavailable, allowing batch (fail-open diagnostic)");
            return Ok(());
        };
        let (used, max) = parse_memory_info(&info);
        let Some(max) = max.filter(|m| *m > 0) else {
            return Ok(());
        };
        let estimate = BYTES_PER_RECIPIENT_ESTIMATE * total_recipients.max(0) as u64;
        let ratio = (used + estimate) as f64 / max as f64;
        if ratio > MEMORY_PRESSURE_RATIO {
            metrics::counter!("batches_rejected_memory_pressure_total").increment(1);
            return Err(WorkerError::Backpressure(format!(
                "memory_pressure: ratio={ratio:.3} used={used} estimate={estimate} max={max}"
            )));
        }
        Ok(())
    }

    pub async fn initialize_batch(
        &self,
        batch_id: Uuid,
        total: i64,
    ) -> Result<(), WorkerError> {
        self.check_backpressure(total).await?;

        let mut conn = self.redis.clone();
        let counters = counters_key(batch_id);
        let res: Result<(), redis::RedisError> = redis::pipe()
            .atomic()
            .hset(&counters, "sent", 0)
            .hset(&counters, "failed", 0)
            .hset(&counters, "total", total)
            .expire(&counters, self.ttls.active_batch_secs as i64)
            .query_async(&mut conn)
            .await;
        res.map_err(|e| WorkerError::TransientIo(e.into()))
    }

    /// Fail-safe (§4.3.3, §7): on circuit-open or KV error, throw rather
    /// than return `None` — the caller must fall back to a durable-store
    /// read and never execute without a verified non-terminal view (I3).
    #[tracing::instrument(skip(self))]
    pub async fn check_recipient_processed(
        &self,
        batch_id: Uuid,
        recipient_id: Uuid,
    ) -> Result<Option<CompactState>, WorkerError> {
        if !self.circuit_allows().await {
            return Err(WorkerError::IntegrityFault("hot-state circuit open".into()));
        }
        let mut conn = self.redis.clone();
        let raw: Result<Option<String>, redis::RedisError> =
            conn.hget(recipients_key(batch_id), recipient_id.to_string()).await;
        match raw {
            Ok(None) => {
                self.record_circuit_success().await;
                Ok(None)
            }
            Ok(Some(v)) => {
                self.record_circuit_success().await;
                let state = CompactState::decode(&v)
                    .map_err(|e| WorkerError::IntegrityFault(e.to_string()))?;
                Ok(Some(state))
            }
            Err(e) => {
                self.record_circuit_failure().await;
                Err(WorkerError::IntegrityFault(format!("hot-state KV error: {e}")))
            }
        }
    }

    #[tracing::instrument(skip(self, recipient_ids))]
    pub async fn check_recipients_processed_batch(
        &self,
        batch_id: Uuid,
        recipient_ids: &[Uuid],
    ) -> Result<std::collections::HashMap<Uuid, CompactState>, WorkerError> {
        if recipient_ids.is_empty() {
            return Ok(Default::default());
        }
        if !self.circuit_allows().await {
            return Err(WorkerError::IntegrityFault("hot-state circuit open".into()));
        }
        let mut conn = self.redis.clone();
        let fields: Vec<String> = recipient_ids.iter().map(Uuid::to_string).collect();
        let raw: Result<Vec<Option<String>>, redis::RedisError> =
            conn.hget(recipients_key(batch_id), &fields).await;
        match raw {
            Ok(values) => {
                self.record_circuit_success().await;
                let mut out = std::collections::HashMap::new();
                for (id, v) in recipient_ids.iter().zip(values) {
                    if let Some(v) = v {
                        if let Ok(state) = CompactState::decode(&v) {
                            out.insert(*id, state);
                        }
                    }
                }
                Ok(out)
            }
            Err(e) => {
                self.record_circuit_failure().await;
                Err(WorkerError::IntegrityFault(format!("hot-state KV error: {e}")))
            }
        }
    }

    async fn record_terminal(
        &self,
        batch_id: Uuid,
        recipient_id: Uuid,
        field: &str,
        state: CompactState,
    ) -> Result<RecordOutcome, WorkerError> {
        let mut conn = self.redis.clone();
        let (sent, failed, total): (i64, i64, i64) = self
            .record_terminal
            .key(counters_key(batch_id))
            .key(recipients_key(batch_id))
            .key(pending_sync_key(batch_id))
            .arg(field)
            .arg(recipient_id.to_string())
            .arg(state.encode())
            .arg(self.ttls.active_batch_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| WorkerError::TransientIo(e.into()))?;

        let _: Result<(), redis::RedisError> =
            conn.sadd(ACTIVE_BATCHES_KEY, batch_id.to_string()).await;

        let counters = BatchCounters { sent, failed, total };
        Ok(RecordOutcome { counters, is_complete: counters.is_complete() })
    }

    pub async fn record_sent(
        &self,
        batch_id: Uuid,
        recipient_id: Uuid,
        provider_message_id: String,
    ) -> Result<RecordOutcome, WorkerError> {
        let state =
            CompactState::Sent { sent_at_ms: Self::now_ms(), provider_message_id };
        self.record_terminal(batch_id, recipient_id, "sent", state).await
    }

    pub async fn record_failed(
        &self,
        batch_id: Uuid,
        recipient_id: Uuid,
        error_message: String,
    ) -> Result<RecordOutcome, WorkerError> {
        let state = CompactState::Failed { error_message };
        self.record_terminal(batch_id, recipient_id, "failed", state).await
    }

    /// Shorten TTL of all batch keys to `completed_batch_secs` (§4.3).
    pub async fn mark_batch_completed(&self, batch_id: Uuid) -> Result<(), WorkerError> {
        let mut conn = self.redis.clone();
        let ttl = self.ttls.completed_batch_secs as i64;
        let res: Result<(), redis::RedisError> = redis::pipe()
            .atomic()
            .expire(counters_key(batch_id), ttl)
            .expire(recipients_key(batch_id), ttl)
            .expire(pending_sync_key(batch_id), ttl)
            .query_async(&mut conn)
            .await;
        res.map_err(|e| WorkerError::TransientIo(e.into()))
    }

    pub async fn is_batch_complete(&self, batch_id: Uuid) -> Result<bool, WorkerError> {
        let counters = self.get_counters(batch_id).await?;
        Ok(counters.is_complete())
    }

    pub async fn get_counters(&self, batch_id: Uuid) -> Result<BatchCounters, WorkerError> {
        let mut conn = self.redis.clone();
        let (sent, failed, total): (Option<i64>, Option<i64>, Option<i64>) = redis::pipe()
            .hget(counters_key(batch_id), "sent")
            .hget(counters_key(batch_id), "failed")
            .hget(counters_key(batch_id), "total")
            .query_async(&mut conn)
            .await
            .map_err(|e| WorkerError::TransientIo(e.into()))?;
        Ok(BatchCounters {
            sent: sent.unwrap_or(0),
            failed: failed.unwrap_or(0),
            total: total.unwrap_or(0),
        })
    }

    pub async fn get_pending_sync_recipients(
        &self,
        batch_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Uuid>, WorkerError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .srandmember_multiple(pending_sync_key(batch_id), limit)
            .await
            .map_err(|e| WorkerError::TransientIo(e.into()))?;
        Ok(ids.into_iter().filter_map(|s| Uuid::parse_str(&s).ok()).collect())
    }

    pub async fn get_recipient_states(
        &self,
        batch_id: Uuid,
        ids: &[Uuid],
    ) -> Result<std::collections::HashMap<Uuid, CompactState>, WorkerError> {
        self.check_recipients_processed_batch(batch_id, ids).await
    }

    /// Clears synced ids from the pending-sync set; when it empties,
    /// deregisters the batch from the active-batch index.
    pub async fn mark_synced(&self, batch_id: Uuid, ids: &[Uuid]) -> Result<(), WorkerError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let members: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let _: i64 = conn
            .srem(pending_sync_key(batch_id), &members)
            .await
            .map_err(|e| WorkerError::TransientIo(e.into()))?;
        let remaining: i64 = conn
            .scard(pending_sync_key(batch_id))
            .await
            .map_err(|e| WorkerError::TransientIo(e.into()))?;
        if remaining == 0 {
            let _: Result<(), redis::RedisError> =
                conn.srem(ACTIVE_BATCHES_KEY, batch_id.to_string()).await;
        }
        Ok(())
    }

    pub async fn get_active_batch_ids(&self) -> Result<Vec<Uuid>, WorkerError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .smembers(ACTIVE_BATCHES_KEY)
            .await
            .map_err(|e| WorkerError::TransientIo(e.into()))?;
        Ok(ids.into_iter().filter_map(|s| Uuid::parse_str(&s).ok()).collect())
    }
}

/// Parses `used_memory:<n>` and `maxmemory:<n>` out of a Redis `INFO memory`
/// reply. Returns `(used, None)` when `maxmemory` is unset (no-eviction
/// deployments commonly leave it at 0, meaning "unbounded").
fn parse_memory_info(info: &str) -> (u64, Option<u64>) {
    let mut used = 0u64;
    let mut max = None;
    for line in info.lines() {
        if let Some(v) = line.strip_prefix("used_memory:") {
            used = v.trim().parse().unwrap_or(0);
        } else if let Some(v) = line.strip_prefix("maxmemory:") {
            max = v.trim().parse().ok().filter(|m: &u64| *m > 0);
        }
    }
    (used, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_info_fields() {
        let raw = "# Memory\r\nused_memory:1048576\r\nmaxmemory:2097152\r\n";
        assert_eq!(parse_memory_info(raw), (1_048_576, Some(2_097_152)));
    }

    #[test]
    fn treats_zero_maxmemory_as_unbounded() {
        let raw = "used_memory:100\r\nmaxmemory:0\r\n";
        assert_eq!(parse_memory_info(raw), (100, None));
    }

    #[test]
    fn batch_counters_complete_requires_positive_total() {
        assert!(!BatchCounters { sent: 0, failed: 0, total: 0 }.is_complete());
        assert!(BatchCounters { sent: 2, failed: 1, total: 3 }.is_complete());
        assert!(!BatchCounters { sent: 1, failed: 1, total: 3 }.is_complete());
    }
}
