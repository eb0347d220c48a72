//! Enrichment and dedup lookups for the webhook pipeline (§4.10 steps a/b).
//! "Matcher" is the source of truth for resolving `(recipientId, batchId,
//! userId)` from a provider message id, ahead of whatever the intake
//! adapter guessed (§8 ambiguity note).

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::PgPool;
use uuid::Uuid;

use crate::analytics::AnalyticsSink;
use crate::domain::WebhookEvent;

const DEDUP_TTL_SECS: u64 = 86_400;
const INDEX_CACHE_TTL_SECS: u64 = 86_400;

fn dedup_key(event: &WebhookEvent) -> String {
    format!("webhook:dedup:{}", event.dedup_key())
}

fn index_key(provider_message_id: &str) -> String {
    format!("webhook:pmidx:{provider_message_id}")
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedLocation {
    pub recipient_id: Uuid,
    pub batch_id: Uuid,
    pub user_id: Uuid,
}

pub struct WebhookMatcher {
    redis: ConnectionManager,
    analytics: Arc<dyn AnalyticsSink>,
    pool: PgPool,
}

impl WebhookMatcher {
    pub fn new(redis: ConnectionManager, analytics: Arc<dyn AnalyticsSink>, pool: PgPool) -> Self {
        Self { redis, analytics, pool }
    }

    /// Step 2a. A prior successful apply leaves the dedup key set; a
    /// redis error fails closed here (treat as not-a-duplicate) since a
    /// missed dedup only costs a redundant no-op guarded update, never a
    /// double-apply (the recipient status guard is the real safety net).
    pub async fn is_duplicate(&self, event: &WebhookEvent) -> bool {
        let mut conn = self.redis.clone();
        let exists: Result<bool, redis::RedisError> = conn.exists(dedup_key(event)).await;
        exists.unwrap_or(false)
    }

    pub async fn mark_processed(&self, event: &WebhookEvent) {
        let mut conn = self.redis.clone();
        let res: Result<(), redis::RedisError> =
            conn.set_ex(dedup_key(event), 1, DEDUP_TTL_SECS).await;
        if let Err(e) = res {
            tracing::warn!(error = %e, event_id = %event.id, "failed to mark webhook event processed in dedup cache");
        }
    }

    /// Step 2b: cache -> analytics store -> durable store. Populates the
    /// cache on a miss so a later event for the same provider message id
    /// (e.g. `bounced` following `delivered`) resolves in one round trip.
    pub async fn resolve(&self, provider_message_id: &str) -> Option<ResolvedLocation> {
        if let Some(loc) = self.resolve_from_cache(provider_message_id).await {
            return Some(loc);
        }
        if let Some(loc) = self.resolve_from_analytics(provider_message_id).await {
            self.cache_location(provider_message_id, loc).await;
            return Some(loc);
        }
        if let Some(loc) = self.resolve_from_durable_store(provider_message_id).await {
            self.cache_location(provider_message_id, loc).await;
            return Some(loc);
        }
        None
    }

    async fn resolve_from_cache(&self, provider_message_id: &str) -> Option<ResolvedLocation> {
        let mut conn = self.redis.clone();
        let fields: Result<Vec<String>, redis::RedisError> = conn
            .hget(index_key(provider_message_id), &["recipient_id", "batch_id", "user_id"])
            .await;
        let fields = fields.ok()?;
        let [recipient_id, batch_id, user_id] = <[String; 3]>::try_from(fields).ok()?;
        Some(ResolvedLocation {
            recipient_id: recipient_id.parse().ok()?,
            batch_id: batch_id.parse().ok()?,
            user_id: user_id.parse().ok()?,
        })
    }

    async fn resolve_from_analytics(&self, provider_message_id: &str) -> Option<ResolvedLocation> {
        match self.analytics.lookup_provider_message(provider_message_id).await {
            Ok(Some(loc)) => Some(ResolvedLocation {
                recipient_id: loc.recipient_id,
                batch_id: loc.batch_id,
                user_id: loc.user_id,
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "analytics provider-message lookup failed");
                None
            }
        }
    }

    async fn resolve_from_durable_store(&self, provider_message_id: &str) -> Option<ResolvedLocation> {
        let row = sqlx::query!(
            r#"
            SELECT r.id AS recipient_id, r.batch_id, b.user_id
            FROM recipients r
            JOIN batches b ON b.id = r.batch_id
            WHERE r.provider_message_id = $1
            "#,
            provider_message_id,
        )
        .fetch_optional(&self.pool)
        .await
        .ok()??;
        Some(ResolvedLocation { recipient_id: row.recipient_id, batch_id: row.batch_id, user_id: row.user_id })
    }

    async fn cache_location(&self, provider_message_id: &str, loc: ResolvedLocation) {
        let mut conn = self.redis.clone();
        let res: Result<(), redis::RedisError> = conn
            .hset_multiple(
                index_key(provider_message_id),
                &[
                    ("recipient_id", loc.recipient_id.to_string()),
                    ("batch_id", loc.batch_id.to_string()),
                    ("user_id", loc.user_id.to_string()),
                ],
            )
            .await;
        if res.is_ok() {
            let _: Result<(), redis::RedisError> =
                conn.expire(index_key(provider_message_id), INDEX_CACHE_TTL_SECS as i64).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::WebhookEventType;

    fn sample_event() -> WebhookEvent {
        WebhookEvent {
            id: "evt_1".into(),
            provider: "sendgrid".into(),
            event_type: WebhookEventType::Delivered,
            provider_message_id: "pmid-123".into(),
            occurred_at: Utc::now(),
            raw: serde_json::json!({}),
            recipient_id: None,
            batch_id: None,
            user_id: None,
            metadata: None,
        }
    }

    #[test]
    fn dedup_key_is_stable_for_same_event_fields() {
        let a = dedup_key(&sample_event());
        let b = dedup_key(&sample_event());
        assert_eq!(a, b);
        assert!(a.starts_with("webhook:dedup:"));
    }

    #[test]
    fn dedup_key_differs_across_event_types() {
        let mut other = sample_event();
        other.event_type = WebhookEventType::Bounced;
        assert_ne!(dedup_key(&sample_event()), dedup_key(&other));
    }

    #[test]
    fn index_key_is_namespaced_by_provider_message_id() {
        assert_eq!(index_key("pmid-123"), "webhook:pmidx:pmid-123");
        assert_ne!(index_key("pmid-123"), index_key("pmid-456"));
    }
}
