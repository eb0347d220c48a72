//! Webhook ingestion pipeline (C10): buffer -> dedup -> enrich -> bulk-apply
//! -> ack, mirroring the orchestrator's page-buffer shape (§4.10) but over
//! inbound provider callbacks instead of outbound recipient pages.

pub mod matcher;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analytics::AnalyticsEvent;
use crate::analytics::AnalyticsSink;
use crate::domain::WebhookEvent;
use crate::domain::WebhookEventType;
use crate::hotstate::HotStateManager;
use crate::queue::ConsumeOptions;
use crate::queue::MessageQueue;
use crate::queue::QueueMessage;
use crate::webhook::matcher::ResolvedLocation;
use crate::webhook::matcher::WebhookMatcher;

#[derive(Debug, Clone, Copy)]
pub struct WebhookPipelineSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_in_flight: usize,
    pub max_deliver: u32,
}

impl Default for WebhookPipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            max_in_flight: 500,
            max_deliver: 10,
        }
    }
}

struct Buffered {
    message: Box<dyn QueueMessage>,
    event: WebhookEvent,
}

pub struct WebhookPipeline {
    queue: Arc<dyn MessageQueue>,
    pool: PgPool,
    hot_state: Arc<HotStateManager>,
    matcher: WebhookMatcher,
    analytics: Arc<dyn AnalyticsSink>,
    settings: WebhookPipelineSettings,
}

impl WebhookPipeline {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        pool: PgPool,
        hot_state: Arc<HotStateManager>,
        matcher: WebhookMatcher,
        analytics: Arc<dyn AnalyticsSink>,
        settings: WebhookPipelineSettings,
    ) -> Self {
        Self { queue, pool, hot_state, matcher, analytics, settings }
    }

    /// Consumes every subject on the `WEBHOOK` stream; providers are
    /// distinguished by `event.provider`, not by consumer.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let mut rx = self
            .queue
            .consume(ConsumeOptions {
                stream: "WEBHOOK",
                consumer_name: "webhook-pipeline",
                filter_subject: None,
                max_in_flight: self.settings.max_in_flight,
                max_deliver: self.settings.max_deliver,
            })
            .await?;

        let mut buffer = Vec::with_capacity(self.settings.batch_size);
        let mut tick = tokio::time::interval(self.settings.flush_interval);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(message) = maybe else {
                        tracing::warn!("webhook queue consumer closed");
                        return Ok(());
                    };
                    match serde_json::from_slice::<WebhookEvent>(message.data()) {
                        Ok(event) => buffer.push(Buffered { message, event }),
                        Err(e) => {
                            tracing::error!(error = %e, "undecodable webhook event, terminating");
                            let _ = message.term().await;
                            metrics::counter!("webhooks_errors_total", "error_type" => "decode").increment(1);
                        }
                    }
                    if buffer.len() >= self.settings.batch_size {
                        self.flush(std::mem::take(&mut buffer)).await;
                    }
                }
                _ = tick.tick() => {
                    if !buffer.is_empty() {
                        self.flush(std::mem::take(&mut buffer)).await;
                    }
                }
                _ = shutdown.cancelled() => {
                    if !buffer.is_empty() {
                        self.flush(std::mem::take(&mut buffer)).await;
                    }
                    return Ok(());
                }
            }
        }
    }

    #[tracing::instrument(skip(self, items), fields(batch_size = items.len()))]
    async fn flush(&self, items: Vec<Buffered>) {
        metrics::histogram!("webhook_batch_size").record(items.len() as f64);
        let start = std::time::Instant::now();

        let mut resolved = Vec::with_capacity(items.len());
        for item in items {
            if self.matcher.is_duplicate(&item.event).await {
                let _ = item.message.ack().await;
                continue;
            }
            let Some(location) = self.location_for(&item.event).await else {
                tracing::warn!(event_id = %item.event.id, "unresolved webhook event, skipping");
                metrics::counter!("webhooks_errors_total", "error_type" => "unresolved").increment(1);
                let _ = item.message.ack().await;
                continue;
            };
            metrics::counter!(
                "webhooks_received_total",
                "provider" => item.event.provider.clone(),
                "event_type" => event_type_label(item.event.event_type),
            )
            .increment(1);
            resolved.push((item, location));
        }

        if resolved.is_empty() {
            return;
        }

        let status = match self.apply_partitioned(&resolved).await {
            Ok(()) => {
                for (item, location) in &resolved {
                    self.analytics.record(webhook_analytics_event(item, *location));
                    self.matcher.mark_processed(&item.event).await;
                }
                for (item, _) in resolved {
                    let _ = item.message.ack().await;
                }
                "ok"
            }
            Err(e) => {
                tracing::error!(error = %e, "webhook batch apply failed, nacking batch");
                for (item, _) in resolved {
                    let delay = webhook_backoff(item.message.redelivery_count());
                    let _ = item.message.nak(delay).await;
                }
                "error"
            }
        };

        metrics::histogram!("webhook_processing_duration_seconds", "status" => status)
            .record(start.elapsed().as_secs_f64());
    }

    /// The event's own `recipientId`/`batchId`/`userId` are only whatever
    /// the intake adapter guessed from the provider payload; the matcher's
    /// cache/analytics/durable-store chain is the one source of truth, so
    /// every event is resolved through it rather than trusting the hint.
    async fn location_for(&self, event: &WebhookEvent) -> Option<ResolvedLocation> {
        self.matcher.resolve(&event.provider_message_id).await
    }

    /// Groups the flushed batch by event class and applies each group in
    /// one bulk statement (§4.10c/d). Opened/clicked never touch the
    /// durable recipient row.
    async fn apply_partitioned(
        &self,
        resolved: &[(Buffered, ResolvedLocation)],
    ) -> Result<(), anyhow::Error> {
        let mut delivered = Vec::new();
        let mut bounced = Vec::new();
        let mut failed = Vec::new();
        let mut complained = Vec::new();

        for (item, location) in resolved {
            match item.event.event_type {
                WebhookEventType::Delivered => delivered.push((*location, item.event.occurred_at)),
                WebhookEventType::Bounced => bounced.push((*location, item.event.occurred_at)),
                WebhookEventType::Failed => {
                    failed.push((*location, item.event.occurred_at, webhook_failure_reason(&item.event)))
                }
                WebhookEventType::Complained => complained.push((*location, item.event.occurred_at)),
                WebhookEventType::Opened | WebhookEventType::Clicked => {}
            }
        }

        let mut touched_batches: Vec<Uuid> = Vec::new();
        if !delivered.is_empty() {
            touched_batches.extend(self.apply_delivered(&delivered).await?);
        }
        if !bounced.is_empty() {
            touched_batches
                .extend(self.apply_status_transition(&bounced, "bounced", "bounced_at", "bounced_count").await?);
        }
        if !failed.is_empty() {
            touched_batches.extend(self.apply_failed(&failed).await?);
        }
        if !complained.is_empty() {
            self.apply_complained(&complained).await?;
        }

        touched_batches.sort_unstable();
        touched_batches.dedup();
        for batch_id in touched_batches {
            self.finalize_if_complete(batch_id).await?;
        }
        Ok(())
    }

    /// `delivered` never changes `status`; it only stamps `delivered_at`
    /// and increments the counter, guarded by the recipient already being
    /// `sent` (P4). Returns the batch ids actually touched.
    async fn apply_delivered(
        &self,
        rows: &[(ResolvedLocation, DateTime<Utc>)],
    ) -> Result<Vec<Uuid>, anyhow::Error> {
        let ids: Vec<Uuid> = rows.iter().map(|(l, _)| l.recipient_id).collect();
        let ats: Vec<DateTime<Utc>> = rows.iter().map(|(_, at)| *at).collect();

        let updated = sqlx::query!(
            r#"
            UPDATE recipients AS r
            SET delivered_at = v.delivered_at, updated_at = now()
            FROM UNNEST($1::uuid[], $2::timestamptz[]) AS v(id, delivered_at)
            WHERE r.id = v.id AND r.status = 'sent'
            RETURNING r.batch_id
            "#,
            &ids,
            &ats,
        )
        .fetch_all(&self.pool)
        .await?;

        let batch_ids: Vec<Uuid> = updated.iter().map(|r| r.batch_id).collect();
        self.increment_counters_by_batch(&batch_ids, "delivered_count").await?;
        Ok(batch_ids)
    }

    async fn apply_status_transition(
        &self,
        rows: &[(ResolvedLocation, DateTime<Utc>)],
        new_status: &str,
        timestamp_column: &str,
        counter_column: &str,
    ) -> Result<Vec<Uuid>, anyhow::Error> {
        let ids: Vec<Uuid> = rows.iter().map(|(l, _)| l.recipient_id).collect();
        let ats: Vec<DateTime<Utc>> = rows.iter().map(|(_, at)| *at).collect();

        let query = format!(
            r#"
            UPDATE recipients AS r
            SET status = $3, {timestamp_column} = v.at, updated_at = now()
            FROM UNNEST($1::uuid[], $2::timestamptz[]) AS v(id, at)
            WHERE r.id = v.id AND r.status = 'sent'
            RETURNING r.batch_id
            "#
        );
        let batch_ids: Vec<Uuid> = sqlx::query_as::<_, (Uuid,)>(&query)
            .bind(&ids)
            .bind(&ats)
            .bind(new_status)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|(id,)| id)
            .collect();

        self.increment_counters_by_batch(&batch_ids, counter_column).await?;
        Ok(batch_ids)
    }

    /// Unlike `bounced`, there's no dedicated `failed_at` column — stamping
    /// one would mean inventing a column the durable store doesn't have, and
    /// reusing `sent_at` would destroy the timestamp of the original send.
    /// Only `status` and `error_message` move. Returns the batch ids
    /// actually touched.
    async fn apply_failed(
        &self,
        rows: &[(ResolvedLocation, DateTime<Utc>, String)],
    ) -> Result<Vec<Uuid>, anyhow::Error> {
        let ids: Vec<Uuid> = rows.iter().map(|(l, _, _)| l.recipient_id).collect();
        let errors: Vec<String> = rows.iter().map(|(_, _, e)| e.clone()).collect();

        let batch_ids: Vec<Uuid> = sqlx::query!(
            r#"
            UPDATE recipients AS r
            SET status = 'failed', error_message = v.error_message, updated_at = now()
            FROM UNNEST($1::uuid[], $2::text[]) AS v(id, error_message)
            WHERE r.id = v.id AND r.status = 'sent'
            RETURNING r.batch_id
            "#,
            &ids,
            &errors,
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| r.batch_id)
        .collect();

        self.increment_counters_by_batch(&batch_ids, "failed_count").await?;
        Ok(batch_ids)
    }

    /// No batch counter tracks complaints (there is no `complained_count`
    /// column); only the recipient status moves.
    async fn apply_complained(&self, rows: &[(ResolvedLocation, DateTime<Utc>)]) -> Result<(), anyhow::Error> {
        let ids: Vec<Uuid> = rows.iter().map(|(l, _)| l.recipient_id).collect();
        sqlx::query!(
            r#"
            UPDATE recipients AS r
            SET status = 'complained', updated_at = now()
            FROM UNNEST($1::uuid[]) AS v(id)
            WHERE r.id = v.id AND r.status = 'sent'
            "#,
            &ids,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_counters_by_batch(&self, batch_ids: &[Uuid], column: &str) -> Result<(), anyhow::Error> {
        if batch_ids.is_empty() {
            return Ok(());
        }
        let mut per_batch: HashMap<Uuid, i64> = HashMap::new();
        for id in batch_ids {
            *per_batch.entry(*id).or_default() += 1;
        }
        let ids: Vec<Uuid> = per_batch.keys().copied().collect();
        let deltas: Vec<i64> = ids.iter().map(|id| per_batch[id]).collect();

        let query = format!(
            r#"
            UPDATE batches AS b
            SET {column} = LEAST(b.{column} + v.delta, b.total_recipients)
            FROM UNNEST($1::uuid[], $2::bigint[]) AS v(id, delta)
            WHERE b.id = v.id
            "#
        );
        sqlx::query(&query).bind(&ids).bind(&deltas).execute(&self.pool).await?;
        Ok(())
    }

    async fn finalize_if_complete(&self, batch_id: Uuid) -> Result<(), anyhow::Error> {
        if !self.hot_state.is_batch_complete(batch_id).await? {
            return Ok(());
        }
        let row = sqlx::query!(r#"SELECT status FROM batches WHERE id = $1"#, batch_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(()) };
        if row.status == "completed" {
            return Ok(());
        }
        sqlx::query!(
            r#"UPDATE batches SET status = 'completed', completed_at = now() WHERE id = $1 AND status <> 'completed'"#,
            batch_id
        )
        .execute(&self.pool)
        .await?;
        self.hot_state.mark_batch_completed(batch_id).await?;
        Ok(())
    }
}

/// Providers carry the bounce/failure reason in whatever shape their
/// envelope uses; `metadata` is the normalized catch-all for it (§4.10
/// intake). Falls back to a generic reason rather than leaving the column
/// null when a provider omits it.
fn webhook_failure_reason(event: &WebhookEvent) -> String {
    event.metadata.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "webhook reported failure".to_string())
}

fn event_type_label(event_type: WebhookEventType) -> &'static str {
    match event_type {
        WebhookEventType::Delivered => "delivered",
        WebhookEventType::Bounced => "bounced",
        WebhookEventType::Failed => "failed",
        WebhookEventType::Complained => "complained",
        WebhookEventType::Opened => "opened",
        WebhookEventType::Clicked => "clicked",
    }
}

fn webhook_analytics_event(item: &Buffered, location: ResolvedLocation) -> AnalyticsEvent {
    AnalyticsEvent {
        event_type: event_type_label(item.event.event_type).to_string(),
        module_type: "email".to_string(),
        batch_id: location.batch_id,
        recipient_id: location.recipient_id,
        user_id: location.user_id,
        identifier: item.event.provider_message_id.clone(),
        provider_message_id: Some(item.event.provider_message_id.clone()),
        metadata: item.event.metadata.as_ref().map(|v| v.to_string()),
        error_message: None,
        timestamp: item.event.occurred_at,
    }
}

/// `5s * 2^redeliveryCount` capped at `60s`, the same schedule as the
/// orchestrator's batch-level NACKs (§4.10g).
fn webhook_backoff(redelivery_count: u32) -> Duration {
    let secs = 5u64.checked_shl(redelivery_count.min(5)).unwrap_or(u64::MAX).min(60);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;

    struct FakeMessage {
        data: Vec<u8>,
        headers: HashMap<String, String>,
        redelivery_count: u32,
    }

    #[async_trait]
    impl QueueMessage for FakeMessage {
        fn data(&self) -> &[u8] {
            &self.data
        }
        fn headers(&self) -> &HashMap<String, String> {
            &self.headers
        }
        fn redelivery_count(&self) -> u32 {
            self.redelivery_count
        }
        async fn ack(self: Box<Self>) -> Result<(), anyhow::Error> {
            Ok(())
        }
        async fn nak(self: Box<Self>, _delay: Duration) -> Result<(), anyhow::Error> {
            Ok(())
        }
        async fn term(self: Box<Self>) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    fn sample_buffered(event_type: WebhookEventType) -> Buffered {
        Buffered {
            message: Box::new(FakeMessage { data: vec![], headers: HashMap::new(), redelivery_count: 0 }),
            event: WebhookEvent {
                id: "evt_1".into(),
                provider: "sendgrid".into(),
                event_type,
                provider_message_id: "pmid-123".into(),
                occurred_at: Utc::now(),
                raw: serde_json::json!({}),
                recipient_id: None,
                batch_id: None,
                user_id: None,
                metadata: None,
            },
        }
    }

    #[test]
    fn event_type_label_covers_every_variant() {
        assert_eq!(event_type_label(WebhookEventType::Delivered), "delivered");
        assert_eq!(event_type_label(WebhookEventType::Bounced), "bounced");
        assert_eq!(event_type_label(WebhookEventType::Failed), "failed");
        assert_eq!(event_type_label(WebhookEventType::Complained), "complained");
        assert_eq!(event_type_label(WebhookEventType::Opened), "opened");
        assert_eq!(event_type_label(WebhookEventType::Clicked), "clicked");
    }

    #[test]
    fn webhook_backoff_doubles_then_caps_at_sixty_seconds() {
        assert_eq!(webhook_backoff(0), Duration::from_secs(5));
        assert_eq!(webhook_backoff(1), Duration::from_secs(10));
        assert_eq!(webhook_backoff(2), Duration::from_secs(20));
        assert_eq!(webhook_backoff(3), Duration::from_secs(40));
        assert_eq!(webhook_backoff(4), Duration::from_secs(60));
        assert_eq!(webhook_backoff(10), Duration::from_secs(60));
    }

    #[test]
    fn analytics_event_carries_resolved_location_and_label() {
        let item = sample_buffered(WebhookEventType::Bounced);
        let location = ResolvedLocation {
            recipient_id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        };
        let event = webhook_analytics_event(&item, location);
        assert_eq!(event.event_type, "bounced");
        assert_eq!(event.recipient_id, location.recipient_id);
        assert_eq!(event.batch_id, location.batch_id);
        assert_eq!(event.user_id, location.user_id);
        assert_eq!(event.provider_message_id.as_deref(), Some("pmid-123"));
    }
}
