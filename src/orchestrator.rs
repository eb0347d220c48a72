//! Batch orchestrator (C7): consumes `sys.batch.process`, pages recipients
//! into per-user send jobs, and ensures a consumer exists for the owning
//! user. Grounded on the teacher's `delivery.rs` dequeue-then-act shape,
//! generalized from a single-row `SKIP LOCKED` dequeue to a paginated
//! fan-out over a queue port.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analytics::AnalyticsEvent;
use crate::analytics::AnalyticsSink;
use crate::domain::Batch;
use crate::domain::BatchStatus;
use crate::domain::SendConfig;
use crate::error::WorkerError;
use crate::hotstate::HotStateManager;
use crate::queue::new_trace_id;
use crate::queue::ConsumeOptions;
use crate::queue::MessageQueue;
use crate::queue::PublishOptions;
use crate::queue::QueueMessage;
use crate::queue::TRACE_ID_HEADER;
use crate::worker::job::msg_id;
use crate::worker::job::subject_for_user;
use crate::worker::job::JobData;
use crate::worker::UserWorkerFactory;

const PAGE_SIZE: i64 = 1000;
const MAX_ENQUEUE_FAILURE_RATIO: f64 = 0.01;
const SYS_STREAM: &str = "SYS";
const BATCH_PROCESS_SUBJECT: &str = "sys.batch.process";

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub max_in_flight: usize,
    pub max_deliver: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self { max_in_flight: 100, max_deliver: 10 }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct BatchMessage {
    pub batch_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub dry_run: bool,
}

struct RecipientRow {
    id: Uuid,
    identifier: String,
    name: Option<String>,
    variables: Option<serde_json::Value>,
}

pub struct Orchestrator {
    pool: PgPool,
    hot_state: Arc<HotStateManager>,
    queue: Arc<dyn MessageQueue>,
    worker_factory: Arc<UserWorkerFactory>,
    analytics: Arc<dyn AnalyticsSink>,
    active_processors: Arc<DashMap<Uuid, ()>>,
    user_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        pool: PgPool,
        hot_state: Arc<HotStateManager>,
        queue: Arc<dyn MessageQueue>,
        worker_factory: Arc<UserWorkerFactory>,
        analytics: Arc<dyn AnalyticsSink>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pool,
            hot_state,
            queue,
            worker_factory,
            analytics,
            active_processors: Arc::new(DashMap::new()),
            user_locks: Arc::new(DashMap::new()),
            settings,
        }
    }

    /// Consumes `sys.batch.process`, the entry point batches are published
    /// to once eligible for processing (by the API layer, or an
    /// `ExternalScheduler` for delayed/scheduled batches).
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let mut rx = self
            .queue
            .consume(ConsumeOptions {
                stream: SYS_STREAM,
                consumer_name: "orchestrator",
                filter_subject: Some(BATCH_PROCESS_SUBJECT),
                max_in_flight: self.settings.max_in_flight,
                max_deliver: self.settings.max_deliver,
            })
            .await?;

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.settings.max_in_flight));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(msg) = maybe else {
                        tracing::warn!("batch-process queue consumer closed");
                        return Ok(());
                    };
                    let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        this.handle_batch_message(msg).await;
                    });
                }
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    #[tracing::instrument(skip(self, msg), fields(batch_id = tracing::field::Empty))]
    pub async fn handle_batch_message(&self, msg: Box<dyn QueueMessage>) {
        let redelivery = msg.redelivery_count();
        let body: BatchMessage = match serde_json::from_slice(msg.data()) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "undecodable batch message, terminating");
                let _ = msg.term().await;
                return;
            }
        };
        tracing::Span::current().record("batch_id", tracing::field::display(body.batch_id));

        match self.process(&body).await {
            Ok(()) => {
                if let Err(e) = msg.ack().await {
                    tracing::error!(error = %e, "ack failed");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, redelivery, "batch processing failed, will retry");
                if let Err(e) = msg.nak(batch_backoff(redelivery)).await {
                    tracing::error!(error = %e, "nak failed");
                }
            }
        }
    }

    async fn process(&self, body: &BatchMessage) -> Result<(), WorkerError> {
        let Some(mut batch) = self.load_batch(body.batch_id).await? else {
            tracing::warn!(batch_id = %body.batch_id, "batch not found, dropping");
            return Ok(());
        };

        if batch.status == BatchStatus::Paused {
            tracing::info!(batch_id = %batch.id, "batch paused, skipping");
            return Ok(());
        }

        let send_config = match batch.send_config_id {
            Some(id) => Some(self.load_send_config(id).await?),
            None => None,
        };

        if batch.status == BatchStatus::Queued {
            self.mark_processing(batch.id).await?;
            batch.status = BatchStatus::Processing;
        }

        let pending = self.count_pending_recipients(batch.id).await?;
        if pending == 0 {
            if self.hot_state.is_batch_complete(batch.id).await? {
                self.finalize_if_needed(batch.id).await?;
            }
            self.ensure_user_processor(batch.user_id).await;
            return Ok(());
        }

        self.hot_state.initialize_batch(batch.id, pending).await?;

        let Some(send_config) = send_config else {
            return Err(WorkerError::FatalConfig(format!(
                "batch {} has pending recipients but no send_config_id",
                batch.id
            )));
        };

        let mut total_ok: i64 = 0;
        let mut total_failed: i64 = 0;
        let mut offset: i64 = 0;
        loop {
            let page = self.fetch_recipient_page(batch.id, PAGE_SIZE, offset).await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len() as i64;
            self.mark_queued(&batch, &send_config, &page).await?;
            let (ok, failed) =
                self.publish_page(&batch, &send_config, body.dry_run, &page).await;
            total_ok += ok;
            total_failed += failed;
            offset += page_len;
            if page_len < PAGE_SIZE {
                break;
            }
        }

        let attempted = total_ok + total_failed;
        if attempted > 0 {
            let ratio = total_failed as f64 / attempted as f64;
            if ratio > MAX_ENQUEUE_FAILURE_RATIO {
                return Err(WorkerError::TransientIo(anyhow::anyhow!(
                    "enqueue failure ratio {ratio:.3} exceeds 1% threshold ({total_failed} of {attempted})"
                )));
            }
            if total_failed > 0 {
                tracing::warn!(batch_id = %batch.id, total_failed, attempted, "some recipients failed to enqueue, within tolerance");
            }
        }

        self.ensure_user_processor(batch.user_id).await;
        Ok(())
    }

    async fn publish_page(
        &self,
        batch: &Batch,
        send_config: &SendConfig,
        dry_run: bool,
        page: &[RecipientRow],
    ) -> (i64, i64) {
        let mut ok = 0i64;
        let mut failed = 0i64;
        let subject = subject_for_user(batch.user_id);
        for row in page {
            let variables = variables_from_json(row.variables.clone());
            let job = JobData {
                batch_id: batch.id,
                recipient_id: row.id,
                user_id: batch.user_id,
                recipient_identifier: row.identifier.clone(),
                recipient_name: row.name.clone(),
                recipient_variables: variables,
                send_config: send_config.clone(),
                batch_payload: batch.payload.clone(),
                legacy_fields: None,
                dry_run,
            };

            let Ok(payload_bytes) = serde_json::to_vec(&job) else {
                failed += 1;
                continue;
            };

            let mut headers = HashMap::new();
            headers.insert(TRACE_ID_HEADER.to_string(), new_trace_id());
            let opts = PublishOptions { msg_id: msg_id(batch.id, row.id), headers };

            match self.queue.publish(&subject, &payload_bytes, opts).await {
                Ok(_) => ok += 1,
                Err(e) => {
                    tracing::warn!(recipient_id = %row.id, error = %e, "failed to enqueue recipient job");
                    metrics::counter!("enqueue_failures_total", "queue" => subject.clone()).increment(1);
                    failed += 1;
                }
            }
        }
        (ok, failed)
    }

    /// Guards creation of a user's consumer with a per-user lock so
    /// concurrent orchestrator invocations share one creation (§4.7.2).
    async fn ensure_user_processor(&self, user_id: Uuid) {
        if self.active_processors.contains_key(&user_id) {
            return;
        }
        let lock = self.user_locks.entry(user_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        let _guard = lock.lock().await;
        if self.active_processors.contains_key(&user_id) {
            return;
        }
        self.active_processors.insert(user_id, ());

        let factory = self.worker_factory.clone();
        let active = self.active_processors.clone();
        let handle = factory.spawn(user_id);
        tokio::spawn(async move {
            let _ = handle.await;
            active.remove(&user_id);
        });
    }

    async fn load_batch(&self, batch_id: Uuid) -> Result<Option<Batch>, WorkerError> {
        sqlx::query_as!(
            Batch,
            r#"
            SELECT
                id, user_id, send_config_id,
                status AS "status: BatchStatus",
                total_recipients, sent_count, failed_count, delivered_count, bounced_count,
                payload, created_at, started_at, completed_at, dry_run
            FROM batches WHERE id = $1
            "#,
            batch_id
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| WorkerError::TransientIo(e.into()))
    }

    async fn load_send_config(&self, send_config_id: Uuid) -> Result<SendConfig, WorkerError> {
        let row = sqlx::query!(
            r#"
            SELECT
                id, user_id,
                module AS "module: crate::domain::ModuleType",
                mode AS "mode: crate::domain::RateLimitMode",
                config, rate_limit_per_second, is_default, is_active
            FROM send_configs WHERE id = $1
            "#,
            send_config_id
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| WorkerError::TransientIo(e.into()))?;

        Ok(SendConfig {
            id: row.id,
            user_id: row.user_id,
            module: row.module,
            mode: row.mode,
            config: row.config,
            rate_limit: row
                .rate_limit_per_second
                .map(|per_second| crate::domain::ConfigRateLimit { per_second: per_second as u32 }),
            is_default: row.is_default,
            is_active: row.is_active,
        })
    }

    async fn mark_processing(&self, batch_id: Uuid) -> Result<(), WorkerError> {
        sqlx::query!(
            r#"UPDATE batches SET status = 'processing', started_at = now() WHERE id = $1"#,
            batch_id
        )
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| WorkerError::TransientIo(e.into()))
    }

    async fn count_pending_recipients(&self, batch_id: Uuid) -> Result<i64, WorkerError> {
        let row = sqlx::query!(
            r#"SELECT COUNT(*) AS "count!" FROM recipients WHERE batch_id = $1 AND status = 'pending'"#,
            batch_id
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| WorkerError::TransientIo(e.into()))?;
        Ok(row.count)
    }

    async fn fetch_recipient_page(
        &self,
        batch_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RecipientRow>, WorkerError> {
        let rows = sqlx::query_as!(
            RecipientRow,
            r#"
            SELECT id, identifier, name, variables
            FROM recipients
            WHERE batch_id = $1 AND status = 'pending'
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#,
            batch_id,
            limit,
            offset
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| WorkerError::TransientIo(e.into()))?;
        Ok(rows)
    }

    /// Emits analytics `queued` events (buffered) once the status transition
    /// lands (§4.7 step 5.b).
    async fn mark_queued(
        &self,
        batch: &Batch,
        send_config: &SendConfig,
        page: &[RecipientRow],
    ) -> Result<(), WorkerError> {
        let ids: Vec<Uuid> = page.iter().map(|r| r.id).collect();
        sqlx::query!(
            r#"UPDATE recipients SET status = 'queued' WHERE id = ANY($1)"#,
            &ids
        )
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| WorkerError::TransientIo(e.into()))?;

        for row in page {
            self.analytics.record(AnalyticsEvent {
                event_type: "queued".into(),
                module_type: send_config.provider_name().into(),
                batch_id: batch.id,
                recipient_id: row.id,
                user_id: batch.user_id,
                identifier: row.identifier.clone(),
                provider_message_id: None,
                metadata: None,
                error_message: None,
                timestamp: chrono::Utc::now(),
            });
        }
        Ok(())
    }

    async fn finalize_if_needed(&self, batch_id: Uuid) -> Result<(), WorkerError> {
        sqlx::query!(
            r#"
            UPDATE batches SET status = 'completed', completed_at = now()
            WHERE id = $1 AND status <> 'completed'
            "#,
            batch_id
        )
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| WorkerError::TransientIo(e.into()))?;
        self.hot_state.mark_batch_completed(batch_id).await
    }
}

fn variables_from_json(v: Option<serde_json::Value>) -> HashMap<String, String> {
    v.and_then(|v| v.as_object().cloned())
        .map(|obj| {
            obj.into_iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// `5s * 2^redeliveryCount` capped at `60s` (§4.7.1).
fn batch_backoff(redelivery_count: u32) -> Duration {
    let secs = 5u64.checked_shl(redelivery_count.min(5)).unwrap_or(u64::MAX).min(60);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_backoff_caps_at_sixty_seconds() {
        assert_eq!(batch_backoff(0), Duration::from_secs(5));
        assert_eq!(batch_backoff(2), Duration::from_secs(20));
        assert_eq!(batch_backoff(10), Duration::from_secs(60));
    }

    #[test]
    fn variables_from_json_keeps_only_string_values() {
        let v = serde_json::json!({"a": "1", "b": 2});
        let out = variables_from_json(Some(v));
        assert_eq!(out.get("a"), Some(&"1".to_string()));
        assert_eq!(out.get("b"), None);
    }
}
