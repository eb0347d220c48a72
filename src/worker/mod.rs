//! User job worker (C8): one cooperative consumer per user, processing
//! `email.user.<userId>.send` messages with a bounded in-flight set. Mirrors
//! the teacher's `delivery.rs` dequeue-then-act shape, generalized from a
//! single SQL `SKIP LOCKED` dequeue to a queue-port consumer plus the
//! idempotency/rate-limit/module pipeline this spec adds.

pub mod job;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::analytics::AnalyticsEvent;
use crate::analytics::AnalyticsSink;
use crate::analytics::ProviderMessageIndexRecord;
use crate::domain::ModuleType;
use crate::domain::Recipient;
use crate::domain::RecipientStatus;
use crate::error::WorkerError;
use crate::hotstate::HotStateManager;
use crate::http_client::ResilientHttpClient;
use crate::module;
use crate::queue::new_trace_id;
use crate::queue::ConsumeOptions;
use crate::queue::MessageQueue;
use crate::queue::QueueMessage;
use crate::queue::TRACE_ID_HEADER;
use crate::rate_limit::registry::AcquireContext;
use crate::rate_limit::registry::RateLimitRegistry;
use crate::worker::job::JobData;

const EMAIL_STREAM: &str = "EMAIL";

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Max in-flight jobs per user consumer (§5, default 1000).
    pub max_concurrent: usize,
    /// JetStream `max_deliver`; `max_deliver - 1` is the retry budget before
    /// a job is recorded failed on its final attempt (§4.8.1).
    pub max_deliver: u32,
    pub rate_limit_max_wait: Duration,
    pub dry_run_latency_min_ms: u64,
    pub dry_run_latency_max_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 1000,
            max_deliver: 5,
            rate_limit_max_wait: Duration::from_secs(10),
            dry_run_latency_min_ms: 50,
            dry_run_latency_max_ms: 250,
        }
    }
}

/// Builds and runs the per-user consumer loop. One instance is shared (via
/// `Arc`) across every user the orchestrator's `ensure_user_processor`
/// starts.
pub struct UserWorkerFactory {
    pool: PgPool,
    hot_state: Arc<HotStateManager>,
    rate_limiter: Arc<RateLimitRegistry>,
    queue: Arc<dyn MessageQueue>,
    analytics: Arc<dyn AnalyticsSink>,
    http: Arc<ResilientHttpClient>,
    settings: WorkerSettings,
}

impl UserWorkerFactory {
    pub fn new(
        pool: PgPool,
        hot_state: Arc<HotStateManager>,
        rate_limiter: Arc<RateLimitRegistry>,
        queue: Arc<dyn MessageQueue>,
        analytics: Arc<dyn AnalyticsSink>,
        http: Arc<ResilientHttpClient>,
        settings: WorkerSettings,
    ) -> Self {
        Self { pool, hot_state, rate_limiter, queue, analytics, http, settings }
    }

    /// Spawns the consumer loop for `user_id` and returns its handle. Exits
    /// only on stream EOF (broker closed the subscription) or an
    /// unrecoverable consume-setup error; the orchestrator deregisters the
    /// user on exit so the next enqueue restarts it (§4.7.2).
    pub fn spawn(self: &Arc<Self>, user_id: Uuid) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run(user_id).await {
                tracing::error!(%user_id, error = %e, "user job consumer exited with error");
            }
        })
    }

    async fn run(self: Arc<Self>, user_id: Uuid) -> Result<(), anyhow::Error> {
        let subject = job::subject_for_user(user_id);
        let consumer_name = format!("user-{user_id}");
        let mut rx = self
            .queue
            .consume(ConsumeOptions {
                stream: EMAIL_STREAM,
                consumer_name: &consumer_name,
                filter_subject: Some(&subject),
                max_in_flight: self.settings.max_concurrent,
                max_deliver: self.settings.max_deliver,
            })
            .await?;

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent));
        while let Some(msg) = rx.recv().await {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                this.handle_message(msg).await;
            });
        }
        Ok(())
    }

    #[tracing::instrument(
        skip(self, msg),
        fields(trace_id = tracing::field::Empty, batch_id = tracing::field::Empty, recipient_id = tracing::field::Empty)
    )]
    async fn handle_message(self: Arc<Self>, msg: Box<dyn QueueMessage>) {
        let trace_id = msg.headers().get(TRACE_ID_HEADER).cloned().unwrap_or_else(new_trace_id);
        tracing::Span::current().record("trace_id", tracing::field::display(&trace_id));
        let redelivery = msg.redelivery_count();

        let data: JobData = match serde_json::from_slice(msg.data()) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(error = %e, "undecodable job payload, terminating message");
                if let Err(e) = msg.term().await {
                    tracing::error!(error = %e, "term failed for undecodable job");
                }
                return;
            }
        };
        tracing::Span::current()
            .record("batch_id", tracing::field::display(data.batch_id))
            .record("recipient_id", tracing::field::display(data.recipient_id));

        match self.try_process(&data).await {
            Ok(()) => {
                if let Err(e) = msg.ack().await {
                    tracing::error!(error = %e, "ack failed");
                }
            }
            Err(err) => {
                let is_final = redelivery + 1 >= self.settings.max_deliver;
                if !is_final {
                    tracing::warn!(error = %err, redelivery, "job failed, will retry");
                    if let Err(e) = msg.nak(job_backoff(redelivery)).await {
                        tracing::error!(error = %e, "nak failed");
                    }
                    return;
                }
                tracing::warn!(error = %err, redelivery, "job failed on final delivery attempt, recording failed");
                if let Err(e) = self.finalize_as_failed(&data, &err).await {
                    tracing::error!(error = %e, "could not record final failure, retrying message anyway");
                    if let Err(e) = msg.nak(job_backoff(redelivery)).await {
                        tracing::error!(error = %e, "nak failed");
                    }
                    return;
                }
                if let Err(e) = msg.ack().await {
                    tracing::error!(error = %e, "ack failed after recording final failure");
                }
            }
        }
    }

    async fn try_process(&self, data: &JobData) -> Result<(), WorkerError> {
        if self.already_terminal(data).await? {
            return Ok(());
        }

        let module = module::get_module(data.send_config.module, self.http.clone());
        let recipient = recipient_from_job(data);
        let payload = module::build_payload(
            &recipient,
            &data.batch_payload,
            data.legacy_fields.as_ref(),
            &data.send_config,
        );

        let ctx = AcquireContext {
            mode: data.send_config.mode,
            provider: data.send_config.provider_name(),
            send_config_id: data.send_config.id,
        };
        self.rate_limiter
            .acquire(
                ctx,
                data.send_config.rate_limit.as_ref().map(|r| r.per_second),
                self.settings.rate_limit_max_wait,
            )
            .await?;

        let exec = if data.dry_run {
            self.execute_dry_run().await
        } else {
            module.execute(&payload, &data.send_config.config).await
        };

        if !exec.success {
            metrics::counter!(
                "email_errors_total",
                "provider" => data.send_config.provider_name().to_string(),
                "error_type" => "module_execute_failed",
            )
            .increment(1);
            return Err(WorkerError::TransientIo(anyhow::anyhow!(
                exec.error.unwrap_or_else(|| "module execution failed".into())
            )));
        }

        // A real send can legitimately return no provider id (e.g. a
        // webhook module whose response carries no `x-request-id`); only a
        // dry run gets the `dryrun-` prefix, since that id feeds webhook
        // enrichment lookups and must never claim a live send was fake.
        let provider_message_id = exec.provider_message_id.unwrap_or_else(|| {
            if data.dry_run {
                format!("dryrun-{}", Uuid::new_v4())
            } else {
                format!("no-id-{}", Uuid::new_v4())
            }
        });
        let record_outcome = self
            .hot_state
            .record_sent(data.batch_id, data.recipient_id, provider_message_id.clone())
            .await?;

        self.buffer_sent_event(data, &provider_message_id);
        metrics::counter!(
            "emails_sent_total",
            "provider" => data.send_config.provider_name().to_string(),
            "status" => "sent",
        )
        .increment(1);
        metrics::histogram!(
            "email_send_duration_seconds",
            "provider" => data.send_config.provider_name().to_string(),
            "status" => "sent",
        )
        .record(exec.latency.as_secs_f64());

        if record_outcome.is_complete {
            self.hot_state.mark_batch_completed(data.batch_id).await?;
            metrics::counter!("batches_processed_total", "status" => "completed").increment(1);
            tracing::info!(batch_id = %data.batch_id, "batch completed");
        }

        Ok(())
    }

    /// Idempotency probe (§4.8 step 2, I3): hot state is authoritative; on
    /// circuit-open it throws, and the durable store is consulted as a
    /// fallback. If neither can verify non-terminal status the caller must
    /// retry rather than risk a duplicate send.
    async fn already_terminal(&self, data: &JobData) -> Result<bool, WorkerError> {
        match self.hot_state.check_recipient_processed(data.batch_id, data.recipient_id).await {
            Ok(Some(state)) => Ok(state.is_terminal()),
            Ok(None) => Ok(false),
            Err(WorkerError::IntegrityFault(reason)) => {
                tracing::warn!(
                    reason = %reason,
                    "hot-state idempotency probe unavailable, falling back to durable store"
                );
                match self.durable_recipient_status(data.recipient_id).await {
                    Ok(Some(status)) if status.is_terminal() => Ok(true),
                    Ok(_) => Err(WorkerError::IntegrityFault(format!(
                        "cannot verify recipient {} is unprocessed",
                        data.recipient_id
                    ))),
                    Err(e) => Err(WorkerError::IntegrityFault(e.to_string())),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn durable_recipient_status(
        &self,
        recipient_id: Uuid,
    ) -> Result<Option<RecipientStatus>, anyhow::Error> {
        let row = sqlx::query!(
            r#"SELECT status AS "status: RecipientStatus" FROM recipients WHERE id = $1"#,
            recipient_id
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.status))
    }

    async fn finalize_as_failed(&self, data: &JobData, err: &WorkerError) -> Result<(), WorkerError> {
        let error_message = err.to_string();
        let outcome = self
            .hot_state
            .record_failed(data.batch_id, data.recipient_id, error_message.clone())
            .await?;
        self.buffer_failed_event(data, &error_message);
        metrics::counter!("batches_processed_total", "status" => "partial_failure").increment(1);
        if outcome.is_complete {
            self.hot_state.mark_batch_completed(data.batch_id).await?;
            metrics::counter!("batches_processed_total", "status" => "completed").increment(1);
        }
        Ok(())
    }

    async fn execute_dry_run(&self) -> module::ExecuteResult {
        let start = std::time::Instant::now();
        let min = self.settings.dry_run_latency_min_ms;
        let max = self.settings.dry_run_latency_max_ms.max(min);
        let latency_ms = if max > min { rand::thread_rng().gen_range(min..=max) } else { min };
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        module::ExecuteResult {
            success: true,
            provider_message_id: Some(format!("dryrun-{}", Uuid::new_v4())),
            error: None,
            latency: start.elapsed(),
        }
    }

    fn buffer_sent_event(&self, data: &JobData, provider_message_id: &str) {
        self.analytics.record(AnalyticsEvent {
            event_type: "sent".into(),
            module_type: data.send_config.provider_name().into(),
            batch_id: data.batch_id,
            recipient_id: data.recipient_id,
            user_id: data.user_id,
            identifier: data.recipient_identifier.clone(),
            provider_message_id: Some(provider_message_id.to_string()),
            metadata: None,
            error_message: None,
            timestamp: chrono::Utc::now(),
        });
        if data.send_config.module == ModuleType::Email {
            self.analytics.index_provider_message(ProviderMessageIndexRecord {
                provider_message_id: provider_message_id.to_string(),
                batch_id: data.batch_id,
                recipient_id: data.recipient_id,
                user_id: data.user_id,
            });
        }
    }

    fn buffer_failed_event(&self, data: &JobData, error_message: &str) {
        self.analytics.record(AnalyticsEvent {
            event_type: "failed".into(),
            module_type: data.send_config.provider_name().into(),
            batch_id: data.batch_id,
            recipient_id: data.recipient_id,
            user_id: data.user_id,
            identifier: data.recipient_identifier.clone(),
            provider_message_id: None,
            metadata: None,
            error_message: Some(error_message.to_string()),
            timestamp: chrono::Utc::now(),
        });
    }
}

fn recipient_from_job(data: &JobData) -> Recipient {
    Recipient {
        id: data.recipient_id,
        batch_id: data.batch_id,
        identifier: data.recipient_identifier.clone(),
        name: data.recipient_name.clone(),
        variables: Some(data.recipient_variables.clone()),
        status: RecipientStatus::Queued,
        provider_message_id: None,
        sent_at: None,
        delivered_at: None,
        bounced_at: None,
        error_message: None,
    }
}

/// `1s * 2^n` capped at `30s` (§4.7.1).
fn job_backoff(redelivery_count: u32) -> Duration {
    let secs = 1u64.checked_shl(redelivery_count.min(5)).unwrap_or(u64::MAX).min(30);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_backoff_caps_at_thirty_seconds() {
        assert_eq!(job_backoff(0), Duration::from_secs(1));
        assert_eq!(job_backoff(3), Duration::from_secs(8));
        assert_eq!(job_backoff(10), Duration::from_secs(30));
    }
}
