//! Postgres sync service (C9): drains hot state's pending-sync set into the
//! durable store and finalizes completed batches. Same periodic-loop shape
//! as the teacher's `idempotency::expiry` worker, generalized from a single
//! `DELETE` sweep to a per-batch bulk-apply reconciliation.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::BatchStatus;
use crate::hotstate::compact::CompactState;
use crate::hotstate::HotStateManager;

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub interval: Duration,
    pub max_recipients_per_sync: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self { interval: Duration::from_millis(2000), max_recipients_per_sync: 500 }
    }
}

pub struct SyncService {
    pool: PgPool,
    hot_state: Arc<HotStateManager>,
    settings: SyncSettings,
    running: AtomicBool,
}

impl SyncService {
    pub fn new(pool: PgPool, hot_state: Arc<HotStateManager>, settings: SyncSettings) -> Self {
        Self { pool, hot_state, settings, running: AtomicBool::new(false) }
    }

    /// Ticks every `settings.interval`; runs one final cycle after
    /// `shutdown` is cancelled so no committed hot-state update is lost
    /// (§4.9).
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.settings.interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("sync service shutting down, running final cycle");
                    self.run_cycle().await;
                    return;
                }
            }
        }
    }

    /// Only one cycle runs at a time per replica; concurrent callers (the
    /// timer firing again before the previous cycle returned) simply skip.
    /// Racing replicas are safe — see §4.9 concurrency note.
    async fn run_cycle(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let batch_ids = match self.hot_state.get_active_batch_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "sync cycle: could not list active batches");
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        };
        for batch_id in batch_ids {
            if let Err(e) = self.sync_batch(batch_id).await {
                tracing::error!(%batch_id, error = %e, "sync cycle failed for batch, will retry next cycle");
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn sync_batch(&self, batch_id: Uuid) -> Result<(), anyhow::Error> {
        let pending =
            self.hot_state.get_pending_sync_recipients(batch_id, self.settings.max_recipients_per_sync).await?;
        if pending.is_empty() {
            self.finalize_if_complete(batch_id).await?;
            return Ok(());
        }

        let states = self.hot_state.get_recipient_states(batch_id, &pending).await?;
        let mut sent_rows = Vec::new();
        let mut failed_rows = Vec::new();
        for (id, state) in &states {
            match state {
                CompactState::Sent { sent_at_ms, provider_message_id } => {
                    sent_rows.push((*id, ms_to_datetime(*sent_at_ms), provider_message_id.clone()));
                }
                CompactState::Failed { error_message } => {
                    failed_rows.push((*id, error_message.clone()));
                }
                // Bounced/Complained are written by the webhook pipeline
                // directly to the durable store (§4.10), never through
                // pending-sync.
                _ => {}
            }
        }

        if !sent_rows.is_empty() {
            self.bulk_apply_sent(&sent_rows).await?;
        }
        if !failed_rows.is_empty() {
            self.bulk_apply_failed(&failed_rows).await?;
        }

        let synced_ids: Vec<Uuid> = states.keys().copied().collect();
        self.hot_state.mark_synced(batch_id, &synced_ids).await?;

        let counters = self.hot_state.get_counters(batch_id).await?;
        self.mirror_counters(batch_id, counters.sent, counters.failed).await?;

        self.finalize_if_complete(batch_id).await?;
        Ok(())
    }

    /// Guarded by `status = 'queued'`: sync is the transition that first
    /// makes a recipient terminal, so it must never downgrade a row the
    /// webhook pipeline has already advanced past `sent` (I2/P4).
    async fn bulk_apply_sent(
        &self,
        rows: &[(Uuid, DateTime<Utc>, String)],
    ) -> Result<(), anyhow::Error> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.0).collect();
        let sent_ats: Vec<DateTime<Utc>> = rows.iter().map(|r| r.1).collect();
        let provider_ids: Vec<String> = rows.iter().map(|r| r.2.clone()).collect();

        sqlx::query!(
            r#"
            UPDATE recipients AS r
            SET status = 'sent', sent_at = v.sent_at, provider_message_id = v.provider_message_id,
                updated_at = now()
            FROM UNNEST($1::uuid[], $2::timestamptz[], $3::text[]) AS v(id, sent_at, provider_message_id)
            WHERE r.id = v.id AND r.status = 'queued'
            "#,
            &ids,
            &sent_ats,
            &provider_ids,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bulk_apply_failed(&self, rows: &[(Uuid, String)]) -> Result<(), anyhow::Error> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.0).collect();
        let errors: Vec<String> = rows.iter().map(|r| r.1.clone()).collect();

        sqlx::query!(
            r#"
            UPDATE recipients AS r
            SET status = 'failed', error_message = v.error_message, updated_at = now()
            FROM UNNEST($1::uuid[], $2::text[]) AS v(id, error_message)
            WHERE r.id = v.id AND r.status = 'queued'
            "#,
            &ids,
            &errors,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Last writer wins (§4.9); caps enforce P3.
    async fn mirror_counters(&self, batch_id: Uuid, sent: i64, failed: i64) -> Result<(), anyhow::Error> {
        sqlx::query!(
            r#"
            UPDATE batches
            SET sent_count = LEAST($2, total_recipients), failed_count = LEAST($3, total_recipients)
            WHERE id = $1
            "#,
            batch_id,
            sent,
            failed,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_if_complete(&self, batch_id: Uuid) -> Result<(), anyhow::Error> {
        if !self.hot_state.is_batch_complete(batch_id).await? {
            return Ok(());
        }
        let still_pending = self.hot_state.get_pending_sync_recipients(batch_id, 1).await?;
        if !still_pending.is_empty() {
            return Ok(());
        }

        let row = sqlx::query!(
            r#"SELECT status AS "status: BatchStatus" FROM batches WHERE id = $1"#,
            batch_id
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(()) };
        if row.status == BatchStatus::Completed {
            return Ok(());
        }

        sqlx::query!(
            r#"UPDATE batches SET status = 'completed', completed_at = now() WHERE id = $1"#,
            batch_id
        )
        .execute(&self.pool)
        .await?;
        self.hot_state.mark_batch_completed(batch_id).await?;
        metrics::counter!("batches_processed_total", "status" => "completed").increment(1);
        tracing::info!(%batch_id, "batch finalized by sync service");
        Ok(())
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_to_datetime_round_trips_millis() {
        let now = Utc::now();
        let ms = now.timestamp_millis();
        let back = ms_to_datetime(ms);
        assert_eq!(back.timestamp_millis(), ms);
    }

    #[test]
    fn ms_to_datetime_falls_back_to_now_on_overflow() {
        // i64::MAX milliseconds overflows what chrono can represent as a
        // `DateTime<Utc>`, so the fallback must kick in rather than panic.
        let before = Utc::now();
        let result = ms_to_datetime(i64::MAX);
        assert!(result >= before);
    }

    #[test]
    fn default_settings_match_documented_cadence() {
        let settings = SyncSettings::default();
        assert_eq!(settings.interval, Duration::from_millis(2000));
        assert_eq!(settings.max_recipients_per_sync, 500);
    }
}
