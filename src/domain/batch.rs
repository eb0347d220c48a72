use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Lifecycle of a batch. `Paused` may only be entered from `Processing`;
/// `Completed`/`Failed` require `sent + failed == total` in hot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Draft,
    Scheduled,
    Queued,
    Processing,
    Paused,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A user-submitted set of recipients sharing a template and send
/// configuration. Owned by the durable store; mutated by the orchestrator,
/// job worker (via hot state) and sync service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub user_id: Uuid,
    pub send_config_id: Option<Uuid>,
    pub status: BatchStatus,
    pub total_recipients: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub delivered_count: i64,
    pub bounced_count: i64,
    /// Module-specific payload (subject/content templates, sms body, ...).
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
}
