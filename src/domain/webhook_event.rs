use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// The event classes a provider callback can report. `Opened`/`Clicked`
/// never touch recipient status — they are analytics-only (§4.10c).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    Delivered,
    Bounced,
    Failed,
    Complained,
    Opened,
    Clicked,
}

/// A decoded provider callback, as published to `webhook.<provider>.<eventType>`.
/// `recipient_id`/`batch_id`/`user_id` are filled in by whichever code path
/// resolved them first — the intake adapter when it already knows, the
/// matcher otherwise (§8 ambiguity note).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    pub provider: String,
    pub event_type: WebhookEventType,
    pub provider_message_id: String,
    pub occurred_at: DateTime<Utc>,
    pub raw: Value,
    pub recipient_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub metadata: Option<Value>,
}

impl WebhookEvent {
    pub fn is_resolved(&self) -> bool {
        self.recipient_id.is_some() && self.batch_id.is_some()
    }

    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{:?}", self.provider, self.provider_message_id, self.event_type)
    }
}
