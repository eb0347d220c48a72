use std::collections::HashMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Terminal statuses (`Sent`, `Failed`, `Bounced`, `Complained`) are one-way:
/// a recipient never transitions back to a non-terminal status (I2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Queued,
    Sent,
    Failed,
    Bounced,
    Complained,
}

impl RecipientStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Bounced | Self::Complained)
    }
}

/// One delivery target within a batch, addressed by a channel-specific
/// identifier (email address, phone number, device token, webhook URL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub identifier: String,
    pub name: Option<String>,
    pub variables: Option<HashMap<String, String>>,
    pub status: RecipientStatus,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}
