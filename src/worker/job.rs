//! `JobData`: the message shape published to `email.user.<userId>.send`
//! (§6). Carries everything the job worker needs to build a `JobPayload`
//! itself (§4.8 step 4) rather than the already-built payload, so a module
//! swap or template change on the send-config side takes effect without
//! republishing in-flight jobs.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::SendConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    pub batch_id: Uuid,
    pub recipient_id: Uuid,
    pub user_id: Uuid,
    pub recipient_identifier: String,
    pub recipient_name: Option<String>,
    #[serde(default)]
    pub recipient_variables: HashMap<String, String>,
    pub send_config: SendConfig,
    pub batch_payload: serde_json::Value,
    /// Present only on jobs published by an older orchestrator that
    /// flattened module fields onto the job instead of `batch_payload`
    /// (§4.11 field-resolution priority, tier 2).
    #[serde(default)]
    pub legacy_fields: Option<serde_json::Value>,
    #[serde(default)]
    pub dry_run: bool,
}

pub fn subject_for_user(user_id: Uuid) -> String {
    format!("email.user.{user_id}.send")
}

pub fn msg_id(batch_id: Uuid, recipient_id: Uuid) -> String {
    format!("email-{batch_id}-{recipient_id}")
}
