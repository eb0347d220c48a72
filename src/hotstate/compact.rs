//! Compact per-recipient state encoding (§4.3.1). Chosen over a JSON record
//! to cut per-recipient hot-state footprint by roughly 4-5x. The decoder
//! tolerates legacy JSON values (starting with `{`) so a rolling deploy can
//! migrate without a flag day.

use crate::domain::RecipientStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum CompactState {
    Pending,
    Queued,
    Sent { sent_at_ms: i64, provider_message_id: String },
    Failed { error_message: String },
    Bounced { error_message: String },
    Complained { error_message: String },
}

impl CompactState {
    pub fn status(&self) -> RecipientStatus {
        match self {
            Self::Pending => RecipientStatus::Pending,
            Self::Queued => RecipientStatus::Queued,
            Self::Sent { .. } => RecipientStatus::Sent,
            Self::Failed { .. } => RecipientStatus::Failed,
            Self::Bounced { .. } => RecipientStatus::Bounced,
            Self::Complained { .. } => RecipientStatus::Complained,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Pending => "p".to_string(),
            Self::Queued => "q".to_string(),
            Self::Sent { sent_at_ms, provider_message_id } => {
                format!("s:{sent_at_ms}:{provider_message_id}")
            }
            Self::Failed { error_message } => format!("f:{error_message}"),
            Self::Bounced { error_message } => format!("b:{error_message}"),
            Self::Complained { error_message } => format!("c:{error_message}"),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, anyhow::Error> {
        if raw.starts_with('{') {
            return Self::decode_legacy_json(raw);
        }
        let mut parts = raw.splitn(3, ':');
        let code = parts.next().ok_or_else(|| anyhow::anyhow!("empty compact state"))?;
        match code {
            "p" => Ok(Self::Pending),
            "q" => Ok(Self::Queued),
            "s" => {
                let sent_at_ms: i64 = parts
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("missing sentAt in compact state"))?
                    .parse()?;
                let provider_message_id = parts.next().unwrap_or_default().to_string();
                Ok(Self::Sent { sent_at_ms, provider_message_id })
            }
            "f" | "b" | "c" => {
                let rest = raw.splitn(2, ':').nth(1).unwrap_or_default();
                let error_message = rest.to_string();
                Ok(match code {
                    "f" => Self::Failed { error_message },
                    "b" => Self::Bounced { error_message },
                    _ => Self::Complained { error_message },
                })
            }
            other => anyhow::bail!("unknown compact status code: {other:?}"),
        }
    }

    /// Legacy (pre-compact-encoding) records were a full JSON object:
    /// `{"status": "sent", "providerMessageId": "...", "sentAt": ...}`.
    fn decode_legacy_json(raw: &str) -> Result<Self, anyhow::Error> {
        #[derive(serde::Deserialize)]
        struct Legacy {
            status: String,
            #[serde(default)]
            provider_message_id: Option<String>,
            #[serde(default)]
            sent_at: Option<i64>,
            #[serde(default)]
            error_message: Option<String>,
        }
        let legacy: Legacy = serde_json::from_str(raw)?;
        Ok(match legacy.status.as_str() {
            "pending" => Self::Pending,
            "queued" => Self::Queued,
            "sent" => Self::Sent {
                sent_at_ms: legacy.sent_at.unwrap_or_default(),
                provider_message_id: legacy.provider_message_id.unwrap_or_default(),
            },
            "failed" => Self::Failed { error_message: legacy.error_message.unwrap_or_default() },
            "bounced" => Self::Bounced { error_message: legacy.error_message.unwrap_or_default() },
            "complained" => {
                Self::Complained { error_message: legacy.error_message.unwrap_or_default() }
            }
            other => anyhow::bail!("unknown legacy status: {other:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(s: CompactState) {
        let encoded = s.encode();
        let decoded = CompactState::decode(&encoded).unwrap();
        assert_eq!(s, decoded);
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(CompactState::Pending);
        round_trip(CompactState::Queued);
        round_trip(CompactState::Sent { sent_at_ms: 1234, provider_message_id: "msg-1".into() });
        round_trip(CompactState::Failed { error_message: "timeout".into() });
        round_trip(CompactState::Bounced { error_message: "mailbox full".into() });
        round_trip(CompactState::Complained { error_message: "spam".into() });
    }

    #[test]
    fn decodes_legacy_json() {
        let raw = r#"{"status":"sent","provider_message_id":"abc","sent_at":42}"#;
        let decoded = CompactState::decode(raw).unwrap();
        assert_eq!(
            decoded,
            CompactState::Sent { sent_at_ms: 42, provider_message_id: "abc".into() }
        );
    }

    #[quickcheck_macros::quickcheck]
    fn encode_decode_is_lossless_for_sent(sent_at_ms: i64, suffix: String) -> bool {
        let provider_message_id: String = suffix.chars().filter(|c| *c != ':').collect();
        let s = CompactState::Sent { sent_at_ms, provider_message_id };
        matches!(CompactState::decode(&s.encode()), Ok(decoded) if decoded == s)
    }
}
