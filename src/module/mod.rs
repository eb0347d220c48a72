//! Module port (C11): the single outbound seam. Each channel owns its own
//! network client, signing, and error mapping; a registry resolves the
//! concrete implementation by tag. No inheritance — a capability trait plus
//! a tagged union (`crate::domain::ModuleType`).

pub mod email;
pub mod push;
pub mod sms;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::domain::ModuleType;
use crate::domain::Recipient;
use crate::domain::SendConfig;
use crate::http_client::ResilientHttpClient;

#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub success: bool,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub latency: Duration,
}

#[async_trait]
pub trait Module: Send + Sync {
    async fn execute(&self, payload: &JobPayload, config: &Value) -> ExecuteResult;
}

/// Every module shares the one resilient HTTP client (C5) so retries and the
/// circuit breaker apply uniformly across channels.
pub fn get_module(module_type: ModuleType, http: Arc<ResilientHttpClient>) -> Box<dyn Module> {
    match module_type {
        ModuleType::Email => Box::new(email::EmailModule::new(http)),
        ModuleType::Sms => Box::new(sms::SmsModule::new(http)),
        ModuleType::Push => Box::new(push::PushModule::new(http)),
        ModuleType::Webhook => Box::new(webhook::WebhookModule::new(http)),
    }
}

/// Module-specific payload shape, built by `build_payload` from three layers
/// of precedence: explicit per-batch payload fields, legacy top-level job
/// fields, then send-config defaults (§4.11).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPayload {
    pub to: String,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub from_number: Option<String>,
    pub subject: Option<String>,
    pub html_content: Option<String>,
    pub text_content: Option<String>,
    pub message: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub data: Option<Value>,
    pub url: Option<String>,
    pub variables: HashMap<String, String>,
}

/// `{{key}}` substitution with `{{name}}`/`{{email}}` conveniences (§4.8.2).
/// Unknown tokens are left unchanged.
pub fn substitute_template(template: &str, recipient: &Recipient) -> String {
    let mut vars = recipient.variables.clone().unwrap_or_default();
    vars.entry("email".to_string()).or_insert_with(|| recipient.identifier.clone());
    if let Some(name) = &recipient.name {
        vars.entry("name".to_string()).or_insert_with(|| name.clone());
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        if let Some(end) = after.find("}}") {
            let key = after[..end].trim();
            match vars.get(key) {
                Some(value) => out.push_str(value),
                None => {
                    out.push_str("{{");
                    out.push_str(key);
                    out.push_str("}}");
                }
            }
            rest = &after[end + 2..];
        } else {
            out.push_str("{{");
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

/// Resolves the right payload shape for a module type, honoring the
/// explicit-batch > legacy-top-level-job-field > send-config-default
/// priority (§4.11). `legacy_job_fields` exists for jobs published by an
/// older orchestrator version that flattened these fields onto the job
/// itself instead of nesting them under the batch payload; freshly
/// published jobs leave it empty and fall straight through to `defaults`.
pub fn build_payload(
    recipient: &Recipient,
    batch_payload: &Value,
    legacy_job_fields: Option<&Value>,
    send_config: &SendConfig,
) -> JobPayload {
    let defaults = &send_config.config;
    let empty = Value::Null;
    let legacy = legacy_job_fields.unwrap_or(&empty);
    let field = |name: &str| -> Option<String> {
        batch_payload
            .get(name)
            .and_then(Value::as_str)
            .or_else(|| legacy.get(name).and_then(Value::as_str))
            .or_else(|| defaults.get(name).and_then(Value::as_str))
            .map(str::to_string)
    };

    let mut payload = JobPayload {
        to: recipient.identifier.clone(),
        from_email: field("from_email"),
        from_name: field("from_name"),
        from_number: field("from_number"),
        subject: field("subject"),
        html_content: field("html_content"),
        text_content: field("text_content"),
        message: field("message"),
        title: field("title"),
        body: field("body"),
        data: batch_payload.get("data").cloned(),
        url: field("url").or_else(|| defaults.get("url").and_then(Value::as_str).map(str::to_string)),
        variables: recipient.variables.clone().unwrap_or_default(),
    };

    payload.subject = payload.subject.map(|s| substitute_template(&s, recipient));
    payload.html_content = payload.html_content.map(|s| substitute_template(&s, recipient));
    payload.text_content = payload.text_content.map(|s| substitute_template(&s, recipient));
    payload.message = payload.message.map(|s| substitute_template(&s, recipient));
    payload.body = payload.body.map(|s| substitute_template(&s, recipient));

    match send_config.module {
        ModuleType::Webhook => {
            payload.url = payload.url.or_else(|| defaults.get("url").and_then(Value::as_str).map(str::to_string));
        }
        ModuleType::Push => {
            payload.to = recipient.identifier.clone();
        }
        _ => {}
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RecipientStatus;

    fn build(recipient: &Recipient, batch_payload: Value, send_config: &SendConfig) -> JobPayload {
        build_payload(recipient, &batch_payload, None, send_config)
    }

    fn recipient() -> Recipient {
        Recipient {
            id: uuid::Uuid::new_v4(),
            batch_id: uuid::Uuid::new_v4(),
            identifier: "jane@example.com".into(),
            name: Some("Jane".into()),
            variables: Some(HashMap::from([("coupon".to_string(), "SAVE10".to_string())])),
            status: RecipientStatus::Pending,
            provider_message_id: None,
            sent_at: None,
            delivered_at: None,
            bounced_at: None,
            error_message: None,
        }
    }

    #[test]
    fn substitutes_known_tokens_and_conveniences() {
        let r = recipient();
        let out = substitute_template("Hi {{name}}, use {{coupon}} at {{email}}", &r);
        assert_eq!(out, "Hi Jane, use SAVE10 at jane@example.com");
    }

    #[test]
    fn leaves_unknown_tokens_unchanged() {
        let r = recipient();
        let out = substitute_template("Hello {{nickname}}", &r);
        assert_eq!(out, "Hello {{nickname}}");
    }

    fn send_config(config: Value) -> SendConfig {
        SendConfig {
            id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            module: ModuleType::Email,
            mode: crate::domain::RateLimitMode::Managed,
            config,
            rate_limit: None,
            is_default: true,
            is_active: true,
        }
    }

    #[test]
    fn explicit_batch_payload_wins_over_send_config_defaults() {
        let r = recipient();
        let cfg = send_config(serde_json::json!({"subject": "default subject"}));
        let payload = build(&r, serde_json::json!({"subject": "Hi {{name}}"}), &cfg);
        assert_eq!(payload.subject.as_deref(), Some("Hi Jane"));
    }

    #[test]
    fn send_config_default_used_when_batch_payload_silent() {
        let r = recipient();
        let cfg = send_config(serde_json::json!({"subject": "Fallback for {{name}}"}));
        let payload = build(&r, serde_json::json!({}), &cfg);
        assert_eq!(payload.subject.as_deref(), Some("Fallback for Jane"));
    }

    #[test]
    fn legacy_job_field_resolves_between_batch_payload_and_defaults() {
        let r = recipient();
        let cfg = send_config(serde_json::json!({"subject": "default"}));
        let payload = build_payload(
            &r,
            &serde_json::json!({}),
            Some(&serde_json::json!({"subject": "legacy subject"})),
            &cfg,
        );
        assert_eq!(payload.subject.as_deref(), Some("legacy subject"));
    }
}
