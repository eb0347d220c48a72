//! Email module. The actual provider SDK is out of scope (§1) — this talks
//! to whatever HTTP transactional-email endpoint `config.base_url` names,
//! via the shared resilient client (C5) in the same shape as the teacher's
//! `EmailClient`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;

use super::ExecuteResult;
use super::JobPayload;
use super::Module;
use crate::http_client::ResilientHttpClient;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: String,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

pub struct EmailModule {
    http: Arc<ResilientHttpClient>,
}

impl EmailModule {
    pub fn new(http: Arc<ResilientHttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Module for EmailModule {
    #[tracing::instrument(skip(self, payload, config), fields(to = %payload.to))]
    async fn execute(&self, payload: &JobPayload, config: &Value) -> ExecuteResult {
        let start = std::time::Instant::now();
        let Some(base_url) = config.get("base_url").and_then(Value::as_str) else {
            return ExecuteResult {
                success: false,
                provider_message_id: None,
                error: Some("send_config missing base_url".into()),
                latency: start.elapsed(),
            };
        };
        let token = config.get("auth_token").and_then(Value::as_str).unwrap_or_default();

        let from = format!(
            "{} <{}>",
            payload.from_name.clone().unwrap_or_default(),
            payload.from_email.clone().unwrap_or_default()
        );
        let body = SendEmailRequest {
            from,
            to: &payload.to,
            subject: payload.subject.as_deref().unwrap_or_default(),
            html: payload.html_content.as_deref().unwrap_or_default(),
            text: payload.text_content.as_deref().unwrap_or_default(),
        };
        let Ok(body) = serde_json::to_string(&body) else {
            return ExecuteResult {
                success: false,
                provider_message_id: None,
                error: Some("failed to encode email payload".into()),
                latency: start.elapsed(),
            };
        };

        let outcome = self
            .http
            .request(
                Method::POST,
                &format!("{base_url}/email"),
                &[
                    ("Authorization".to_string(), format!("Bearer {token}")),
                    ("Content-Type".to_string(), "application/json".to_string()),
                ],
                Some(body),
                TIMEOUT,
            )
            .await;

        let provider_message_id = outcome
            .success
            .then(|| outcome.body.as_deref())
            .flatten()
            .and_then(|b| serde_json::from_str::<Value>(b).ok())
            .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string));

        ExecuteResult {
            success: outcome.success,
            provider_message_id,
            error: outcome.error,
            latency: start.elapsed(),
        }
    }
}
