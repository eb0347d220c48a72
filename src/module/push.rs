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
struct SendPushRequest<'a> {
    to: &'a str,
    title: &'a str,
    body: &'a str,
    data: &'a Value,
}

pub struct PushModule {
    http: Arc<ResilientHttpClient>,
}

impl PushModule {
    pub fn new(http: Arc<ResilientHttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Module for PushModule {
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
        let empty = Value::Null;
        let body = SendPushRequest {
            to: &payload.to,
            title: payload.title.as_deref().unwrap_or_default(),
            body: payload.body.as_deref().unwrap_or_default(),
            data: payload.data.as_ref().unwrap_or(&empty),
        };
        let Ok(body) = serde_json::to_string(&body) else {
            return ExecuteResult {
                success: false,
                provider_message_id: None,
                error: Some("failed to encode push payload".into()),
                latency: start.elapsed(),
            };
        };

        let outcome = self
            .http
            .request(
                Method::POST,
                &format!("{base_url}/push"),
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
            .and_then(|v| v.get("messageId").and_then(Value::as_str).map(str::to_string));

        ExecuteResult {
            success: outcome.success,
            provider_message_id,
            error: outcome.error,
            latency: start.elapsed(),
        }
    }
}
