//! Webhook module: posts the batch-supplied `body` to the batch-supplied
//! `url`, optionally signed with an HMAC over the raw body (mirrors the
//! inbound signature check in `routes::webhook_intake`), via the shared
//! resilient client (C5).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::Hmac;
use hmac::Mac;
use reqwest::Method;
use serde_json::Value;
use sha2::Sha256;

use super::ExecuteResult;
use super::JobPayload;
use super::Module;
use crate::http_client::ResilientHttpClient;

type HmacSha256 = Hmac<Sha256>;

const TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookModule {
    http: Arc<ResilientHttpClient>,
}

impl WebhookModule {
    pub fn new(http: Arc<ResilientHttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Module for WebhookModule {
    #[tracing::instrument(skip(self, payload, config), fields(url = payload.url.as_deref().unwrap_or("")))]
    async fn execute(&self, payload: &JobPayload, config: &Value) -> ExecuteResult {
        let start = std::time::Instant::now();
        let Some(url) = payload.url.as_deref() else {
            return ExecuteResult {
                success: false,
                provider_message_id: None,
                error: Some("job payload missing url".into()),
                latency: start.elapsed(),
            };
        };

        let body = payload.body.clone().unwrap_or_default();
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(secret) = config.get("signing_secret").and_then(Value::as_str) {
            if let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) {
                mac.update(body.as_bytes());
                let signature = hex::encode(mac.finalize().into_bytes());
                headers.push(("X-BatchSender-Signature".to_string(), signature));
            }
        }

        let outcome = self.http.request(Method::POST, url, &headers, Some(body), TIMEOUT).await;
        let provider_message_id = outcome.headers.get("x-request-id").cloned();

        ExecuteResult {
            success: outcome.success,
            provider_message_id,
            error: outcome.error,
            latency: start.elapsed(),
        }
    }
}
