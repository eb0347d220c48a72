//! HTTP boundary for provider callbacks (§4.10 "Intake"). Verifies the
//! shared-secret signature, decodes a provider-agnostic envelope into a
//! `WebhookEvent`, and republishes it onto `webhook.<provider>.<eventType>`
//! for C10 to pick up — this route does no enrichment or DB work itself.

use std::sync::Arc;

use actix_web::web;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use hmac::Hmac;
use hmac::Mac;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use sha2::Sha256;

use crate::domain::WebhookEvent;
use crate::domain::WebhookEventType;
use crate::queue::new_trace_id;
use crate::queue::MessageQueue;
use crate::queue::PublishOptions;

pub struct WebhookIntakeState {
    pub queue: Arc<dyn MessageQueue>,
    pub webhook_secret: Secret<String>,
}

/// The provider-specific envelope shapes (Resend/SES/Telnyx/...) are
/// adapted externally; this endpoint accepts the single normalized
/// envelope they're translated into before reaching BatchSender.
#[derive(Deserialize)]
struct InboundWebhookPayload {
    id: String,
    #[serde(rename = "type")]
    event_type: WebhookEventType,
    provider_message_id: String,
    occurred_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    recipient_id: Option<uuid::Uuid>,
    #[serde(default)]
    batch_id: Option<uuid::Uuid>,
    #[serde(default)]
    user_id: Option<uuid::Uuid>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(flatten)]
    raw: serde_json::Value,
}

pub async fn webhook_intake(
    path: web::Path<String>,
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<WebhookIntakeState>,
) -> HttpResponse {
    let provider = path.into_inner();

    if !signature_valid(&req, &body, &state.webhook_secret) {
        metrics::counter!("webhooks_errors_total", "error_type" => "bad_signature").increment(1);
        return HttpResponse::Unauthorized().finish();
    }

    let payload: InboundWebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, %provider, "undecodable webhook payload");
            metrics::counter!("webhooks_errors_total", "error_type" => "decode").increment(1);
            return HttpResponse::BadRequest().finish();
        }
    };

    let event = WebhookEvent {
        id: payload.id.clone(),
        provider: provider.clone(),
        event_type: payload.event_type,
        provider_message_id: payload.provider_message_id,
        occurred_at: payload.occurred_at,
        raw: payload.raw,
        recipient_id: payload.recipient_id,
        batch_id: payload.batch_id,
        user_id: payload.user_id,
        metadata: payload.metadata,
    };

    let subject = format!("webhook.{}.{}", provider, event_type_segment(event.event_type));
    let body = match serde_json::to_vec(&event) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode webhook event for publish");
            return HttpResponse::InternalServerError().finish();
        }
    };

    let mut headers = std::collections::HashMap::new();
    headers.insert(crate::queue::TRACE_ID_HEADER.to_string(), new_trace_id());

    match state
        .queue
        .publish(&subject, &body, PublishOptions { msg_id: payload.id, headers })
        .await
    {
        Ok(_) => HttpResponse::Ok().finish(),
        Err(e) => {
            tracing::error!(error = %e, %subject, "failed to publish webhook event");
            metrics::counter!("enqueue_failures_total", "queue" => subject).increment(1);
            HttpResponse::ServiceUnavailable().finish()
        }
    }
}

fn event_type_segment(event_type: WebhookEventType) -> &'static str {
    match event_type {
        WebhookEventType::Delivered => "delivered",
        WebhookEventType::Bounced => "bounced",
        WebhookEventType::Failed => "failed",
        WebhookEventType::Complained => "complained",
        WebhookEventType::Opened => "opened",
        WebhookEventType::Clicked => "clicked",
    }
}

fn signature_valid(req: &HttpRequest, body: &[u8], secret: &Secret<String>) -> bool {
    let Some(header) = req.headers().get("X-Webhook-Signature").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Ok(expected) = hex::decode(header) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.expose_secret().as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
