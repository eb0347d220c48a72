//! NATS JetStream implementation of the message queue port. `msg_id`
//! dedup maps directly onto JetStream's `Nats-Msg-Id` header + the stream's
//! duplicate window; explicit ack/nak/term map onto the JetStream consumer
//! API.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::jetstream;
use async_nats::jetstream::consumer::pull::MessagesErrorKind;
use async_nats::jetstream::Context as JsContext;
use async_trait::async_trait;
use futures::StreamExt;

use super::ConsumeOptions;
use super::MessageQueue;
use super::PublishOptions;
use super::PublishOutcome;
use super::QueueMessage;

pub struct NatsQueue {
    jetstream: JsContext,
}

impl NatsQueue {
    pub async fn connect(cluster: &str, tls: bool) -> Result<Self, anyhow::Error> {
        let client = if tls {
            async_nats::ConnectOptions::new().require_tls(true).connect(cluster).await?
        } else {
            async_nats::connect(cluster).await?
        };
        Ok(Self { jetstream: jetstream::new(client) })
    }
}

#[async_trait]
impl MessageQueue for NatsQueue {
    #[tracing::instrument(skip(self, payload), fields(subject = %subject, msg_id = %opts.msg_id))]
    async fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        opts: PublishOptions,
    ) -> Result<PublishOutcome, anyhow::Error> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", opts.msg_id.as_str());
        for (k, v) in &opts.headers {
            headers.insert(k.as_str(), v.as_str());
        }

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload.to_vec().into())
            .await?
            .await?;

        Ok(PublishOutcome { duplicate: ack.duplicate })
    }

    async fn consume(
        &self,
        opts: ConsumeOptions<'_>,
    ) -> Result<tokio::sync::mpsc::Receiver<Box<dyn QueueMessage>>, anyhow::Error> {
        let stream_handle = self.jetstream.get_stream(opts.stream).await?;
        let consumer = stream_handle
            .get_or_create_consumer(
                opts.consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(opts.consumer_name.to_string()),
                    filter_subject: opts.filter_subject.unwrap_or_default().to_string(),
                    max_ack_pending: opts.max_in_flight as i64,
                    max_deliver: opts.max_deliver as i64,
                    ..Default::default()
                },
            )
            .await?;

        let (tx, rx) = tokio::sync::mpsc::channel(opts.max_in_flight);
        tokio::spawn(async move {
            let mut messages = match consumer.messages().await {
                Ok(m) => m,
                Err(e) => {
                    tracing::error!(error = %e, "failed to start consumer message stream");
                    return;
                }
            };
            while let Some(next) = messages.next().await {
                match next {
                    Ok(msg) => {
                        if tx.send(Box::new(NatsMessage::new(msg)) as Box<dyn QueueMessage>).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if matches!(e.kind(), MessagesErrorKind::MissingHeartbeat) => {
                        tracing::warn!("consumer missed heartbeat, continuing");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "consumer message error");
                    }
                }
            }
        });
        Ok(rx)
    }
}

struct NatsMessage {
    msg: jetstream::Message,
    headers: HashMap<String, String>,
}

impl NatsMessage {
    fn new(msg: jetstream::Message) -> Self {
        let headers = msg
            .headers
            .as_ref()
            .map(|h| {
                h.iter()
                    .map(|(name, values)| {
                        (name.as_str().to_string(), values.iter().next().map_or_else(String::new, |v| v.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { msg, headers }
    }
}

#[async_trait]
impl QueueMessage for NatsMessage {
    fn data(&self) -> &[u8] {
        &self.msg.payload
    }

    fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    fn redelivery_count(&self) -> u32 {
        self.msg.info().map(|i| i.delivered as u32).unwrap_or(1)
    }

    async fn ack(self: Box<Self>) -> Result<(), anyhow::Error> {
        self.msg.ack().await.map_err(|e| anyhow::anyhow!("ack failed: {e}"))
    }

    async fn nak(self: Box<Self>, delay: Duration) -> Result<(), anyhow::Error> {
        self.msg
            .ack_with(jetstream::AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| anyhow::anyhow!("nak failed: {e}"))
    }

    async fn term(self: Box<Self>) -> Result<(), anyhow::Error> {
        self.msg
            .ack_with(jetstream::AckKind::Term)
            .await
            .map_err(|e| anyhow::anyhow!("term failed: {e}"))
    }
}
