//! Analytics sink (external collaborator, §1/§6): an append-only event log
//! (ClickHouse) plus a provider-message-id index used by the webhook
//! pipeline to resolve inbound callbacks back to `(batch_id, recipient_id,
//! user_id)`. The core only ever writes here; it is never read back except
//! through `lookup_provider_message` during enrichment (§4.10).

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use clickhouse::Row;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct AnalyticsEvent {
    pub event_type: String,
    pub module_type: String,
    pub batch_id: Uuid,
    pub recipient_id: Uuid,
    pub user_id: Uuid,
    pub identifier: String,
    pub provider_message_id: Option<String>,
    pub metadata: Option<String>,
    pub error_message: Option<String>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Row)]
pub struct ProviderMessageIndexRecord {
    pub provider_message_id: String,
    pub batch_id: Uuid,
    pub recipient_id: Uuid,
    pub user_id: Uuid,
}

/// Resolved by `lookup_provider_message` during webhook enrichment.
#[derive(Debug, Clone, Copy)]
pub struct ProviderMessageLocation {
    pub batch_id: Uuid,
    pub recipient_id: Uuid,
    pub user_id: Uuid,
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Buffers a transition event for the next flush; never blocks on the
    /// network.
    fn record(&self, event: AnalyticsEvent);

    /// Buffers a provider-message-id index write (email module only, §4.8).
    fn index_provider_message(&self, record: ProviderMessageIndexRecord);

    /// Consults the analytics store directly (cache and durable-store
    /// fallbacks live in `crate::webhook::matcher`).
    async fn lookup_provider_message(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<ProviderMessageLocation>, anyhow::Error>;

    /// Drains any buffered events. Awaited during shutdown (§5).
    async fn close(&self);
}

enum BufferedWrite {
    Event(AnalyticsEvent),
    Index(ProviderMessageIndexRecord),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Buffers writes in-process and flushes on a timer or when `batch_size` is
/// reached, the same batch-then-flush shape as the webhook pipeline's intake
/// buffer (§4.10).
pub struct ClickHouseAnalyticsSink {
    client: clickhouse::Client,
    tx: mpsc::UnboundedSender<BufferedWrite>,
}

impl ClickHouseAnalyticsSink {
    pub fn new(url: &str, database: &str, batch_size: usize, flush_interval: Duration) -> Self {
        let client = clickhouse::Client::default().with_url(url).with_database(database);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_flusher(client.clone(), rx, batch_size, flush_interval));
        Self { client, tx }
    }

    async fn run_flusher(
        client: clickhouse::Client,
        mut rx: mpsc::UnboundedReceiver<BufferedWrite>,
        batch_size: usize,
        flush_interval: Duration,
    ) {
        let mut events = Vec::with_capacity(batch_size);
        let mut index_records = Vec::with_capacity(batch_size);
        let mut tick = tokio::time::interval(flush_interval);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(BufferedWrite::Event(e)) => events.push(e),
                        Some(BufferedWrite::Index(i)) => index_records.push(i),
                        Some(BufferedWrite::Flush(ack)) => {
                            Self::flush(&client, &mut events, &mut index_records).await;
                            let _ = ack.send(());
                        }
                        None => {
                            Self::flush(&client, &mut events, &mut index_records).await;
                            return;
                        }
                    }
                    if events.len() >= batch_size || index_records.len() >= batch_size {
                        Self::flush(&client, &mut events, &mut index_records).await;
                    }
                }
                _ = tick.tick() => {
                    Self::flush(&client, &mut events, &mut index_records).await;
                }
            }
        }
    }

    async fn flush(
        client: &clickhouse::Client,
        events: &mut Vec<AnalyticsEvent>,
        index_records: &mut Vec<ProviderMessageIndexRecord>,
    ) {
        if !events.is_empty() {
            if let Err(e) = Self::insert_all(client, "events", events.drain(..)).await {
                tracing::error!(error = %e, "analytics event flush failed");
            }
        }
        if !index_records.is_empty() {
            if let Err(e) = Self::insert_all(client, "provider_message_index", index_records.drain(..)).await
            {
                tracing::error!(error = %e, "provider-message-index flush failed");
            }
        }
    }

    async fn insert_all<T: Row + Serialize>(
        client: &clickhouse::Client,
        table: &str,
        rows: impl Iterator<Item = T>,
    ) -> Result<(), clickhouse::error::Error> {
        let mut insert = client.insert(table)?;
        for row in rows {
            insert.write(&row).await?;
        }
        insert.end().await
    }
}

#[async_trait]
impl AnalyticsSink for ClickHouseAnalyticsSink {
    fn record(&self, event: AnalyticsEvent) {
        if self.tx.send(BufferedWrite::Event(event)).is_err() {
            tracing::error!("analytics sink flusher task is gone, dropping event");
        }
    }

    fn index_provider_message(&self, record: ProviderMessageIndexRecord) {
        if self.tx.send(BufferedWrite::Index(record)).is_err() {
            tracing::error!("analytics sink flusher task is gone, dropping index record");
        }
    }

    async fn lookup_provider_message(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<ProviderMessageLocation>, anyhow::Error> {
        let row = self
            .client
            .query(
                "SELECT batch_id, recipient_id, user_id FROM provider_message_index \
                 WHERE provider_message_id = ? LIMIT 1",
            )
            .bind(provider_message_id)
            .fetch_optional::<ProviderMessageIndexRecord>()
            .await?;
        Ok(row.map(|r| ProviderMessageLocation {
            batch_id: r.batch_id,
            recipient_id: r.recipient_id,
            user_id: r.user_id,
        }))
    }

    async fn close(&self) {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        if self.tx.send(BufferedWrite::Flush(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}
