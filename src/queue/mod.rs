//! Message queue port (C6): an abstract contract implementable over any
//! durable stream broker offering per-message dedup and explicit ack. The
//! only concrete implementation shipped here targets NATS JetStream
//! (`crate::queue::nats`); a `Module`-style registry isn't needed since
//! there is exactly one transport, but the trait keeps the orchestrator and
//! workers decoupled from it for testing.

pub mod nats;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub const TRACE_ID_HEADER: &str = "X-Trace-Id";

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub msg_id: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub duplicate: bool,
}

/// Durable pull-consumer parameters. `filter_subject` scopes a consumer to
/// one subject within a multi-subject stream (the per-user job consumers
/// all share one `EMAIL` stream but each filters to its own
/// `email.user.<id>.send`); `None` consumes every subject on the stream.
#[derive(Debug, Clone)]
pub struct ConsumeOptions<'a> {
    pub stream: &'a str,
    pub consumer_name: &'a str,
    pub filter_subject: Option<&'a str>,
    pub max_in_flight: usize,
    pub max_deliver: u32,
}

/// A delivered message. `ack`/`nak`/`term` consume `self` because each may
/// only be called once per delivery.
#[async_trait]
pub trait QueueMessage: Send + Sync {
    fn data(&self) -> &[u8];
    fn headers(&self) -> &HashMap<String, String>;
    fn redelivery_count(&self) -> u32;
    async fn ack(self: Box<Self>) -> Result<(), anyhow::Error>;
    async fn nak(self: Box<Self>, delay: Duration) -> Result<(), anyhow::Error>;
    async fn term(self: Box<Self>) -> Result<(), anyhow::Error>;
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        opts: PublishOptions,
    ) -> Result<PublishOutcome, anyhow::Error>;

    /// Pulls up to `opts.max_in_flight` messages at a time, redelivering up
    /// to `opts.max_deliver` times on nak/crash.
    async fn consume(
        &self,
        opts: ConsumeOptions<'_>,
    ) -> Result<tokio::sync::mpsc::Receiver<Box<dyn QueueMessage>>, anyhow::Error>;
}

/// Builds a 12-char base62 trace id for `X-Trace-Id` propagation (§6).
pub fn new_trace_id() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..12).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}

#[cfg(test)]
mod tests {
    use super::new_trace_id;

    #[test]
    fn trace_id_is_twelve_base62_chars() {
        let id = new_trace_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
