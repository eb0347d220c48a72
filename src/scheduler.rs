//! External batch scheduler (Open Question, see DESIGN.md): deciding *when*
//! a `draft`/`scheduled` batch becomes eligible to publish to
//! `sys.batch.process` is an external collaborator's responsibility (a cron
//! sweep, a delayed-job service, ...), not this worker's. This trait exists
//! so that boundary is explicit in the type system; no implementation ships
//! here.

use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait ExternalScheduler: Send + Sync {
    /// Returns batch ids whose `scheduled_at` has elapsed and that should be
    /// handed to the orchestrator via `sys.batch.process`.
    async fn due_batches(&self) -> Result<Vec<Uuid>, anyhow::Error>;
}
