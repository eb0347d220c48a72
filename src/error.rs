//! Component-boundary error taxonomy (spec §7). Internals propagate
//! `anyhow::Error` with `.context(...)`; at a component seam the error is
//! converted into one of these variants so the caller can decide whether to
//! retry, NACK with backoff, or fail the process outright.

/// Which limiter in the composition (C2) refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitingFactor {
    System,
    Provider,
    Config,
}

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    /// KV/durable-store/queue error not classifiable as permanent. Retried by
    /// the originating subsystem.
    #[error("transient I/O error: {0}")]
    TransientIo(#[source] anyhow::Error),

    /// Limiter denied within the wait budget. Job retries with backoff.
    #[error("rate limited by {factor:?} limiter, wait {wait_ms}ms")]
    RateLimited { factor: LimitingFactor, wait_ms: u64 },

    /// 4xx-class provider error or invalid input.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Hot-state memory or in-flight-limit refusal.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// Hot-state circuit open during an idempotency probe; the durable-store
    /// fallback could not resolve the status either. Never assume
    /// unprocessed when we can't verify (I3).
    #[error("cannot verify recipient state: {0}")]
    IntegrityFault(String),

    /// Required config missing or schema invalid. Process fails to start.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
}

impl WorkerError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_) | Self::FatalConfig(_))
    }
}
