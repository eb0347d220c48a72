//! Rate-limit registry (C2): composes the system-wide, shared-provider and
//! per-config token buckets per spec §4.2.

use std::time::Duration;

use crate::domain::RateLimitMode;
use crate::error::LimitingFactor;
use crate::error::WorkerError;
use crate::rate_limit::bucket::TokenBucket;

pub struct AcquireContext<'a> {
    pub mode: RateLimitMode,
    pub provider: &'a str,
    pub send_config_id: uuid::Uuid,
}

pub struct RegistrySettings {
    pub system_rate_per_second: u32,
    pub default_provider_rate_per_second: u32,
    pub disabled: bool,
}

pub struct RateLimitRegistry {
    bucket: TokenBucket,
    settings: RegistrySettings,
}

impl RateLimitRegistry {
    pub fn new(bucket: TokenBucket, settings: RegistrySettings) -> Self {
        Self { bucket, settings }
    }

    /// `mode=managed`: system -> shared provider pool -> per-config, all
    /// must succeed. `mode=byok`: only the per-config bucket applies, and
    /// only if the caller supplied a limit — otherwise unlimited (P6).
    #[tracing::instrument(skip(self, ctx), fields(mode = ?ctx.mode, provider = %ctx.provider))]
    pub async fn acquire(
        &self,
        ctx: AcquireContext<'_>,
        config_limit_per_second: Option<u32>,
        max_wait: Duration,
    ) -> Result<(), WorkerError> {
        if self.settings.disabled {
            return Ok(());
        }

        if matches!(ctx.mode, RateLimitMode::Managed) {
            let system = self
                .bucket
                .acquire("ratelimit:system", self.settings.system_rate_per_second, 1, max_wait)
                .await;
            if !system.allowed {
                return Err(WorkerError::RateLimited {
                    factor: LimitingFactor::System,
                    wait_ms: system.wait_ms,
                });
            }

            let provider_key = format!("ratelimit:provider:{}", ctx.provider);
            let provider = self
                .bucket
                .acquire(&provider_key, self.settings.default_provider_rate_per_second, 1, max_wait)
                .await;
            if !provider.allowed {
                return Err(WorkerError::RateLimited {
                    factor: LimitingFactor::Provider,
                    wait_ms: provider.wait_ms,
                });
            }
        }

        if let Some(rate) = config_limit_per_second {
            let config_key = format!("ratelimit:config:{}", ctx.send_config_id);
            let config = self.bucket.acquire(&config_key, rate, 1, max_wait).await;
            if !config.allowed {
                return Err(WorkerError::RateLimited {
                    factor: LimitingFactor::Config,
                    wait_ms: config.wait_ms,
                });
            }
        }

        Ok(())
    }
}
