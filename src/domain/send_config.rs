use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Tagged union over the delivery channels a `Module` can execute. No
/// inheritance: a registry resolves the concrete implementation (see
/// `crate::module`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Module {
    Email,
    Sms,
    Push,
    Webhook,
}

/// Whether a send uses the platform's shared provider account (subject to
/// the shared-pool limiter) or a user-supplied credential (only capped if
/// explicitly configured). Carried on every job so the rate-limit registry
/// never has to infer it from ambient state (see SPEC_FULL.md open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    Managed,
    Byok,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRateLimit {
    pub per_second: u32,
}

/// User-scoped provider binding. Read-only from the worker's perspective and
/// embedded into job messages so workers never need a lookup mid-flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendConfig {
    pub id: Uuid,
    pub user_id: Uuid,
    pub module: Module,
    pub mode: RateLimitMode,
    /// Module-specific credentials/endpoint (provider API key, webhook
    /// signing secret, ...).
    pub config: serde_json::Value,
    pub rate_limit: Option<ConfigRateLimit>,
    pub is_default: bool,
    pub is_active: bool,
}

impl SendConfig {
    pub fn provider_name(&self) -> &'static str {
        match self.module {
            Module::Email => "email",
            Module::Sms => "sms",
            Module::Push => "push",
            Module::Webhook => "webhook",
        }
    }
}
