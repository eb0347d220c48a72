mod batch;
mod recipient;
mod send_config;
mod webhook_event;

pub use batch::Batch;
pub use batch::BatchStatus;
pub use recipient::Recipient;
pub use recipient::RecipientStatus;
pub use send_config::Module as ModuleType;
pub use send_config::RateLimitMode;
pub use send_config::SendConfig;
pub use webhook_event::WebhookEvent;
pub use webhook_event::WebhookEventType;
