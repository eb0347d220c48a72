mod health_check;
mod metrics;
mod webhook_intake;

pub use health_check::health_check;
pub use metrics::metrics_scrape;
pub use webhook_intake::webhook_intake;
pub use webhook_intake::WebhookIntakeState;
