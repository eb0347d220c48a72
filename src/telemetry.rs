use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::subscriber::set_global_default;
use tracing::Subscriber;
use tracing_bunyan_formatter::BunyanFormattingLayer;
use tracing_bunyan_formatter::JsonStorageLayer;
use tracing_log::LogTracer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;

/// 'subscriber' is a `tracing` trait, and is not to be confused with a
/// subscriber of the newsletter!
pub fn get_subscriber<Sink>(name: &str, filter_level: &str, sink: Sink) -> impl Subscriber
where
    Sink: for<'a> MakeWriter<'a> + 'static,
{
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_level));
    let fmt_layer = BunyanFormattingLayer::new(name.to_string(), sink);
    Registry::default().with(env_filter).with(JsonStorageLayer).with(fmt_layer)
}

/// Start the logger and subscriber. This should be called before starting
/// the db/app.
pub fn init_subscriber(subscriber: impl Subscriber + Send + Sync) {
    LogTracer::init().unwrap();
    set_global_default(subscriber).unwrap();
}

/// Installs the `metrics` recorder backed by a Prometheus text-exposition
/// renderer; `routes::metrics::scrape` calls `PrometheusHandle::render()`.
/// Every counter/histogram/gauge name in spec §6 is registered implicitly
/// on first use — no upfront registration step needed with the `metrics`
/// facade.
pub fn init_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new().install_recorder().expect("failed to install Prometheus recorder")
}
