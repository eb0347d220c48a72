use std::fmt::Debug;
use std::fmt::Display;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use batchsender::configuration::get_configuration;
use batchsender::startup::run_orchestrator;
use batchsender::startup::run_sync_service;
use batchsender::startup::run_webhook_pipeline;
use batchsender::startup::Application;
use batchsender::telemetry::get_subscriber;
use batchsender::telemetry::init_subscriber;

fn report_exit(name: &str, outcome: Result<Result<(), impl Debug + Display>, JoinError>) {
    match outcome {
        Ok(Ok(())) => tracing::info!("{name} exited gracefully"),
        Ok(Err(e)) => {
            tracing::error!(error.cause_chain = ?e, error.message = %e, "{name} failed (inner)")
        }
        Err(e) => {
            tracing::error!(error.cause_chain = ?e, error.message = %e, "{name} failed (outer)")
        }
    }
}

/// Initialise telemetry, load config, and start the server plus the
/// orchestrator/sync/webhook background services.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("batchsender", "info", std::io::stdout);
    init_subscriber(subscriber);

    let cfg = get_configuration()?;
    let (app, services) = Application::build(cfg).await?;
    tracing::info!(port = app.get_port(), "listening");

    let shutdown = CancellationToken::new();

    let server_thread = tokio::spawn(app.run_until_stopped());
    let orchestrator_thread = {
        let orchestrator = services.orchestrator.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { run_orchestrator(orchestrator, shutdown).await })
    };
    let sync_thread = {
        let sync_service = services.sync_service.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_sync_service(sync_service, shutdown).await;
            Ok::<(), anyhow::Error>(())
        })
    };
    let webhook_thread = {
        let pipeline = services.webhook_pipeline.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { run_webhook_pipeline(pipeline, shutdown).await })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
        o = server_thread => {
            match o {
                Ok(Ok(())) => tracing::info!("HTTP server exited gracefully"),
                Ok(Err(e)) => tracing::error!(error = %e, "HTTP server failed"),
                Err(e) => tracing::error!(error = %e, "HTTP server task panicked"),
            }
            shutdown.cancel();
        }
    }

    let (orchestrator_outcome, sync_outcome, webhook_outcome) =
        tokio::join!(orchestrator_thread, sync_thread, webhook_thread);
    report_exit("orchestrator", orchestrator_outcome);
    report_exit("sync service", sync_outcome);
    report_exit("webhook pipeline", webhook_outcome);

    Ok(())
}
