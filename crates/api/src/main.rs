//! Payment orchestrator entry point.

use api::InMemoryServices;
use api::config::Config;
use api::consumers::BookingConfirmations;
use event_bus::{DeduplicatingConsumer, InMemoryDeliveryLedger, OutboxRelay};
use reconciliation::ReconciliationScheduler;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Wire stores, provider and engine
    let services = InMemoryServices::new(&config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 4. Downstream consumer, subscribed before anything is published
    let consumer = DeduplicatingConsumer::new(
        "booking-confirmation",
        BookingConfirmations::new(),
        InMemoryDeliveryLedger::new(),
    );
    let events = services.bus.subscribe();
    let consumer_task = tokio::spawn(async move { consumer.run(events).await });

    // 5. Background workers
    let relay = OutboxRelay::new(services.store.clone(), services.bus.clone());
    let relay_task = tokio::spawn(relay.run(shutdown_rx.clone()));

    let scheduler = ReconciliationScheduler::new(
        config.node_id.clone(),
        services.leases.clone(),
        services.machine().clone(),
        config.scheduler(),
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    // 6. Start server
    let app = api::create_app(services.state.clone(), metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, node_id = %config.node_id, "starting payment orchestrator");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Stop background workers
    let _ = shutdown_tx.send(true);
    if let Err(err) = relay_task.await {
        tracing::error!(error = %err, "outbox relay task failed");
    }
    if let Err(err) = scheduler_task.await {
        tracing::error!(error = %err, "reconciliation task failed");
    }
    consumer_task.abort();

    tracing::info!("server shut down gracefully");
}
