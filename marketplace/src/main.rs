//! Orders-side consumer process.
//!
//! Keeps ticket replicas current from the broker and answers stream health
//! probes until SIGINT or SIGTERM.

use anyhow::Context;
use std::sync::Arc;
use ticketbus_core::Broker;
use ticketbus_core::events::StreamHealthPing;
use ticketbus_marketplace::{Config, ReplicationApp, TicketReplica};
use ticketbus_postgres::PostgresReplicaRepository;
use ticketbus_redpanda::RedpandaBroker;
use ticketbus_runtime::metrics::MetricsServer;
use ticketbus_runtime::{Publisher, shutdown_signal};
use ticketbus_testing::InMemoryReplicaRepository;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let identity = config.identity()?;
    info!(
        broker = %config.broker.url,
        cluster_id = identity.cluster_id(),
        client_id = identity.client_id(),
        queue_group = %identity.queue_group(),
        "Configuration loaded"
    );

    let mut metrics = config.metrics_addr.map(MetricsServer::new);
    if let Some(server) = metrics.as_mut() {
        server.start().context("Failed to start metrics exporter")?;
    }

    // Setup broker
    info!("Connecting to broker...");
    let broker = RedpandaBroker::builder()
        .brokers(&config.broker.url)
        .identity(&identity)
        .producer_acks(&config.broker.producer_acks)
        .timeout(config.broker.publish_timeout)
        .build()
        .context("Failed to create broker client")?;
    broker.ping().await.context("Broker unreachable")?;
    let broker: Arc<dyn Broker> = Arc::new(broker);
    info!("Broker connected");

    // Setup replica storage
    let repository: Arc<dyn ticketbus_core::ReplicaRepository<TicketReplica>> =
        if let Some(url) = &config.database_url {
            info!("Connecting to replica database...");
            let repository = PostgresReplicaRepository::<TicketReplica>::connect(url, "ticket")
                .await
                .context("Failed to connect to replica database")?;
            repository.migrate().await.context("Failed to create replica table")?;
            Arc::new(repository)
        } else {
            warn!("DATABASE_URL not set; ticket replicas are kept in memory");
            Arc::new(InMemoryReplicaRepository::new())
        };

    let app = ReplicationApp::start(Arc::clone(&broker), repository, &config.listener);

    let ping = StreamHealthPing {
        message: format!("{} online", identity.client_id()),
    };
    match Publisher::new(broker)
        .with_timeout(config.broker.publish_timeout)
        .publish(&ping)
        .await
    {
        Ok(ack) => info!(sequence = ack.sequence, "Health ping published"),
        Err(e) => warn!(error = %e, "Health ping not confirmed"),
    }

    let reports = app.run(shutdown_signal(), config.shutdown_timeout).await?;
    let acked: u64 = reports.iter().map(|(_, report)| report.acked).sum();
    info!(acked, "Shutdown complete");
    Ok(())
}
