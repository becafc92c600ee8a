use anyhow::Result;
use changeprop_api::ApiServer;
use changeprop_core::config::Config;
use changeprop_executor::broadcast::RuleBroadcastListener;
use changeprop_executor::executor::ExecutorSettings;
use changeprop_executor::http_client::{HttpClient, ReqwestClient};
use changeprop_executor::registry::RuleRegistry;
use changeprop_msg::kafka::KafkaFactory;
use changeprop_msg::publisher::EventPublisher;
use changeprop_msg::{ConsumerFactory, EventProducer};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "changeprop", about = "Change propagation - event driven HTTP updates from Kafka topics")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/changeprop/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)?;

    // Initialize logging
    init_logging(&config.logging);

    info!(
        brokers = ?config.kafka.brokers,
        rules = config.rules.len(),
        "starting changeprop"
    );

    if let Some(ref metrics_config) = config.metrics {
        let addr: SocketAddr = metrics_config.listen.parse()?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(%addr, "metrics exporter listening");
    }

    if config.kafka.startup_delay_ms > 0 {
        info!(delay_ms = config.kafka.startup_delay_ms, "waiting for kafka");
        tokio::time::sleep(Duration::from_millis(config.kafka.startup_delay_ms)).await;
    }

    let factory = Arc::new(KafkaFactory::new(&config.kafka));
    let producer = Arc::new(factory.create_producer()?);
    let publisher = EventPublisher::new(producer.clone(), factory.naming().clone());
    let client: Arc<dyn HttpClient> = Arc::new(ReqwestClient::new(&config.http)?);

    let registry = Arc::new(RuleRegistry::new(
        factory.clone(),
        client,
        publisher.clone(),
        ExecutorSettings::from_config(&config.executor),
    ));

    let outcome = registry.subscribe(&config.rules).await?;
    info!(rules = ?outcome, "static rules subscribed");

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();

    // Dynamic rule registrations
    if config.broadcast.enabled {
        let listener = RuleBroadcastListener::new(
            registry.clone(),
            factory.clone() as Arc<dyn ConsumerFactory>,
            &config.broadcast.topic,
        );
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run(rx).await {
                error!("rule broadcast listener error: {e}");
            }
        }));
    }

    // Start REST API
    if config.api.enabled {
        let addr: SocketAddr = config.api.listen.parse()?;
        let api = ApiServer::new(addr, registry.clone(), publisher)
            .with_static_rules(config.rules.clone());

        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = api.run(rx).await {
                error!("REST API error: {e}");
            }
        }));
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping services...");
    let _ = shutdown_tx.send(true);

    // Wait for all tasks to finish
    for task in tasks {
        let _ = task.await;
    }

    registry.close().await;

    // Shut down producer
    if let Err(e) = producer.close().await {
        error!("producer shutdown error: {e}");
    }

    info!("changeprop stopped");
    Ok(())
}

fn init_logging(config: &changeprop_core::config::LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .init();
        }
    }
}
