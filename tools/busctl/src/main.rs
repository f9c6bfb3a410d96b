use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::sync::Arc;
use topic_bus::retry::{retry_bus_operation, RetryConfig};
use topic_bus::{AmqpBroker, BusConfig, TopicBus};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Publish to and listen on the topic bus configured by RABBITMQ_* variables
#[derive(Parser)]
#[command(name = "busctl")]
#[command(version)]
struct Cli {
    /// Log as JSON lines instead of human-readable text
    #[arg(long, global = true, env = "BUSCTL_JSON_LOGS")]
    json: bool,

    /// Connection attempts before giving up
    #[arg(long, global = true, value_name = "N", default_value_t = 5)]
    connect_attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Publish one JSON payload under a routing key
    Publish {
        routing_key: String,
        /// Payload as JSON; it is sent wrapped as {"data": ...}
        payload: String,
    },
    /// Declare a queue, bind it and print every message until Ctrl-C
    Listen {
        queue: String,
        #[arg(required = true)]
        routing_keys: Vec<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = BusConfig::from_env().context("invalid bus configuration")?;
    let bus = TopicBus::new(config, Arc::new(AmqpBroker::default()));

    let retry = RetryConfig {
        max_attempts: cli.connect_attempts.max(1),
        ..RetryConfig::default()
    };
    retry_bus_operation(|| bus.connect(), &retry, "connect")
        .await
        .context("could not connect to broker")?;

    let outcome = match cli.command {
        Command::Publish {
            routing_key,
            payload,
        } => publish(&bus, &routing_key, &payload).await,
        Command::Listen {
            queue,
            routing_keys,
        } => listen(&bus, queue, routing_keys).await,
    };

    bus.close().await?;
    outcome
}

async fn publish(bus: &TopicBus, routing_key: &str, payload: &str) -> anyhow::Result<()> {
    let data: Value = serde_json::from_str(payload).context("payload is not valid JSON")?;
    bus.publish(routing_key, &data).await?;
    Ok(())
}

async fn listen(bus: &TopicBus, queue: String, routing_keys: Vec<String>) -> anyhow::Result<()> {
    bus.declare_and_bind(&queue, routing_keys).await?;

    let consumer = bus
        .consume(&queue, |routing_key: String, data: Value| async move {
            println!(
                "{}",
                serde_json::json!({ "routing_key": routing_key, "data": data })
            );
            Ok(())
        })
        .await?;

    info!(queue = %queue, "Listening; press Ctrl-C to stop");

    let finished = consumer.wait();
    tokio::pin!(finished);

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Shutting down");
            bus.close().await?;
            let stats = finished.await;
            info!(
                delivered = stats.delivered,
                acked = stats.acked,
                requeued = stats.requeued,
                "Listener stopped"
            );
            Ok(())
        }
        stats = &mut finished => {
            bail!(
                "consumer on '{queue}' stopped after {} deliveries: connection to broker lost",
                stats.delivered
            )
        }
    }
}
